use bustrack_sim::{web, Configuration};
use clap::Parser;
use std::path::PathBuf;

/// Simulated bus trips for the campus transport dashboard
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; built-in demo route when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// port to listen on, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut configuration = match &args.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::default(),
    };
    if let Some(port) = args.port {
        configuration.server.port = port;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(web::main(configuration))
}
