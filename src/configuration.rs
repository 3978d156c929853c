use crate::error::SimulationError;
use crate::progress::CompletionPolicy;
use crate::sink::{HttpSink, LogSink, PositionSink};
use crate::stop::Stop;
use crate::BusId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Configuration {
    pub server: ServerSettings,
    pub simulation: SimulationSettings,
    pub sink: SinkSettings,
    pub buses: Vec<BusDefinition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: [u8; 4],
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulationSettings {
    pub tick_interval_ms: u64,
    pub steps_per_segment: u32,
    pub completion: CompletionPolicy,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSettings {
    #[default]
    Log,
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

/// A catalogue entry: which stops a bus runs through.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BusDefinition {
    pub id: BusId,
    pub name: String,
    #[serde(default)]
    pub route_name: String,
    pub stops: Vec<Stop>,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: [0, 0, 0, 0],
            port: 3030,
        }
    }
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            tick_interval_ms: 1000,
            steps_per_segment: 10,
            completion: CompletionPolicy::Loop,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            server: ServerSettings::default(),
            simulation: SimulationSettings::default(),
            sink: SinkSettings::default(),
            buses: vec![BusDefinition {
                id: 1,
                name: "Bus 1".to_string(),
                route_name: "KLS GIT loop".to_string(),
                stops: vec![
                    Stop::new("KLS GIT", 15.4589, 74.5084),
                    Stop::new("Tilakwadi", 15.4689, 74.5184),
                    Stop::new("Shahpur", 15.4789, 74.5284),
                ],
            }],
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.tick_interval_ms == 0 {
            return Err(SimulationError::InvalidSchedule(
                "tick_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.steps_per_segment == 0 {
            return Err(SimulationError::InvalidSchedule(
                "steps_per_segment must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl SinkSettings {
    pub fn build(&self) -> anyhow::Result<Arc<dyn PositionSink>> {
        match self {
            SinkSettings::Log => Ok(Arc::new(LogSink)),
            SinkSettings::Http {
                base_url,
                token,
                timeout_ms,
            } => {
                let sink = HttpSink::new(base_url, token.clone(), Duration::from_millis(*timeout_ms))
                    .context("building http position sink")?;
                Ok(Arc::new(sink))
            }
        }
    }
}

impl Configuration {
    pub fn from_toml(text: &str) -> anyhow::Result<Configuration> {
        let config: Configuration = toml::from_str(text).context("parsing configuration")?;
        config.simulation.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Configuration> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        Configuration::from_toml(&text)
    }

    pub fn bus(&self, id: BusId) -> Option<&BusDefinition> {
        self.buses.iter().find(|bus| bus.id == id)
    }
}
