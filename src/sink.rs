use crate::BusId;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// The record written to the backend for every tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PositionUpdate {
    pub bus_id: BusId,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: f64,
    pub remaining_m: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("request to position backend failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("position backend rejected update with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("position receiver has been dropped")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Capability to publish a bus position somewhere outside the simulator.
pub trait PositionSink: Send + Sync {
    fn publish<'a>(&'a self, update: &'a PositionUpdate) -> BoxFuture<'a, Result<(), PublishError>>;
}

pub struct LogSink;

impl PositionSink for LogSink {
    fn publish<'a>(&'a self, update: &'a PositionUpdate) -> BoxFuture<'a, Result<(), PublishError>> {
        info!(
            "bus {} at ({:.6}, {:.6}) {:.1} km/h, {:.0} m to go",
            update.bus_id, update.latitude, update.longitude, update.speed_kmh, update.remaining_m
        );
        futures::future::ready(Ok(())).boxed()
    }
}

/// Hands updates to an in-process consumer, e.g. a map widget adapter.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PositionUpdate>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PositionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl PositionSink for ChannelSink {
    fn publish<'a>(&'a self, update: &'a PositionUpdate) -> BoxFuture<'a, Result<(), PublishError>> {
        let result = self
            .tx
            .send(update.clone())
            .map_err(|_| PublishError::Closed);
        futures::future::ready(result).boxed()
    }
}

/// POSTs each update as JSON to `{base_url}/driver/trip/update`.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpSink::with_client(client, base_url, token))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        HttpSink {
            client,
            endpoint: format!("{}/driver/trip/update", base_url.trim_end_matches('/')),
            token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, update: &PositionUpdate) -> Result<(), PublishError> {
        let mut request = self.client.post(&self.endpoint).json(update);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl PositionSink for HttpSink {
    fn publish<'a>(&'a self, update: &'a PositionUpdate) -> BoxFuture<'a, Result<(), PublishError>> {
        self.post(update).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::{Arc, Mutex};
    use warp::http::StatusCode;
    use warp::Filter;

    fn update() -> PositionUpdate {
        PositionUpdate {
            bus_id: 16,
            latitude: 15.4589,
            longitude: 74.5084,
            timestamp: Utc::now(),
            speed_kmh: 24.0,
            remaining_m: 1200.0,
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards_updates() {
        let (sink, mut rx) = ChannelSink::new();
        let sent = update();
        sink.publish(&sent).await.unwrap();
        assert_eq!(rx.recv().await, Some(sent));
    }

    #[tokio::test]
    async fn channel_sink_fails_without_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(matches!(
            sink.publish(&update()).await,
            Err(PublishError::Closed)
        ));
    }

    #[test]
    fn http_sink_targets_update_endpoint() {
        let sink = HttpSink::new("http://localhost:8001/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.endpoint(), "http://localhost:8001/driver/trip/update");
    }

    type Received = Arc<Mutex<Vec<(Option<String>, PositionUpdate)>>>;

    /// Backend stand-in that records every update and answers with `status`.
    fn backend(status: StatusCode, body: &'static str) -> (SocketAddr, Received) {
        let received: Received = Arc::default();
        let log = received.clone();
        let update = warp::post()
            .and(warp::path!("driver" / "trip" / "update"))
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::json())
            .map(move |auth: Option<String>, update: PositionUpdate| {
                log.lock().unwrap().push((auth, update));
                warp::reply::with_status(body, status)
            });
        let (addr, server) = warp::serve(update).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (addr, received)
    }

    fn sink_for(addr: SocketAddr, token: Option<&str>) -> HttpSink {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpSink::with_client(client, &format!("http://{addr}"), token.map(str::to_string))
    }

    #[tokio::test]
    async fn http_sink_posts_with_bearer_token() {
        let (addr, received) = backend(StatusCode::OK, "");
        let sink = sink_for(addr, Some("driver-token"));
        let sent = update();
        sink.publish(&sent).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.as_deref(), Some("Bearer driver-token"));
        assert_eq!(received[0].1, sent);
    }

    #[tokio::test]
    async fn http_sink_sends_no_auth_without_token() {
        let (addr, received) = backend(StatusCode::OK, "");
        sink_for(addr, None).publish(&update()).await.unwrap();
        assert_eq!(received.lock().unwrap()[0].0, None);
    }

    #[tokio::test]
    async fn http_sink_reports_rejection_with_body() {
        let (addr, received) = backend(StatusCode::BAD_REQUEST, "No active trip for this driver");
        let result = sink_for(addr, None).publish(&update()).await;

        match result {
            Err(PublishError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "No active trip for this driver");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn http_sink_reports_unreachable_backend() {
        // grab a free port, then close it so nothing is listening
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let result = sink_for(addr, None).publish(&update()).await;
        assert!(matches!(result, Err(PublishError::Http(_))));
    }

    #[test]
    fn update_serializes_backend_fields() {
        let json = serde_json::to_value(update()).unwrap();
        for key in ["bus_id", "latitude", "longitude", "timestamp"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
