use crate::board::{BusLocation, LocationBoard};
use crate::configuration::{BusDefinition, Configuration};
use crate::error::SimulationError;
use crate::fleet::Fleet;
use crate::stop::{Route, Stop};
use crate::BusId;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

pub struct AppData {
    pub configuration: Configuration,
    pub fleet: Fleet,
}

impl AppData {
    pub fn new(configuration: Configuration) -> anyhow::Result<Arc<AppData>> {
        let sink = configuration.sink.build()?;
        let fleet = Fleet::new(
            configuration.simulation.clone(),
            sink,
            Arc::new(LocationBoard::new()),
        );
        Ok(Arc::new(AppData {
            configuration,
            fleet,
        }))
    }
}

#[derive(Deserialize)]
pub struct StartTripRequest {
    pub bus_id: BusId,
    /// Overrides the catalogue's stops for this trip.
    #[serde(default)]
    pub stops: Option<Vec<Stop>>,
}

#[derive(Deserialize)]
pub struct EndTripRequest {
    pub bus_id: BusId,
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    warp::reply::with_status(warp::reply::json(&json!({ "detail": message.into() })), status)
        .into_response()
}

fn error_response(e: &SimulationError) -> Response {
    let status = match e {
        SimulationError::UnknownBus(_) => StatusCode::NOT_FOUND,
        SimulationError::InvalidRoute(_)
        | SimulationError::InvalidSchedule(_)
        | SimulationError::NoActiveTrip(_) => StatusCode::BAD_REQUEST,
        SimulationError::SinkPublish { .. } => StatusCode::BAD_GATEWAY,
        SimulationError::TaskFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    detail(status, e.to_string())
}

fn catalogue_bus(ad: &AppData, bus_id: BusId) -> Result<&BusDefinition, SimulationError> {
    ad.configuration
        .bus(bus_id)
        .ok_or(SimulationError::UnknownBus(bus_id))
}

fn start_trip(ad: Arc<AppData>, req: StartTripRequest) -> Response {
    let bus = match catalogue_bus(&ad, req.bus_id) {
        Ok(bus) => bus,
        Err(e) => return error_response(&e),
    };
    let stops = req.stops.unwrap_or_else(|| bus.stops.clone());

    match ad.fleet.start_trip(bus.id, &bus.name, stops) {
        Ok(initial) => warp::reply::json(&json!({
            "message": "Trip started successfully",
            "initial_location": initial,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

fn end_trip(ad: Arc<AppData>, req: EndTripRequest) -> Response {
    match ad.fleet.end_trip(req.bus_id) {
        Ok(()) => warp::reply::json(&json!({ "message": "Trip ended successfully" })).into_response(),
        Err(e) => error_response(&e),
    }
}

fn trip_status(ad: Arc<AppData>, bus_id: BusId) -> Response {
    warp::reply::json(&ad.fleet.status(bus_id)).into_response()
}

fn bus_location(ad: Arc<AppData>, bus_id: BusId) -> Response {
    ad.fleet.reap();
    match ad.fleet.board().get(bus_id) {
        Some(location) => warp::reply::json(&location).into_response(),
        None => detail(
            StatusCode::NOT_FOUND,
            "Bus not found or not currently tracking",
        ),
    }
}

fn all_locations(ad: Arc<AppData>) -> Response {
    ad.fleet.reap();
    warp::reply::json(&ad.fleet.board().all()).into_response()
}

fn locations_frame(all: &[BusLocation]) -> Message {
    Message::text(json!({ "bus_locations": all }).to_string())
}

/// Sends the whole board on connect and again after every change, until the
/// client goes away.
async fn push_locations(socket: WebSocket, ad: Arc<AppData>) {
    let board = ad.fleet.board();
    let mut updates = board.subscribe();
    let (mut tx, mut rx) = socket.split();

    if tx.send(locations_frame(&board.all())).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(all) => {
                    if let Err(e) = tx.send(locations_frame(&all)).await {
                        debug!("location push failed: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("location client lagging, skipped {} snapshots", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(message)) if !message.is_close() => {}
                _ => break,
            },
        }
    }
}

/// The route the bus is running (or last ran), else its catalogue route.
fn route_geojson(ad: Arc<AppData>, bus_id: BusId) -> Response {
    let route = catalogue_bus(&ad, bus_id).and_then(|bus| match ad.fleet.route(bus_id) {
        Some(route) => Ok(route),
        None => Route::new(bus.stops.clone()),
    });
    match route {
        Ok(route) => warp::reply::json(&route.to_geojson()).into_response(),
        Err(e) => error_response(&e),
    }
}

fn with_appdata(
    ad: Arc<AppData>,
) -> impl Filter<Extract = (Arc<AppData>,), Error = Infallible> + Clone {
    warp::any().map(move || ad.clone())
}

pub fn routes(
    appdata: Arc<AppData>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let start = warp::post()
        .and(with_appdata(appdata.clone()))
        .and(warp::path!("driver" / "trip" / "start"))
        .and(warp::body::json())
        .map(start_trip);

    let end = warp::post()
        .and(with_appdata(appdata.clone()))
        .and(warp::path!("driver" / "trip" / "end"))
        .and(warp::body::json())
        .map(end_trip);

    let status = warp::get()
        .and(with_appdata(appdata.clone()))
        .and(warp::path!("driver" / "trip" / "status" / BusId))
        .map(trip_status);

    let bus = warp::get()
        .and(with_appdata(appdata.clone()))
        .and(warp::path!("tracking" / "bus" / BusId))
        .map(bus_location);

    let all = warp::get()
        .and(with_appdata(appdata.clone()))
        .and(warp::path!("tracking" / "all"))
        .map(all_locations);

    let live = warp::path!("tracking" / "ws" / "bus_locations")
        .and(warp::ws())
        .and(with_appdata(appdata.clone()))
        .map(|ws: Ws, ad: Arc<AppData>| ws.on_upgrade(move |socket| push_locations(socket, ad)));

    let route = warp::get()
        .and(with_appdata(appdata))
        .and(warp::path!("routes" / BusId))
        .map(route_geojson);

    start.or(end).or(status).or(bus).or(all).or(live).or(route)
}

pub async fn main(configuration: Configuration) -> anyhow::Result<()> {
    let address = (configuration.server.host, configuration.server.port);
    let appdata = AppData::new(configuration)?;

    let cors_policy = warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "Access-Control-Allow-Origin",
            "Origin",
            "Accept",
            "X-Requested-With",
            "Content-Type",
            "Authorization",
        ])
        .allow_methods(["POST", "GET"]);

    info!(
        "serving {} buses on {:?}",
        appdata.configuration.buses.len(),
        address
    );

    let log = warp::log("bustrack_sim::web");
    let routes = routes(appdata).with(cors_policy).with(log);

    warp::serve(routes).run(address).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::SimulationSettings;
    use crate::progress::CompletionPolicy;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time;

    fn appdata() -> Arc<AppData> {
        let configuration = Configuration {
            simulation: SimulationSettings {
                tick_interval_ms: 10,
                steps_per_segment: 10,
                completion: CompletionPolicy::Loop,
            },
            ..Configuration::default()
        };
        AppData::new(configuration).unwrap()
    }

    fn body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn driver_can_start_and_end_a_trip() {
        let routes = routes(appdata());

        let started = warp::test::request()
            .method("POST")
            .path("/driver/trip/start")
            .json(&json!({ "bus_id": 1 }))
            .reply(&routes)
            .await;
        assert_eq!(started.status(), StatusCode::OK);
        let started = body(&started);
        assert_eq!(started["initial_location"]["latitude"], 15.4589);

        time::sleep(Duration::from_millis(35)).await;

        let status = warp::test::request()
            .path("/driver/trip/status/1")
            .reply(&routes)
            .await;
        assert_eq!(body(&status)["state"], "running");

        let location = warp::test::request()
            .path("/tracking/bus/1")
            .reply(&routes)
            .await;
        let location = body(&location);
        assert_eq!(location["active"], true);
        assert_eq!(location["next_stop"], "Tilakwadi");
        assert!(location["lat"].as_f64().unwrap() > 15.4589);

        let ended = warp::test::request()
            .method("POST")
            .path("/driver/trip/end")
            .json(&json!({ "bus_id": 1 }))
            .reply(&routes)
            .await;
        assert_eq!(ended.status(), StatusCode::OK);

        let again = warp::test::request()
            .method("POST")
            .path("/driver/trip/end")
            .json(&json!({ "bus_id": 1 }))
            .reply(&routes)
            .await;
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let all = warp::test::request().path("/tracking/all").reply(&routes).await;
        let all = body(&all);
        assert_eq!(all.as_array().unwrap().len(), 1);
        assert_eq!(all[0]["active"], false);
    }

    #[tokio::test]
    async fn rejects_unknown_buses_and_short_routes() {
        let routes = routes(appdata());

        let unknown = warp::test::request()
            .method("POST")
            .path("/driver/trip/start")
            .json(&json!({ "bus_id": 42 }))
            .reply(&routes)
            .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let short = warp::test::request()
            .method("POST")
            .path("/driver/trip/start")
            .json(&json!({ "bus_id": 1, "stops": [{ "name": "GIT", "lat": 15.45, "lng": 74.5 }] }))
            .reply(&routes)
            .await;
        assert_eq!(short.status(), StatusCode::BAD_REQUEST);
        assert!(body(&short)["detail"]
            .as_str()
            .unwrap()
            .contains("at least two stops"));

        let untracked = warp::test::request()
            .path("/tracking/bus/1")
            .reply(&routes)
            .await;
        assert_eq!(untracked.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_route_geojson() {
        let routes = routes(appdata());
        let response = warp::test::request().path("/routes/1").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let geojson = body(&response);
        assert_eq!(geojson["type"], "FeatureCollection");
        assert_eq!(geojson["features"].as_array().unwrap().len(), 4);
        assert_eq!(geojson["features"][0]["geometry"]["type"], "LineString");
    }

    #[tokio::test]
    async fn serves_the_route_a_trip_is_running() {
        let routes = routes(appdata());
        let started = warp::test::request()
            .method("POST")
            .path("/driver/trip/start")
            .json(&json!({ "bus_id": 1, "stops": [
                { "name": "GIT", "lat": 15.45, "lng": 74.5 },
                { "name": "Shahpur", "lat": 15.4789, "lng": 74.5284 }
            ] }))
            .reply(&routes)
            .await;
        assert_eq!(started.status(), StatusCode::OK);

        let response = warp::test::request().path("/routes/1").reply(&routes).await;
        let geojson = body(&response);
        assert_eq!(geojson["features"].as_array().unwrap().len(), 3);
    }

    fn frame(message: Message) -> Value {
        serde_json::from_str(message.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pushes_locations_over_websocket() {
        let routes = routes(appdata());
        let mut client = warp::test::ws()
            .path("/tracking/ws/bus_locations")
            .handshake(routes.clone())
            .await
            .unwrap();

        let initial = frame(client.recv().await.unwrap());
        assert_eq!(initial["bus_locations"], json!([]));

        let started = warp::test::request()
            .method("POST")
            .path("/driver/trip/start")
            .json(&json!({ "bus_id": 1 }))
            .reply(&routes)
            .await;
        assert_eq!(started.status(), StatusCode::OK);

        let active = frame(client.recv().await.unwrap());
        assert_eq!(active["bus_locations"][0]["bus_id"], 1);
        assert_eq!(active["bus_locations"][0]["active"], true);

        let moved = frame(client.recv().await.unwrap());
        assert!(moved["bus_locations"][0]["lat"].as_f64().unwrap() > 15.4589);
        assert_eq!(moved["bus_locations"][0]["next_stop"], "Tilakwadi");
    }
}
