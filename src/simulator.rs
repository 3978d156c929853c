use crate::configuration::SimulationSettings;
use crate::error::SimulationError;
use crate::progress::RouteProgress;
use crate::sink::{PositionSink, PositionUpdate};
use crate::stop::{LatLng, Route, Stop};
use crate::BusId;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Everything known about the vehicle after one tick.
#[derive(Serialize, Clone, Debug)]
pub struct TickEvent {
    pub bus_id: BusId,
    pub tick: u64,
    pub position: LatLng,
    pub segment_index: usize,
    pub segment_fraction: f64,
    pub segment_complete: bool,
    pub route_complete: bool,
    pub next_stop: String,
    pub speed_kmh: f64,
    pub remaining_m: f64,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl TickEvent {
    pub fn to_update(&self) -> PositionUpdate {
        PositionUpdate {
            bus_id: self.bus_id,
            latitude: self.position.latitude,
            longitude: self.position.longitude,
            timestamp: self.timestamp,
            speed_kmh: self.speed_kmh,
            remaining_m: self.remaining_m,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripEnd {
    Stopped,
    Arrived,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TripSummary {
    pub bus_id: BusId,
    pub ticks: u64,
    pub laps: u64,
    pub end: TripEnd,
}

type TickCallback = Box<dyn FnMut(&TickEvent) + Send>;

/// A trip that has been validated but not started yet.
pub struct TripSession {
    bus_id: BusId,
    progress: RouteProgress,
    tick_interval: Duration,
    on_tick: Option<TickCallback>,
}

impl TripSession {
    pub fn new(
        bus_id: BusId,
        stops: Vec<Stop>,
        settings: &SimulationSettings,
    ) -> Result<Self, SimulationError> {
        let route = Route::new(stops)?;
        settings.validate()?;
        let progress = RouteProgress::new(route, settings.steps_per_segment, settings.completion)?;

        Ok(TripSession {
            bus_id,
            progress,
            tick_interval: settings.tick_interval(),
            on_tick: None,
        })
    }

    pub fn bus_id(&self) -> BusId {
        self.bus_id
    }

    pub fn route(&self) -> &Route {
        self.progress.route()
    }

    pub fn initial_location(&self) -> LatLng {
        self.progress.state().current_position
    }

    /// Registers the per-tick callback. A later call replaces the earlier one.
    pub fn on_tick(mut self, callback: impl FnMut(&TickEvent) + Send + 'static) -> Self {
        self.on_tick = Some(Box::new(callback));
        self
    }

    /// Spawns the ticking task on the current tokio runtime. The first tick
    /// fires one interval after this call.
    pub fn start(self, sink: Arc<dyn PositionSink>) -> TripHandle {
        let bus_id = self.bus_id;
        let (cancel, cancelled) = watch::channel(false);
        info!(
            "starting trip for bus {} over {} stops, tick every {:?}",
            bus_id,
            self.progress.route().stops().len(),
            self.tick_interval
        );
        let task = tokio::spawn(self.run(sink, cancelled));

        TripHandle {
            bus_id,
            cancel,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        sink: Arc<dyn PositionSink>,
        mut cancelled: watch::Receiver<bool>,
    ) -> Result<TripSummary, SimulationError> {
        let mut interval = time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0;
        let mut previous = self.progress.state().current_position;

        let end = loop {
            tokio::select! {
                biased;
                changed = cancelled.changed() => {
                    // a dropped sender means the handle is gone
                    if changed.is_err() || *cancelled.borrow() {
                        break TripEnd::Stopped;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }
            if *cancelled.borrow() {
                break TripEnd::Stopped;
            }

            ticks += 1;
            let event = self.tick(ticks, previous);
            previous = event.position;

            if let Some(callback) = self.on_tick.as_mut() {
                callback(&event);
            }

            if let Err(source) = sink.publish(&event.to_update()).await {
                error!("bus {}: publishing position failed, stopping trip: {}", self.bus_id, source);
                return Err(SimulationError::SinkPublish {
                    bus_id: self.bus_id,
                    source,
                });
            }

            if self.progress.is_finished() {
                break TripEnd::Arrived;
            }
        };

        info!("trip for bus {} ended ({:?}) after {} ticks", self.bus_id, end, ticks);
        Ok(TripSummary {
            bus_id: self.bus_id,
            ticks,
            laps: self.progress.laps(),
            end,
        })
    }

    fn tick(&mut self, tick: u64, previous: LatLng) -> TickEvent {
        let advance = self.progress.advance();
        let state = *self.progress.state();
        let timestamp = Utc::now();

        // jumping back to the start is not movement
        let moved_m = if advance.route_complete {
            0.0
        } else {
            previous.distance_m(advance.position)
        };
        let speed_ms = moved_m / self.tick_interval.as_secs_f64();
        let remaining_m = self.progress.remaining_m();

        let estimated_arrival = if speed_ms > 0.0 {
            Duration::try_from_secs_f64(remaining_m / speed_ms)
                .ok()
                .and_then(|eta| chrono::Duration::from_std(eta).ok())
                .map(|eta| timestamp + eta)
        } else {
            None
        };

        debug!(
            "bus {} tick {}: segment {} at {:.2} -> ({:.6}, {:.6})",
            self.bus_id,
            tick,
            state.current_segment_index,
            state.segment_fraction,
            advance.position.latitude,
            advance.position.longitude
        );

        TickEvent {
            bus_id: self.bus_id,
            tick,
            position: advance.position,
            segment_index: state.current_segment_index,
            segment_fraction: state.segment_fraction,
            segment_complete: advance.segment_complete,
            route_complete: advance.route_complete,
            next_stop: self.progress.next_stop().name.clone(),
            speed_kmh: speed_ms * 3.6,
            remaining_m,
            estimated_arrival,
            timestamp,
        }
    }
}

/// Validates the route and starts ticking straight away.
pub fn start(
    bus_id: BusId,
    stops: Vec<Stop>,
    settings: &SimulationSettings,
    sink: Arc<dyn PositionSink>,
) -> Result<TripHandle, SimulationError> {
    Ok(TripSession::new(bus_id, stops, settings)?.start(sink))
}

/// Cancellable handle to a running trip. Dropping it stops the trip.
pub struct TripHandle {
    bus_id: BusId,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<Result<TripSummary, SimulationError>>>,
}

impl TripHandle {
    pub fn bus_id(&self) -> BusId {
        self.bus_id
    }

    /// Cancels the timer; no new tick begins after this returns. A tick already
    /// past the cancellation check may still run its callback and finish its
    /// publish. Calling it again is a no-op.
    pub fn stop(&self) {
        if !self.cancel.send_replace(true) {
            debug!("stop requested for bus {}", self.bus_id);
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.cancel.borrow() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Terminal result of the trip, if it has ended. Reported at most once.
    pub fn try_outcome(&mut self) -> Option<Result<TripSummary, SimulationError>> {
        if !self.task.as_ref()?.is_finished() {
            return None;
        }
        let mut task = self.task.take()?;
        match (&mut task).now_or_never() {
            Some(result) => Some(self.flatten(result)),
            None => {
                self.task = Some(task);
                None
            }
        }
    }

    /// Waits for the trip to end, either through [`TripHandle::stop`], arrival
    /// or a sink failure.
    pub async fn wait(mut self) -> Result<TripSummary, SimulationError> {
        let bus_id = self.bus_id;
        match self.task.take() {
            Some(task) => {
                let result = task.await;
                self.flatten(result)
            }
            None => Err(SimulationError::TaskFailed {
                bus_id,
                message: "outcome already taken".to_string(),
            }),
        }
    }

    fn flatten(
        &self,
        result: Result<Result<TripSummary, SimulationError>, tokio::task::JoinError>,
    ) -> Result<TripSummary, SimulationError> {
        result.map_err(|e| SimulationError::TaskFailed {
            bus_id: self.bus_id,
            message: e.to_string(),
        })?
    }
}

impl Drop for TripHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
