use crate::board::LocationBoard;
use crate::configuration::SimulationSettings;
use crate::error::SimulationError;
use crate::simulator::{TripHandle, TripSession};
use crate::sink::PositionSink;
use crate::stop::{LatLng, Route, Stop};
use crate::BusId;
use log::{info, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Idle,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TripStatus {
    pub bus_id: BusId,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Sessions {
    running: FxHashMap<BusId, TripHandle>,
    /// Stopped on request but possibly still finishing an in-flight publish.
    stopping: Vec<TripHandle>,
    failures: FxHashMap<BusId, String>,
    routes: FxHashMap<BusId, Route>,
}

/// Owns every trip session, keyed by bus. Starting a trip for a bus that is
/// already moving replaces the old session.
pub struct Fleet {
    settings: SimulationSettings,
    sink: Arc<dyn PositionSink>,
    board: Arc<LocationBoard>,
    sessions: Mutex<Sessions>,
}

impl Fleet {
    pub fn new(
        settings: SimulationSettings,
        sink: Arc<dyn PositionSink>,
        board: Arc<LocationBoard>,
    ) -> Self {
        Fleet {
            settings,
            sink,
            board,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn board(&self) -> &LocationBoard {
        &self.board
    }

    /// Returns the location the bus starts from.
    pub fn start_trip(
        &self,
        bus_id: BusId,
        bus_name: &str,
        stops: Vec<Stop>,
    ) -> Result<LatLng, SimulationError> {
        let board = self.board.clone();
        let session = TripSession::new(bus_id, stops, &self.settings)?
            .on_tick(move |event| board.record(event));
        let initial = session.initial_location();
        let route = session.route().clone();

        let mut sessions = self.lock();
        self.reap_locked(&mut sessions);
        if let Some(previous) = sessions.running.remove(&bus_id) {
            info!("bus {} already has a trip running, replacing it", bus_id);
            previous.stop();
            sessions.stopping.push(previous);
        }
        sessions.failures.remove(&bus_id);
        sessions.routes.insert(bus_id, route);

        self.board.mark_active(bus_id, bus_name, initial);
        sessions
            .running
            .insert(bus_id, session.start(self.sink.clone()));
        Ok(initial)
    }

    pub fn end_trip(&self, bus_id: BusId) -> Result<(), SimulationError> {
        let mut sessions = self.lock();
        self.reap_locked(&mut sessions);

        let handle = sessions
            .running
            .remove(&bus_id)
            .ok_or(SimulationError::NoActiveTrip(bus_id))?;
        handle.stop();
        sessions.stopping.push(handle);
        self.board.mark_inactive(bus_id);
        info!("trip for bus {} ended by request", bus_id);
        Ok(())
    }

    /// Route of the bus's most recent trip, which may differ from the
    /// catalogue when the driver supplied their own stops.
    pub fn route(&self, bus_id: BusId) -> Option<Route> {
        self.lock().routes.get(&bus_id).cloned()
    }

    /// Reports a sink failure that ended the last trip at most once.
    pub fn status(&self, bus_id: BusId) -> TripStatus {
        let mut sessions = self.lock();
        self.reap_locked(&mut sessions);

        let state = match sessions.running.get(&bus_id) {
            Some(handle) if handle.is_running() => SessionState::Running,
            _ => SessionState::Idle,
        };
        TripStatus {
            bus_id,
            state,
            error: sessions.failures.remove(&bus_id),
        }
    }

    pub fn running(&self) -> Vec<BusId> {
        let mut sessions = self.lock();
        self.reap_locked(&mut sessions);
        let mut ids: Vec<BusId> = sessions.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Collects sessions that ended on their own (arrival or sink failure) and
    /// the outcome of stopped ones once their last tick has finished.
    pub fn reap(&self) {
        let mut sessions = self.lock();
        self.reap_locked(&mut sessions);
    }

    fn reap_locked(&self, sessions: &mut Sessions) {
        let ended: Vec<BusId> = sessions
            .running
            .iter()
            .filter(|(_, handle)| !handle.is_running())
            .map(|(bus_id, _)| *bus_id)
            .collect();

        for bus_id in ended {
            let Some(mut handle) = sessions.running.remove(&bus_id) else {
                continue;
            };
            match handle.try_outcome() {
                Some(Ok(summary)) => {
                    info!("bus {} finished after {} ticks", bus_id, summary.ticks);
                    self.board.mark_inactive(bus_id);
                }
                Some(Err(e)) => {
                    warn!("bus {} stopped: {}", bus_id, e);
                    sessions.failures.insert(bus_id, e.to_string());
                    self.board.mark_inactive(bus_id);
                }
                None => {
                    sessions.running.insert(bus_id, handle);
                }
            }
        }

        let stopping = std::mem::take(&mut sessions.stopping);
        for mut handle in stopping {
            match handle.try_outcome() {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("bus {} failed while stopping: {}", handle.bus_id(), e);
                    sessions.failures.insert(handle.bus_id(), e.to_string());
                }
                None => sessions.stopping.push(handle),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
