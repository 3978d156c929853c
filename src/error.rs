use crate::sink::PublishError;
use crate::BusId;

#[derive(thiserror::Error, Debug)]
pub enum SimulationError {
    /// A trip needs a starting point and a destination
    #[error("route needs at least two stops to simulate a trip, got {0}")]
    InvalidRoute(usize),
    #[error("invalid simulation schedule: {0}")]
    InvalidSchedule(String),
    /// The external position sink failed; the session has stopped ticking
    #[error("failed to publish position for bus {bus_id}: {source}")]
    SinkPublish {
        bus_id: BusId,
        #[source]
        source: PublishError,
    },
    #[error("no active trip for bus {0}")]
    NoActiveTrip(BusId),
    #[error("bus {0} is not in the catalogue")]
    UnknownBus(BusId),
    #[error("trip session task for bus {bus_id} ended abnormally: {message}")]
    TaskFailed { bus_id: BusId, message: String },
}
