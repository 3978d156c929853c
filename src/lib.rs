//! Simulated bus movement along a route of stops, publishing one interpolated
//! position per tick to an external sink.

pub mod board;
pub mod configuration;
pub mod error;
pub mod fleet;
pub mod progress;
pub mod simulator;
pub mod sink;
pub mod stop;
pub mod web;

pub type BusId = u32;

pub use configuration::{Configuration, SimulationSettings};
pub use error::SimulationError;
pub use progress::{CompletionPolicy, RouteProgress, RouteProgressState};
pub use simulator::{start, TickEvent, TripHandle, TripSession, TripSummary};
pub use sink::{PositionSink, PositionUpdate, PublishError};
pub use stop::{LatLng, Route, Stop};
