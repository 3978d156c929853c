use crate::error::SimulationError;
use crate::stop::{LatLng, Route, Stop};
use serde::{Deserialize, Serialize};

/// What happens when the last segment completes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Jump back to the starting point and keep going.
    #[default]
    Loop,
    /// Stay at the destination and end the trip.
    Terminate,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct RouteProgressState {
    pub current_segment_index: usize,
    pub segment_fraction: f64,
    pub current_position: LatLng,
}

/// Result of a single [`RouteProgress::advance`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Advance {
    pub position: LatLng,
    pub segment_complete: bool,
    pub route_complete: bool,
}

/// Position of a simulated vehicle along a route, moved forward one sub-step
/// per tick. Each segment is split into `steps_per_segment` sub-steps.
#[derive(Clone, Debug)]
pub struct RouteProgress {
    route: Route,
    steps_per_segment: u32,
    policy: CompletionPolicy,
    step_counter: u32,
    state: RouteProgressState,
    laps: u64,
    finished: bool,
}

impl RouteProgress {
    pub fn new(
        route: Route,
        steps_per_segment: u32,
        policy: CompletionPolicy,
    ) -> Result<Self, SimulationError> {
        if steps_per_segment == 0 {
            return Err(SimulationError::InvalidSchedule(
                "steps_per_segment must be at least 1".to_string(),
            ));
        }

        let state = RouteProgressState {
            current_segment_index: 0,
            segment_fraction: 0.0,
            current_position: route.starting_point().location(),
        };

        Ok(RouteProgress {
            route,
            steps_per_segment,
            policy,
            step_counter: 0,
            state,
            laps: 0,
            finished: false,
        })
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn state(&self) -> &RouteProgressState {
        &self.state
    }

    /// Number of times the destination has been reached.
    pub fn laps(&self) -> u64 {
        self.laps
    }

    /// Only ever true under [`CompletionPolicy::Terminate`].
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_stop(&self) -> &Stop {
        let (_, next) = self.route.segment(self.state.current_segment_index);
        next
    }

    pub fn remaining_m(&self) -> f64 {
        self.route
            .remaining_m(self.state.current_segment_index, self.state.segment_fraction)
    }

    pub fn advance(&mut self) -> Advance {
        if self.finished {
            return Advance {
                position: self.state.current_position,
                segment_complete: false,
                route_complete: false,
            };
        }

        let mut segment_index = self.state.current_segment_index;
        let mut segment_complete = false;
        let mut route_complete = false;

        self.step_counter += 1;
        if self.step_counter > self.steps_per_segment {
            self.step_counter = 0;
            segment_index += 1;
            segment_complete = true;
        }

        if segment_index == self.route.segment_count() {
            route_complete = true;
            self.laps += 1;
            match self.policy {
                CompletionPolicy::Loop => {
                    segment_index = 0;
                    self.step_counter = 0;
                }
                CompletionPolicy::Terminate => {
                    // park on the last segment at its far end
                    segment_index = self.route.segment_count() - 1;
                    self.step_counter = self.steps_per_segment;
                    self.finished = true;
                }
            }
        }

        let fraction = self.step_counter as f64 / self.steps_per_segment as f64;
        let (a, b) = self.route.segment(segment_index);
        let position = a.location().interpolate(b.location(), fraction);

        self.state = RouteProgressState {
            current_segment_index: segment_index,
            segment_fraction: fraction,
            current_position: position,
        };

        Advance {
            position,
            segment_complete,
            route_complete,
        }
    }
}
