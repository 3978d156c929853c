use crate::simulator::TickEvent;
use crate::stop::LatLng;
use crate::BusId;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Snapshots kept for slow subscribers; older ones are skipped.
const SNAPSHOT_BACKLOG: usize = 16;

/// What a student page sees for one bus.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BusLocation {
    pub bus_id: BusId,
    pub bus_name: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub next_stop: Option<String>,
    pub remaining_m: Option<f64>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

/// Latest known location of every bus that has run a trip. Every change is
/// also pushed to subscribers as a full snapshot.
pub struct LocationBoard {
    inner: Mutex<FxHashMap<BusId, BusLocation>>,
    updates: broadcast::Sender<Vec<BusLocation>>,
}

impl Default for LocationBoard {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(SNAPSHOT_BACKLOG);
        LocationBoard {
            inner: Mutex::default(),
            updates,
        }
    }
}

impl LocationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<BusLocation>> {
        self.updates.subscribe()
    }

    /// A trip is starting: park the bus on its first stop.
    pub fn mark_active(&self, bus_id: BusId, bus_name: &str, at: LatLng) {
        let location = BusLocation {
            bus_id,
            bus_name: bus_name.to_string(),
            lat: at.latitude,
            lng: at.longitude,
            speed: 0.0,
            next_stop: None,
            remaining_m: None,
            estimated_arrival: None,
            updated_at: Utc::now(),
            active: true,
        };
        let mut inner = self.lock();
        inner.insert(bus_id, location);
        self.push(inner);
    }

    pub fn record(&self, event: &TickEvent) {
        let mut inner = self.lock();
        let Some(location) = inner.get_mut(&event.bus_id) else {
            return;
        };
        location.lat = event.position.latitude;
        location.lng = event.position.longitude;
        location.speed = event.speed_kmh;
        location.next_stop = Some(event.next_stop.clone());
        location.remaining_m = Some(event.remaining_m);
        location.estimated_arrival = event.estimated_arrival;
        location.updated_at = event.timestamp;
        self.push(inner);
    }

    pub fn mark_inactive(&self, bus_id: BusId) {
        let mut inner = self.lock();
        let Some(location) = inner.get_mut(&bus_id) else {
            return;
        };
        location.active = false;
        location.speed = 0.0;
        location.estimated_arrival = None;
        self.push(inner);
    }

    pub fn get(&self, bus_id: BusId) -> Option<BusLocation> {
        self.lock().get(&bus_id).cloned()
    }

    /// Sorted by bus id.
    pub fn all(&self) -> Vec<BusLocation> {
        snapshot(&self.lock())
    }

    fn push(&self, inner: MutexGuard<'_, FxHashMap<BusId, BusLocation>>) {
        if self.updates.receiver_count() == 0 {
            return;
        }
        // sent under the lock so subscribers see snapshots in order; fails
        // only when every subscriber has left
        let _ = self.updates.send(snapshot(&inner));
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<BusId, BusLocation>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn snapshot(inner: &FxHashMap<BusId, BusLocation>) -> Vec<BusLocation> {
    let mut all: Vec<BusLocation> = inner.values().cloned().collect();
    all.sort_by_key(|location| location.bus_id);
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(bus_id: BusId, lat: f64, lng: f64) -> TickEvent {
        TickEvent {
            bus_id,
            tick: 1,
            position: LatLng::from_lat_lng(lat, lng),
            segment_index: 0,
            segment_fraction: 0.1,
            segment_complete: false,
            route_complete: false,
            next_stop: "Nath Pai Circle".to_string(),
            speed_kmh: 18.0,
            remaining_m: 2500.0,
            estimated_arrival: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn records_ticks_for_active_buses() {
        let board = LocationBoard::new();
        board.mark_active(2, "Bus 2", LatLng::from_lat_lng(15.0, 74.0));
        board.record(&event(2, 15.1, 74.1));

        let location = board.get(2).unwrap();
        assert!(location.active);
        assert_eq!(location.lat, 15.1);
        assert_eq!(location.next_stop.as_deref(), Some("Nath Pai Circle"));
        assert_eq!(location.speed, 18.0);
    }

    #[test]
    fn ignores_ticks_for_unknown_buses() {
        let board = LocationBoard::new();
        board.record(&event(9, 1.0, 1.0));
        assert!(board.get(9).is_none());
    }

    #[test]
    fn inactive_buses_keep_their_last_position() {
        let board = LocationBoard::new();
        board.mark_active(5, "Bus 5", LatLng::from_lat_lng(15.0, 74.0));
        board.mark_active(1, "Bus 1", LatLng::from_lat_lng(16.0, 75.0));
        board.record(&event(5, 15.2, 74.2));
        board.mark_inactive(5);

        let location = board.get(5).unwrap();
        assert!(!location.active);
        assert_eq!(location.speed, 0.0);
        assert_eq!(location.lat, 15.2);

        let ids: Vec<BusId> = board.all().iter().map(|l| l.bus_id).collect();
        assert_eq!(ids, vec![1, 5]);
    }

    #[test]
    fn subscribers_receive_every_change() {
        let board = LocationBoard::new();
        let mut updates = board.subscribe();

        board.mark_active(3, "Bus 3", LatLng::from_lat_lng(15.0, 74.0));
        board.record(&event(3, 15.1, 74.1));
        board.record(&event(8, 1.0, 1.0));
        board.mark_inactive(3);

        let started = updates.try_recv().unwrap();
        assert_eq!(started.len(), 1);
        assert!(started[0].active);
        assert_eq!(updates.try_recv().unwrap()[0].lat, 15.1);
        let ended = updates.try_recv().unwrap();
        assert!(!ended[0].active);
        // the unknown bus produced nothing
        assert!(updates.try_recv().is_err());
    }
}
