use crate::error::SimulationError;
use geo::{Distance, Haversine, Point};
use geo_types::{Coord, LineString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LatLng {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
}

impl LatLng {
    pub fn from_lat_lng(lat: f64, lng: f64) -> Self {
        Self {
            latitude: lat,
            longitude: lng,
        }
    }

    pub fn to_coord(self) -> Coord {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }

    pub fn to_point(self) -> Point {
        Point::from(self.to_coord())
    }

    /// Great-circle distance in metres.
    pub fn distance_m(self, other: LatLng) -> f64 {
        Haversine.distance(self.to_point(), other.to_point())
    }

    pub fn interpolate(self, end: LatLng, fraction: f64) -> LatLng {
        LatLng {
            latitude: self.latitude + (end.latitude - self.latitude) * fraction,
            longitude: self.longitude + (end.longitude - self.longitude) * fraction,
        }
    }
}

/// A named waypoint. Accepts both `latitude`/`longitude` and the `lat`/`lng`
/// spelling used by the route records.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Stop {
    pub name: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
}

impl Stop {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Stop {
            name: name.into(),
            latitude,
            longitude,
        }
    }

    pub fn location(&self) -> LatLng {
        LatLng::from_lat_lng(self.latitude, self.longitude)
    }
}

/// An ordered, immutable stop sequence with at least two stops. Cloning is
/// cheap so a running session can hold its own copy.
#[derive(Clone, Debug)]
pub struct Route {
    stops: Arc<[Stop]>,
    segment_lengths: Arc<[f64]>,
}

impl Route {
    pub fn new(stops: Vec<Stop>) -> Result<Route, SimulationError> {
        if stops.len() < 2 {
            return Err(SimulationError::InvalidRoute(stops.len()));
        }

        let segment_lengths: Vec<f64> = stops
            .windows(2)
            .map(|pair| pair[0].location().distance_m(pair[1].location()))
            .collect();

        Ok(Route {
            stops: stops.into(),
            segment_lengths: segment_lengths.into(),
        })
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn starting_point(&self) -> &Stop {
        &self.stops[0]
    }

    pub fn destination(&self) -> &Stop {
        &self.stops[self.stops.len() - 1]
    }

    pub fn segment_count(&self) -> usize {
        self.stops.len() - 1
    }

    /// Start and end stop of segment `index`. Panics if `index >= segment_count()`.
    pub fn segment(&self, index: usize) -> (&Stop, &Stop) {
        (&self.stops[index], &self.stops[index + 1])
    }

    pub fn segment_length_m(&self, index: usize) -> f64 {
        self.segment_lengths[index]
    }

    pub fn length_m(&self) -> f64 {
        self.segment_lengths.iter().sum()
    }

    /// Distance left to the destination from `fraction` of the way along segment `index`.
    pub fn remaining_m(&self, index: usize, fraction: f64) -> f64 {
        let current = self.segment_lengths[index] * (1.0 - fraction);
        let after: f64 = self.segment_lengths[index + 1..].iter().sum();
        current + after
    }

    pub fn to_line_string(&self) -> LineString {
        let coords: Vec<Coord> = self
            .stops
            .iter()
            .map(|stop| stop.location().to_coord())
            .collect();
        LineString::new(coords)
    }

    pub fn to_geojson(&self) -> geojson::FeatureCollection {
        let line = geojson::Geometry::from(&self.to_line_string());
        let mut features = vec![geojson::Feature::from(line)];

        let last = self.stops.len() - 1;
        for (i, stop) in self.stops.iter().enumerate() {
            let point = geojson::Value::Point(vec![stop.longitude, stop.latitude]);
            let mut feature = geojson::Feature::from(point);
            feature.set_property("name", stop.name.clone());
            feature.set_property("sequence", i);
            let role = match i {
                0 => "start",
                i if i == last => "destination",
                _ => "stop",
            };
            feature.set_property("role", role);
            features.push(feature);
        }

        geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}
