//! Kinematic model of one simulated tracker.
//!
//! Each device wanders around a fixed area with a seeded random walk. The
//! displacement uses a flat-Earth approximation (degrees per kilometre, with
//! longitude scaled by `cos(latitude)`); that is accurate enough at city scale
//! and is not meant to be geodesically exact.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Degrees of latitude per kilometre.
const DEG_PER_KM: f64 = 0.009;
const KMH_TO_MPS: f64 = 0.2778;
const MAX_TURN_DEG: f64 = 6.0;
const TOGGLE_PROBABILITY: f64 = 0.02;

/// Where devices are spawned and how the longitude scale is guarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationArea {
    pub center_lat: f64,
    pub center_lon: f64,
    /// Maximum initial offset from the centre, in degrees, on each axis.
    pub spread_deg: f64,
    /// Floor for the `|cos(lat)|` longitude factor. Keeps steps finite near the poles.
    pub min_lon_scale: f64,
}

impl Default for SimulationArea {
    fn default() -> Self {
        Self {
            center_lat: 10.3157,
            center_lon: 123.8854,
            spread_deg: 0.05,
            min_lon_scale: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing_degrees: f64,
    pub speed_kmh: f64,
}

/// One position report as sent to the ingest endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub device_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub speed_mps: f64,
    pub bearing: f64,
}

impl PositionReport {
    /// Query parameters in the OsmAnd field layout.
    pub fn query_pairs(&self) -> [(&'static str, String); 6] {
        [
            ("id", self.device_id.to_string()),
            ("lat", format!("{:.6}", self.latitude)),
            ("lon", format!("{:.6}", self.longitude)),
            ("timestamp", self.timestamp.to_string()),
            ("speed", format!("{:.2}", self.speed_mps)),
            ("bearing", format!("{:.1}", self.bearing)),
        ]
    }
}

/// Owns one device's state and its private random source.
pub struct DeviceSimulator {
    state: DeviceState,
    area: SimulationArea,
    rng: StdRng,
}

impl DeviceSimulator {
    /// The random source is seeded with `seed + id`, so a given seed
    /// reproduces every device's trajectory.
    pub fn new(id: i64, seed: u64, area: SimulationArea) -> Self {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(id as u64));
        let state = DeviceState {
            id,
            latitude: area.center_lat + rng.random_range(-area.spread_deg..=area.spread_deg),
            longitude: area.center_lon + rng.random_range(-area.spread_deg..=area.spread_deg),
            bearing_degrees: rng.random_range(0.0..360.0),
            speed_kmh: rng.random_range(5.0..40.0),
        };
        Self { state, area, rng }
    }

    pub fn id(&self) -> i64 {
        self.state.id
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Advances the model by `dt_seconds`.
    pub fn step(&mut self, dt_seconds: f64) {
        let turn = self.rng.random_range(-MAX_TURN_DEG..MAX_TURN_DEG);
        self.state.bearing_degrees = (self.state.bearing_degrees + turn).rem_euclid(360.0);
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        if self.state.bearing_degrees >= 360.0 {
            self.state.bearing_degrees = 0.0;
        }

        let km_per_sec = self.state.speed_kmh / 3600.0;
        let dlat = km_per_sec * DEG_PER_KM * dt_seconds;
        let lon_scale = self
            .state
            .latitude
            .to_radians()
            .cos()
            .abs()
            .max(self.area.min_lon_scale);
        let dlon = dlat * lon_scale;

        let heading = self.state.bearing_degrees.to_radians();
        self.state.latitude += dlat * heading.cos();
        self.state.longitude += dlon * heading.sin();

        if self.rng.random::<f64>() < TOGGLE_PROBABILITY {
            self.state.speed_kmh = if self.state.speed_kmh > 1.0 {
                0.0
            } else {
                self.rng.random_range(10.0..40.0)
            };
        }
    }

    /// Steps the model by one tick and returns the report stamped `timestamp`.
    pub fn tick(&mut self, dt_seconds: f64, timestamp: i64) -> PositionReport {
        self.step(dt_seconds);
        PositionReport {
            device_id: self.state.id,
            latitude: self.state.latitude,
            longitude: self.state.longitude,
            timestamp,
            speed_mps: self.state.speed_kmh * KMH_TO_MPS,
            bearing: self.state.bearing_degrees,
        }
    }
}
