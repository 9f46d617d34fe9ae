pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Sensor that produced an observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Lidar,
    Radar,
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Lidar => write!(f, "lidar"),
            SensorKind::Radar => write!(f, "radar"),
        }
    }
}

/// Cartesian position fix from a lidar.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LidarObservation {
    /// Capture time [microseconds]
    pub timestamp_us: i64,
    pub px: f64,
    pub py: f64,
}

/// Polar return from a radar.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadarObservation {
    /// Capture time [microseconds]
    pub timestamp_us: i64,
    /// Distance to the object [m]
    pub range: f64,
    /// Angle from the x axis [rad]
    pub bearing: f64,
    /// Radial velocity [m/s]
    pub range_rate: f64,
}

impl LidarObservation {
    pub fn new(timestamp_us: i64, px: f64, py: f64) -> Self {
        Self { timestamp_us, px, py }
    }

    pub fn as_vector(&self) -> LidarVector {
        LidarVector::new(self.px, self.py)
    }
}

impl RadarObservation {
    pub fn new(timestamp_us: i64, range: f64, bearing: f64, range_rate: f64) -> Self {
        Self { timestamp_us, range, bearing, range_rate }
    }

    pub fn as_vector(&self) -> RadarVector {
        RadarVector::new(self.range, self.bearing, self.range_rate)
    }
}

/// One timestamped sensor reading, consumed once by the fusion filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sensor", rename_all = "lowercase")]
pub enum Observation {
    Lidar(LidarObservation),
    Radar(RadarObservation),
}

impl Observation {
    pub fn timestamp_us(&self) -> i64 {
        match self {
            Observation::Lidar(m) => m.timestamp_us,
            Observation::Radar(m) => m.timestamp_us,
        }
    }

    pub fn sensor(&self) -> SensorKind {
        match self {
            Observation::Lidar(_) => SensorKind::Lidar,
            Observation::Radar(_) => SensorKind::Radar,
        }
    }
}

impl From<LidarObservation> for Observation {
    fn from(m: LidarObservation) -> Self {
        Observation::Lidar(m)
    }
}

impl From<RadarObservation> for Observation {
    fn from(m: RadarObservation) -> Self {
        Observation::Radar(m)
    }
}
