//! Lidar/radar fusion with an Extended Kalman Filter.
//!
//! [`sensor_fusion::FusionEkf`] consumes timestamped [`types::Observation`]s one at a
//! time and keeps a constant-velocity estimate of a single target's 2D position
//! and velocity. Lidar fixes use the linear Kalman update; radar returns use the
//! EKF update linearized with [`polar::radar_jacobian`].

pub mod error;
pub mod filters;
pub mod measurement_log;
pub mod metrics;
pub mod polar;
pub mod sensor_fusion;
pub mod types;

pub use error::{ConfigError, FilterError, LogError};
pub use filters::ekf::{KalmanFilter, MeasurementModel, ProcessNoise};
pub use sensor_fusion::{Estimate, FusionConfig, FusionEkf, FusionStats, StepOutcome};
pub use types::{LidarObservation, Observation, RadarObservation, SensorKind};
