// sensor_fusion.rs — Lidar/radar fusion on top of the EKF core
//
// Everything in this module is independent of:
//   - file formats and measurement sources
//   - output writers and accuracy reporting
//
// It takes observations in and produces state estimates out, one observation
// at a time, synchronously. Callers that need concurrent read access must
// wrap the whole `FusionEkf` in their own lock.

use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FilterError};
use crate::filters::ekf::{transition_matrix, KalmanFilter, MeasurementModel, ProcessNoise};
use crate::polar::{polar_to_cartesian, radar_jacobian, DEFAULT_MIN_RANGE_SQUARED};
use crate::types::{
    LidarMatrix, LidarNoise, LidarObservation, LidarVector, Observation, RadarJacobian,
    RadarNoise, RadarObservation, RadarVector, SensorKind, StateMatrix, StateVector,
};

const MICROS_PER_SECOND: f64 = 1_000_000.0;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Process noise ──
    pub noise_ax: f64,
    pub noise_ay: f64,

    // ── Measurement noise (diagonal variances) ──
    pub lidar_noise: [f64; 2],
    pub radar_noise: [f64; 3],

    // ── Initial belief ──
    pub initial_covariance: [f64; 4],

    // ── Radar linearization ──
    pub min_range_squared: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            noise_ax: 9.0,
            noise_ay: 9.0,
            lidar_noise: [0.0225, 0.0225],
            radar_noise: [0.09, 0.0009, 0.09],
            initial_covariance: [1.0, 1.0, 1.0, 1.0],
            min_range_squared: DEFAULT_MIN_RANGE_SQUARED,
        }
    }
}

impl FusionConfig {
    /// Load a (possibly partial) JSON config; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a covariance indefinite or the Jacobian guard useless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [("noise_ax", self.noise_ax), ("noise_ay", self.noise_ay)];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }

        let positive = self
            .lidar_noise
            .iter()
            .map(|v| ("lidar_noise", *v))
            .chain(self.radar_noise.iter().map(|v| ("radar_noise", *v)))
            .chain(self.initial_covariance.iter().map(|v| ("initial_covariance", *v)))
            .chain(std::iter::once(("min_range_squared", self.min_range_squared)));
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} entries must be finite and > 0, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn process_noise(&self) -> ProcessNoise {
        ProcessNoise::new(self.noise_ax, self.noise_ay)
    }
}

/// Fixed per-sensor matrices derived once from the config.
#[derive(Clone, Debug)]
pub struct SensorModels {
    pub lidar_h: LidarMatrix,
    pub lidar_r: LidarNoise,
    pub radar_r: RadarNoise,
    pub initial_covariance: StateMatrix,
    pub process_noise: ProcessNoise,
    pub min_range_squared: f64,
}

impl SensorModels {
    pub fn from_config(config: &FusionConfig) -> Self {
        #[rustfmt::skip]
        let lidar_h = LidarMatrix::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        Self {
            lidar_h,
            lidar_r: LidarNoise::from_diagonal(&LidarVector::from(config.lidar_noise)),
            radar_r: RadarNoise::from_diagonal(&RadarVector::from(config.radar_noise)),
            initial_covariance: StateMatrix::from_diagonal(&StateVector::from(
                config.initial_covariance,
            )),
            process_noise: config.process_noise(),
            min_range_squared: config.min_range_squared,
        }
    }
}

// ─── Update strategies ───────────────────────────────────────────────────────

/// What a single `process_measurement` call did to the belief.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// First observation: belief seeded, nothing predicted or updated.
    Initialized,
    /// Predicted to the observation time and corrected with it.
    Updated,
    /// Predicted only; the measurement could not be used.
    PredictionOnly { reason: FilterError },
}

/// Sensor-specific initialization and correction.
///
/// Adding a sensor means one `Observation` variant plus one impl of this trait.
pub trait SensorMeasurement {
    const KIND: SensorKind;

    fn timestamp_us(&self) -> i64;

    /// Belief seeded from this observation alone (zero velocity).
    fn initial_state(&self) -> StateVector;

    /// Measurement model to install when this observation seeds the filter.
    fn initial_model(&self, models: &SensorModels) -> MeasurementModel;

    /// Correct the predicted belief with this observation.
    fn correct(
        &self,
        filter: &mut KalmanFilter,
        models: &SensorModels,
    ) -> Result<StepOutcome, FilterError>;
}

impl SensorMeasurement for LidarObservation {
    const KIND: SensorKind = SensorKind::Lidar;

    fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    fn initial_state(&self) -> StateVector {
        StateVector::new(self.px, self.py, 0.0, 0.0)
    }

    fn initial_model(&self, models: &SensorModels) -> MeasurementModel {
        MeasurementModel::Position { h: models.lidar_h, r: models.lidar_r }
    }

    fn correct(
        &self,
        filter: &mut KalmanFilter,
        models: &SensorModels,
    ) -> Result<StepOutcome, FilterError> {
        filter.set_measurement_model(self.initial_model(models));
        filter.update_linear(&self.as_vector())?;
        Ok(StepOutcome::Updated)
    }
}

impl SensorMeasurement for RadarObservation {
    const KIND: SensorKind = SensorKind::Radar;

    fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    /// Range rate is dropped: it cannot be split into vx/vy without a bearing rate.
    fn initial_state(&self) -> StateVector {
        let (px, py) = polar_to_cartesian(self.range, self.bearing);
        StateVector::new(px, py, 0.0, 0.0)
    }

    fn initial_model(&self, models: &SensorModels) -> MeasurementModel {
        // Recomputed at the first radar update; nothing to linearize around yet
        MeasurementModel::RangeBearing { h: RadarJacobian::zeros(), r: models.radar_r }
    }

    fn correct(
        &self,
        filter: &mut KalmanFilter,
        models: &SensorModels,
    ) -> Result<StepOutcome, FilterError> {
        let h = match radar_jacobian(filter.state(), models.min_range_squared) {
            Ok(h) => h,
            Err(reason @ FilterError::DegenerateLinearization { .. }) => {
                warn!("Skipping radar update at t={}us: {}", self.timestamp_us, reason);
                return Ok(StepOutcome::PredictionOnly { reason });
            }
            Err(e) => return Err(e),
        };
        filter.set_measurement_model(MeasurementModel::RangeBearing { h, r: models.radar_r });
        filter.update_nonlinear(&self.as_vector())?;
        Ok(StepOutcome::Updated)
    }
}

// ─── Fusion output snapshot ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Time of the last observation folded in [microseconds]
    pub timestamp_us: i64,
    pub px: f64,
    pub py: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed: f64,
    /// Covariance trace for uncertainty
    pub covariance_trace: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionStats {
    pub lidar_updates: u64,
    pub radar_updates: u64,
    pub skipped_updates: u64,
}

// ─── The main fusion struct ──────────────────────────────────────────────────

enum Session {
    Uninitialized,
    Running { filter: KalmanFilter, previous_timestamp_us: i64 },
}

pub struct FusionEkf {
    models: SensorModels,
    session: Session,
    stats: FusionStats,
}

/// Elapsed time between two microsecond timestamps [s]; never overflows for any `i64` pair.
fn elapsed_seconds(from_us: i64, to_us: i64) -> f64 {
    (i128::from(to_us) - i128::from(from_us)) as f64 / MICROS_PER_SECOND
}

impl FusionEkf {
    /// Start an uninitialized session. Rejects configs that `validate` rejects.
    pub fn new(config: &FusionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            models: SensorModels::from_config(config),
            session: Session::Uninitialized,
            stats: FusionStats::default(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.session, Session::Running { .. })
    }

    pub fn filter(&self) -> Option<&KalmanFilter> {
        match &self.session {
            Session::Running { filter, .. } => Some(filter),
            Session::Uninitialized => None,
        }
    }

    pub fn state(&self) -> Option<&StateVector> {
        self.filter().map(KalmanFilter::state)
    }

    pub fn covariance(&self) -> Option<&StateMatrix> {
        self.filter().map(KalmanFilter::covariance)
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    pub fn estimate(&self) -> Option<Estimate> {
        let Session::Running { filter, previous_timestamp_us } = &self.session else {
            return None;
        };
        let x = filter.state();
        Some(Estimate {
            timestamp_us: *previous_timestamp_us,
            px: x[0],
            py: x[1],
            vx: x[2],
            vy: x[3],
            speed: x.fixed_rows::<2>(2).norm(),
            covariance_trace: filter.covariance().trace(),
        })
    }

    /// Fold one observation into the belief.
    ///
    /// Observations must arrive in non-decreasing timestamp order.
    pub fn process_measurement(
        &mut self,
        observation: &Observation,
    ) -> Result<StepOutcome, FilterError> {
        match observation {
            Observation::Lidar(m) => self.step(m),
            Observation::Radar(m) => self.step(m),
        }
    }

    fn step<S: SensorMeasurement>(&mut self, measurement: &S) -> Result<StepOutcome, FilterError> {
        let timestamp_us = measurement.timestamp_us();

        let Session::Running { filter, previous_timestamp_us } = &mut self.session else {
            let x0 = measurement.initial_state();
            debug!("Initializing from {} at t={}us: {:?}", S::KIND, timestamp_us, x0.as_slice());
            let filter = KalmanFilter::new(
                x0,
                self.models.initial_covariance,
                transition_matrix(0.0),
                StateMatrix::zeros(),
                measurement.initial_model(&self.models),
            );
            self.session = Session::Running { filter, previous_timestamp_us: timestamp_us };
            return Ok(StepOutcome::Initialized);
        };

        if timestamp_us < *previous_timestamp_us {
            warn!(
                "Out-of-order {} observation: t={}us precedes t={}us",
                S::KIND,
                timestamp_us,
                previous_timestamp_us
            );
        }
        let dt = elapsed_seconds(*previous_timestamp_us, timestamp_us);
        *previous_timestamp_us = timestamp_us;

        filter.predict(dt, &self.models.process_noise);
        debug!("Predicted {:.6}s ahead for {} update", dt, S::KIND);

        let outcome = measurement.correct(filter, &self.models)?;
        match (&outcome, S::KIND) {
            (StepOutcome::Updated, SensorKind::Lidar) => self.stats.lidar_updates += 1,
            (StepOutcome::Updated, SensorKind::Radar) => self.stats.radar_updates += 1,
            (StepOutcome::PredictionOnly { .. }, _) => self.stats.skipped_updates += 1,
            (StepOutcome::Initialized, _) => {}
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn lidar(t: i64, px: f64, py: f64) -> Observation {
        LidarObservation::new(t, px, py).into()
    }

    fn radar(t: i64, range: f64, bearing: f64, range_rate: f64) -> Observation {
        RadarObservation::new(t, range, bearing, range_rate).into()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_noise() {
        let config = FusionConfig { radar_noise: [0.09, 0.0, 0.09], ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = FusionConfig { noise_ax: f64::NAN, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_config_keeps_defaults() {
        let config: FusionConfig = serde_json::from_str(r#"{"noise_ax": 4.0}"#).unwrap();
        assert_eq!(config.noise_ax, 4.0);
        assert_eq!(config.noise_ay, 9.0);
        assert_eq!(config.lidar_noise, [0.0225, 0.0225]);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fusion.json");
        std::fs::write(&path, r#"{"noise_ay": 2.5, "radar_noise": [0.1, 0.001, 0.1]}"#).unwrap();
        let config = FusionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.noise_ax, 9.0);
        assert_eq!(config.noise_ay, 2.5);
        assert_eq!(config.radar_noise, [0.1, 0.001, 0.1]);

        std::fs::write(&path, r#"{"lidar_noise": [0.0225, -1.0]}"#).unwrap();
        assert!(matches!(FusionConfig::from_json_file(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(FusionConfig::from_json_file(&path), Err(ConfigError::Parse(_))));

        let missing = dir.path().join("missing.json");
        assert!(matches!(FusionConfig::from_json_file(&missing), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_new_rejects_zero_variance_config() {
        let config = FusionConfig {
            lidar_noise: [0.0, 0.0],
            initial_covariance: [0.0; 4],
            noise_ax: 0.0,
            noise_ay: 0.0,
            ..Default::default()
        };
        assert!(matches!(FusionEkf::new(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_elapsed_seconds_covers_full_range() {
        assert_eq!(elapsed_seconds(1_000_000, 1_500_000), 0.5);
        assert_eq!(elapsed_seconds(2_000_000, 1_000_000), -1.0);
        let span = elapsed_seconds(i64::MIN, i64::MAX);
        assert!(span.is_finite() && span > 1.8e13);
    }

    #[test]
    fn test_uninitialized_has_no_estimate() {
        let fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        assert!(!fusion.is_initialized());
        assert!(fusion.state().is_none());
        assert!(fusion.estimate().is_none());
    }

    #[test]
    fn test_first_lidar_seeds_state() {
        let config = FusionConfig::default();
        let mut fusion = FusionEkf::new(&config).unwrap();
        let outcome = fusion.process_measurement(&lidar(0, 5.0, 3.0)).unwrap();
        assert_eq!(outcome, StepOutcome::Initialized);
        assert_eq!(*fusion.state().unwrap(), StateVector::new(5.0, 3.0, 0.0, 0.0));
        assert_eq!(*fusion.covariance().unwrap(), StateMatrix::identity());
        assert_eq!(fusion.stats(), &FusionStats::default());
    }

    #[test]
    fn test_first_radar_converts_polar() {
        let mut fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        fusion.process_measurement(&radar(0, 5.0, 0.0, 3.0)).unwrap();
        assert_eq!(*fusion.state().unwrap(), StateVector::new(5.0, 0.0, 0.0, 0.0));

        let mut fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        let bearing = std::f64::consts::FRAC_PI_2 + 4.0 * std::f64::consts::PI;
        fusion.process_measurement(&radar(0, 2.0, bearing, 0.0)).unwrap();
        let x = fusion.state().unwrap();
        assert_abs_diff_eq!(x[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_elapsed_time_drives_transition() {
        let mut fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        fusion.process_measurement(&lidar(1_000_000, 1.0, 1.0)).unwrap();
        fusion.process_measurement(&lidar(1_500_000, 1.1, 1.0)).unwrap();
        let filter = fusion.filter().unwrap();
        assert_abs_diff_eq!(filter.transition()[(0, 2)], 0.5);
        assert_abs_diff_eq!(filter.process_noise()[(2, 2)], 0.25 * 9.0);
        assert_eq!(fusion.estimate().unwrap().timestamp_us, 1_500_000);
        assert_eq!(fusion.stats().lidar_updates, 1);
    }

    #[test]
    fn test_radar_update_after_lidar_init() {
        let mut fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        fusion.process_measurement(&lidar(0, 3.0, 4.0)).unwrap();
        let bearing = (4.0f64).atan2(3.0);
        let outcome = fusion.process_measurement(&radar(100_000, 5.2, bearing, 1.0)).unwrap();
        assert_eq!(outcome, StepOutcome::Updated);
        assert_eq!(fusion.stats().radar_updates, 1);
        let model = fusion.filter().unwrap().measurement_model();
        assert!(matches!(model, MeasurementModel::RangeBearing { .. }));
        let est = fusion.estimate().unwrap();
        let range = (est.px * est.px + est.py * est.py).sqrt();
        assert!(range > 5.0 && range < 5.2);
    }

    #[test]
    fn test_degenerate_radar_counts_as_skipped() {
        let mut fusion = FusionEkf::new(&FusionConfig::default()).unwrap();
        fusion.process_measurement(&lidar(0, 0.0, 0.0)).unwrap();
        let outcome = fusion.process_measurement(&radar(1_000_000, 1.0, 0.3, 0.0)).unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::PredictionOnly { reason: FilterError::DegenerateLinearization { .. } }
        ));
        assert_eq!(fusion.stats().skipped_updates, 1);
        assert_eq!(fusion.stats().radar_updates, 0);
    }
}
