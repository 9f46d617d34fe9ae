//! Extended Kalman Filter core for a 2D constant-velocity target
//!
//! State Vector (4D):
//! [0-1]: Position (px, py) [meters]
//! [2-3]: Velocity (vx, vy) [m/s]
//!
//! The core only knows the shape of the measurement model it has been
//! handed. Which sensor produced a measurement is the orchestrator's concern.
use log::trace;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::polar::polar_innovation;
use crate::types::{
    KalmanGain, LidarMatrix, LidarNoise, LidarVector, RadarJacobian, RadarNoise, RadarVector,
    StateMatrix, StateVector, STATE_DIM,
};

/// Acceleration noise intensities driving the constant-velocity model [m²/s⁴]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessNoise {
    pub noise_ax: f64,
    pub noise_ay: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        Self { noise_ax: 9.0, noise_ay: 9.0 }
    }
}

impl ProcessNoise {
    pub fn new(noise_ax: f64, noise_ay: f64) -> Self {
        Self { noise_ax, noise_ay }
    }

    /// Discretized white-acceleration covariance for an elapsed time `dt` [s].
    pub fn covariance(&self, dt: f64) -> StateMatrix {
        let dt_2 = dt * dt;
        let dt_3 = dt_2 * dt;
        let dt_4 = dt_3 * dt;
        let (ax, ay) = (self.noise_ax, self.noise_ay);

        #[rustfmt::skip]
        let q = StateMatrix::new(
            dt_4 / 4.0 * ax, 0.0,             dt_3 / 2.0 * ax, 0.0,
            0.0,             dt_4 / 4.0 * ay, 0.0,             dt_3 / 2.0 * ay,
            dt_3 / 2.0 * ax, 0.0,             dt_2 * ax,       0.0,
            0.0,             dt_3 / 2.0 * ay, 0.0,             dt_2 * ay,
        );
        q
    }
}

/// Constant-velocity state transition for an elapsed time `dt` [s].
pub fn transition_matrix(dt: f64) -> StateMatrix {
    let mut f = StateMatrix::identity();
    f[(0, 2)] = dt;
    f[(1, 3)] = dt;
    f
}

/// Measurement matrix and noise the next update will use.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasurementModel {
    /// Linear position observation (2×4 H, 2×2 R)
    Position { h: LidarMatrix, r: LidarNoise },
    /// Range/bearing/range-rate observation, H being the Jacobian at the current estimate
    RangeBearing { h: RadarJacobian, r: RadarNoise },
}

impl MeasurementModel {
    pub fn dim(&self) -> usize {
        match self {
            MeasurementModel::Position { .. } => 2,
            MeasurementModel::RangeBearing { .. } => 3,
        }
    }
}

pub struct KalmanFilter {
    /// State vector [4D]
    x: StateVector,

    /// State covariance [4x4]
    p: StateMatrix,

    /// State transition [4x4]
    f: StateMatrix,

    /// Process noise covariance [4x4]
    q: StateMatrix,

    /// Active measurement model (H, R)
    model: MeasurementModel,
}

impl KalmanFilter {
    /// Set up the filter from an initial belief and its model matrices.
    pub fn new(
        x0: StateVector,
        p0: StateMatrix,
        f0: StateMatrix,
        q0: StateMatrix,
        model: MeasurementModel,
    ) -> Self {
        Self { x: x0, p: p0, f: f0, q: q0, model }
    }

    pub fn state(&self) -> &StateVector {
        &self.x
    }

    pub fn covariance(&self) -> &StateMatrix {
        &self.p
    }

    pub fn transition(&self) -> &StateMatrix {
        &self.f
    }

    pub fn process_noise(&self) -> &StateMatrix {
        &self.q
    }

    pub fn measurement_model(&self) -> &MeasurementModel {
        &self.model
    }

    pub fn set_transition_matrix(&mut self, f: StateMatrix) {
        self.f = f;
    }

    pub fn set_process_noise(&mut self, q: StateMatrix) {
        self.q = q;
    }

    pub fn set_measurement_model(&mut self, model: MeasurementModel) {
        self.model = model;
    }

    /// Rebuild F and Q for the elapsed time `dt` [s], then propagate.
    pub fn predict(&mut self, dt: f64, noise: &ProcessNoise) {
        self.set_transition_matrix(transition_matrix(dt));
        self.set_process_noise(noise.covariance(dt));
        self.propagate();
    }

    /// x ← F·x, P ← F·P·Fᵀ + Q with the currently assigned F and Q.
    pub fn propagate(&mut self) {
        self.x = self.f * self.x;
        let scale = self.p.amax();
        self.p = self.f * self.p * self.f.transpose() + self.q;
        self.symmetrize();
        self.debug_check_covariance(scale);
    }

    /// Standard Kalman update with innovation z − H·x.
    pub fn update_linear(&mut self, z: &LidarVector) -> Result<(), FilterError> {
        let MeasurementModel::Position { h, r } = self.model else {
            return Err(FilterError::ModelMismatch { expected: 2, actual: self.model.dim() });
        };
        let y = z - h * self.x;
        self.correct(&y, &h, &r)
    }

    /// EKF update with innovation z − h(x), bearing residual wrapped into (−π, π].
    ///
    /// H must already hold the Jacobian of h evaluated at the current state.
    pub fn update_nonlinear(&mut self, z: &RadarVector) -> Result<(), FilterError> {
        let MeasurementModel::RangeBearing { h, r } = self.model else {
            return Err(FilterError::ModelMismatch { expected: 3, actual: self.model.dim() });
        };
        let y = polar_innovation(z, &self.x);
        self.correct(&y, &h, &r)
    }

    fn correct<const M: usize>(
        &mut self,
        y: &SMatrix<f64, M, 1>,
        h: &SMatrix<f64, M, STATE_DIM>,
        r: &SMatrix<f64, M, M>,
    ) -> Result<(), FilterError> {
        let ht = h.transpose();
        let s = h * self.p * ht + r;
        let si = s.try_inverse().ok_or(FilterError::SingularInnovation)?;
        let k: KalmanGain<M> = self.p * ht * si;

        let scale = self.p.amax();
        self.x += k * y;
        // Joseph form: stays positive semi-definite under rounding at large P
        let i_kh = StateMatrix::identity() - k * h;
        self.p = i_kh * self.p * i_kh.transpose() + k * r * k.transpose();
        self.symmetrize();
        trace!("innovation {:?} gain trace {:.4}", y.as_slice(), (k * h).trace());

        self.debug_check_covariance(scale);
        Ok(())
    }

    fn symmetrize(&mut self) {
        self.p = (self.p + self.p.transpose()) * 0.5;
    }

    /// Development-time check that P is still symmetric with a non-negative diagonal.
    ///
    /// `prior_scale` is the magnitude of P before the step; rounding error scales with it.
    fn debug_check_covariance(&self, prior_scale: f64) {
        if cfg!(debug_assertions) {
            let scale = self.p.amax().max(prior_scale).max(1.0);
            let asymmetry = (self.p - self.p.transpose()).amax();
            debug_assert!(
                asymmetry <= 1e-6 * scale,
                "covariance lost symmetry (max |P - Pᵀ| = {asymmetry:e})"
            );
            debug_assert!(
                (0..STATE_DIM).all(|i| self.p[(i, i)] >= -1e-9 * scale),
                "covariance has a negative variance: {:?}",
                self.p.diagonal().as_slice()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn lidar_model() -> MeasurementModel {
        #[rustfmt::skip]
        let h = LidarMatrix::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        MeasurementModel::Position { h, r: LidarNoise::identity() * 0.0225 }
    }

    fn filter_at(x0: StateVector) -> KalmanFilter {
        KalmanFilter::new(
            x0,
            StateMatrix::identity(),
            transition_matrix(1.0),
            StateMatrix::zeros(),
            lidar_model(),
        )
    }

    #[test]
    fn test_process_noise_blocks() {
        let q = ProcessNoise::new(9.0, 4.0).covariance(2.0);
        assert_abs_diff_eq!(q[(0, 0)], 16.0 / 4.0 * 9.0);
        assert_abs_diff_eq!(q[(0, 2)], 8.0 / 2.0 * 9.0);
        assert_abs_diff_eq!(q[(2, 2)], 4.0 * 9.0);
        assert_abs_diff_eq!(q[(1, 1)], 16.0 / 4.0 * 4.0);
        assert_abs_diff_eq!(q[(3, 3)], 4.0 * 4.0);
        // No cross-axis coupling
        assert_eq!(q[(0, 1)], 0.0);
        assert_eq!(q[(0, 3)], 0.0);
        assert_eq!(q[(2, 3)], 0.0);
        assert_eq!(q, q.transpose());
    }

    #[test]
    fn test_predict_noise_free_moves_by_velocity() {
        let mut kf = filter_at(StateVector::new(0.0, 0.0, 1.0, 1.0));
        kf.predict(1.0, &ProcessNoise::new(0.0, 0.0));
        assert_abs_diff_eq!(*kf.state(), StateVector::new(1.0, 1.0, 1.0, 1.0), epsilon = 1e-12);
        assert_eq!(kf.transition()[(0, 2)], 1.0);
        assert_eq!(kf.transition()[(1, 3)], 1.0);
    }

    #[test]
    fn test_predict_grows_uncertainty() {
        let mut kf = filter_at(StateVector::new(0.0, 0.0, 1.0, 1.0));
        let before = kf.covariance().trace();
        kf.predict(0.1, &ProcessNoise::default());
        assert!(kf.covariance().trace() > before);
    }

    #[test]
    fn test_propagate_uses_assigned_matrices() {
        let mut kf = filter_at(StateVector::new(2.0, -1.0, 0.5, 0.25));
        kf.set_transition_matrix(transition_matrix(4.0));
        kf.set_process_noise(StateMatrix::identity());
        kf.propagate();
        assert_abs_diff_eq!(*kf.state(), StateVector::new(4.0, 0.0, 0.5, 0.25), epsilon = 1e-12);
        // P = F·I·Fᵀ + I
        assert_abs_diff_eq!(kf.covariance()[(0, 0)], 1.0 + 16.0 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_update_reduces_trace() {
        let mut kf = filter_at(StateVector::new(1.0, 1.0, 0.0, 0.0));
        kf.predict(0.5, &ProcessNoise::default());
        let prior = kf.covariance().trace();
        kf.update_linear(&LidarVector::new(1.3, 0.8)).unwrap();
        assert!(kf.covariance().trace() <= prior);
        assert!(kf.state()[0] > 1.0 && kf.state()[0] < 1.3);
    }

    #[test]
    fn test_update_rejects_wrong_model() {
        let mut kf = filter_at(StateVector::new(1.0, 1.0, 0.0, 0.0));
        let err = kf.update_nonlinear(&RadarVector::new(1.0, 0.0, 0.0)).unwrap_err();
        assert_eq!(err, FilterError::ModelMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_singular_innovation_is_reported() {
        let mut kf = KalmanFilter::new(
            StateVector::zeros(),
            StateMatrix::zeros(),
            transition_matrix(0.0),
            StateMatrix::zeros(),
            MeasurementModel::Position { h: LidarMatrix::zeros(), r: LidarNoise::zeros() },
        );
        let err = kf.update_linear(&LidarVector::new(1.0, 1.0)).unwrap_err();
        assert_eq!(err, FilterError::SingularInnovation);
        assert_eq!(*kf.state(), StateVector::zeros());
    }

    #[test]
    fn test_covariance_stays_symmetric_after_long_gap() {
        let mut kf = filter_at(StateVector::new(3.0, 4.0, 0.5, -0.2));
        for dt in [30.0, 1000.0] {
            kf.predict(dt, &ProcessNoise::default());
            kf.update_linear(&LidarVector::new(3.0, 4.0)).unwrap();
            let p = kf.covariance();
            assert_eq!(*p, p.transpose());
            assert!((0..STATE_DIM).all(|i| p[(i, i)] >= 0.0), "diag {:?}", p.diagonal());
        }
        // Position variance can never exceed the sensor's own after a direct fix
        assert!(kf.covariance()[(0, 0)] <= 0.0225 + 1e-9);
    }

    #[test]
    fn test_nonlinear_update_pulls_toward_measurement() {
        let x0 = StateVector::new(4.0, 0.0, 0.0, 0.0);
        let h = crate::polar::radar_jacobian(&x0, crate::polar::DEFAULT_MIN_RANGE_SQUARED).unwrap();
        let r = RadarNoise::from_diagonal(&RadarVector::new(0.09, 0.0009, 0.09));
        let mut kf = KalmanFilter::new(
            x0,
            StateMatrix::identity(),
            transition_matrix(0.0),
            StateMatrix::zeros(),
            MeasurementModel::RangeBearing { h, r },
        );
        kf.update_nonlinear(&RadarVector::new(5.0, 0.0, 0.0)).unwrap();
        assert!(kf.state()[0] > 4.5 && kf.state()[0] < 5.0);
        assert_abs_diff_eq!(kf.state()[1], 0.0, epsilon = 1e-12);
    }
}
