//! Linear algebra type system for the fusion filter
//!
//! Fixed-size aliases so every predict/update step is dimension-checked
//! at compile time.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 4; // (px, py, vx, vy)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_LIDAR: usize = 2; // (px, py)
pub const MEASURE_DIM_RADAR: usize = 3; // (range, bearing, range_rate)

// ===== State Types =====
pub type StateVector = SVector<f64, STATE_DIM>;
pub type StateMatrix = SMatrix<f64, STATE_DIM, STATE_DIM>;

// ===== Lidar Types =====
pub type LidarVector = SVector<f64, MEASURE_DIM_LIDAR>;
pub type LidarMatrix = SMatrix<f64, MEASURE_DIM_LIDAR, STATE_DIM>; // 2×4
pub type LidarNoise = SMatrix<f64, MEASURE_DIM_LIDAR, MEASURE_DIM_LIDAR>;

// ===== Radar Types =====
pub type RadarVector = SVector<f64, MEASURE_DIM_RADAR>;
pub type RadarJacobian = SMatrix<f64, MEASURE_DIM_RADAR, STATE_DIM>; // 3×4
pub type RadarNoise = SMatrix<f64, MEASURE_DIM_RADAR, MEASURE_DIM_RADAR>;

// Kalman gain types
pub type KalmanGain<const M: usize> = SMatrix<f64, STATE_DIM, M>; // 4×M
