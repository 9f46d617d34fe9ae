//! Radar measurement geometry.
//!
//! Conversions between the Cartesian filter state and the radar's polar
//! measurement space, plus the closed-form Jacobian used to linearize
//! the radar model at the current estimate.

use std::f64::consts::{PI, TAU};

use crate::error::FilterError;
use crate::types::{RadarJacobian, RadarVector, StateVector};

/// Squared range below which the radar Jacobian is treated as undefined [m²]
pub const DEFAULT_MIN_RANGE_SQUARED: f64 = 1e-4;

/// Wrap an angle into (−π, π].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        PI
    } else {
        wrapped
    }
}

/// Radar measurement function h(x): (range, bearing, range_rate) of a Cartesian state.
///
/// Range rate is reported as zero at the origin, where it is undefined.
pub fn cartesian_to_polar(x: &StateVector) -> RadarVector {
    let (px, py, vx, vy) = (x[0], x[1], x[2], x[3]);
    let range = (px * px + py * py).sqrt();
    let bearing = py.atan2(px);
    let range_rate = if range > f64::EPSILON {
        (px * vx + py * vy) / range
    } else {
        0.0
    };
    RadarVector::new(range, bearing, range_rate)
}

/// Position of a polar return in the Cartesian frame.
pub fn polar_to_cartesian(range: f64, bearing: f64) -> (f64, f64) {
    let phi = normalize_angle(bearing);
    (range * phi.cos(), range * phi.sin())
}

/// Innovation z − h(x) with the bearing residual wrapped into (−π, π].
pub fn polar_innovation(z: &RadarVector, x: &StateVector) -> RadarVector {
    let mut y = z - cartesian_to_polar(x);
    y[1] = normalize_angle(y[1]);
    y
}

/// Jacobian of h(x) evaluated at `x`.
///
/// Fails with `DegenerateLinearization` when px² + py² is below
/// `min_range_squared`, where the partials divide by zero.
pub fn radar_jacobian(
    x: &StateVector,
    min_range_squared: f64,
) -> Result<RadarJacobian, FilterError> {
    let (px, py, vx, vy) = (x[0], x[1], x[2], x[3]);

    let c1 = px * px + py * py;
    // NaN falls through to the error branch as well
    if !(c1 >= min_range_squared) {
        return Err(FilterError::DegenerateLinearization { range_squared: c1 });
    }
    let c2 = c1.sqrt();
    let c3 = c1 * c2;

    #[rustfmt::skip]
    let hj = RadarJacobian::new(
        px / c2,                          py / c2,                          0.0,     0.0,
        -py / c1,                         px / c1,                          0.0,     0.0,
        py * (vx * py - vy * px) / c3,    px * (px * vy - py * vx) / c3,    px / c2, py / c2,
    );
    Ok(hj)
}
