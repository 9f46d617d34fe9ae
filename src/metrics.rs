//! Accuracy of an estimate stream against ground truth.

use crate::types::StateVector;

/// Per-component root-mean-square error over (px, py, vx, vy).
///
/// `None` when either slice is empty or the lengths differ.
pub fn rmse(estimates: &[StateVector], ground_truth: &[StateVector]) -> Option<StateVector> {
    if estimates.is_empty() || estimates.len() != ground_truth.len() {
        return None;
    }
    let sum_sq = estimates
        .iter()
        .zip(ground_truth)
        .fold(StateVector::zeros(), |acc, (est, gt)| {
            let residual = est - gt;
            acc + residual.component_mul(&residual)
        });
    Some((sum_sq / estimates.len() as f64).map(f64::sqrt))
}
