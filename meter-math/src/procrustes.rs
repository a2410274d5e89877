//! Best-fit rotation between matched unit-vector sets via SVD.
//!
//! Given pairs `(a_i, b_i)` and weights `w_i`, finds the proper rotation `R`
//! minimizing `Σ w_i ‖R a_i − b_i‖²`. The weighted cross-covariance
//! `H = Σ w_i b_i a_iᵀ` is decomposed as `U Σ Vᵀ`; the solution is `U Vᵀ`
//! with the axis of the smallest singular value flipped when that product
//! would be a reflection.

use nalgebra::{Matrix3, Rotation3, Unit, Vector3};
use thiserror::Error;

/// Errors from rotation fitting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcrustesError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("SVD decomposition failed to produce U or V^T matrices")]
    SvdFailed,
}

/// Weighted orthogonal Procrustes fit mapping `from` onto `to`.
///
/// A single pair yields the minimal rotation (see [`minimal_rotation`]);
/// two or more pairs use the SVD solution.
pub fn weighted_rotation(
    from: &[Vector3<f64>],
    to: &[Vector3<f64>],
    weights: &[f64],
) -> Result<Matrix3<f64>, ProcrustesError> {
    if from.len() != to.len() || from.len() != weights.len() {
        return Err(ProcrustesError::ArgumentError(format!(
            "mismatched lengths: {} from, {} to, {} weights",
            from.len(),
            to.len(),
            weights.len()
        )));
    }
    if from.is_empty() {
        return Err(ProcrustesError::ArgumentError(
            "cannot fit rotation to empty point set".to_string(),
        ));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ProcrustesError::ArgumentError(
            "weights must be finite and non-negative".to_string(),
        ));
    }
    if from.len() == 1 {
        return Ok(minimal_rotation(&from[0], &to[0]));
    }

    let mut h = Matrix3::zeros();
    for ((a, b), w) in from.iter().zip(to).zip(weights) {
        h += *w * b * a.transpose();
    }

    let svd = h.svd(true, true);
    let mut u = svd.u.ok_or(ProcrustesError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(ProcrustesError::SvdFailed)?;

    let mut r = u * v_t;

    // Handle reflection case
    if r.determinant() < 0.0 {
        let weakest = svd.singular_values.imin();
        u.column_mut(weakest).neg_mut();
        r = u * v_t;
    }

    Ok(r)
}

/// Smallest rotation carrying direction `a` onto direction `b` (Rodrigues).
///
/// Antiparallel inputs rotate by π about an arbitrary perpendicular axis.
pub fn minimal_rotation(a: &Vector3<f64>, b: &Vector3<f64>) -> Matrix3<f64> {
    if let Some(rotation) = Rotation3::rotation_between(a, b) {
        return rotation.into_inner();
    }
    let helper = if a.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let axis = Unit::new_normalize(a.cross(&helper));
    Rotation3::from_axis_angle(&axis, std::f64::consts::PI).into_inner()
}
