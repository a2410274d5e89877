//! Fitting each model tier to a set of alignment points.

use meter_math::{
    angle_between, levenberg_marquardt, weighted_rotation, LmConfig, ProcrustesError, SolverError,
};
use nalgebra::{DVector, Matrix3, Vector3};
use thiserror::Error;

use crate::model::{select_tier, AlignmentModel, ModelTier, MountGeometry};
use crate::point::AlignmentPoint;

const ARCSEC_PER_RADIAN: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

/// Scale of the proximity kernel, in squared chord length.
const PROXIMITY_SCALE: f64 = 0.5;

/// Why a tier could not be fitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("{tier} model needs at least {needed} points, have {have}")]
    InsufficientPoints {
        tier: ModelTier,
        needed: usize,
        have: usize,
    },

    #[error("rotation fit failed: {0}")]
    Rotation(#[from] ProcrustesError),

    #[error("{tier} least squares failed: {source}")]
    Solver {
        tier: ModelTier,
        #[source]
        source: SolverError,
    },

    #[error("{0} fit produced a non-finite model")]
    NonFinite(ModelTier),
}

/// Fewest points the tier is fitted from.
pub fn min_points(tier: ModelTier) -> usize {
    match tier {
        ModelTier::Identity => 0,
        ModelTier::Rotation => 1,
        ModelTier::AxisOffset => 3,
        ModelTier::Geometric => 6,
    }
}

/// Angle between two directions in arcseconds.
pub fn angle_arcsec(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    angle_between(a, b) * ARCSEC_PER_RADIAN
}

/// Misfit of one point under `model`, arcseconds.
pub fn residual_arcsec(model: &AlignmentModel, point: &AlignmentPoint) -> f64 {
    angle_arcsec(&model.apply(&point.sky), &point.mount)
}

/// Unweighted RMS misfit over `points`, arcseconds (0 for no points).
pub fn rms_arcsec(model: &AlignmentModel, points: &[AlignmentPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let sum: f64 = points.iter().map(|p| residual_arcsec(model, p).powi(2)).sum();
    (sum / points.len() as f64).sqrt()
}

/// Point weights boosted near `target`: `w · (1 + 10·bias·exp(−|sky − target|² / 0.5))`.
pub fn proximity_weights(points: &[AlignmentPoint], target: &Vector3<f64>, bias: f64) -> Vec<f64> {
    points
        .iter()
        .map(|p| {
            let distance_sq = (p.sky - target).norm_squared();
            p.weight * (1.0 + 10.0 * bias * (-distance_sq / PROXIMITY_SCALE).exp())
        })
        .collect()
}

/// Weighted best-fit rotation from sky vectors to mount vectors.
pub fn fit_rotation(points: &[AlignmentPoint], weights: &[f64]) -> Result<Matrix3<f64>, FitError> {
    let sky: Vec<Vector3<f64>> = points.iter().map(|p| p.sky).collect();
    let mount: Vec<Vector3<f64>> = points.iter().map(|p| p.mount).collect();
    Ok(weighted_rotation(&sky, &mount, weights)?)
}

/// Rotation fit re-weighted towards `target`.
pub fn local_rotation(
    points: &[AlignmentPoint],
    target: &Vector3<f64>,
    bias: f64,
) -> Result<Matrix3<f64>, FitError> {
    fit_rotation(points, &proximity_weights(points, target, bias))
}

/// Least-squares fit of the mechanical terms of an offset tier.
///
/// Residuals are the weighted chord between predicted and observed mount
/// vectors, three per point.
pub fn fit_geometry(
    points: &[AlignmentPoint],
    tier: ModelTier,
    seed: &MountGeometry,
    config: &LmConfig,
) -> Result<MountGeometry, FitError> {
    let scales: Vec<f64> = points.iter().map(|p| p.weight.max(0.0).sqrt()).collect();
    let residuals = |params: &DVector<f64>| {
        let geometry = MountGeometry::from_params(params.as_slice());
        let mut r = DVector::zeros(points.len() * 3);
        for (i, (point, scale)) in points.iter().zip(&scales).enumerate() {
            let diff = (geometry.apply(&point.sky) - point.mount) * *scale;
            r.fixed_rows_mut::<3>(i * 3).copy_from(&diff);
        }
        r
    };

    let initial = DVector::from_vec(seed.to_params(tier));
    let report = levenberg_marquardt(residuals, initial, config)
        .map_err(|source| FitError::Solver { tier, source })?;
    log::debug!(
        "{} fit converged in {} iterations, cost {:e}",
        tier,
        report.iterations,
        report.cost
    );

    let geometry = MountGeometry::from_params(report.params.as_slice());
    if geometry.to_params(ModelTier::Geometric).iter().all(|p| p.is_finite()) {
        Ok(geometry)
    } else {
        Err(FitError::NonFinite(tier))
    }
}

/// Fit exactly `tier` to `points`.
pub fn fit_model(
    points: &[AlignmentPoint],
    tier: ModelTier,
    config: &LmConfig,
) -> Result<AlignmentModel, FitError> {
    let needed = min_points(tier);
    if points.len() < needed {
        return Err(FitError::InsufficientPoints {
            tier,
            needed,
            have: points.len(),
        });
    }

    if tier == ModelTier::Identity {
        return Ok(AlignmentModel::Identity);
    }

    let weights: Vec<f64> = points.iter().map(|p| p.weight).collect();
    let rotation = fit_rotation(points, &weights)?;
    if rotation.iter().any(|x| !x.is_finite()) {
        return Err(FitError::NonFinite(ModelTier::Rotation));
    }

    match tier {
        ModelTier::Rotation => Ok(AlignmentModel::Rotation(rotation)),
        ModelTier::AxisOffset => {
            let seed = MountGeometry::from_rotation(&rotation);
            fit_geometry(points, tier, &seed, config).map(AlignmentModel::AxisOffset)
        }
        ModelTier::Geometric => {
            let seed = MountGeometry::from_rotation(&rotation);
            fit_geometry(points, tier, &seed, config).map(AlignmentModel::Geometric)
        }
        ModelTier::Identity => Ok(AlignmentModel::Identity),
    }
}

/// Fit the tier the point count calls for.
pub fn fit_auto(points: &[AlignmentPoint], config: &LmConfig) -> Result<AlignmentModel, FitError> {
    fit_model(points, select_tier(points.len()), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::SectorKey;
    use approx::assert_abs_diff_eq;
    use chrono::Utc;
    use meter_math::from_spherical;
    use nalgebra::Rotation3;

    fn point(sky: Vector3<f64>, mount: Vector3<f64>) -> AlignmentPoint {
        AlignmentPoint {
            sky,
            mount,
            timestamp: Utc::now(),
            weight: 1.0,
            residual_arcsec: 0.0,
            sector: SectorKey::of(&sky, 15.0),
            sequence: 0,
        }
    }

    fn synthetic(model: &AlignmentModel, directions: &[(f64, f64)]) -> Vec<AlignmentPoint> {
        directions
            .iter()
            .map(|(az, alt)| {
                let sky = from_spherical(az.to_radians(), alt.to_radians());
                point(sky, model.apply(&sky))
            })
            .collect()
    }

    #[test]
    fn test_rotation_recovered() {
        let truth = Rotation3::from_euler_angles(0.01, -0.02, 0.3).into_inner();
        let model = AlignmentModel::Rotation(truth);
        let points = synthetic(&model, &[(10.0, 20.0), (130.0, 45.0)]);
        let fitted = fit_model(&points, ModelTier::Rotation, &LmConfig::default()).unwrap();
        assert!(rms_arcsec(&fitted, &points) < 1e-6);
    }

    #[test]
    fn test_insufficient_points() {
        let model = AlignmentModel::Identity;
        let points = synthetic(&model, &[(10.0, 20.0), (130.0, 45.0)]);
        let err = fit_model(&points, ModelTier::AxisOffset, &LmConfig::default()).unwrap_err();
        assert_eq!(
            err,
            FitError::InsufficientPoints {
                tier: ModelTier::AxisOffset,
                needed: 3,
                have: 2
            }
        );
    }

    #[test]
    fn test_proximity_weights_favour_nearby_points() {
        let model = AlignmentModel::Identity;
        let points = synthetic(&model, &[(0.0, 30.0), (180.0, 30.0)]);
        let target = points[0].sky;
        let weights = proximity_weights(&points, &target, 1.0);
        assert_abs_diff_eq!(weights[0], 11.0, epsilon = 1e-12);
        assert!(weights[1] < 1.01);
        assert_eq!(proximity_weights(&points, &target, 0.0), vec![1.0, 1.0]);
    }

    #[test]
    fn test_axis_offset_absorbs_altitude_index() {
        let truth = MountGeometry {
            pitch: 0.001,
            yaw: 0.5,
            altitude_index: 0.004,
            ..MountGeometry::default()
        };
        let model = AlignmentModel::AxisOffset(truth);
        let points = synthetic(
            &model,
            &[(20.0, 15.0), (110.0, 50.0), (250.0, 35.0), (300.0, 70.0)],
        );

        let rotation_only = fit_model(&points, ModelTier::Rotation, &LmConfig::default()).unwrap();
        let fitted = fit_model(&points, ModelTier::AxisOffset, &LmConfig::default()).unwrap();
        assert!(rms_arcsec(&rotation_only, &points) > 10.0);
        assert!(rms_arcsec(&fitted, &points) < 0.01);
        assert_abs_diff_eq!(fitted.geometry().altitude_index, 0.004, epsilon = 1e-7);
    }

    #[test]
    fn test_rms_of_empty_set() {
        assert_eq!(rms_arcsec(&AlignmentModel::Identity, &[]), 0.0);
    }
}
