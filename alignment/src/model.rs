//! Pointing models mapping ideal sky directions to encoder directions.
//!
//! Every tier is a closed variant of [`AlignmentModel`]. The mechanical
//! terms of the offset tiers are applied after the rotation, in the rotated
//! frame:
//!
//! ```text
//! v   = R(roll, pitch, yaw) · sky
//! az  = az(v) + cone / cos(alt) + non_perp · tan(alt)
//! alt = alt(v) + altitude_index
//! ```
//!
//! which is undone in closed form by reversing the steps.

use std::fmt;

use meter_math::{from_spherical, to_spherical};
use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Floor on `cos(alt)` in the cone term.
const MIN_COS_ALT: f64 = 0.01;

/// Altitude clamp for the `tan(alt)` term, radians (89°).
const MAX_TAN_ALT: f64 = 89.0 * std::f64::consts::PI / 180.0;

/// Model complexity, ordered from simplest to richest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelTier {
    Identity,
    Rotation,
    AxisOffset,
    Geometric,
}

impl ModelTier {
    /// Next simpler tier, if any.
    pub fn fallback(self) -> Option<ModelTier> {
        match self {
            ModelTier::Identity => None,
            ModelTier::Rotation => Some(ModelTier::Identity),
            ModelTier::AxisOffset => Some(ModelTier::Rotation),
            ModelTier::Geometric => Some(ModelTier::AxisOffset),
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelTier::Identity => "identity",
            ModelTier::Rotation => "rotation",
            ModelTier::AxisOffset => "axis-offset",
            ModelTier::Geometric => "geometric",
        };
        f.write_str(name)
    }
}

/// Tier fitted for a given number of points.
pub fn select_tier(point_count: usize) -> ModelTier {
    match point_count {
        0 => ModelTier::Identity,
        1..=2 => ModelTier::Rotation,
        3..=5 => ModelTier::AxisOffset,
        _ => ModelTier::Geometric,
    }
}

/// Mechanical parameters of the offset tiers, all in radians.
///
/// `roll` and `pitch` tilt the azimuth axis, `yaw` is the azimuth
/// zero-point. The axis-offset tier fits only the first four terms and
/// keeps `cone` and `non_perpendicularity` at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MountGeometry {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    /// Altitude encoder zero-point error
    pub altitude_index: f64,
    /// Optical axis not perpendicular to the altitude axis
    pub cone: f64,
    /// Altitude axis not perpendicular to the azimuth axis
    pub non_perpendicularity: f64,
}

impl MountGeometry {
    /// Parameters from a rotation matrix alone.
    pub fn from_rotation(rotation: &Matrix3<f64>) -> Self {
        let (roll, pitch, yaw) = Rotation3::from_matrix_unchecked(*rotation).euler_angles();
        Self {
            roll,
            pitch,
            yaw,
            ..Self::default()
        }
    }

    /// Parameters unpacked from a solver vector (4 or 6 entries).
    pub fn from_params(params: &[f64]) -> Self {
        let get = |i: usize| params.get(i).copied().unwrap_or(0.0);
        Self {
            roll: get(0),
            pitch: get(1),
            yaw: get(2),
            altitude_index: get(3),
            cone: get(4),
            non_perpendicularity: get(5),
        }
    }

    /// Solver vector for `tier` (4 entries for axis-offset, 6 otherwise).
    pub fn to_params(&self, tier: ModelTier) -> Vec<f64> {
        let mut params = vec![self.roll, self.pitch, self.yaw, self.altitude_index];
        if tier == ModelTier::Geometric {
            params.push(self.cone);
            params.push(self.non_perpendicularity);
        }
        params
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        Rotation3::from_euler_angles(self.roll, self.pitch, self.yaw).into_inner()
    }

    fn azimuth_correction(&self, alt: f64) -> f64 {
        self.cone / alt.cos().max(MIN_COS_ALT)
            + self.non_perpendicularity * alt.clamp(-MAX_TAN_ALT, MAX_TAN_ALT).tan()
    }

    pub fn apply(&self, sky: &Vector3<f64>) -> Vector3<f64> {
        let (az, alt) = to_spherical(&(self.rotation() * sky));
        from_spherical(az + self.azimuth_correction(alt), alt + self.altitude_index)
    }

    pub fn inverse(&self, mount: &Vector3<f64>) -> Vector3<f64> {
        let (az, alt) = to_spherical(mount);
        let alt = alt - self.altitude_index;
        let rotated = from_spherical(az - self.azimuth_correction(alt), alt);
        self.rotation().transpose() * rotated
    }
}

/// Fitted pointing model.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AlignmentModel {
    #[default]
    Identity,
    /// Orthonormal matrix taking sky vectors to mount vectors
    Rotation(Matrix3<f64>),
    AxisOffset(MountGeometry),
    Geometric(MountGeometry),
}

impl AlignmentModel {
    pub fn tier(&self) -> ModelTier {
        match self {
            AlignmentModel::Identity => ModelTier::Identity,
            AlignmentModel::Rotation(_) => ModelTier::Rotation,
            AlignmentModel::AxisOffset(_) => ModelTier::AxisOffset,
            AlignmentModel::Geometric(_) => ModelTier::Geometric,
        }
    }

    /// Sky direction to the encoder direction that points at it.
    pub fn apply(&self, sky: &Vector3<f64>) -> Vector3<f64> {
        match self {
            AlignmentModel::Identity => *sky,
            AlignmentModel::Rotation(r) => r * sky,
            AlignmentModel::AxisOffset(g) | AlignmentModel::Geometric(g) => g.apply(sky),
        }
    }

    /// Encoder direction to the sky direction it points at.
    pub fn inverse(&self, mount: &Vector3<f64>) -> Vector3<f64> {
        match self {
            AlignmentModel::Identity => *mount,
            AlignmentModel::Rotation(r) => r.transpose() * mount,
            AlignmentModel::AxisOffset(g) | AlignmentModel::Geometric(g) => g.inverse(mount),
        }
    }

    /// Mechanical terms, with the rotation decomposed for the rotation tier.
    pub fn geometry(&self) -> MountGeometry {
        match self {
            AlignmentModel::Identity => MountGeometry::default(),
            AlignmentModel::Rotation(r) => MountGeometry::from_rotation(r),
            AlignmentModel::AxisOffset(g) | AlignmentModel::Geometric(g) => *g,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use meter_math::angle_between;

    fn sample_geometry() -> MountGeometry {
        MountGeometry {
            roll: 0.3_f64.to_radians(),
            pitch: -0.2_f64.to_radians(),
            yaw: 12.0_f64.to_radians(),
            altitude_index: 0.15_f64.to_radians(),
            cone: 0.1_f64.to_radians(),
            non_perpendicularity: -0.05_f64.to_radians(),
        }
    }

    fn sky_grid() -> Vec<Vector3<f64>> {
        let mut out = Vec::new();
        for az in (0..360).step_by(40) {
            for alt in [5.0_f64, 30.0, 60.0, 80.0] {
                out.push(from_spherical((az as f64).to_radians(), alt.to_radians()));
            }
        }
        out
    }

    #[test]
    fn test_select_tier() {
        assert_eq!(select_tier(0), ModelTier::Identity);
        assert_eq!(select_tier(1), ModelTier::Rotation);
        assert_eq!(select_tier(2), ModelTier::Rotation);
        assert_eq!(select_tier(3), ModelTier::AxisOffset);
        assert_eq!(select_tier(5), ModelTier::AxisOffset);
        assert_eq!(select_tier(6), ModelTier::Geometric);
        assert_eq!(select_tier(500), ModelTier::Geometric);
    }

    #[test]
    fn test_fallback_chain() {
        assert_eq!(ModelTier::Geometric.fallback(), Some(ModelTier::AxisOffset));
        assert_eq!(ModelTier::AxisOffset.fallback(), Some(ModelTier::Rotation));
        assert_eq!(ModelTier::Rotation.fallback(), Some(ModelTier::Identity));
        assert_eq!(ModelTier::Identity.fallback(), None);
    }

    #[test]
    fn test_identity_passes_through() {
        let model = AlignmentModel::Identity;
        for v in sky_grid() {
            assert_eq!(model.apply(&v), v);
            assert_eq!(model.inverse(&v), v);
        }
    }

    #[test]
    fn test_geometry_inverse_is_exact() {
        let model = AlignmentModel::Geometric(sample_geometry());
        for sky in sky_grid() {
            let back = model.inverse(&model.apply(&sky));
            assert!(angle_between(&back, &sky) < 1e-12, "{sky:?} -> {back:?}");
        }
    }

    #[test]
    fn test_rotation_inverse_is_transpose() {
        let r = Rotation3::from_euler_angles(0.1, -0.2, 0.7).into_inner();
        let model = AlignmentModel::Rotation(r);
        for sky in sky_grid() {
            let back = model.inverse(&model.apply(&sky));
            assert_relative_eq!(back, sky, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_euler_decomposition_roundtrip() {
        let g = sample_geometry();
        let decomposed = MountGeometry::from_rotation(&g.rotation());
        assert_relative_eq!(decomposed.roll, g.roll, epsilon = 1e-12);
        assert_relative_eq!(decomposed.pitch, g.pitch, epsilon = 1e-12);
        assert_relative_eq!(decomposed.yaw, g.yaw, epsilon = 1e-12);
    }

    #[test]
    fn test_altitude_index_shifts_altitude_only() {
        let g = MountGeometry {
            altitude_index: 1.0_f64.to_radians(),
            ..MountGeometry::default()
        };
        let (az, alt) = to_spherical(&g.apply(&from_spherical(1.0, 0.5)));
        assert_relative_eq!(az, 1.0, epsilon = 1e-12);
        assert_relative_eq!(alt, 0.5 + 1.0_f64.to_radians(), epsilon = 1e-12);
    }

    #[test]
    fn test_cone_grows_toward_zenith() {
        let g = MountGeometry {
            cone: 0.01,
            ..MountGeometry::default()
        };
        let shift = |alt: f64| to_spherical(&g.apply(&from_spherical(1.0, alt))).0 - 1.0;
        assert_relative_eq!(shift(0.0), 0.01, epsilon = 1e-12);
        assert!(shift(1.2) > 2.0 * shift(0.0));
        // near the zenith the cos floor keeps the term finite
        assert!(shift(89.999_f64.to_radians()).is_finite());
    }

    #[test]
    fn test_params_layout() {
        let g = sample_geometry();
        assert_eq!(g.to_params(ModelTier::AxisOffset).len(), 4);
        let params = g.to_params(ModelTier::Geometric);
        assert_eq!(params.len(), 6);
        assert_eq!(MountGeometry::from_params(&params), g);
        let four = MountGeometry::from_params(&params[..4]);
        assert_eq!(four.cone, 0.0);
        assert_eq!(four.non_perpendicularity, 0.0);
    }
}
