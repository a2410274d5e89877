//! Unit vectors on the celestial / mount sphere.
//!
//! Longitude is measured from +X towards +Y, latitude from the XY plane
//! towards +Z. All angles are radians.

use nalgebra::Vector3;

/// Unit vector for a (longitude, latitude) pair.
pub fn from_spherical(lon: f64, lat: f64) -> Vector3<f64> {
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    Vector3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat)
}

/// (longitude in [0, 2π), latitude in [-π/2, π/2]) of a vector.
///
/// The vector need not be normalized. At the poles the longitude is 0.
pub fn to_spherical(v: &Vector3<f64>) -> (f64, f64) {
    let rho = v.x.hypot(v.y);
    let lat = v.z.atan2(rho);
    let lon = if rho == 0.0 {
        0.0
    } else {
        v.y.atan2(v.x).rem_euclid(std::f64::consts::TAU)
    };
    (lon, lat)
}

/// Angle between two vectors, accurate for both tiny and near-π separations.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.cross(b).norm().atan2(a.dot(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_roundtrip() {
        for &(lon, lat) in &[(0.3, 0.2), (4.0, -1.1), (PI, 0.0), (6.2, 1.5)] {
            let (lon2, lat2) = to_spherical(&from_spherical(lon, lat));
            assert_relative_eq!(lon2, lon, epsilon = 1e-12);
            assert_relative_eq!(lat2, lat, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_pole() {
        let (lon, lat) = to_spherical(&Vector3::new(0.0, 0.0, 2.0));
        assert_eq!(lon, 0.0);
        assert_relative_eq!(lat, FRAC_PI_2);
    }

    #[test]
    fn test_small_angle_precision() {
        let arcsec = (1.0f64 / 3600.0).to_radians();
        let a = from_spherical(1.0, 0.5);
        let b = from_spherical(1.0, 0.5 + arcsec);
        assert_relative_eq!(angle_between(&a, &b), arcsec, max_relative = 1e-6);
    }
}
