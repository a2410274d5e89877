//! Atmospheric refraction (Bennett's formula).
//!
//! Refraction raises objects: the apparent altitude exceeds the geometric
//! one by roughly half a degree at the horizon and nothing at the zenith.
//! The correction is applied between [`MIN_ALTITUDE_DEG`] and
//! [`MAX_ALTITUDE_DEG`]; outside that band altitudes pass through unchanged.

use serde::{Deserialize, Serialize};

/// Lowest altitude at which refraction is modelled.
pub const MIN_ALTITUDE_DEG: f64 = -2.0;

/// Above this the correction is below a hundredth of an arcsecond.
pub const MAX_ALTITUDE_DEG: f64 = 89.9;

const REMOVE_ITERATIONS: usize = 3;

/// Atmospheric conditions scaling the standard refraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Atmosphere {
    pub pressure_hpa: f64,
    pub temperature_c: f64,
}

impl Default for Atmosphere {
    fn default() -> Self {
        Self {
            pressure_hpa: 1010.0,
            temperature_c: 10.0,
        }
    }
}

impl Atmosphere {
    /// Meeus ch. 16 pressure / temperature factor (1.0 at the defaults).
    fn scale(&self) -> f64 {
        (self.pressure_hpa / 1010.0) * (283.0 / (273.0 + self.temperature_c))
    }

    /// Refraction in degrees for an object at `alt_deg`.
    pub fn refraction_deg(&self, alt_deg: f64) -> f64 {
        if !(MIN_ALTITUDE_DEG..=MAX_ALTITUDE_DEG).contains(&alt_deg) {
            return 0.0;
        }
        let arg = (alt_deg + 7.31 / (alt_deg + 4.4)).to_radians();
        self.scale() * (1.0 / arg.tan()) / 60.0
    }

    /// Geometric altitude to apparent altitude.
    pub fn apply(&self, true_alt_deg: f64) -> f64 {
        true_alt_deg + self.refraction_deg(true_alt_deg)
    }

    /// Apparent altitude to geometric altitude, by fixed-point iteration
    /// on [`apply`](Self::apply).
    pub fn remove(&self, apparent_alt_deg: f64) -> f64 {
        if !(MIN_ALTITUDE_DEG..=MAX_ALTITUDE_DEG).contains(&apparent_alt_deg) {
            return apparent_alt_deg;
        }
        let mut alt = apparent_alt_deg;
        for _ in 0..REMOVE_ITERATIONS {
            alt = apparent_alt_deg - self.refraction_deg(alt);
        }
        alt
    }
}

/// [`Atmosphere::apply`] under standard conditions.
pub fn apply_refraction(true_alt_deg: f64) -> f64 {
    Atmosphere::default().apply(true_alt_deg)
}

/// [`Atmosphere::remove`] under standard conditions.
pub fn remove_refraction(apparent_alt_deg: f64) -> f64 {
    Atmosphere::default().remove(apparent_alt_deg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_horizon_refraction_is_about_half_a_degree() {
        let r = apply_refraction(0.0) - 0.0;
        assert!(r > 0.45 && r < 0.6, "refraction at horizon {r}");
    }

    #[test]
    fn test_refraction_at_45_degrees() {
        // roughly one arcminute
        let r = (apply_refraction(45.0) - 45.0) * 60.0;
        assert_abs_diff_eq!(r, 1.0, epsilon = 0.05);
    }

    #[test]
    fn test_outside_band_unchanged() {
        assert_eq!(apply_refraction(-10.0), -10.0);
        assert_eq!(apply_refraction(89.95), 89.95);
        assert_eq!(remove_refraction(-5.0), -5.0);
    }

    #[test]
    fn test_remove_inverts_apply() {
        for alt in [5.0, 10.0, 20.0, 45.0, 70.0, 89.0] {
            let back = remove_refraction(apply_refraction(alt));
            // 0.1 arcsec
            assert_abs_diff_eq!(back, alt, epsilon = 0.1 / 3600.0);
        }
    }

    #[test]
    fn test_cold_dense_air_refracts_more() {
        let cold = Atmosphere {
            pressure_hpa: 1030.0,
            temperature_c: -10.0,
        };
        assert!(cold.refraction_deg(10.0) > Atmosphere::default().refraction_deg(10.0));
    }
}
