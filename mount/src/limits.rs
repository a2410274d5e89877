//! Software slew limits in mount coordinates.

use ephemeris::Horizontal;
use serde::{Deserialize, Serialize};

use crate::MotionError;

/// Allowed altitude band and azimuth arc, degrees.
///
/// When `az_min_deg > az_max_deg` the allowed arc runs through 0°
/// (e.g. 300 → 60 permits north-facing pointing only).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftLimits {
    pub alt_min_deg: f64,
    pub alt_max_deg: f64,
    pub az_min_deg: f64,
    pub az_max_deg: f64,
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            alt_min_deg: -90.0,
            alt_max_deg: 90.0,
            az_min_deg: 0.0,
            az_max_deg: 360.0,
        }
    }
}

impl SoftLimits {
    pub fn allows(&self, position: &Horizontal) -> bool {
        let alt = position.alt_deg;
        if !(self.alt_min_deg..=self.alt_max_deg).contains(&alt) {
            return false;
        }
        let az = position.az_deg;
        if self.az_min_deg <= self.az_max_deg {
            (self.az_min_deg..=self.az_max_deg).contains(&az)
        } else {
            az >= self.az_min_deg || az <= self.az_max_deg
        }
    }

    pub fn check(&self, position: &Horizontal) -> Result<(), MotionError> {
        if self.allows(position) {
            Ok(())
        } else {
            Err(MotionError::SoftLimitViolation {
                az_deg: position.az_deg,
                alt_deg: position.alt_deg,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_everything() {
        let limits = SoftLimits::default();
        for az in [0.0, 90.0, 359.9] {
            for alt in [-90.0, 0.0, 90.0] {
                assert!(limits.allows(&Horizontal::new(az, alt)));
            }
        }
    }

    #[test]
    fn test_altitude_band() {
        let limits = SoftLimits {
            alt_min_deg: 10.0,
            alt_max_deg: 80.0,
            ..SoftLimits::default()
        };
        assert!(limits.allows(&Horizontal::new(0.0, 10.0)));
        assert!(!limits.allows(&Horizontal::new(0.0, 9.9)));
        assert!(!limits.allows(&Horizontal::new(0.0, 85.0)));
        assert!(matches!(
            limits.check(&Horizontal::new(12.0, 5.0)),
            Err(MotionError::SoftLimitViolation { .. })
        ));
    }

    #[test]
    fn test_azimuth_arc_through_north() {
        let limits = SoftLimits {
            az_min_deg: 300.0,
            az_max_deg: 60.0,
            ..SoftLimits::default()
        };
        assert!(limits.allows(&Horizontal::new(330.0, 20.0)));
        assert!(limits.allows(&Horizontal::new(0.0, 20.0)));
        assert!(limits.allows(&Horizontal::new(45.0, 20.0)));
        assert!(!limits.allows(&Horizontal::new(180.0, 20.0)));
    }
}
