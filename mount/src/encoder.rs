//! Encoder counts and their axis angles.
//!
//! Both axes report 24-bit counts. Azimuth wraps modulo one revolution.
//! Altitude is treated as a signed linear axis: counts above half a
//! revolution are negative altitudes, so the direction of travel near the
//! horizon is never ambiguous.

use std::fmt;

use ephemeris::Horizontal;
use hardware::aux::{Device, U24_MAX};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::MotionError;

/// Counts per revolution of the stock motor controllers.
pub const DEFAULT_STEPS_PER_REV: u32 = 1 << 24;

/// A motor axis of an Alt-Az mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum Axis {
    Azimuth,
    Altitude,
}

impl Axis {
    pub const BOTH: [Axis; 2] = [Axis::Azimuth, Axis::Altitude];

    /// Motor controller driving this axis.
    pub fn device(self) -> Device {
        match self {
            Axis::Azimuth => Device::Azimuth,
            Axis::Altitude => Device::Altitude,
        }
    }
}

/// Raw counts of both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncoderPosition {
    pub azm_steps: u32,
    pub alt_steps: u32,
}

impl EncoderPosition {
    pub fn new(azm_steps: u32, alt_steps: u32) -> Self {
        Self { azm_steps, alt_steps }
    }

    pub fn get(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Azimuth => self.azm_steps,
            Axis::Altitude => self.alt_steps,
        }
    }
}

impl fmt::Display for EncoderPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "azm {} alt {}", self.azm_steps, self.alt_steps)
    }
}

/// Unrounded counts, used where quantization would add noise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MountSteps {
    pub azm: f64,
    pub alt: f64,
}

impl MountSteps {
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Azimuth => self.azm,
            Axis::Altitude => self.alt,
        }
    }
}

/// Counts-per-revolution of each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderGeometry {
    pub azm_steps_per_rev: u32,
    pub alt_steps_per_rev: u32,
}

impl Default for EncoderGeometry {
    fn default() -> Self {
        Self {
            azm_steps_per_rev: DEFAULT_STEPS_PER_REV,
            alt_steps_per_rev: DEFAULT_STEPS_PER_REV,
        }
    }
}

impl EncoderGeometry {
    pub fn steps_per_rev(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Azimuth => self.azm_steps_per_rev,
            Axis::Altitude => self.alt_steps_per_rev,
        }
    }

    /// Angle in degrees to unrounded counts, without wrapping.
    pub fn degrees_to_fractional(&self, axis: Axis, deg: f64) -> f64 {
        deg / 360.0 * self.steps_per_rev(axis) as f64
    }

    /// Angle in degrees to a raw count within one revolution.
    pub fn degrees_to_steps(&self, axis: Axis, deg: f64) -> Result<u32, MotionError> {
        if !deg.is_finite() {
            return Err(MotionError::OutOfRange(format!("{axis} angle {deg} is not finite")));
        }
        self.wrap(axis, self.degrees_to_fractional(axis, deg).round())
    }

    /// Raw count to degrees: azimuth in [0, 360), altitude in (-180, 180].
    pub fn steps_to_degrees(&self, axis: Axis, steps: u32) -> f64 {
        let rev = self.steps_per_rev(axis) as f64;
        let steps = (steps as f64).rem_euclid(rev);
        match axis {
            Axis::Azimuth => steps / rev * 360.0,
            Axis::Altitude => {
                let signed = if steps > rev / 2.0 { steps - rev } else { steps };
                signed / rev * 360.0
            }
        }
    }

    /// Fold unrounded counts into a raw count.
    pub fn wrap(&self, axis: Axis, steps: f64) -> Result<u32, MotionError> {
        if !steps.is_finite() {
            return Err(MotionError::OutOfRange(format!("{axis} steps {steps} are not finite")));
        }
        let rev = self.steps_per_rev(axis) as f64;
        let wrapped = steps.round().rem_euclid(rev) as u32;
        Ok(wrapped % self.steps_per_rev(axis))
    }

    /// Shortest signed distance in counts from `from` to `to`, in (-rev/2, rev/2].
    pub fn signed_delta(&self, axis: Axis, from: f64, to: f64) -> f64 {
        let rev = self.steps_per_rev(axis) as f64;
        let d = (to - from).rem_euclid(rev);
        if d > rev / 2.0 {
            d - rev
        } else {
            d
        }
    }

    /// Reject counts the 24-bit wire format or the axis cannot represent.
    pub fn validate(&self, position: &EncoderPosition) -> Result<(), MotionError> {
        for axis in Axis::BOTH {
            let steps = position.get(axis);
            if steps > U24_MAX || steps >= self.steps_per_rev(axis) {
                return Err(MotionError::OutOfRange(format!(
                    "{axis} steps {steps} outside [0, {})",
                    self.steps_per_rev(axis)
                )));
            }
        }
        Ok(())
    }

    pub fn horizontal_to_fractional(&self, hz: &Horizontal) -> MountSteps {
        let alt = self.degrees_to_fractional(Axis::Altitude, hz.alt_deg);
        MountSteps {
            azm: self.degrees_to_fractional(Axis::Azimuth, hz.az_deg),
            alt,
        }
    }

    pub fn horizontal_to_steps(&self, hz: &Horizontal) -> Result<EncoderPosition, MotionError> {
        Ok(EncoderPosition {
            azm_steps: self.degrees_to_steps(Axis::Azimuth, hz.az_deg)?,
            alt_steps: self.degrees_to_steps(Axis::Altitude, hz.alt_deg)?,
        })
    }

    pub fn fractional_to_steps(&self, steps: &MountSteps) -> Result<EncoderPosition, MotionError> {
        Ok(EncoderPosition {
            azm_steps: self.wrap(Axis::Azimuth, steps.azm)?,
            alt_steps: self.wrap(Axis::Altitude, steps.alt)?,
        })
    }

    pub fn steps_to_horizontal(&self, position: &EncoderPosition) -> Horizontal {
        Horizontal::new(
            self.steps_to_degrees(Axis::Azimuth, position.azm_steps),
            self.steps_to_degrees(Axis::Altitude, position.alt_steps),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_roundtrip_within_one_step() {
        let g = EncoderGeometry::default();
        let one_step_deg = 360.0 / DEFAULT_STEPS_PER_REV as f64;
        for az in [0.0, 0.001, 45.0, 179.999, 180.0, 270.5, 359.9999] {
            for alt in [-30.0, -0.001, 0.0, 12.345, 45.0, 85.0] {
                let hz = Horizontal::new(az, alt);
                let back = g.steps_to_horizontal(&g.horizontal_to_steps(&hz).unwrap());
                let daz = (back.az_deg - hz.az_deg + 180.0).rem_euclid(360.0) - 180.0;
                assert!(daz.abs() <= one_step_deg, "az {az}: {daz}");
                assert_abs_diff_eq!(back.alt_deg, hz.alt_deg, epsilon = one_step_deg);
            }
        }
    }

    #[test]
    fn test_negative_altitude_is_upper_half() {
        let g = EncoderGeometry::default();
        let steps = g.degrees_to_steps(Axis::Altitude, -10.0).unwrap();
        assert!(steps > DEFAULT_STEPS_PER_REV / 2);
        assert_abs_diff_eq!(g.steps_to_degrees(Axis::Altitude, steps), -10.0, epsilon = 1e-4);
    }

    #[test]
    fn test_azimuth_wraps() {
        let g = EncoderGeometry::default();
        assert_eq!(g.degrees_to_steps(Axis::Azimuth, 360.0).unwrap(), 0);
        assert_eq!(
            g.degrees_to_steps(Axis::Azimuth, -90.0).unwrap(),
            DEFAULT_STEPS_PER_REV / 4 * 3
        );
    }

    #[test]
    fn test_signed_delta_takes_short_way() {
        let g = EncoderGeometry::default();
        let rev = DEFAULT_STEPS_PER_REV as f64;
        assert_eq!(g.signed_delta(Axis::Azimuth, rev - 10.0, 10.0), 20.0);
        assert_eq!(g.signed_delta(Axis::Azimuth, 10.0, rev - 10.0), -20.0);
        assert_eq!(g.signed_delta(Axis::Altitude, 100.0, 50.0), -50.0);
    }

    #[test]
    fn test_non_finite_rejected() {
        let g = EncoderGeometry::default();
        assert!(matches!(
            g.degrees_to_steps(Axis::Azimuth, f64::NAN),
            Err(MotionError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_validate() {
        let g = EncoderGeometry::default();
        assert!(g.validate(&EncoderPosition::new(0, U24_MAX)).is_ok());
        assert!(g.validate(&EncoderPosition::new(U24_MAX + 1, 0)).is_err());
        let small = EncoderGeometry {
            azm_steps_per_rev: 1000,
            alt_steps_per_rev: 1000,
        };
        assert!(small.validate(&EncoderPosition::new(1000, 0)).is_err());
    }
}
