//! Sources of target positions over time.
//!
//! Tracking re-evaluates its target every tick, so a target is anything that
//! can report its apparent equatorial position at an arbitrary instant. Fixed
//! stars implement this trivially; solar-system bodies and satellites plug in
//! an external ephemeris behind the same trait.

use chrono::{DateTime, Utc};

use crate::coords::Equatorial;

/// A target whose equatorial position may change with time.
pub trait TargetSource: Send + Sync {
    /// Apparent right ascension / declination at `time`.
    fn equatorial_at(&self, time: DateTime<Utc>) -> Equatorial;

    /// Short label for logs.
    fn name(&self) -> String {
        "target".to_string()
    }
}

/// A sidereal target: fixed RA/Dec.
impl TargetSource for Equatorial {
    fn equatorial_at(&self, _time: DateTime<Utc>) -> Equatorial {
        *self
    }

    fn name(&self) -> String {
        format!(
            "RA {} Dec {}",
            crate::format::format_hms(self.ra_hours),
            crate::format::format_dms(self.dec_deg)
        )
    }
}

/// A target moving linearly in RA/Dec from a reference epoch, e.g. a comet
/// or a satellite pass segment fed from an external ephemeris.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftingTarget {
    pub start: Equatorial,
    pub epoch: DateTime<Utc>,
    /// Hours of RA per hour of time
    pub ra_rate: f64,
    /// Degrees of declination per hour of time
    pub dec_rate: f64,
}

impl TargetSource for DriftingTarget {
    fn equatorial_at(&self, time: DateTime<Utc>) -> Equatorial {
        let hours = (time - self.epoch).num_milliseconds() as f64 / 3_600_000.0;
        Equatorial::new(
            self.start.ra_hours + self.ra_rate * hours,
            self.start.dec_deg + self.dec_rate * hours,
        )
    }

    fn name(&self) -> String {
        "drifting target".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_fixed_target_is_constant() {
        let eq = Equatorial::new(5.5, 30.0);
        let t = Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap();
        assert_eq!(eq.equatorial_at(t), eq);
        assert_eq!(eq.equatorial_at(t + Duration::hours(5)), eq);
        assert_eq!(eq.name(), "RA 05h30m00.0s Dec +30°00'00\"");
    }

    #[test]
    fn test_drifting_target() {
        let epoch = Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap();
        let target = DriftingTarget {
            start: Equatorial::new(23.5, 10.0),
            epoch,
            ra_rate: 1.0,
            dec_rate: -2.0,
        };
        let later = target.equatorial_at(epoch + Duration::minutes(90));
        assert_abs_diff_eq!(later.ra_hours, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(later.dec_deg, 7.0, epsilon = 1e-9);
    }
}
