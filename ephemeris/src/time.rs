//! Julian dates and sidereal time.

use chrono::{DateTime, Utc};

/// Julian date of the Unix epoch.
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Julian date of J2000.0.
pub const J2000_JD: f64 = 2_451_545.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Julian date (UTC) of an instant.
pub fn julian_date(time: DateTime<Utc>) -> f64 {
    let seconds = time.timestamp() as f64 + time.timestamp_subsec_nanos() as f64 * 1e-9;
    UNIX_EPOCH_JD + seconds / SECONDS_PER_DAY
}

/// Greenwich mean sidereal time in degrees [0, 360) (Meeus eq. 12.4).
pub fn gmst_deg(time: DateTime<Utc>) -> f64 {
    let d = julian_date(time) - J2000_JD;
    let t = d / 36_525.0;
    let theta = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    theta.rem_euclid(360.0)
}

/// Local mean sidereal time in degrees [0, 360) for an east-positive longitude.
pub fn lst_deg(time: DateTime<Utc>, longitude_deg: f64) -> f64 {
    (gmst_deg(time) + longitude_deg).rem_euclid(360.0)
}
