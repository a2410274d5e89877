//! Equatorial and horizontal coordinates of an observing site.
//!
//! Azimuth is measured from north through east. Right ascension and
//! declination are apparent coordinates of date; no precession or nutation
//! is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::lst_deg;
use crate::EphemerisError;

/// Observing location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Geodetic latitude, degrees north
    pub latitude_deg: f64,
    /// Longitude, degrees east
    pub longitude_deg: f64,
    /// Height above sea level, meters
    #[serde(default)]
    pub elevation_m: f64,
}

impl Site {
    pub fn new(
        latitude_deg: f64,
        longitude_deg: f64,
        elevation_m: f64,
    ) -> Result<Self, EphemerisError> {
        if !(-90.0..=90.0).contains(&latitude_deg) || !latitude_deg.is_finite() {
            return Err(EphemerisError::InvalidCoordinate(format!(
                "latitude {latitude_deg} outside [-90, 90]"
            )));
        }
        if !longitude_deg.is_finite() {
            return Err(EphemerisError::InvalidCoordinate(format!(
                "longitude {longitude_deg} is not finite"
            )));
        }
        Ok(Self {
            latitude_deg,
            longitude_deg: wrap_180(longitude_deg),
            elevation_m,
        })
    }

    /// Local sidereal time at `time`, degrees.
    pub fn local_sidereal_time(&self, time: DateTime<Utc>) -> f64 {
        lst_deg(time, self.longitude_deg)
    }
}

impl Default for Site {
    /// Greenwich, sea level.
    fn default() -> Self {
        Self {
            latitude_deg: 51.4769,
            longitude_deg: 0.0,
            elevation_m: 0.0,
        }
    }
}

/// Right ascension / declination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Equatorial {
    /// Right ascension, hours [0, 24)
    pub ra_hours: f64,
    /// Declination, degrees [-90, 90]
    pub dec_deg: f64,
}

impl Equatorial {
    pub fn new(ra_hours: f64, dec_deg: f64) -> Self {
        Self {
            ra_hours: ra_hours.rem_euclid(24.0),
            dec_deg: dec_deg.clamp(-90.0, 90.0),
        }
    }

    pub fn ra_deg(&self) -> f64 {
        self.ra_hours * 15.0
    }

    /// Great-circle distance in degrees.
    pub fn separation(&self, other: &Equatorial) -> f64 {
        separation_deg(self.ra_deg(), self.dec_deg, other.ra_deg(), other.dec_deg)
    }
}

/// Azimuth / altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Horizontal {
    /// Azimuth, degrees [0, 360), north = 0, east = 90
    pub az_deg: f64,
    /// Altitude above the horizon, degrees [-90, 90]
    pub alt_deg: f64,
}

impl Horizontal {
    pub fn new(az_deg: f64, alt_deg: f64) -> Self {
        Self {
            az_deg: az_deg.rem_euclid(360.0),
            alt_deg: alt_deg.clamp(-90.0, 90.0),
        }
    }

    /// Great-circle distance in degrees.
    pub fn separation(&self, other: &Horizontal) -> f64 {
        separation_deg(self.az_deg, self.alt_deg, other.az_deg, other.alt_deg)
    }
}

fn wrap_180(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Haversine-free great-circle distance via atan2, robust at 0 and 180 degrees.
fn separation_deg(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lon1, lat1, lon2, lat2) = (
        lon1.to_radians(),
        lat1.to_radians(),
        lon2.to_radians(),
        lat2.to_radians(),
    );
    let dlon = lon2 - lon1;
    let a = lat2.cos() * dlon.sin();
    let b = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let c = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * dlon.cos();
    a.hypot(b).atan2(c).to_degrees()
}

/// Apparent position of `eq` in the sky of `site` at `time`.
pub fn equatorial_to_horizontal(eq: &Equatorial, time: DateTime<Utc>, site: &Site) -> Horizontal {
    let hour_angle = (site.local_sidereal_time(time) - eq.ra_deg()).to_radians();
    let lat = site.latitude_deg.to_radians();
    let dec = eq.dec_deg.to_radians();

    let sin_alt =
        (lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos()).clamp(-1.0, 1.0);
    let alt = sin_alt.asin();

    let y = -dec.cos() * hour_angle.sin();
    let x = dec.sin() * lat.cos() - dec.cos() * lat.sin() * hour_angle.cos();
    let az = if x == 0.0 && y == 0.0 { 0.0 } else { y.atan2(x) };

    Horizontal::new(az.to_degrees(), alt.to_degrees())
}

/// Inverse of [`equatorial_to_horizontal`].
pub fn horizontal_to_equatorial(hz: &Horizontal, time: DateTime<Utc>, site: &Site) -> Equatorial {
    let lat = site.latitude_deg.to_radians();
    let alt = hz.alt_deg.to_radians();
    let az = hz.az_deg.to_radians();

    let sin_dec = (lat.sin() * alt.sin() + lat.cos() * alt.cos() * az.cos()).clamp(-1.0, 1.0);
    let dec = sin_dec.asin();

    let y = -az.sin() * alt.cos();
    let x = alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos();
    let hour_angle = if x == 0.0 && y == 0.0 { 0.0 } else { y.atan2(x) };

    let ra_deg = site.local_sidereal_time(time) - hour_angle.to_degrees();
    Equatorial::new(ra_deg / 15.0, dec.to_degrees())
}
