//! Alignment observations and the sky sectors used to thin them.

use chrono::{DateTime, Utc};
use ephemeris::Horizontal;
use meter_math::{from_spherical, to_spherical};
use nalgebra::Vector3;

/// Unit vector for an azimuth / altitude pair in degrees.
pub fn horizontal_to_vector(hz: &Horizontal) -> Vector3<f64> {
    from_spherical(hz.az_deg.to_radians(), hz.alt_deg.to_radians())
}

/// Azimuth / altitude in degrees of a (not necessarily unit) vector.
pub fn vector_to_horizontal(v: &Vector3<f64>) -> Horizontal {
    let (lon, lat) = to_spherical(v);
    Horizontal::new(lon.to_degrees(), lat.to_degrees())
}

/// One star observation: where the sky says the star is, and where the
/// encoders say the mount was pointing when it was centred.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPoint {
    /// Ideal topocentric direction (refracted Alt/Az of the catalogue position)
    pub sky: Vector3<f64>,
    /// Direction reported by the encoders
    pub mount: Vector3<f64>,
    pub timestamp: DateTime<Utc>,
    pub weight: f64,
    /// Angular misfit under the current model, arcseconds
    pub residual_arcsec: f64,
    pub(crate) sector: SectorKey,
    pub(crate) sequence: u64,
}

impl AlignmentPoint {
    pub fn sector(&self) -> SectorKey {
        self.sector
    }
}

/// Grid cell of the sky, indexed by the sky vector's azimuth and altitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorKey {
    pub az_index: u16,
    pub alt_index: u16,
}

impl SectorKey {
    /// Sector containing `sky` for square cells of `size_deg`.
    pub fn of(sky: &Vector3<f64>, size_deg: f64) -> Self {
        let hz = vector_to_horizontal(sky);
        Self {
            az_index: (hz.az_deg / size_deg).floor() as u16,
            alt_index: ((hz.alt_deg + 90.0) / size_deg).floor() as u16,
        }
    }
}
