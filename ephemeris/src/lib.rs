//! Celestial coordinate calculations for an observing site.
//!
//! Converts between apparent equatorial coordinates (RA/Dec of date) and
//! local horizontal coordinates (Az/Alt), with optional atmospheric
//! refraction. Time is handled as `chrono::DateTime<Utc>`.

pub mod coords;
pub mod format;
pub mod refraction;
pub mod target;
pub mod time;

use thiserror::Error;

pub use coords::{equatorial_to_horizontal, horizontal_to_equatorial, Equatorial, Horizontal, Site};
pub use format::{format_dms, format_hms, parse_sexagesimal};
pub use refraction::{apply_refraction, remove_refraction, Atmosphere};
pub use target::{DriftingTarget, TargetSource};
pub use time::{gmst_deg, julian_date, lst_deg};

/// Errors from coordinate construction and parsing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EphemerisError {
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("cannot parse angle: {0:?}")]
    Parse(String),
}
