//! AUX mount motion control.
//!
//! Ties the bus from `hardware`, the coordinate pipeline from `ephemeris`
//! and the pointing model from `alignment` into a [`MountController`]:
//!
//! - [`encoder`]: encoder counts per axis and their angles
//! - [`pointing`]: sky targets to counts through refraction and alignment
//! - [`limits`]: software slew limits
//! - [`goto`]: staged anti-backlash GoTo
//! - [`tracking`]: predictive rate tracking
//! - [`controller`]: the façade a front end drives
//! - [`config`]: JSON configuration

use std::time::Duration;

use hardware::aux::BusError;
use thiserror::Error;

pub mod config;
pub mod controller;
pub mod encoder;
pub mod goto;
pub mod limits;
pub mod pointing;
pub mod tracking;

pub use config::{ConfigError, ConnectionConfig, MountConfig};
pub use controller::{
    AlignmentStatus, Direction, MotionMode, MountController, MountIdentity, PositionReport,
};
pub use encoder::{Axis, EncoderGeometry, EncoderPosition, MountSteps};
pub use goto::{ApproachConfig, ApproachMode, GotoConfig, GotoProgress, GotoRunner, GotoStage};
pub use limits::SoftLimits;
pub use pointing::{Pointing, Target};
pub use tracking::{GuideRate, RateWindow, Tracker, TrackingConfig, TrackingLoop, TrackingState};

/// Errors from motion commands.
#[derive(Error, Debug)]
pub enum MotionError {
    /// A coordinate or count the mount cannot represent.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The move would leave the configured slew limits.
    #[error("Az {az_deg:.3}° Alt {alt_deg:.3}° is outside the soft limits")]
    SoftLimitViolation { az_deg: f64, alt_deg: f64 },

    /// The motion was pre-empted by an abort.
    #[error("motion aborted")]
    AbortRequested,

    /// Corrective passes did not bring the axis within tolerance.
    #[error("{axis} still {error_steps} steps off after {passes} passes")]
    SettleFailed { axis: Axis, error_steps: i64, passes: u32 },

    #[error("{axis} slew not complete after {waited:?}")]
    SlewTimeout { axis: Axis, waited: Duration },

    #[error("mount is parked")]
    Parked,

    /// A hardware fault was recorded and not yet cleared.
    #[error("mount is faulted; clear the fault before moving")]
    Faulted,

    #[error("bus error: {0}")]
    Bus(#[source] BusError),
}

impl MotionError {
    /// Whether the error means the hardware stopped answering.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            MotionError::Bus(BusError::Unavailable { .. } | BusError::Io(_))
        )
    }
}

impl From<BusError> for MotionError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::AbortRequested => MotionError::AbortRequested,
            other => MotionError::Bus(other),
        }
    }
}
