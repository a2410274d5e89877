//! Sky positions to encoder counts and back.
//!
//! ```text
//! RA/Dec --(site, time)--> Alt/Az --(refraction)--> apparent Alt/Az
//!        --(alignment model)--> mount Alt/Az --(geometry)--> steps
//! ```

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alignment::AlignmentEngine;
use chrono::{DateTime, Duration, Utc};
use ephemeris::{
    equatorial_to_horizontal, horizontal_to_equatorial, Atmosphere, Equatorial, Horizontal, Site,
    TargetSource,
};

use crate::encoder::{EncoderGeometry, EncoderPosition, MountSteps};
use crate::MotionError;

/// Something to point at.
#[derive(Clone)]
pub enum Target {
    /// Raw encoder counts, bypassing the alignment model
    Steps(EncoderPosition),
    /// Fixed apparent Alt/Az in the sky frame
    Horizontal(Horizontal),
    /// Fixed RA/Dec of date
    Equatorial(Equatorial),
    /// A moving body supplied by an ephemeris
    Body(Arc<dyn TargetSource>),
}

impl Target {
    /// RA/Dec of the target at `time`, for targets that have one.
    pub fn equatorial_at(&self, time: DateTime<Utc>) -> Option<Equatorial> {
        match self {
            Target::Equatorial(eq) => Some(*eq),
            Target::Body(source) => Some(source.equatorial_at(time)),
            Target::Steps(_) | Target::Horizontal(_) => None,
        }
    }

    /// Whether the target moves across the sky and must be re-resolved.
    pub fn is_moving(&self) -> bool {
        matches!(self, Target::Equatorial(_) | Target::Body(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Steps(pos) => write!(f, "steps {pos}"),
            Target::Horizontal(hz) => write!(f, "Az {:.4}° Alt {:.4}°", hz.az_deg, hz.alt_deg),
            Target::Equatorial(eq) => f.write_str(&eq.name()),
            Target::Body(source) => f.write_str(&source.name()),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({self})")
    }
}

/// Site, refraction, alignment and encoder geometry combined.
///
/// Clones share the alignment engine.
#[derive(Clone)]
pub struct Pointing {
    site: Site,
    geometry: EncoderGeometry,
    atmosphere: Option<Atmosphere>,
    alignment: Arc<RwLock<AlignmentEngine>>,
}

impl Pointing {
    pub fn new(
        site: Site,
        geometry: EncoderGeometry,
        atmosphere: Option<Atmosphere>,
        alignment: AlignmentEngine,
    ) -> Self {
        Self {
            site,
            geometry,
            atmosphere,
            alignment: Arc::new(RwLock::new(alignment)),
        }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn geometry(&self) -> &EncoderGeometry {
        &self.geometry
    }

    pub fn refraction(&self) -> Option<&Atmosphere> {
        self.atmosphere.as_ref()
    }

    pub fn alignment(&self) -> RwLockReadGuard<'_, AlignmentEngine> {
        self.alignment.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn alignment_mut(&self) -> RwLockWriteGuard<'_, AlignmentEngine> {
        self.alignment.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Where `eq` appears in the sky at `time`, refraction included when enabled.
    pub fn apparent_horizontal(&self, eq: &Equatorial, time: DateTime<Utc>) -> Horizontal {
        let hz = equatorial_to_horizontal(eq, time, &self.site);
        match &self.atmosphere {
            Some(atmosphere) => Horizontal::new(hz.az_deg, atmosphere.apply(hz.alt_deg)),
            None => hz,
        }
    }

    /// Sky Alt/Az to the mount Alt/Az the encoders must read.
    pub fn sky_to_mount(&self, sky: &Horizontal) -> Horizontal {
        self.alignment().apply_horizontal(sky)
    }

    /// Mount Alt/Az to the sky Alt/Az it points at.
    pub fn mount_to_sky(&self, mount: &Horizontal) -> Horizontal {
        self.alignment().inverse_horizontal(mount)
    }

    /// Unrounded counts for `eq` evaluated at `time + time_offset`.
    pub fn equatorial_to_steps(
        &self,
        eq: &Equatorial,
        time: DateTime<Utc>,
        time_offset: Duration,
    ) -> MountSteps {
        let sky = self.apparent_horizontal(eq, time + time_offset);
        self.geometry.horizontal_to_fractional(&self.sky_to_mount(&sky))
    }

    /// Apparent sky Alt/Az the encoders at `position` point at.
    pub fn steps_to_sky(&self, position: &EncoderPosition) -> Horizontal {
        self.mount_to_sky(&self.geometry.steps_to_horizontal(position))
    }

    /// RA/Dec the encoders at `position` point at.
    pub fn steps_to_equatorial(
        &self,
        position: &EncoderPosition,
        time: DateTime<Utc>,
    ) -> Equatorial {
        let sky = self.steps_to_sky(position);
        let geometric = match &self.atmosphere {
            Some(atmosphere) => Horizontal::new(sky.az_deg, atmosphere.remove(sky.alt_deg)),
            None => sky,
        };
        horizontal_to_equatorial(&geometric, time, &self.site)
    }

    /// Unrounded counts for `target` at `time + time_offset`.
    pub fn target_steps(
        &self,
        target: &Target,
        time: DateTime<Utc>,
        time_offset: Duration,
    ) -> MountSteps {
        match target {
            Target::Steps(pos) => MountSteps {
                azm: pos.azm_steps as f64,
                alt: pos.alt_steps as f64,
            },
            Target::Horizontal(hz) => {
                self.geometry.horizontal_to_fractional(&self.sky_to_mount(hz))
            }
            Target::Equatorial(eq) => self.equatorial_to_steps(eq, time, time_offset),
            Target::Body(source) => {
                let at = time + time_offset;
                self.equatorial_to_steps(&source.equatorial_at(at), time, time_offset)
            }
        }
    }

    /// Raw counts for `target` at `time`.
    pub fn resolve(
        &self,
        target: &Target,
        time: DateTime<Utc>,
    ) -> Result<EncoderPosition, MotionError> {
        if let Target::Steps(pos) = target {
            self.geometry.validate(pos)?;
            return Ok(*pos);
        }
        self.geometry
            .fractional_to_steps(&self.target_steps(target, time, Duration::zero()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Axis;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    fn scenario() -> (Pointing, DateTime<Utc>) {
        let site = Site::new(50.0, 20.0, 0.0).unwrap();
        let pointing =
            Pointing::new(site, EncoderGeometry::default(), None, AlignmentEngine::default());
        (pointing, Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap())
    }

    #[test]
    fn test_reference_target_encoder_counts() {
        let (pointing, time) = scenario();
        let pos = pointing.resolve(&Target::Equatorial(Equatorial::new(5.5, 30.0)), time).unwrap();
        let hz = pointing.geometry().steps_to_horizontal(&pos);
        assert_abs_diff_eq!(hz.alt_deg, 69.273_48, epsilon = 1.0 / 60.0);
        assert_abs_diff_eq!(hz.az_deg, 162.092_12, epsilon = 1.0 / 60.0);
    }

    #[test]
    fn test_steps_to_equatorial_inverts() {
        let (pointing, time) = scenario();
        let eq = Equatorial::new(5.5, 30.0);
        let pos = pointing.resolve(&Target::Equatorial(eq), time).unwrap();
        let back = pointing.steps_to_equatorial(&pos, time);
        // within a few encoder steps
        assert!(eq.separation(&back) < 1e-3, "{back:?}");
    }

    #[test]
    fn test_refraction_raises_target() {
        let (plain, time) = scenario();
        let refracted = Pointing::new(
            *plain.site(),
            EncoderGeometry::default(),
            Some(Atmosphere::default()),
            AlignmentEngine::default(),
        );
        let eq = Equatorial::new(5.5, 30.0);
        let a = plain.equatorial_to_steps(&eq, time, Duration::zero());
        let b = refracted.equatorial_to_steps(&eq, time, Duration::zero());
        assert!(b.alt > a.alt);
        let resolved = refracted.resolve(&Target::Equatorial(eq), time).unwrap();
        let back = refracted.steps_to_equatorial(&resolved, time);
        assert!(eq.separation(&back) < 1e-3);
    }

    #[test]
    fn test_time_offset_moves_star() {
        let (pointing, time) = scenario();
        let eq = Equatorial::new(5.5, 30.0);
        let now = pointing.equatorial_to_steps(&eq, time, Duration::zero());
        let later = pointing.equatorial_to_steps(&eq, time, Duration::seconds(30));
        let g = pointing.geometry();
        // east of the meridian, approaching transit: azimuth increasing
        assert!(g.signed_delta(Axis::Azimuth, now.azm, later.azm) > 0.0);
    }

    #[test]
    fn test_steps_target_bypasses_model() {
        let (pointing, time) = scenario();
        let pos = EncoderPosition::new(1234, 5678);
        assert_eq!(pointing.resolve(&Target::Steps(pos), time).unwrap(), pos);
        assert!(pointing
            .resolve(&Target::Steps(EncoderPosition::new(1 << 24, 0)), time)
            .is_err());
    }
}
