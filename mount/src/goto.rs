//! Staged GoTo with anti-backlash approach.
//!
//! Each axis passes through `Idle → FastApproach → SlowApproach → Settled`.
//! The fast pass stops short of the target by the configured offset so the
//! slow pass always finishes moving in one mechanical direction per axis.
//! Sky targets are resolved again when the slow pass starts, since the
//! target has moved during the fast pass.
//!
//! Every command goes through [`AuxBus::send_cancellable`], so a raised
//! [`AbortSignal`] stops the sequence before its next bus command.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hardware::aux::{mc, pack_u24, unpack_u24, unpack_u8, AbortSignal, AuxBus, BusError};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::encoder::{Axis, EncoderPosition};
use crate::limits::SoftLimits;
use crate::pointing::{Pointing, Target};
use crate::MotionError;

/// How the final approach direction is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ApproachMode {
    /// One fast slew straight onto the target
    Disabled,
    /// Finish each axis in the direction of the sign of its offset
    FixedOffset,
    /// Finish each axis in the direction the target is moving
    TrackingDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproachConfig {
    pub mode: ApproachMode,
    /// Signed approach margin in counts; positive finishes moving forward
    pub azm_offset_steps: i32,
    pub alt_offset_steps: i32,
}

impl Default for ApproachConfig {
    fn default() -> Self {
        Self {
            mode: ApproachMode::FixedOffset,
            azm_offset_steps: 10_000,
            alt_offset_steps: 10_000,
        }
    }
}

impl ApproachConfig {
    pub fn disabled() -> Self {
        Self {
            mode: ApproachMode::Disabled,
            ..Self::default()
        }
    }

    pub fn offset(&self, axis: Axis) -> i32 {
        match axis {
            Axis::Azimuth => self.azm_offset_steps,
            Axis::Altitude => self.alt_offset_steps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GotoConfig {
    pub approach: ApproachConfig,
    /// Largest settled error accepted per axis, counts
    pub tolerance_steps: u32,
    /// Corrective slow passes before giving up
    pub max_corrections: u32,
    pub poll_interval_ms: u64,
    pub slew_timeout_s: f64,
    /// Look-ahead used to find the target's direction of motion
    pub direction_lookahead_s: f64,
}

impl Default for GotoConfig {
    fn default() -> Self {
        Self {
            approach: ApproachConfig::default(),
            tolerance_steps: 16,
            max_corrections: 2,
            poll_interval_ms: 200,
            slew_timeout_s: 120.0,
            direction_lookahead_s: 30.0,
        }
    }
}

impl GotoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn slew_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.slew_timeout_s.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum GotoStage {
    #[default]
    Idle,
    FastApproach,
    SlowApproach,
    Settled,
}

/// Per-axis stage, shared with status readers.
#[derive(Debug, Clone, Default)]
pub struct GotoProgress(Arc<Mutex<[GotoStage; 2]>>);

impl GotoProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [GotoStage; 2]> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, axis: Axis) -> GotoStage {
        self.lock()[axis as usize]
    }

    pub fn snapshot(&self) -> [GotoStage; 2] {
        *self.lock()
    }

    fn set(&self, axis: Axis, stage: GotoStage) {
        let mut stages = self.lock();
        if stages[axis as usize] != stage {
            debug!("{} GoTo stage {} -> {}", axis, stages[axis as usize], stage);
            stages[axis as usize] = stage;
        }
    }

    fn set_all(&self, stage: GotoStage) {
        for axis in Axis::BOTH {
            self.set(axis, stage);
        }
    }
}

/// Resolved counts of one GoTo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApproachPlan {
    pub target: EncoderPosition,
    /// End of the fast pass; `None` when the approach is disabled
    pub intermediate: Option<EncoderPosition>,
    /// Direction (+1 / -1) of the final slow move per axis, 0 when disabled
    pub direction: [i8; 2],
}

/// Runs one GoTo sequence on the shared bus.
pub struct GotoRunner {
    bus: AuxBus,
    pointing: Pointing,
    limits: SoftLimits,
    config: GotoConfig,
    abort: AbortSignal,
    progress: GotoProgress,
}

impl GotoRunner {
    pub fn new(
        bus: AuxBus,
        pointing: Pointing,
        limits: SoftLimits,
        config: GotoConfig,
        abort: AbortSignal,
    ) -> Self {
        Self {
            bus,
            pointing,
            limits,
            config,
            abort,
            progress: GotoProgress::new(),
        }
    }

    /// Report stages into an existing progress handle.
    pub fn with_progress(mut self, progress: GotoProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> GotoProgress {
        self.progress.clone()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    fn check_abort(&self) -> Result<(), MotionError> {
        if self.abort.is_raised() {
            Err(MotionError::AbortRequested)
        } else {
            Ok(())
        }
    }

    fn check_limits(&self, position: &EncoderPosition) -> Result<(), MotionError> {
        self.limits
            .check(&self.pointing.geometry().steps_to_horizontal(position))
    }

    fn resolve_checked(
        &self,
        target: &Target,
        now: DateTime<Utc>,
    ) -> Result<EncoderPosition, MotionError> {
        let position = self.pointing.resolve(target, now)?;
        self.check_limits(&position)?;
        Ok(position)
    }

    fn approach_direction(&self, target: &Target, now: DateTime<Utc>) -> [i8; 2] {
        let approach = &self.config.approach;
        let fixed = Axis::BOTH.map(|axis| if approach.offset(axis) < 0 { -1 } else { 1 });
        match approach.mode {
            ApproachMode::Disabled => [0, 0],
            ApproachMode::FixedOffset => fixed,
            ApproachMode::TrackingDirection if target.is_moving() => {
                let lookahead_ms = (self.config.direction_lookahead_s * 1000.0) as i64;
                let lookahead = chrono::Duration::milliseconds(lookahead_ms);
                let before = self.pointing.target_steps(target, now, -lookahead);
                let after = self.pointing.target_steps(target, now, lookahead);
                let geometry = self.pointing.geometry();
                Axis::BOTH.map(|axis| {
                    if geometry.signed_delta(axis, before.get(axis), after.get(axis)) < 0.0 {
                        -1
                    } else {
                        1
                    }
                })
            }
            ApproachMode::TrackingDirection => fixed,
        }
    }

    /// Resolve `target` and its approach point, rejecting either if it
    /// leaves the soft limits. Sends nothing.
    pub fn plan(&self, target: &Target, now: DateTime<Utc>) -> Result<ApproachPlan, MotionError> {
        let exact = self.resolve_checked(target, now)?;
        if self.config.approach.mode == ApproachMode::Disabled {
            return Ok(ApproachPlan {
                target: exact,
                intermediate: None,
                direction: [0, 0],
            });
        }

        let direction = self.approach_direction(target, now);
        let geometry = self.pointing.geometry();
        let mut steps = [0u32; 2];
        for axis in Axis::BOTH {
            let margin = self.config.approach.offset(axis).unsigned_abs() as f64;
            let sign = direction[axis as usize] as f64;
            steps[axis as usize] = geometry.wrap(axis, exact.get(axis) as f64 - sign * margin)?;
        }
        let intermediate = EncoderPosition::new(steps[0], steps[1]);
        self.check_limits(&intermediate)?;

        Ok(ApproachPlan {
            target: exact,
            intermediate: Some(intermediate),
            direction,
        })
    }

    /// Drive both axes onto `target` and return where they settled.
    pub async fn run(&self, target: &Target) -> Result<EncoderPosition, MotionError> {
        let result = self.run_stages(target).await;
        match &result {
            Ok(position) => info!("GoTo {} settled at {}", target, position),
            Err(MotionError::AbortRequested) => {
                self.progress.set_all(GotoStage::Idle);
                info!("GoTo {} aborted", target);
            }
            Err(e) => {
                self.progress.set_all(GotoStage::Idle);
                warn!("GoTo {} failed: {}", target, e);
            }
        }
        result
    }

    async fn run_stages(&self, target: &Target) -> Result<EncoderPosition, MotionError> {
        let plan = self.plan(target, Utc::now())?;
        self.check_abort()?;
        debug!("GoTo {} plan {:?}", target, plan);

        let exact = match plan.intermediate {
            Some(intermediate) => {
                self.slew(&Axis::BOTH, mc::GOTO_FAST, &intermediate, GotoStage::FastApproach)
                    .await?;
                let exact = if target.is_moving() {
                    self.resolve_checked(target, Utc::now())?
                } else {
                    plan.target
                };
                self.slew(&Axis::BOTH, mc::GOTO_SLOW, &exact, GotoStage::SlowApproach)
                    .await?;
                exact
            }
            None => {
                self.slew(&Axis::BOTH, mc::GOTO_FAST, &plan.target, GotoStage::FastApproach)
                    .await?;
                plan.target
            }
        };

        let geometry = self.pointing.geometry();
        let tolerance = self.config.tolerance_steps as f64;
        let mut passes = 0;
        loop {
            let actual = self.read_position().await?;
            let errors = Axis::BOTH.map(|axis| {
                geometry.signed_delta(axis, actual.get(axis) as f64, exact.get(axis) as f64)
            });
            let off: Vec<Axis> = Axis::BOTH
                .into_iter()
                .filter(|axis| errors[*axis as usize].abs() > tolerance)
                .collect();

            let Some(&worst) = off.first() else {
                self.progress.set_all(GotoStage::Settled);
                return Ok(actual);
            };
            if passes == self.config.max_corrections {
                return Err(MotionError::SettleFailed {
                    axis: worst,
                    error_steps: errors[worst as usize].round() as i64,
                    passes,
                });
            }
            passes += 1;
            for axis in off {
                let remaining = errors[axis as usize];
                debug!("{} correction pass {}: {:.0} steps to go", axis, passes, remaining);
                self.correct(axis, &plan, &exact, remaining).await?;
            }
        }
    }

    /// Slow pass on one axis, backing off first if the axis overshot
    /// against its approach direction.
    async fn correct(
        &self,
        axis: Axis,
        plan: &ApproachPlan,
        exact: &EncoderPosition,
        remaining: f64,
    ) -> Result<(), MotionError> {
        let sign = plan.direction[axis as usize] as f64;
        if sign * remaining < 0.0 {
            let margin = self.config.approach.offset(axis).unsigned_abs() as f64;
            let back_off = self
                .pointing
                .geometry()
                .wrap(axis, exact.get(axis) as f64 - sign * margin)?;
            let mut position = *exact;
            match axis {
                Axis::Azimuth => position.azm_steps = back_off,
                Axis::Altitude => position.alt_steps = back_off,
            }
            self.slew(&[axis], mc::GOTO_SLOW, &position, GotoStage::SlowApproach)
                .await?;
        }
        self.slew(&[axis], mc::GOTO_SLOW, exact, GotoStage::SlowApproach)
            .await
    }

    async fn slew(
        &self,
        axes: &[Axis],
        opcode: u8,
        position: &EncoderPosition,
        stage: GotoStage,
    ) -> Result<(), MotionError> {
        for &axis in axes {
            self.progress.set(axis, stage);
            self.bus
                .send_cancellable(axis.device(), opcode, &pack_u24(position.get(axis)), &self.abort)
                .await?;
        }
        self.wait_for_slew(axes).await
    }

    async fn wait_for_slew(&self, axes: &[Axis]) -> Result<(), MotionError> {
        let started = Instant::now();
        let timeout = self.config.slew_timeout();
        let mut pending = axes.to_vec();
        loop {
            let mut moving = Vec::with_capacity(pending.len());
            for &axis in &pending {
                let reply = self
                    .bus
                    .send_cancellable(axis.device(), mc::SLEW_DONE, &[], &self.abort)
                    .await?;
                if unpack_u8(&reply).map_err(BusError::from)? != mc::SLEW_COMPLETE {
                    moving.push(axis);
                }
            }
            let Some(&slowest) = moving.first() else {
                return Ok(());
            };
            if started.elapsed() >= timeout {
                return Err(MotionError::SlewTimeout {
                    axis: slowest,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
            self.check_abort()?;
            pending = moving;
        }
    }

    async fn read_position(&self) -> Result<EncoderPosition, MotionError> {
        let mut steps = [0u32; 2];
        for axis in Axis::BOTH {
            let reply = self
                .bus
                .send_cancellable(axis.device(), mc::GET_POSITION, &[], &self.abort)
                .await?;
            steps[axis as usize] = unpack_u24(&reply).map_err(BusError::from)?;
        }
        Ok(EncoderPosition::new(steps[0], steps[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alignment::AlignmentEngine;
    use chrono::TimeZone;
    use ephemeris::{Equatorial, Horizontal, Site};
    use hardware::aux::{BusConfig, Device, SimClock, SimLink, SimulatedMount};

    use crate::encoder::EncoderGeometry;

    fn pointing() -> Pointing {
        let site = Site::new(50.0, 20.0, 0.0).unwrap();
        Pointing::new(site, EncoderGeometry::default(), None, AlignmentEngine::default())
    }

    fn sim_runner(
        config: GotoConfig,
        limits: SoftLimits,
    ) -> (GotoRunner, Arc<std::sync::Mutex<SimulatedMount>>) {
        let sim = Arc::new(std::sync::Mutex::new(SimulatedMount::new()));
        let link = SimLink::new(sim.clone(), SimClock::PerCommand(Duration::from_millis(100)));
        let bus = AuxBus::new(
            Box::new(link),
            BusConfig {
                reply_timeout: Duration::from_millis(200),
                retries: 1,
            },
        );
        (
            GotoRunner::new(bus, pointing(), limits, config, AbortSignal::new()),
            sim,
        )
    }

    fn fast_config(approach: ApproachConfig) -> GotoConfig {
        GotoConfig {
            approach,
            poll_interval_ms: 1,
            ..GotoConfig::default()
        }
    }

    #[test]
    fn test_fixed_offset_plan() {
        let (runner, _) = sim_runner(fast_config(ApproachConfig::default()), SoftLimits::default());
        let target = Target::Steps(EncoderPosition::new(500_000, 300_000));
        let plan = runner.plan(&target, Utc::now()).unwrap();
        assert_eq!(plan.intermediate, Some(EncoderPosition::new(490_000, 290_000)));
        assert_eq!(plan.direction, [1, 1]);
    }

    #[test]
    fn test_negative_offset_approaches_from_above() {
        let approach = ApproachConfig {
            azm_offset_steps: -2000,
            ..ApproachConfig::default()
        };
        let (runner, _) = sim_runner(fast_config(approach), SoftLimits::default());
        let plan = runner
            .plan(&Target::Steps(EncoderPosition::new(1000, 300_000)), Utc::now())
            .unwrap();
        assert_eq!(plan.direction, [-1, 1]);
        assert_eq!(plan.intermediate.unwrap().azm_steps, 3000);
    }

    #[test]
    fn test_intermediate_wraps_through_zero() {
        let (runner, _) = sim_runner(fast_config(ApproachConfig::default()), SoftLimits::default());
        let plan = runner
            .plan(&Target::Steps(EncoderPosition::new(4000, 300_000)), Utc::now())
            .unwrap();
        assert_eq!(plan.intermediate.unwrap().azm_steps, (1 << 24) - 6000);
    }

    #[test]
    fn test_tracking_direction_follows_star() {
        let approach = ApproachConfig {
            mode: ApproachMode::TrackingDirection,
            azm_offset_steps: -10_000,
            alt_offset_steps: -10_000,
        };
        let (runner, _) = sim_runner(fast_config(approach), SoftLimits::default());
        let time = Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap();
        // south-east of the meridian and rising
        let plan = runner
            .plan(&Target::Equatorial(Equatorial::new(5.5, 30.0)), time)
            .unwrap();
        assert_eq!(plan.direction, [1, 1]);
    }

    #[test]
    fn test_limits_checked_on_intermediate() {
        let limits = SoftLimits {
            alt_min_deg: 0.0,
            ..SoftLimits::default()
        };
        let (runner, _) = sim_runner(fast_config(ApproachConfig::default()), limits);
        // target sits at the horizon, the approach point just below it
        let err = runner
            .plan(&Target::Horizontal(Horizontal::new(90.0, 0.1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, MotionError::SoftLimitViolation { .. }));
    }

    #[tokio::test]
    async fn test_disabled_approach_uses_fast_only() {
        let (runner, sim) =
            sim_runner(fast_config(ApproachConfig::disabled()), SoftLimits::default());
        let target = EncoderPosition::new(200_000, 100_000);
        let settled = runner.run(&Target::Steps(target)).await.unwrap();
        assert_eq!(settled, target);
        assert_eq!(runner.progress().snapshot(), [GotoStage::Settled; 2]);

        let sim = sim.lock().unwrap();
        assert!(sim.commands().iter().any(|c| c.opcode == mc::GOTO_FAST));
        assert!(!sim.commands().iter().any(|c| c.opcode == mc::GOTO_SLOW));
    }

    #[tokio::test]
    async fn test_fixed_offset_finishes_slow_in_offset_direction() {
        let (runner, sim) =
            sim_runner(fast_config(ApproachConfig::default()), SoftLimits::default());
        let target = EncoderPosition::new(400_000, 800_000);
        assert_eq!(runner.run(&Target::Steps(target)).await.unwrap(), target);

        let sim = sim.lock().unwrap();
        assert_eq!(sim.azimuth.last_slow_direction(), Some(1));
        assert_eq!(sim.altitude.last_slow_direction(), Some(1));
        let slow: Vec<_> = sim
            .commands()
            .iter()
            .filter(|c| c.opcode == mc::GOTO_SLOW)
            .collect();
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].device, Device::Azimuth);
    }

    #[tokio::test]
    async fn test_raised_abort_sends_nothing() {
        let (runner, sim) =
            sim_runner(fast_config(ApproachConfig::default()), SoftLimits::default());
        runner.abort_signal().raise();
        let err = runner
            .run(&Target::Steps(EncoderPosition::new(1000, 1000)))
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::AbortRequested));
        assert!(sim.lock().unwrap().commands().is_empty());
        assert_eq!(runner.progress().snapshot(), [GotoStage::Idle; 2]);
    }

    #[tokio::test]
    async fn test_frozen_axis_times_out() {
        let config = GotoConfig {
            slew_timeout_s: 0.05,
            ..fast_config(ApproachConfig::disabled())
        };
        let (runner, _sim) = sim_runner(config, SoftLimits::default());
        // half a revolution at the fast rate takes far longer than the timeout
        let err = runner
            .run(&Target::Steps(EncoderPosition::new(8_000_000, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::SlewTimeout { axis: Axis::Azimuth, .. }));
    }
}
