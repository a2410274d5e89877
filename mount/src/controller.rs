//! The mount façade a front end drives.
//!
//! [`MountController`] owns the bus, the pointing pipeline and the motion
//! mode. GoTo and tracking run as separate tokio tasks and never at the
//! same time: starting either one raises the abort signal of whatever was
//! running before and installs a fresh one.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use alignment::{AddOutcome, AlignmentDiagnostics, AlignmentEngine};
use chrono::{DateTime, Utc};
use ephemeris::{Equatorial, Horizontal, Site};
use hardware::aux::payload::decode_dms;
use hardware::aux::{
    gps, mc, pack_u24, unpack_u8, AbortSignal, AuxBus, BusError, Device, FirmwareVersion,
    MountModel,
};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MountConfig;
use crate::encoder::{Axis, EncoderPosition};
use crate::goto::{ApproachConfig, GotoConfig, GotoProgress, GotoRunner, GotoStage};
use crate::pointing::{Pointing, Target};
use crate::tracking::{stop_rates, GuideRate, Tracker, TrackingLoop, TrackingState};
use crate::MotionError;

/// What the mount is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum MotionMode {
    Idle,
    Slewing,
    Tracking,
    Parked,
    /// A hardware fault stopped the last motion
    Fault,
}

/// Manual move direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum Direction {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub time: DateTime<Utc>,
    pub steps: EncoderPosition,
    /// Encoder angles
    pub mount: Horizontal,
    /// Apparent sky position after the alignment model
    pub sky: Horizontal,
    pub equatorial: Equatorial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountIdentity {
    pub model: MountModel,
    pub model_name: String,
    pub azimuth_version: FirmwareVersion,
    pub altitude_version: FirmwareVersion,
    /// `None` when no hand controller answered
    pub hand_controller_version: Option<FirmwareVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentStatus {
    pub diagnostics: AlignmentDiagnostics,
    /// Residual of every stored point under the current model, oldest first
    pub residuals_arcsec: Vec<f64>,
}

/// What to do once a GoTo settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterSlew {
    Stop,
    Track,
    Park,
}

struct Inner {
    bus: AuxBus,
    pointing: Pointing,
    config: MountConfig,
    mode: Mutex<MotionMode>,
    abort: Mutex<AbortSignal>,
    /// Stages of the most recent GoTo; each GoTo gets its own handle
    progress: Mutex<GotoProgress>,
    goto: Mutex<Option<JoinHandle<Result<EncoderPosition, MotionError>>>>,
    tracker: Mutex<Option<Tracker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one mount. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MountController {
    inner: Arc<Inner>,
}

impl MountController {
    /// Controller on an already opened bus.
    ///
    /// Alignment points are restored from `config.alignment_file` when it
    /// exists.
    pub fn new(bus: AuxBus, config: MountConfig) -> Self {
        let engine = match &config.alignment_file {
            Some(path) if path.exists() => match AlignmentEngine::load_from_file(path) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!("cannot restore alignment from {}: {}", path.display(), e);
                    AlignmentEngine::new(config.alignment.clone())
                }
            },
            _ => AlignmentEngine::new(config.alignment.clone()),
        };
        let pointing = Pointing::new(config.site, config.geometry, config.refraction, engine);
        info!("mount controller on {}", bus.describe());
        Self {
            inner: Arc::new(Inner {
                bus,
                pointing,
                config,
                mode: Mutex::new(MotionMode::Idle),
                abort: Mutex::new(AbortSignal::new()),
                progress: Mutex::new(GotoProgress::new()),
                goto: Mutex::new(None),
                tracker: Mutex::new(None),
            }),
        }
    }

    /// Open the configured link and build a controller on it.
    pub fn connect(config: MountConfig) -> Result<Self, MotionError> {
        let link = config.connection.open_link().map_err(BusError::Io)?;
        let bus = AuxBus::new(link, config.connection.bus_config());
        Ok(Self::new(bus, config))
    }

    pub fn bus(&self) -> &AuxBus {
        &self.inner.bus
    }

    pub fn pointing(&self) -> &Pointing {
        &self.inner.pointing
    }

    pub fn config(&self) -> &MountConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> MotionMode {
        let mut mode = lock(&self.inner.mode);
        if *mode == MotionMode::Tracking {
            let stopped = lock(&self.inner.tracker)
                .as_ref()
                .is_some_and(Tracker::is_finished);
            if stopped {
                warn!("tracking loop ended unexpectedly");
                *mode = MotionMode::Fault;
            }
        }
        *mode
    }

    fn set_mode(&self, next: MotionMode) {
        let mut mode = lock(&self.inner.mode);
        if *mode != next {
            info!("mount {} -> {}", *mode, next);
            *mode = next;
        }
    }

    /// Per-axis GoTo stages of the current or last GoTo.
    pub fn goto_stages(&self) -> [GotoStage; 2] {
        lock(&self.inner.progress).snapshot()
    }

    fn ensure_can_move(&self) -> Result<(), MotionError> {
        match self.mode() {
            MotionMode::Parked => Err(MotionError::Parked),
            MotionMode::Fault => Err(MotionError::Faulted),
            _ => Ok(()),
        }
    }

    /// Pre-empt whatever holds the current signal and install a fresh one.
    fn fresh_signal(&self) -> AbortSignal {
        let mut abort = lock(&self.inner.abort);
        abort.raise();
        *abort = AbortSignal::new();
        abort.clone()
    }

    fn runner(&self, config: GotoConfig, abort: AbortSignal) -> GotoRunner {
        GotoRunner::new(
            self.inner.bus.clone(),
            self.inner.pointing.clone(),
            self.inner.config.limits,
            config,
            abort,
        )
    }

    // ==================== GoTo ====================

    /// Start a GoTo to `target` and return once it is under way.
    ///
    /// Limits are checked before anything is sent. Active tracking is
    /// cancelled; with `track_after` tracking of `target` starts once the
    /// GoTo settles.
    pub async fn set_target(&self, target: Target, track_after: bool) -> Result<(), MotionError> {
        let after = if track_after { AfterSlew::Track } else { AfterSlew::Stop };
        self.start_goto(target, self.inner.config.goto, after).await
    }

    async fn start_goto(
        &self,
        target: Target,
        config: GotoConfig,
        after: AfterSlew,
    ) -> Result<(), MotionError> {
        self.ensure_can_move()?;
        self.runner(config, AbortSignal::new()).plan(&target, Utc::now())?;

        // the tracker goes before its signal so mode() never sees it stopped
        let was_tracking = lock(&self.inner.tracker).take().is_some();
        let abort = self.fresh_signal();
        if was_tracking {
            if let Err(e) = stop_rates(&self.inner.bus).await {
                self.record_failure(&e);
                return Err(e);
            }
        }

        let progress = GotoProgress::new();
        *lock(&self.inner.progress) = progress.clone();
        let runner = self.runner(config, abort.clone()).with_progress(progress);
        self.set_mode(MotionMode::Slewing);
        info!("GoTo {}", target);

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let result = runner.run(&target).await;
            controller.finish_goto(&result, target, after, abort);
            result
        });
        if let Some(previous) = lock(&self.inner.goto).replace(handle) {
            debug!("superseded an unfinished GoTo");
            drop(previous);
        }
        Ok(())
    }

    fn finish_goto(
        &self,
        result: &Result<EncoderPosition, MotionError>,
        target: Target,
        after: AfterSlew,
        abort: AbortSignal,
    ) {
        if abort.is_raised() {
            // superseded or aborted; whoever raised the signal owns the mode
            return;
        }
        match result {
            Ok(_) => match after {
                AfterSlew::Stop => self.set_mode(MotionMode::Idle),
                AfterSlew::Park => self.set_mode(MotionMode::Parked),
                AfterSlew::Track => self.begin_tracking(target, abort),
            },
            Err(e) => self.record_failure(e),
        }
    }

    /// Mode after a failed motion: Fault when the hardware stopped answering.
    fn record_failure(&self, error: &MotionError) {
        if error.is_hardware_fault() {
            self.set_mode(MotionMode::Fault);
        } else {
            self.set_mode(MotionMode::Idle);
        }
    }

    /// Wait for the running GoTo, if any, and return where it settled.
    pub async fn wait_for_goto(&self) -> Result<Option<EncoderPosition>, MotionError> {
        let handle = lock(&self.inner.goto).take();
        match handle {
            Some(handle) => {
                let result = handle
                    .await
                    .map_err(|e| MotionError::Bus(BusError::Io(io::Error::other(e))))?;
                result.map(Some)
            }
            None => Ok(None),
        }
    }

    /// GoTo `target` and wait for it to settle.
    pub async fn goto(&self, target: Target) -> Result<EncoderPosition, MotionError> {
        self.set_target(target, false).await?;
        self.wait_for_goto().await?.ok_or(MotionError::AbortRequested)
    }

    /// Slew to the encoder zero of both axes and stay there.
    pub async fn park(&self) -> Result<EncoderPosition, MotionError> {
        let config = GotoConfig {
            approach: ApproachConfig::disabled(),
            ..self.inner.config.goto
        };
        self.start_goto(Target::Steps(EncoderPosition::new(0, 0)), config, AfterSlew::Park)
            .await?;
        self.wait_for_goto().await?.ok_or(MotionError::AbortRequested)
    }

    /// Slew the selected axes to encoder zero; the others hold position.
    pub async fn home(&self, axes: &[Axis]) -> Result<EncoderPosition, MotionError> {
        if axes.is_empty() {
            return Err(MotionError::OutOfRange("no axis selected for homing".to_string()));
        }
        self.ensure_can_move()?;
        let mut target = self.read_encoders().await?;
        for axis in axes {
            match axis {
                Axis::Azimuth => target.azm_steps = 0,
                Axis::Altitude => target.alt_steps = 0,
            }
        }
        info!("homing {:?}", axes);
        let config = GotoConfig {
            approach: ApproachConfig::disabled(),
            ..self.inner.config.goto
        };
        self.start_goto(Target::Steps(target), config, AfterSlew::Stop).await?;
        self.wait_for_goto().await?.ok_or(MotionError::AbortRequested)
    }

    pub fn unpark(&self) {
        let mut mode = lock(&self.inner.mode);
        if *mode == MotionMode::Parked {
            info!("mount unparked");
            *mode = MotionMode::Idle;
        }
    }

    /// Stop everything: pre-empt queued GoTo and tracking commands, then
    /// halt both axes.
    pub async fn abort(&self) -> Result<(), MotionError> {
        let tracker = lock(&self.inner.tracker).take();
        lock(&self.inner.abort).raise();
        drop(tracker);
        info!("abort");

        let result = self.halt_axes().await;
        match &result {
            Ok(()) => {
                let current = *lock(&self.inner.mode);
                if !matches!(current, MotionMode::Parked | MotionMode::Fault) {
                    self.set_mode(MotionMode::Idle);
                }
            }
            Err(e) => {
                warn!("abort could not stop the axes: {}", e);
                self.record_failure(e);
            }
        }
        result
    }

    /// Zero both axes ahead of any queued request.
    async fn halt_axes(&self) -> Result<(), MotionError> {
        let bus = &self.inner.bus;
        let _lane = bus.priority_lane();
        for axis in Axis::BOTH {
            bus.send_priority(axis.device(), mc::MOVE_POS, &[0]).await?;
        }
        for axis in Axis::BOTH {
            let rate = GuideRate::ZERO;
            bus.send_priority(axis.device(), rate.opcode(), &rate.payload()).await?;
        }
        Ok(())
    }

    /// Query both axes and leave the fault state if they answer.
    pub async fn clear_fault(&self) -> Result<(), MotionError> {
        if *lock(&self.inner.mode) != MotionMode::Fault {
            return Ok(());
        }
        for axis in Axis::BOTH {
            self.inner.bus.get_position(axis.device()).await?;
        }
        self.set_mode(MotionMode::Idle);
        Ok(())
    }

    // ==================== Tracking ====================

    /// Lock onto `target` and start tracking it from wherever the mount is.
    pub async fn start_tracking(&self, target: Target) -> Result<(), MotionError> {
        self.ensure_can_move()?;
        let previous = lock(&self.inner.tracker).take();
        let abort = self.fresh_signal();
        drop(previous);
        if let Some(goto) = lock(&self.inner.goto).take() {
            debug!("tracking supersedes an unfinished GoTo");
            drop(goto);
        }
        self.begin_tracking(target, abort);
        Ok(())
    }

    fn begin_tracking(&self, target: Target, abort: AbortSignal) {
        let tracking = TrackingLoop::new(
            self.inner.bus.clone(),
            self.inner.pointing.clone(),
            target,
            self.inner.config.tracking,
            abort,
        );
        let tracker = Tracker::spawn(tracking);
        *lock(&self.inner.tracker) = Some(tracker);
        self.set_mode(MotionMode::Tracking);
    }

    /// Stop tracking and zero the guide rates.
    pub async fn stop_tracking(&self) -> Result<(), MotionError> {
        if lock(&self.inner.tracker).is_none() {
            return Ok(());
        }
        self.set_mode(MotionMode::Idle);
        let tracker = lock(&self.inner.tracker).take();
        drop(tracker);
        let result = stop_rates(&self.inner.bus).await;
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    pub fn get_tracking_state(&self) -> TrackingState {
        lock(&self.inner.tracker)
            .as_ref()
            .map(Tracker::state)
            .unwrap_or_default()
    }

    // ==================== Position and alignment ====================

    async fn read_encoders(&self) -> Result<EncoderPosition, MotionError> {
        let azm = self.inner.bus.get_position(Device::Azimuth).await?;
        let alt = self.inner.bus.get_position(Device::Altitude).await?;
        Ok(EncoderPosition::new(azm, alt))
    }

    pub async fn get_position(&self) -> Result<PositionReport, MotionError> {
        let steps = self.read_encoders().await?;
        let time = Utc::now();
        let pointing = &self.inner.pointing;
        Ok(PositionReport {
            time,
            steps,
            mount: pointing.geometry().steps_to_horizontal(&steps),
            sky: pointing.steps_to_sky(&steps),
            equatorial: pointing.steps_to_equatorial(&steps, time),
        })
    }

    /// Record that the mount, as it stands, points at apparent `sky`.
    pub async fn sync(&self, sky: &Horizontal) -> Result<AddOutcome, MotionError> {
        let steps = self.read_encoders().await?;
        let mount = self.inner.pointing.geometry().steps_to_horizontal(&steps);
        Ok(self.add_alignment_point(sky, &mount, Utc::now()))
    }

    /// [`sync`](Self::sync) on a catalogue position.
    pub async fn sync_equatorial(&self, eq: &Equatorial) -> Result<AddOutcome, MotionError> {
        let sky = self.inner.pointing.apparent_horizontal(eq, Utc::now());
        self.sync(&sky).await
    }

    pub fn add_alignment_point(
        &self,
        sky: &Horizontal,
        mount: &Horizontal,
        time: DateTime<Utc>,
    ) -> AddOutcome {
        let outcome = self.inner.pointing.alignment_mut().add_observation(sky, mount, time);
        info!("alignment point {:?}: {}", outcome, self.inner.pointing.alignment().tier());
        if outcome != AddOutcome::Rejected {
            self.persist_alignment();
        }
        outcome
    }

    pub fn clear_last_alignment_point(&self) -> bool {
        let removed = self.inner.pointing.alignment_mut().clear_last().is_some();
        if removed {
            self.persist_alignment();
        }
        removed
    }

    pub fn clear_alignment(&self) {
        self.inner.pointing.alignment_mut().clear_all();
        self.persist_alignment();
    }

    fn persist_alignment(&self) {
        if let Some(path) = &self.inner.config.alignment_file {
            if let Err(e) = self.inner.pointing.alignment().save_to_file(path) {
                warn!("cannot save alignment to {}: {}", path.display(), e);
            }
        }
    }

    pub fn alignment_status(&self) -> AlignmentStatus {
        let engine = self.inner.pointing.alignment();
        AlignmentStatus {
            diagnostics: engine.diagnostics(),
            residuals_arcsec: engine.points().iter().map(|p| p.residual_arcsec).collect(),
        }
    }

    // ==================== Manual control and accessories ====================

    /// Manual move at rate step 0-9; step 0 stops the axis.
    pub async fn nudge(
        &self,
        axis: Axis,
        direction: Direction,
        rate: u8,
    ) -> Result<(), MotionError> {
        if rate > mc::MAX_MOVE_RATE {
            return Err(MotionError::OutOfRange(format!(
                "move rate {rate} above {}",
                mc::MAX_MOVE_RATE
            )));
        }
        self.ensure_can_move()?;
        match self.mode() {
            MotionMode::Slewing => {
                self.fresh_signal();
                self.set_mode(MotionMode::Idle);
            }
            MotionMode::Tracking => {
                info!("manual move stops tracking");
                self.stop_tracking().await?;
            }
            _ => {}
        }
        let opcode = match direction {
            Direction::Positive => mc::MOVE_POS,
            Direction::Negative => mc::MOVE_NEG,
        };
        debug!("nudge {} {} at rate {}", axis, direction, rate);
        self.inner.bus.send_command(axis.device(), opcode, &[rate]).await?;
        Ok(())
    }

    pub async fn set_cord_wrap(&self, enabled: bool) -> Result<(), MotionError> {
        let opcode = if enabled {
            mc::ENABLE_CORDWRAP
        } else {
            mc::DISABLE_CORDWRAP
        };
        self.inner.bus.send_command(Device::Azimuth, opcode, &[]).await?;
        Ok(())
    }

    pub async fn cord_wrap_enabled(&self) -> Result<bool, MotionError> {
        let reply = self
            .inner
            .bus
            .send_command(Device::Azimuth, mc::POLL_CORDWRAP, &[])
            .await?;
        Ok(unpack_u8(&reply).map_err(BusError::from)? != 0)
    }

    /// Azimuth at which the cable wrap stops, degrees.
    pub async fn set_cord_wrap_position(&self, azimuth_deg: f64) -> Result<(), MotionError> {
        let steps = self.inner.pointing.geometry().degrees_to_steps(Axis::Azimuth, azimuth_deg)?;
        self.inner
            .bus
            .send_command(Device::Azimuth, mc::SET_CORDWRAP_POS, &pack_u24(steps))
            .await?;
        Ok(())
    }

    pub async fn identify(&self) -> Result<MountIdentity, MotionError> {
        let bus = &self.inner.bus;
        let model = bus.get_model().await?;
        let azimuth_version = bus.get_version(Device::Azimuth).await?;
        let altitude_version = bus.get_version(Device::Altitude).await?;
        let hand_controller_version = match bus.get_version(Device::HandController).await {
            Ok(version) => Some(version),
            Err(e) => {
                debug!("no hand controller version: {}", e);
                None
            }
        };
        Ok(MountIdentity {
            model,
            model_name: model.to_string(),
            azimuth_version,
            altitude_version,
            hand_controller_version,
        })
    }

    /// Site reported by the GPS receiver, `None` without a fix.
    pub async fn gps_site(&self) -> Result<Option<Site>, MotionError> {
        let bus = &self.inner.bus;
        let linked = bus.send_command(Device::Gps, gps::LINKED, &[]).await?;
        if unpack_u8(&linked).map_err(BusError::from)? == 0 {
            return Ok(None);
        }
        let lat = bus.send_command(Device::Gps, gps::GET_LAT, &[]).await?;
        let lat = decode_dms(&lat).map_err(BusError::from)?;
        let lon = bus.send_command(Device::Gps, gps::GET_LONG, &[]).await?;
        let lon = decode_dms(&lon).map_err(BusError::from)?;
        let site = Site::new(lat, lon, 0.0).map_err(|e| MotionError::OutOfRange(e.to_string()))?;
        Ok(Some(site))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use approx::assert_relative_eq;
    use hardware::aux::sim::SimGps;
    use hardware::aux::{BusConfig, SimClock, SimLink, SimulatedMount};

    use crate::limits::SoftLimits;
    use crate::tracking::TrackingConfig;

    type SharedSim = Arc<std::sync::Mutex<SimulatedMount>>;

    fn sim_controller(mount: SimulatedMount, config: MountConfig) -> (MountController, SharedSim) {
        let sim = Arc::new(std::sync::Mutex::new(mount));
        let link = SimLink::new(sim.clone(), SimClock::PerCommand(Duration::from_millis(100)));
        let bus = AuxBus::new(
            Box::new(link),
            BusConfig {
                reply_timeout: Duration::from_millis(100),
                retries: 1,
            },
        );
        (MountController::new(bus, config), sim)
    }

    fn test_config() -> MountConfig {
        let mut config = MountConfig {
            refraction: None,
            ..MountConfig::default()
        };
        config.goto.poll_interval_ms = 1;
        config
    }

    fn sim_log_len(sim: &SharedSim) -> usize {
        sim.lock().unwrap().commands().len()
    }

    #[tokio::test]
    async fn test_goto_settles_from_below() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        let target = EncoderPosition::new(600_000, 400_000);
        let settled = mount.goto(Target::Steps(target)).await.unwrap();

        assert_eq!(settled, target);
        assert_eq!(mount.mode(), MotionMode::Idle);
        assert_eq!(mount.goto_stages(), [GotoStage::Settled; 2]);
        let sim = sim.lock().unwrap();
        assert_eq!(sim.azimuth.last_slow_direction(), Some(1));
        assert_eq!(sim.altitude.last_slow_direction(), Some(1));
    }

    #[tokio::test]
    async fn test_soft_limits_reject_before_any_command() {
        let mut config = test_config();
        config.limits = SoftLimits {
            alt_min_deg: 10.0,
            ..SoftLimits::default()
        };
        let (mount, sim) = sim_controller(SimulatedMount::new(), config);

        let result = mount
            .set_target(Target::Horizontal(Horizontal::new(120.0, 5.0)), false)
            .await;
        assert!(matches!(result, Err(MotionError::SoftLimitViolation { .. })));
        assert_eq!(sim_log_len(&sim), 0);
        assert_eq!(mount.mode(), MotionMode::Idle);
    }

    #[tokio::test]
    async fn test_park_refuses_motion_until_unparked() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        mount.goto(Target::Steps(EncoderPosition::new(300_000, 200_000))).await.unwrap();

        assert_eq!(mount.park().await.unwrap(), EncoderPosition::new(0, 0));
        assert_eq!(mount.mode(), MotionMode::Parked);

        let before = sim_log_len(&sim);
        let refused = mount
            .set_target(Target::Steps(EncoderPosition::new(1000, 1000)), false)
            .await;
        assert!(matches!(refused, Err(MotionError::Parked)));
        assert!(matches!(
            mount.nudge(Axis::Azimuth, Direction::Positive, 3).await,
            Err(MotionError::Parked)
        ));
        assert_eq!(sim_log_len(&sim), before);

        mount.unpark();
        assert_eq!(mount.mode(), MotionMode::Idle);
        mount.goto(Target::Steps(EncoderPosition::new(1000, 1000))).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_halts_axes_and_zeroes_rates() {
        let mut config = test_config();
        config.tracking = TrackingConfig {
            cadence_ms: 5,
            ..TrackingConfig::default()
        };
        let (mount, sim) = sim_controller(SimulatedMount::new(), config);
        mount
            .start_tracking(Target::Equatorial(Equatorial::new(5.5, 30.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mount.mode(), MotionMode::Tracking);
        assert!(mount.get_tracking_state().active);

        mount.abort().await.unwrap();
        assert_eq!(mount.mode(), MotionMode::Idle);
        assert!(!mount.get_tracking_state().active);

        let sim = sim.lock().unwrap();
        assert_eq!(sim.azimuth.guide_rate(), 0.0);
        assert_eq!(sim.altitude.guide_rate(), 0.0);
        let halts = sim
            .commands()
            .iter()
            .filter(|c| c.opcode == mc::MOVE_POS && c.payload == [0])
            .count();
        assert_eq!(halts, 2);
    }

    #[tokio::test]
    async fn test_stop_tracking_returns_to_idle() {
        let mut config = test_config();
        config.tracking.cadence_ms = 5;
        let (mount, sim) = sim_controller(SimulatedMount::new(), config);
        mount
            .start_tracking(Target::Equatorial(Equatorial::new(2.0, 60.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio_test::assert_ok!(mount.stop_tracking().await);
        assert_eq!(mount.mode(), MotionMode::Idle);
        assert_eq!(sim.lock().unwrap().azimuth.guide_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_unavailable_axis_faults_until_cleared() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        sim.lock().unwrap().set_offline(Device::Altitude, true);

        let result = mount.goto(Target::Steps(EncoderPosition::new(100_000, 100_000))).await;
        assert!(result.unwrap_err().is_hardware_fault());
        assert_eq!(mount.mode(), MotionMode::Fault);
        assert!(matches!(
            mount.set_target(Target::Steps(EncoderPosition::new(0, 0)), false).await,
            Err(MotionError::Faulted)
        ));

        assert!(mount.clear_fault().await.is_err());
        assert_eq!(mount.mode(), MotionMode::Fault);

        sim.lock().unwrap().set_offline(Device::Altitude, false);
        mount.clear_fault().await.unwrap();
        assert_eq!(mount.mode(), MotionMode::Idle);
    }

    #[tokio::test]
    async fn test_nudge_rate_checked() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        assert!(matches!(
            mount.nudge(Axis::Altitude, Direction::Negative, 10).await,
            Err(MotionError::OutOfRange(_))
        ));
        assert_eq!(sim_log_len(&sim), 0);

        mount.nudge(Axis::Altitude, Direction::Negative, 9).await.unwrap();
        let sim = sim.lock().unwrap();
        let last = sim.commands().last().unwrap();
        assert_eq!(
            (last.device, last.opcode, last.payload.clone()),
            (Device::Altitude, mc::MOVE_NEG, vec![9])
        );
        assert!(sim.altitude.rate() < 0.0);
    }

    #[tokio::test]
    async fn test_nudge_stops_tracking() {
        let mut config = test_config();
        config.tracking.cadence_ms = 5;
        let (mount, sim) = sim_controller(SimulatedMount::new(), config);
        mount
            .start_tracking(Target::Equatorial(Equatorial::new(5.5, 30.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mount.mode(), MotionMode::Tracking);

        mount.nudge(Axis::Azimuth, Direction::Positive, 4).await.unwrap();
        assert_eq!(mount.mode(), MotionMode::Idle);
        assert!(!mount.get_tracking_state().active);

        let sent = sim_log_len(&sim);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let sim = sim.lock().unwrap();
        assert_eq!(sim.commands().len(), sent);
        let last = sim.commands().last().unwrap();
        assert_eq!((last.device, last.opcode), (Device::Azimuth, mc::MOVE_POS));
        assert_eq!(sim.altitude.guide_rate(), 0.0);
        assert!(sim.azimuth.rate() > 0.0);
    }

    #[tokio::test]
    async fn test_goto_over_tracking_never_reports_fault() {
        let mut config = test_config();
        config.tracking.cadence_ms = 5;
        let (mount, _) = sim_controller(SimulatedMount::new(), config);
        let star = Target::Equatorial(Equatorial::new(5.5, 30.0));
        mount.start_tracking(star.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        mount.start_tracking(star).await.unwrap();
        assert_eq!(mount.mode(), MotionMode::Tracking);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mount.mode(), MotionMode::Tracking);

        mount
            .set_target(Target::Steps(EncoderPosition::new(200_000, 100_000)), false)
            .await
            .unwrap();
        assert_eq!(mount.mode(), MotionMode::Slewing);
        mount.wait_for_goto().await.unwrap();
        assert_eq!(mount.mode(), MotionMode::Idle);
    }

    #[tokio::test]
    async fn test_home_selected_axes() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        mount.goto(Target::Steps(EncoderPosition::new(300_000, 200_000))).await.unwrap();

        let homed = mount.home(&[Axis::Azimuth]).await.unwrap();
        assert_eq!(homed, EncoderPosition::new(0, 200_000));
        assert_eq!(mount.mode(), MotionMode::Idle);

        let homed = mount.home(&Axis::BOTH).await.unwrap();
        assert_eq!(homed, EncoderPosition::new(0, 0));
        assert_eq!(sim.lock().unwrap().altitude.position(), 0);
        assert!(matches!(mount.home(&[]).await, Err(MotionError::OutOfRange(_))));
    }

    #[tokio::test]
    async fn test_sync_adds_alignment_point() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("alignment.json");
        let mut config = test_config();
        config.alignment_file = Some(file.clone());
        let (mount, _) = sim_controller(SimulatedMount::new(), config.clone());

        let outcome = mount.sync(&Horizontal::new(0.5, 0.2)).await.unwrap();
        assert_eq!(outcome, AddOutcome::Added);
        assert_eq!(mount.alignment_status().diagnostics.point_count, 1);
        assert_eq!(mount.alignment_status().residuals_arcsec.len(), 1);
        assert!(file.exists());

        let (restored, _) = sim_controller(SimulatedMount::new(), config);
        assert_eq!(restored.alignment_status().diagnostics.point_count, 1);

        assert!(restored.clear_last_alignment_point());
        assert!(!restored.clear_last_alignment_point());
        assert_eq!(restored.alignment_status().diagnostics.point_count, 0);
    }

    #[tokio::test]
    async fn test_identify_without_hand_controller() {
        let (mount, _) = sim_controller(SimulatedMount::new(), test_config());
        let identity = mount.identify().await.unwrap();
        assert_eq!(identity.model.id, 0x1687);
        assert_eq!(identity.azimuth_version.to_string(), "7.11.5002");
        assert_eq!(identity.altitude_version, identity.azimuth_version);
        assert_eq!(identity.hand_controller_version, None);
    }

    #[tokio::test]
    async fn test_gps_site() {
        let gps = SimGps {
            latitude_deg: 50.5,
            longitude_deg: -20.25,
            linked: true,
        };
        let (mount, _) = sim_controller(SimulatedMount::new().with_gps(gps), test_config());
        let site = mount.gps_site().await.unwrap().unwrap();
        assert_relative_eq!(site.latitude_deg, 50.5, epsilon = 1e-9);
        assert_relative_eq!(site.longitude_deg, -20.25, epsilon = 1e-9);

        let unlinked = SimGps { linked: false, ..gps };
        let (mount, _) = sim_controller(SimulatedMount::new().with_gps(unlinked), test_config());
        assert_eq!(mount.gps_site().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cord_wrap() {
        let (mount, _) = sim_controller(SimulatedMount::new(), test_config());
        assert!(!mount.cord_wrap_enabled().await.unwrap());
        mount.set_cord_wrap(true).await.unwrap();
        assert!(mount.cord_wrap_enabled().await.unwrap());

        mount.set_cord_wrap_position(180.0).await.unwrap();
        let reply = mount
            .bus()
            .send_command(Device::Azimuth, mc::GET_CORDWRAP_POS, &[])
            .await
            .unwrap();
        assert_eq!(reply, pack_u24(1 << 23).to_vec());
    }

    #[tokio::test]
    async fn test_position_report() {
        let (mount, sim) = sim_controller(SimulatedMount::new(), test_config());
        mount.goto(Target::Steps(EncoderPosition::new(1 << 22, 1 << 21))).await.unwrap();
        sim.lock().unwrap().clear_log();

        let report = mount.get_position().await.unwrap();
        assert_eq!(report.steps, EncoderPosition::new(1 << 22, 1 << 21));
        assert_relative_eq!(report.mount.az_deg, 90.0, epsilon = 1e-9);
        assert_relative_eq!(report.mount.alt_deg, 45.0, epsilon = 1e-9);
        assert_relative_eq!(report.sky.alt_deg, 45.0, epsilon = 1e-9);
    }
}
