//! Predictive rate tracking.
//!
//! Each tick evaluates the locked target a fixed interval `dt` either side
//! of now and takes the central difference of the two encoder positions:
//!
//! ```text
//! rate = (P(now + dt) - P(now - dt)) / (2 dt)
//! ```
//!
//! Positions are rounded to whole counts first, as the mount would see them,
//! and the per-tick estimates are averaged over a sliding time window. The
//! averaged rate is sent as a native guide rate only when it moved by more
//! than the deadband since the last command.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hardware::aux::{mc, pack_u24, AbortSignal, AuxBus, U24_MAX};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::encoder::Axis;
use crate::pointing::{Pointing, Target};
use crate::MotionError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Time between ticks
    pub cadence_ms: u64,
    /// Half-width of the central difference, seconds
    pub dt_s: f64,
    /// Length of the averaging window, seconds; 0 uses the latest sample only
    pub window_s: f64,
    /// Smallest change in native units worth a new rate command
    pub deadband_units: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 1000,
            dt_s: 30.0,
            window_s: 10.0,
            deadband_units: 4,
        }
    }
}

impl TrackingConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.max(1))
    }

    fn dt(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.dt_s * 1000.0).round() as i64)
    }
}

/// Signed guide rate in native units (1/1024 arcsec per second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuideRate(pub i32);

impl GuideRate {
    pub const ZERO: GuideRate = GuideRate(0);

    /// Native units per (count per second) for an axis of `steps_per_rev`.
    pub fn units_per_step(steps_per_rev: u32) -> f64 {
        360.0 * 3600.0 * 1024.0 / steps_per_rev as f64
    }

    /// Rate command for `steps_per_sec`, clamped to the 24-bit field.
    pub fn from_steps_per_sec(steps_per_sec: f64, steps_per_rev: u32) -> Self {
        if !steps_per_sec.is_finite() {
            return Self::ZERO;
        }
        let units = (steps_per_sec * Self::units_per_step(steps_per_rev)).round();
        let max = U24_MAX as f64;
        GuideRate(units.clamp(-max, max) as i32)
    }

    pub fn steps_per_sec(&self, steps_per_rev: u32) -> f64 {
        self.0 as f64 / Self::units_per_step(steps_per_rev)
    }

    pub fn opcode(&self) -> u8 {
        if self.0 < 0 {
            mc::SET_NEG_GUIDERATE
        } else {
            mc::SET_POS_GUIDERATE
        }
    }

    pub fn payload(&self) -> [u8; 3] {
        pack_u24(self.0.unsigned_abs())
    }
}

/// Rate samples over a sliding time window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    span: chrono::Duration,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl RateWindow {
    pub fn new(span_s: f64) -> Self {
        Self {
            span: chrono::Duration::milliseconds((span_s.max(0.0) * 1000.0).round() as i64),
            samples: VecDeque::new(),
        }
    }

    /// Add a sample and drop those older than the window. Samples are
    /// expected in time order.
    pub fn push(&mut self, time: DateTime<Utc>, rate: f64) {
        self.samples.push_back((time, rate));
        let oldest = time - self.span;
        while self.samples.front().is_some_and(|(t, _)| *t < oldest) {
            self.samples.pop_front();
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|(_, rate)| rate).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Snapshot of the tracking loop for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingState {
    pub active: bool,
    pub target: Option<String>,
    /// Windowed rate estimate, counts per second
    pub azm_rate: f64,
    pub alt_rate: f64,
    /// Last rates sent to the motor controllers
    pub azm_command: GuideRate,
    pub alt_command: GuideRate,
    /// Samples currently in the averaging window
    pub window_fill: usize,
    pub ticks: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Rate estimation and command state for one locked target.
pub struct TrackingLoop {
    bus: AuxBus,
    pointing: Pointing,
    target: Target,
    config: TrackingConfig,
    abort: AbortSignal,
    windows: [RateWindow; 2],
    commanded: [Option<GuideRate>; 2],
    state: Arc<Mutex<TrackingState>>,
}

impl TrackingLoop {
    pub fn new(
        bus: AuxBus,
        pointing: Pointing,
        target: Target,
        config: TrackingConfig,
        abort: AbortSignal,
    ) -> Self {
        let state = TrackingState {
            active: true,
            target: Some(target.to_string()),
            ..TrackingState::default()
        };
        Self {
            bus,
            pointing,
            target,
            config,
            abort,
            windows: [RateWindow::new(config.window_s), RateWindow::new(config.window_s)],
            commanded: [None, None],
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackingState> {
        lock(&self.state)
    }

    pub fn state(&self) -> TrackingState {
        self.lock_state().clone()
    }

    /// Single-tick rate from counts rounded at `now ± dt`.
    pub fn sample(&self, now: DateTime<Utc>) -> [f64; 2] {
        let dt = self.config.dt();
        let before = self.pointing.target_steps(&self.target, now, -dt);
        let after = self.pointing.target_steps(&self.target, now, dt);
        let geometry = self.pointing.geometry();
        let span = 2.0 * dt.num_milliseconds() as f64 / 1000.0;
        Axis::BOTH.map(|axis| {
            if span <= 0.0 {
                return 0.0;
            }
            let delta =
                geometry.signed_delta(axis, before.get(axis).round(), after.get(axis).round());
            delta / span
        })
    }

    /// Add a sample at `now` and return the windowed rates.
    pub fn estimate(&mut self, now: DateTime<Utc>) -> [f64; 2] {
        let sample = self.sample(now);
        for axis in Axis::BOTH {
            self.windows[axis as usize].push(now, sample[axis as usize]);
        }
        Axis::BOTH.map(|axis| self.windows[axis as usize].mean().unwrap_or(0.0))
    }

    /// One tracking step: estimate and send rates that left the deadband.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<(), MotionError> {
        let rates = self.estimate(now);
        let geometry = *self.pointing.geometry();
        let deadband = self.config.deadband_units as i64;

        for axis in Axis::BOTH {
            let i = axis as usize;
            let rate = GuideRate::from_steps_per_sec(rates[i], geometry.steps_per_rev(axis));
            let changed = match self.commanded[i] {
                Some(last) => (rate.0 as i64 - last.0 as i64).abs() > deadband,
                None => true,
            };
            if changed {
                trace!("{} guide rate {} ({:.3} steps/s)", axis, rate.0, rates[i]);
                self.bus
                    .send_cancellable(axis.device(), rate.opcode(), &rate.payload(), &self.abort)
                    .await?;
                self.commanded[i] = Some(rate);
            }
        }

        let mut state = self.lock_state();
        state.azm_rate = rates[0];
        state.alt_rate = rates[1];
        state.azm_command = self.commanded[0].unwrap_or_default();
        state.alt_command = self.commanded[1].unwrap_or_default();
        state.window_fill = self.windows[0].len();
        state.ticks += 1;
        state.last_tick = Some(now);
        Ok(())
    }
}

fn lock(state: &Mutex<TrackingState>) -> MutexGuard<'_, TrackingState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Zero the guide rate of both axes.
pub async fn stop_rates(bus: &AuxBus) -> Result<(), MotionError> {
    for axis in Axis::BOTH {
        let rate = GuideRate::ZERO;
        bus.send_command(axis.device(), rate.opcode(), &rate.payload()).await?;
    }
    Ok(())
}

/// Runs a [`TrackingLoop`] on a background task.
///
/// The task is cancelled on drop. Guide rates are left as last sent; use
/// [`stop_rates`] to halt the axes.
pub struct Tracker {
    handle: JoinHandle<()>,
    state: Arc<Mutex<TrackingState>>,
    error_count: Arc<AtomicUsize>,
}

impl Tracker {
    pub fn spawn(mut tracking: TrackingLoop) -> Self {
        let state = tracking.state.clone();
        let error_count = Arc::new(AtomicUsize::new(0));
        let error_count_clone = error_count.clone();
        let cadence = tracking.config.cadence();
        info!("tracking {} every {:?}", tracking.target, cadence);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match tracking.tick(Utc::now()).await {
                    Ok(()) => {}
                    Err(MotionError::AbortRequested) => {
                        debug!("tracking pre-empted by abort");
                        break;
                    }
                    Err(e) if e.is_hardware_fault() => {
                        warn!("tracking stopped: {e}");
                        error_count_clone.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        let count = error_count_clone.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!("tracking tick failed ({count} total): {e}");
                    }
                }
            }
            tracking.lock_state().active = false;
        });

        Self {
            handle,
            state,
            error_count,
        }
    }

    pub fn state(&self) -> TrackingState {
        lock(&self.state).clone()
    }

    /// Whether the loop ended by itself (abort or hardware fault).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.handle.abort();
        lock(&self.state).active = false;

        let errors = self.error_count.load(Ordering::Relaxed);
        if errors > 0 {
            warn!("Tracker: {errors} tick(s) failed during lifetime");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alignment::AlignmentEngine;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use ephemeris::{Equatorial, Site};
    use hardware::aux::sim::GUIDE_UNITS_PER_STEP;
    use hardware::aux::{BusConfig, SimClock, SimLink, SimulatedMount};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use crate::encoder::{EncoderGeometry, DEFAULT_STEPS_PER_REV};

    fn variance(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    fn sim_loop(config: TrackingConfig) -> (TrackingLoop, Arc<std::sync::Mutex<SimulatedMount>>) {
        let sim = Arc::new(std::sync::Mutex::new(SimulatedMount::new()));
        let link = SimLink::new(sim.clone(), SimClock::PerCommand(Duration::ZERO));
        let bus = AuxBus::new(Box::new(link), BusConfig::default());
        let site = Site::new(50.0, 20.0, 0.0).unwrap();
        let pointing =
            Pointing::new(site, EncoderGeometry::default(), None, AlignmentEngine::default());
        let target = Target::Equatorial(Equatorial::new(5.5, 30.0));
        (TrackingLoop::new(bus, pointing, target, config, AbortSignal::new()), sim)
    }

    fn reference_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_guide_rate_units_match_firmware() {
        assert_abs_diff_eq!(
            GuideRate::units_per_step(DEFAULT_STEPS_PER_REV),
            GUIDE_UNITS_PER_STEP,
            epsilon = 1e-12
        );
        let rate = GuideRate::from_steps_per_sec(-100.0, DEFAULT_STEPS_PER_REV);
        assert_eq!(rate.opcode(), mc::SET_NEG_GUIDERATE);
        assert_eq!(rate.0, -7910);
        assert_abs_diff_eq!(rate.steps_per_sec(DEFAULT_STEPS_PER_REV), -100.0, epsilon = 0.01);
    }

    #[test]
    fn test_guide_rate_clamps_to_24_bits() {
        let rate = GuideRate::from_steps_per_sec(1e9, DEFAULT_STEPS_PER_REV);
        assert_eq!(rate.0 as u32, U24_MAX);
        assert_eq!(rate.payload(), [0xFF, 0xFF, 0xFF]);
        assert_eq!(GuideRate::from_steps_per_sec(f64::NAN, DEFAULT_STEPS_PER_REV), GuideRate::ZERO);
    }

    #[test]
    fn test_window_drops_old_samples() {
        let t0 = reference_time();
        let mut window = RateWindow::new(2.0);
        for i in 0..5 {
            window.push(t0 + chrono::Duration::seconds(i), i as f64);
        }
        // samples at 2, 3 and 4 s remain
        assert_eq!(window.len(), 3);
        assert_abs_diff_eq!(window.mean().unwrap(), 3.0);

        let mut latest_only = RateWindow::new(0.0);
        latest_only.push(t0, 1.0);
        latest_only.push(t0 + chrono::Duration::seconds(1), 5.0);
        assert_eq!(latest_only.len(), 1);
        assert_eq!(latest_only.mean(), Some(5.0));
    }

    #[test]
    fn test_window_reduces_quantization_noise() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let t0 = reference_time();
        let true_rate = 123.4;
        let span = 2.0;
        let mut window = RateWindow::new(10.0);
        let mut single = Vec::new();
        let mut windowed = Vec::new();
        for i in 0..400 {
            let noise = rng.random_range(-1i32..=1) - rng.random_range(-1i32..=1);
            let sample = true_rate + noise as f64 / span;
            window.push(t0 + chrono::Duration::seconds(i), sample);
            single.push(sample);
            if i >= 10 {
                windowed.push(window.mean().unwrap());
            }
        }
        assert!(variance(&windowed) < variance(&single) / 2.0);
        let mean = windowed.iter().sum::<f64>() / windowed.len() as f64;
        assert_abs_diff_eq!(mean, true_rate, epsilon = 0.1);
    }

    #[test]
    fn test_loop_estimate_smooths_rounded_samples() {
        let (mut tracking, _) = sim_loop(TrackingConfig {
            dt_s: 0.5,
            window_s: 19.5,
            ..TrackingConfig::default()
        });
        let t0 = reference_time();
        let mut single = Vec::new();
        let mut windowed = Vec::new();
        let mut exact = 0.0;
        for i in 0..200 {
            let now = t0 + chrono::Duration::seconds(i);
            single.push(tracking.sample(now)[0]);
            let estimate = tracking.estimate(now)[0];
            if i >= 20 {
                windowed.push(estimate);
            }
            if i == 199 {
                let dt = chrono::Duration::seconds(30);
                let a = tracking.pointing.target_steps(&tracking.target, now, -dt);
                let b = tracking.pointing.target_steps(&tracking.target, now, dt);
                let geometry = tracking.pointing.geometry();
                exact = geometry.signed_delta(Axis::Azimuth, a.azm, b.azm) / 60.0;
            }
        }
        assert_eq!(tracking.windows[0].len(), 20);

        // the target moves smoothly, so tick-to-tick changes are rounding noise
        let steps = |series: &[f64]| series.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
        assert!(variance(&steps(&single)) > 0.01);
        assert!(variance(&steps(&windowed)) < variance(&steps(&single)) / 4.0);
        assert_abs_diff_eq!(*windowed.last().unwrap(), exact, epsilon = 1.0);
    }

    #[test]
    fn test_central_difference_matches_star_motion() {
        let (tracking, _) = sim_loop(TrackingConfig::default());
        let now = reference_time();
        let rates = tracking.sample(now);

        let dt = chrono::Duration::seconds(30);
        let g = tracking.pointing.geometry();
        let a = tracking.pointing.target_steps(&tracking.target, now, -dt);
        let b = tracking.pointing.target_steps(&tracking.target, now, dt);
        let expected_az = g.signed_delta(Axis::Azimuth, a.azm, b.azm) / 60.0;
        let expected_alt = (b.alt - a.alt) / 60.0;
        // rounding each endpoint costs at most 1/60 count per second
        assert_abs_diff_eq!(rates[0], expected_az, epsilon = 0.02);
        assert_abs_diff_eq!(rates[1], expected_alt, epsilon = 0.02);
        assert!(rates[0] > 0.0 && rates[1] > 0.0);
    }

    #[tokio::test]
    async fn test_tick_sends_rates_then_respects_deadband() {
        let (mut tracking, sim) = sim_loop(TrackingConfig {
            deadband_units: 1000,
            ..TrackingConfig::default()
        });
        let now = reference_time();
        tracking.tick(now).await.unwrap();
        let state = tracking.state();
        assert_eq!(state.ticks, 1);
        assert_eq!(state.window_fill, 1);
        {
            let sim = sim.lock().unwrap();
            assert_eq!(sim.commands().len(), 2);
            assert_eq!(sim.commands()[0].opcode, mc::SET_POS_GUIDERATE);
            assert_abs_diff_eq!(sim.azimuth.guide_rate(), state.azm_rate, epsilon = 0.05);
            assert_abs_diff_eq!(sim.altitude.guide_rate(), state.alt_rate, epsilon = 0.05);
        }

        // a second later the rate has barely changed
        tracking.tick(now + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(sim.lock().unwrap().commands().len(), 2);
        assert_eq!(tracking.state().ticks, 2);
    }

    #[tokio::test]
    async fn test_stop_rates_zeroes_both_axes() {
        let (mut tracking, sim) = sim_loop(TrackingConfig::default());
        tracking.tick(reference_time()).await.unwrap();
        stop_rates(&tracking.bus).await.unwrap();
        let sim = sim.lock().unwrap();
        assert_eq!(sim.azimuth.guide_rate(), 0.0);
        assert_eq!(sim.altitude.guide_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_tracker_drop_marks_inactive() {
        let (tracking, _) = sim_loop(TrackingConfig {
            cadence_ms: 5,
            ..TrackingConfig::default()
        });
        let tracker = Tracker::spawn(tracking);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = tracker.state();
        assert!(state.active);
        assert!(state.ticks >= 1);

        let shared = tracker.state.clone();
        drop(tracker);
        assert!(!lock(&shared).active);
    }
}
