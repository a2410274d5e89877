//! Simulated AUX mount
//!
//! [`SimulatedMount`] answers motor-controller and GPS commands with a simple
//! kinematic model: each axis has a motor position driven by GoTo slews,
//! manual moves and guide rates, and a pointing position that lags the motor
//! through a backlash dead zone. [`SimLink`] exposes it as a [`Link`] so the
//! real bus code can be exercised without hardware.
//!
//! Time advances either with the wall clock (for the `aux_sim` server) or by
//! a fixed quantum per received command (deterministic tests).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::device::{gps, mc, Device};
use super::frame::Frame;
use super::link::Link;
use super::payload::{
    encode_dms, pack_u24, unpack_u16, unpack_u24, FirmwareVersion, MountModel,
};

/// Commands kept in the log of a new [`SimulatedMount`].
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Encoder steps per revolution of either axis.
pub const STEPS_PER_REV: f64 = 16_777_216.0;

/// Manual rates for `MC_MOVE_POS` / `MC_MOVE_NEG` steps 0-9, degrees per second.
pub const MOVE_RATES_DEG: [f64; 10] = [0.0, 0.008, 0.017, 0.033, 0.067, 0.133, 0.5, 1.0, 2.0, 4.0];

/// `MC_GOTO_SLOW` rate in degrees per second.
pub const GOTO_SLOW_RATE_DEG: f64 = 1.0;

/// Guide-rate units per step per second (`360 * 3600 * 1024 / steps_per_rev`).
pub const GUIDE_UNITS_PER_STEP: f64 = 360.0 * 3600.0 * 1024.0 / STEPS_PER_REV;

fn deg_to_steps(deg: f64) -> f64 {
    deg / 360.0 * STEPS_PER_REV
}

fn wrap_signed(steps: f64) -> f64 {
    let wrapped = steps.rem_euclid(STEPS_PER_REV);
    if wrapped > STEPS_PER_REV / 2.0 {
        wrapped - STEPS_PER_REV
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, Copy)]
struct Slew {
    target: f64,
    rate: f64,
}

/// One simulated motor controller.
#[derive(Debug, Clone)]
pub struct SimAxis {
    motor: f64,
    pointing: f64,
    slew: Option<Slew>,
    move_rate: f64,
    guide_rate: f64,
    backlash_steps: f64,
    last_slow_direction: Option<i8>,
    max_rate_mdeg: u16,
    max_rate_enabled: bool,
    pos_backlash: u8,
    neg_backlash: u8,
    approach: u8,
    autoguide_rate: u8,
    cordwrap_enabled: bool,
    cordwrap_position: u32,
    firmware: FirmwareVersion,
}

impl SimAxis {
    pub fn new(position: u32) -> Self {
        Self {
            motor: position as f64,
            pointing: position as f64,
            slew: None,
            move_rate: 0.0,
            guide_rate: 0.0,
            backlash_steps: 0.0,
            last_slow_direction: None,
            max_rate_mdeg: 4000,
            max_rate_enabled: false,
            pos_backlash: 0,
            neg_backlash: 0,
            approach: 0,
            autoguide_rate: 50,
            cordwrap_enabled: false,
            cordwrap_position: 0,
            firmware: FirmwareVersion {
                major: 7,
                minor: 11,
                build: 5002,
            },
        }
    }

    /// Raw encoder count as reported by `MC_GET_POSITION`.
    pub fn position(&self) -> u32 {
        (self.motor.rem_euclid(STEPS_PER_REV).round() as u32) % (STEPS_PER_REV as u32)
    }

    /// Where the optics actually point, in steps within one revolution.
    pub fn pointing(&self) -> f64 {
        self.pointing.rem_euclid(STEPS_PER_REV)
    }

    /// Combined commanded rate in steps per second (zero while slewing).
    pub fn rate(&self) -> f64 {
        self.move_rate + self.guide_rate
    }

    pub fn guide_rate(&self) -> f64 {
        self.guide_rate
    }

    pub fn is_slewing(&self) -> bool {
        self.slew.is_some()
    }

    /// Direction (+1/-1) of the most recent `MC_GOTO_SLOW`.
    pub fn last_slow_direction(&self) -> Option<i8> {
        self.last_slow_direction
    }

    /// Mechanical dead zone between motor and pointing.
    pub fn set_backlash_steps(&mut self, steps: f64) {
        self.backlash_steps = steps.max(0.0);
    }

    fn start_slew(&mut self, target: u32, rate_deg: f64) -> f64 {
        let delta = wrap_signed(target as f64 - self.motor);
        self.guide_rate = 0.0;
        self.move_rate = 0.0;
        self.slew = Some(Slew {
            target: self.motor + delta,
            rate: deg_to_steps(rate_deg),
        });
        delta
    }

    fn advance(&mut self, dt: f64) {
        match self.slew {
            Some(slew) => {
                let remaining = slew.target - self.motor;
                let step = slew.rate * dt;
                if remaining.abs() <= step {
                    self.motor = slew.target;
                    self.slew = None;
                } else {
                    self.motor += step * remaining.signum();
                }
            }
            None => self.motor += self.rate() * dt,
        }

        let half = self.backlash_steps / 2.0;
        if self.motor - self.pointing > half {
            self.pointing = self.motor - half;
        } else if self.pointing - self.motor > half {
            self.pointing = self.motor + half;
        }
    }

    fn handle(&mut self, opcode: u8, payload: &[u8]) -> Option<Vec<u8>> {
        let reply = match opcode {
            mc::GET_POSITION => pack_u24(self.position()).to_vec(),
            mc::GOTO_FAST => {
                let target = unpack_u24(payload).ok()?;
                let rate = self.max_rate_mdeg as f64 / 1000.0;
                self.start_slew(target, rate);
                Vec::new()
            }
            mc::GOTO_SLOW => {
                let target = unpack_u24(payload).ok()?;
                let delta = self.start_slew(target, GOTO_SLOW_RATE_DEG);
                if delta != 0.0 {
                    self.last_slow_direction = Some(if delta > 0.0 { 1 } else { -1 });
                }
                Vec::new()
            }
            mc::SLEW_DONE => vec![if self.slew.is_none() {
                mc::SLEW_COMPLETE
            } else {
                0x00
            }],
            mc::SET_POSITION => {
                let value = unpack_u24(payload).ok()? as f64;
                self.motor = value;
                self.pointing = value;
                self.slew = None;
                Vec::new()
            }
            mc::SET_POS_GUIDERATE | mc::SET_NEG_GUIDERATE => {
                let units = unpack_u24(payload).ok()? as f64;
                let sign = if opcode == mc::SET_POS_GUIDERATE { 1.0 } else { -1.0 };
                self.guide_rate = sign * units / GUIDE_UNITS_PER_STEP;
                Vec::new()
            }
            mc::MOVE_POS | mc::MOVE_NEG => {
                let index = *payload.first()? as usize;
                let rate = deg_to_steps(*MOVE_RATES_DEG.get(index)?);
                self.slew = None;
                self.move_rate = if opcode == mc::MOVE_POS { rate } else { -rate };
                Vec::new()
            }
            mc::LEVEL_START | mc::SEEK_INDEX | mc::AUX_GUIDE => Vec::new(),
            mc::LEVEL_DONE | mc::SEEK_DONE => vec![mc::SLEW_COMPLETE],
            mc::AUX_GUIDE_ACTIVE => vec![0x00],
            mc::SET_MAXRATE => {
                self.max_rate_mdeg = unpack_u16(payload).ok()?;
                Vec::new()
            }
            mc::GET_MAXRATE => self.max_rate_mdeg.to_be_bytes().to_vec(),
            mc::ENABLE_MAXRATE => {
                self.max_rate_enabled = *payload.first()? != 0;
                Vec::new()
            }
            mc::MAXRATE_ENABLED => vec![u8::from(self.max_rate_enabled)],
            mc::SET_POS_BACKLASH => {
                self.pos_backlash = *payload.first()?;
                Vec::new()
            }
            mc::SET_NEG_BACKLASH => {
                self.neg_backlash = *payload.first()?;
                Vec::new()
            }
            mc::GET_POS_BACKLASH => vec![self.pos_backlash],
            mc::GET_NEG_BACKLASH => vec![self.neg_backlash],
            mc::ENABLE_CORDWRAP => {
                self.cordwrap_enabled = true;
                Vec::new()
            }
            mc::DISABLE_CORDWRAP => {
                self.cordwrap_enabled = false;
                Vec::new()
            }
            mc::POLL_CORDWRAP => vec![if self.cordwrap_enabled { 0xFF } else { 0x00 }],
            mc::SET_CORDWRAP_POS => {
                self.cordwrap_position = unpack_u24(payload).ok()?;
                Vec::new()
            }
            mc::GET_CORDWRAP_POS => pack_u24(self.cordwrap_position).to_vec(),
            mc::SET_AUTOGUIDE_RATE => {
                self.autoguide_rate = *payload.first()?;
                Vec::new()
            }
            mc::GET_AUTOGUIDE_RATE => vec![self.autoguide_rate],
            mc::SET_APPROACH => {
                self.approach = *payload.first()?;
                Vec::new()
            }
            mc::GET_APPROACH => vec![self.approach],
            mc::GET_VER => self.firmware.to_payload().to_vec(),
            _ => return None,
        };
        Some(reply)
    }
}

/// Simulated GPS receiver.
#[derive(Debug, Clone, Copy)]
pub struct SimGps {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub linked: bool,
}

/// A command received by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCommand {
    /// Simulated time at reception, seconds
    pub time: f64,
    pub device: Device,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// A complete simulated Alt-Az mount.
#[derive(Debug, Clone)]
pub struct SimulatedMount {
    pub azimuth: SimAxis,
    pub altitude: SimAxis,
    pub gps: Option<SimGps>,
    model: MountModel,
    time: f64,
    offline: Vec<Device>,
    log: Vec<LoggedCommand>,
    log_capacity: usize,
}

impl Default for SimulatedMount {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMount {
    /// An Evolution mount parked at encoder zero.
    pub fn new() -> Self {
        Self {
            azimuth: SimAxis::new(0),
            altitude: SimAxis::new(0),
            gps: None,
            model: MountModel { id: 0x1687 },
            time: 0.0,
            offline: Vec::new(),
            log: Vec::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Keep at most `capacity` recent commands; 0 disables the log.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self.log.truncate(capacity);
        self
    }

    pub fn with_model(mut self, model: MountModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_gps(mut self, gps: SimGps) -> Self {
        self.gps = Some(gps);
        self
    }

    pub fn axis(&self, device: Device) -> Option<&SimAxis> {
        match device {
            Device::Azimuth => Some(&self.azimuth),
            Device::Altitude => Some(&self.altitude),
            _ => None,
        }
    }

    pub fn axis_mut(&mut self, device: Device) -> Option<&mut SimAxis> {
        match device {
            Device::Azimuth => Some(&mut self.azimuth),
            Device::Altitude => Some(&mut self.altitude),
            _ => None,
        }
    }

    /// Simulated seconds elapsed.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Recent commands, oldest first. Once the log is full the oldest half
    /// is discarded.
    pub fn commands(&self) -> &[LoggedCommand] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Make `device` stop answering (or answer again).
    pub fn set_offline(&mut self, device: Device, offline: bool) {
        self.offline.retain(|d| *d != device);
        if offline {
            self.offline.push(device);
        }
    }

    pub fn advance(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        self.time += dt;
        self.azimuth.advance(dt);
        self.altitude.advance(dt);
    }

    /// Process one request frame, returning the reply if the addressed
    /// device answers.
    pub fn handle_frame(&mut self, frame: &Frame) -> Option<Frame> {
        let device = frame.destination();
        self.record(device, frame);
        if self.offline.contains(&device) {
            trace!("sim: {} offline, ignoring {}", device, frame);
            return None;
        }

        let payload = frame.payload();
        let reply = match device {
            Device::Azimuth if frame.opcode() == mc::GET_MODEL => {
                self.model.id.to_be_bytes().to_vec()
            }
            Device::Azimuth => self.azimuth.handle(frame.opcode(), payload)?,
            Device::Altitude => self.altitude.handle(frame.opcode(), payload)?,
            Device::Gps => self.handle_gps(frame.opcode())?,
            _ => return None,
        };
        Frame::new(device, frame.source(), frame.opcode(), reply).ok()
    }

    fn record(&mut self, device: Device, frame: &Frame) {
        let capacity = self.log_capacity;
        if capacity == 0 {
            return;
        }
        if self.log.len() >= capacity {
            self.log.drain(..(capacity / 2).max(1));
        }
        self.log.push(LoggedCommand {
            time: self.time,
            device,
            opcode: frame.opcode(),
            payload: frame.payload().to_vec(),
        });
    }

    fn handle_gps(&self, opcode: u8) -> Option<Vec<u8>> {
        let gps = self.gps?;
        let reply = match opcode {
            gps::LINKED | gps::TIME_VALID => vec![u8::from(gps.linked)],
            gps::GET_LAT => encode_dms(gps.latitude_deg).to_vec(),
            gps::GET_LONG => encode_dms(gps.longitude_deg).to_vec(),
            mc::GET_VER => vec![1, 6],
            _ => return None,
        };
        Some(reply)
    }
}

/// How simulated time advances.
#[derive(Debug, Clone, Copy)]
pub enum SimClock {
    /// Follow the wall clock
    Wall,
    /// Advance by a fixed amount each time a command is received
    PerCommand(Duration),
}

/// [`Link`] connected to a [`SimulatedMount`].
pub struct SimLink {
    mount: Arc<Mutex<SimulatedMount>>,
    clock: SimClock,
    last_tick: Instant,
    echo: bool,
    rx: VecDeque<u8>,
}

impl SimLink {
    pub fn new(mount: Arc<Mutex<SimulatedMount>>, clock: SimClock) -> Self {
        Self {
            mount,
            clock,
            last_tick: Instant::now(),
            echo: false,
            rx: VecDeque::new(),
        }
    }

    /// Mimic the half-duplex serial port by echoing written bytes.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, SimulatedMount>> {
        self.mount
            .lock()
            .map_err(|_| io::Error::other("simulated mount lock poisoned"))
    }
}

impl Link for SimLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.echo {
            self.rx.extend(bytes.iter().copied());
        }
        let dt = match self.clock {
            SimClock::Wall => {
                let now = Instant::now();
                let dt = now.duration_since(self.last_tick);
                self.last_tick = now;
                dt
            }
            SimClock::PerCommand(dt) => dt,
        };

        let reply = {
            let mut mount = self.lock()?;
            mount.advance(dt.as_secs_f64());
            match Frame::decode(bytes) {
                Ok(frame) => mount.handle_frame(&frame),
                Err(e) => {
                    debug!("sim: ignoring undecodable input: {}", e);
                    None
                }
            }
        };
        if let Some(reply) = reply {
            self.rx.extend(reply.encode());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.rx.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(0);
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn echoes(&self) -> bool {
        self.echo
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}
