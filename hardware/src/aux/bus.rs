//! Serialized request/reply access to the AUX bus
//!
//! The bus is half-duplex and shared by every caller in the process: GoTo
//! sequencing, tracking-rate updates and status polling all issue commands
//! through one [`AuxBus`]. Each request/reply cycle holds an exclusive lock
//! for its full duration, so concurrent callers queue (FIFO, tokio's fair
//! mutex) and can never read each other's replies.
//!
//! Commands sent through [`AuxBus::send_priority`] overtake the queue:
//! while one is pending, ordinary callers that reach the front hand the
//! token back untouched and re-queue behind it. At most the request already
//! on the wire completes first.
//!
//! # Cycle
//!
//! 1. Acquire the bus token, yielding it to pending priority requests;
//!    re-check the caller's [`AbortSignal`] if any.
//! 2. Flush stale input, write the encoded frame.
//! 3. On echoing links, read back exactly the bytes written and compare.
//! 4. Decode incoming frames until one comes from the addressed device, to
//!    us, with the request opcode. Unrelated frames are dropped.
//!
//! Timeouts, echo mismatches and framing errors are retried up to
//! [`BusConfig::retries`] times (each retry re-acquires the token); after
//! that the device is reported [`BusError::Unavailable`].
//!
//! # Example
//!
//! ```no_run
//! use hardware::aux::{open_link, AuxBus, BusConfig, Device, DEFAULT_BAUD};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), hardware::aux::BusError> {
//! let link = open_link("/dev/ttyUSB0", DEFAULT_BAUD, Duration::from_secs(2))?;
//! let bus = AuxBus::new(link, BusConfig::default());
//! let steps = bus.get_position(Device::Azimuth).await?;
//! println!("azimuth at {steps} steps");
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use super::device::{mc, Device};
use super::frame::{Frame, FrameDecoder, FrameError};
use super::link::Link;
use super::payload::{unpack_u16, unpack_u24, unpack_u8, FirmwareVersion, MountModel};

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;

/// Errors from a bus transaction.
#[derive(Error, Debug)]
pub enum BusError {
    /// No matching reply within the reply timeout.
    #[error("timed out waiting for {device} reply to opcode {opcode:#04x}")]
    Timeout { device: Device, opcode: u8 },

    /// Retries exhausted; the device is treated as faulted.
    #[error("{device} unavailable after {attempts} attempts")]
    Unavailable {
        device: Device,
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },

    /// Bytes read back on a half-duplex link differ from those written.
    #[error("echo mismatch: wrote {written:02X?}, read back {echoed:02X?}")]
    EchoMismatch { written: Vec<u8>, echoed: Vec<u8> },

    /// Framing or payload decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Transport I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The caller's abort signal was raised before the request was sent.
    #[error("request pre-empted by abort")]
    AbortRequested,
}

impl BusError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Timeout { .. } | BusError::EchoMismatch { .. } | BusError::Protocol(_)
        )
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Shared flag used to pre-empt queued motion commands.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keeps ordinary requests off the bus while held.
///
/// Take one with [`AuxBus::priority_lane`] to send a burst of
/// [`AuxBus::send_priority`] commands with nothing interleaved.
#[derive(Debug)]
pub struct PriorityLane(Arc<AtomicUsize>);

impl PriorityLane {
    fn open(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self(pending.clone())
    }
}

impl Drop for PriorityLane {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum Lane<'a> {
    Ordinary,
    Cancellable(&'a AbortSignal),
    Priority,
}

/// Bus timing parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-attempt reply timeout
    pub reply_timeout: Duration,
    /// Additional attempts after the first
    pub retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

#[derive(Debug, Default)]
struct BusStats {
    requests: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    resyncs: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Point-in-time copy of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub resyncs: u64,
    pub dropped_frames: u64,
}

struct Channel {
    link: Box<dyn Link>,
    decoder: FrameDecoder,
}

impl Channel {
    fn transact(
        &mut self,
        request: &Frame,
        timeout: Duration,
        stats: &BusStats,
    ) -> BusResult<Frame> {
        let bytes = request.encode();
        let deadline = Instant::now() + timeout;

        self.link.clear_input()?;
        self.decoder.clear();

        trace!("tx {}", request);
        self.link.write_all(&bytes)?;

        if self.link.echoes() {
            if let Err(e) = self.consume_echo(&bytes, deadline, request) {
                stats.resyncs.fetch_add(1, Ordering::Relaxed);
                self.link.clear_input()?;
                self.decoder.clear();
                return Err(e);
            }
        }

        let mut buf = [0u8; 64];
        let mut last_protocol_error = None;
        loop {
            while let Some(result) = self.decoder.next_frame() {
                match result {
                    Ok(frame) if is_reply_to(request, &frame) => {
                        trace!("rx {}", frame);
                        return Ok(frame);
                    }
                    Ok(frame) => {
                        stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        trace!("dropping unrelated frame {}", frame);
                    }
                    Err(e) => {
                        stats.resyncs.fetch_add(1, Ordering::Relaxed);
                        debug!("discarding bad frame from {}: {}", self.link.describe(), e);
                        last_protocol_error = Some(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let n = self.link.read(&mut buf, deadline - now)?;
            self.decoder.push(&buf[..n]);
        }

        match last_protocol_error {
            Some(e) => Err(BusError::Protocol(e)),
            None => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(BusError::Timeout {
                    device: request.destination(),
                    opcode: request.opcode(),
                })
            }
        }
    }

    /// Read back exactly `written.len()` bytes; anything beyond belongs to
    /// the reply and is handed to the decoder.
    fn consume_echo(
        &mut self,
        written: &[u8],
        deadline: Instant,
        request: &Frame,
    ) -> BusResult<()> {
        let mut echoed = Vec::with_capacity(written.len());
        let mut buf = [0u8; 64];
        while echoed.len() < written.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout {
                    device: request.destination(),
                    opcode: request.opcode(),
                });
            }
            let n = self.link.read(&mut buf, deadline - now)?;
            echoed.extend_from_slice(&buf[..n]);
        }

        let rest = echoed.split_off(written.len());
        if echoed != written {
            return Err(BusError::EchoMismatch {
                written: written.to_vec(),
                echoed,
            });
        }
        self.decoder.push(&rest);
        Ok(())
    }
}

fn is_reply_to(request: &Frame, frame: &Frame) -> bool {
    frame.source() == request.destination()
        && frame.destination() == request.source()
        && frame.opcode() == request.opcode()
}

/// Handle to the shared bus. Cheap to clone; all clones share one token.
#[derive(Clone)]
pub struct AuxBus {
    channel: Arc<Mutex<Channel>>,
    priority: Arc<AtomicUsize>,
    stats: Arc<BusStats>,
    config: BusConfig,
    description: String,
}

impl AuxBus {
    pub fn new(link: Box<dyn Link>, config: BusConfig) -> Self {
        let description = link.describe();
        debug!("AUX bus on {}", description);
        Self {
            channel: Arc::new(Mutex::new(Channel {
                link,
                decoder: FrameDecoder::new(),
            })),
            priority: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(BusStats::default()),
            config,
            description,
        }
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Send a command and return the reply payload.
    pub async fn send_command(
        &self,
        dest: Device,
        opcode: u8,
        payload: &[u8],
    ) -> BusResult<Vec<u8>> {
        self.send_with(dest, opcode, payload, Lane::Ordinary).await
    }

    /// Like [`send_command`](Self::send_command), but dropped without
    /// touching the wire if `abort` is raised by the time the bus token is
    /// acquired.
    pub async fn send_cancellable(
        &self,
        dest: Device,
        opcode: u8,
        payload: &[u8],
        abort: &AbortSignal,
    ) -> BusResult<Vec<u8>> {
        self.send_with(dest, opcode, payload, Lane::Cancellable(abort)).await
    }

    /// Hold off ordinary requests until the returned lane is dropped.
    pub fn priority_lane(&self) -> PriorityLane {
        PriorityLane::open(&self.priority)
    }

    /// Send ahead of every queued ordinary request.
    ///
    /// Used for halts: the command goes out as soon as the transaction in
    /// flight, if any, completes.
    pub async fn send_priority(
        &self,
        dest: Device,
        opcode: u8,
        payload: &[u8],
    ) -> BusResult<Vec<u8>> {
        let _lane = self.priority_lane();
        self.send_with(dest, opcode, payload, Lane::Priority).await
    }

    async fn acquire(&self, lane: Lane<'_>) -> OwnedMutexGuard<Channel> {
        loop {
            let guard = self.channel.clone().lock_owned().await;
            if matches!(lane, Lane::Priority) || self.priority.load(Ordering::SeqCst) == 0 {
                return guard;
            }
            drop(guard);
            tokio::task::yield_now().await;
        }
    }

    async fn send_with(
        &self,
        dest: Device,
        opcode: u8,
        payload: &[u8],
        lane: Lane<'_>,
    ) -> BusResult<Vec<u8>> {
        let request = Frame::command(dest, opcode, payload)?;
        let attempts = self.config.retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let guard = self.acquire(lane).await;
            if let Lane::Cancellable(abort) = lane {
                if abort.is_raised() {
                    debug!("{} pre-empted by abort", request);
                    return Err(BusError::AbortRequested);
                }
            }
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let frame = request.clone();
            let stats = self.stats.clone();
            let timeout = self.config.reply_timeout;
            let result = tokio::task::spawn_blocking(move || {
                let mut channel = guard;
                channel.transact(&frame, timeout, &stats)
            })
            .await
            .map_err(|e| BusError::Io(io::Error::other(e)))?;

            match result {
                Ok(reply) => return Ok(reply.into_payload()),
                Err(e) if e.is_retryable() => {
                    warn!("{} attempt {}/{} failed: {}", request, attempt, attempts, e);
                    if attempt < attempts {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(BusError::Unavailable {
            device: dest,
            attempts,
            source: Box::new(last_error.unwrap_or(BusError::Timeout { device: dest, opcode })),
        })
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            resyncs: self.stats.resyncs.load(Ordering::Relaxed),
            dropped_frames: self.stats.dropped_frames.load(Ordering::Relaxed),
        }
    }

    // ==================== Typed helpers ====================

    /// Raw 24-bit encoder count of an axis.
    pub async fn get_position(&self, axis: Device) -> BusResult<u32> {
        let reply = self.send_command(axis, mc::GET_POSITION, &[]).await?;
        Ok(unpack_u24(&reply)?)
    }

    /// Whether the axis has finished its last GoTo.
    pub async fn slew_done(&self, axis: Device) -> BusResult<bool> {
        let reply = self.send_command(axis, mc::SLEW_DONE, &[]).await?;
        Ok(unpack_u8(&reply)? == mc::SLEW_COMPLETE)
    }

    pub async fn get_version(&self, device: Device) -> BusResult<FirmwareVersion> {
        let reply = self.send_command(device, mc::GET_VER, &[]).await?;
        Ok(FirmwareVersion::from_payload(&reply)?)
    }

    pub async fn get_model(&self) -> BusResult<MountModel> {
        let reply = self.send_command(Device::Azimuth, mc::GET_MODEL, &[]).await?;
        Ok(MountModel::from_payload(&reply)?)
    }

    /// Per-axis backlash setting (0-99).
    pub async fn get_backlash(&self, axis: Device, positive: bool) -> BusResult<u8> {
        let opcode = if positive {
            mc::GET_POS_BACKLASH
        } else {
            mc::GET_NEG_BACKLASH
        };
        let reply = self.send_command(axis, opcode, &[]).await?;
        Ok(unpack_u8(&reply)?)
    }

    pub async fn get_max_rate(&self, axis: Device) -> BusResult<u16> {
        let reply = self.send_command(axis, mc::GET_MAXRATE, &[]).await?;
        Ok(unpack_u16(&reply)?)
    }
}
