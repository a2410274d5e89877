//! AUX frame encoding and decoding
//!
//! ```text
//! 0x3B | LEN | SRC | DST | OP | PAYLOAD... | CS
//! ```
//!
//! `LEN` counts SRC, DST, OP and the payload (`3 + payload.len()`), and may
//! not exceed [`MAX_FRAME_LEN`]. `CS` covers LEN through the last payload
//! byte; see [`super::checksum`].
//!
//! [`Frame::decode`] parses one complete frame. [`FrameDecoder`] parses a byte
//! stream that may contain garbage, echoes or partial frames, resynchronizing
//! on the start marker after every error instead of giving up on the link.

use std::fmt;

use thiserror::Error;

use super::checksum::compute_checksum;
use super::device::{Device, DeviceClass};

/// Frame start marker.
pub const START_BYTE: u8 = 0x3B;

/// Largest legal value of the LEN byte.
pub const MAX_FRAME_LEN: usize = 32;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 3;

/// Smallest possible encoded frame (empty payload).
pub const MIN_ENCODED_LEN: usize = 6;

/// Framing and checksum failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame does not begin with start marker (got {0:#04x})")]
    MissingHeader(u8),

    #[error("length byte {declared} disagrees with frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown device address {0:#04x}")]
    UnknownDevice(u8),

    #[error("opcode {opcode:#04x} is not valid for {device}")]
    UnknownOpcode { device: Device, opcode: u8 },

    #[error("payload of {0} bytes exceeds maximum of {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),

    #[error("payload too short: expected {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
}

/// One AUX bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    source: Device,
    destination: Device,
    opcode: u8,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, rejecting payloads that do not fit.
    pub fn new(
        source: Device,
        destination: Device,
        opcode: u8,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            source,
            destination,
            opcode,
            payload,
        })
    }

    /// Build a request from the host application to `destination`.
    pub fn command(destination: Device, opcode: u8, payload: &[u8]) -> Result<Self, FrameError> {
        Self::new(Device::App, destination, opcode, payload.to_vec())
    }

    pub fn source(&self) -> Device {
        self.source
    }

    pub fn destination(&self) -> Device {
        self.destination
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Checksum byte this frame carries on the wire.
    pub fn checksum(&self) -> u8 {
        let encoded = self.encode();
        encoded[encoded.len() - 1]
    }

    /// The device whose opcode table applies to this frame.
    ///
    /// Requests are interpreted by their destination; replies to a host or
    /// hand controller are interpreted by their source.
    pub fn peer(&self) -> Device {
        if self.destination.class() == DeviceClass::Control {
            self.source
        } else {
            self.destination
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_ENCODED_LEN + self.payload.len());
        bytes.push(START_BYTE);
        bytes.push((3 + self.payload.len()) as u8);
        bytes.push(self.source.id());
        bytes.push(self.destination.id());
        bytes.push(self.opcode);
        bytes.extend_from_slice(&self.payload);
        let cs = compute_checksum(&bytes[1..]);
        bytes.push(cs);
        bytes
    }

    /// Parse exactly one frame occupying all of `bytes`.
    ///
    /// The checksum is validated over the buffer extent before the length
    /// byte is trusted, so corruption anywhere after the start marker is
    /// reported as [`FrameError::ChecksumMismatch`].
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let first = *bytes.first().ok_or(FrameError::Truncated {
            needed: MIN_ENCODED_LEN,
            available: 0,
        })?;
        if first != START_BYTE {
            return Err(FrameError::MissingHeader(first));
        }
        if bytes.len() < MIN_ENCODED_LEN {
            return Err(FrameError::Truncated {
                needed: MIN_ENCODED_LEN,
                available: bytes.len(),
            });
        }

        let cs_index = bytes.len() - 1;
        let computed = compute_checksum(&bytes[1..cs_index]);
        let received = bytes[cs_index];
        if computed != received {
            return Err(FrameError::ChecksumMismatch { computed, received });
        }

        let declared = bytes[1] as usize;
        if declared + 3 != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let source = Device::from_id(bytes[2]).ok_or(FrameError::UnknownDevice(bytes[2]))?;
        let destination = Device::from_id(bytes[3]).ok_or(FrameError::UnknownDevice(bytes[3]))?;
        let frame = Frame::new(source, destination, bytes[4], bytes[5..cs_index].to_vec())?;

        let peer = frame.peer();
        if !peer.class().accepts(frame.opcode) {
            return Err(FrameError::UnknownOpcode {
                device: peer,
                opcode: frame.opcode,
            });
        }
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}",
            self.source,
            self.destination,
            self.peer().class().opcode_name(self.opcode)
        )?;
        for b in &self.payload {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

/// Incremental decoder for a raw byte stream.
///
/// Bytes are appended with [`push`](Self::push) and frames pulled with
/// [`next_frame`](Self::next_frame). Bytes preceding a start marker are
/// discarded. A header with an impossible length, or a frame that fails to
/// decode, costs only its start marker: scanning resumes at the following
/// byte so a real frame hidden behind a false marker is still found.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    discarded: usize,
    resyncs: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drop all buffered input.
    pub fn clear(&mut self) {
        self.discarded += self.buffer.len();
        self.buffer.clear();
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes thrown away while hunting for frames.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Number of times the decoder abandoned a candidate start marker.
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    /// Decode the next frame from buffered input.
    ///
    /// Returns `None` when more bytes are needed, `Some(Err(_))` when a
    /// candidate frame was rejected (the decoder has already resynchronized),
    /// and `Some(Ok(_))` for a valid frame.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            match self.buffer.iter().position(|&b| b == START_BYTE) {
                None => {
                    self.clear();
                    return None;
                }
                Some(0) => {}
                Some(skip) => {
                    self.discarded += skip;
                    self.buffer.drain(..skip);
                }
            }

            let Some(&len_byte) = self.buffer.get(1) else {
                return None;
            };
            let len = len_byte as usize;
            if !(3..=MAX_FRAME_LEN).contains(&len) {
                self.skip_marker();
                continue;
            }

            let total = len + 3;
            if self.buffer.len() < total {
                return None;
            }

            return match Frame::decode(&self.buffer[..total]) {
                Ok(frame) => {
                    self.buffer.drain(..total);
                    Some(Ok(frame))
                }
                Err(err @ (FrameError::UnknownOpcode { .. } | FrameError::UnknownDevice(_))) => {
                    // Framing was sound; the whole frame is consumed.
                    self.discarded += total;
                    self.buffer.drain(..total);
                    Some(Err(err))
                }
                Err(err) => {
                    self.skip_marker();
                    Some(Err(err))
                }
            };
        }
    }

    fn skip_marker(&mut self) {
        self.buffer.drain(..1);
        self.discarded += 1;
        self.resyncs += 1;
    }
}
