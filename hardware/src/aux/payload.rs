//! Payload encodings shared by several opcodes
//!
//! Positions and tracking rates travel as 24-bit big-endian unsigned
//! integers. Firmware versions are two or four bytes. The mount model is a
//! 16-bit identifier returned by the azimuth controller.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::frame::FrameError;

/// Largest value representable in a 24-bit field.
pub const U24_MAX: u32 = 0x00FF_FFFF;

/// Encode the low 24 bits of `value`, big-endian.
pub fn pack_u24(value: u32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Decode a 24-bit big-endian value from the first three payload bytes.
pub fn unpack_u24(payload: &[u8]) -> Result<u32, FrameError> {
    match payload {
        [a, b, c, ..] => Ok((*a as u32) << 16 | (*b as u32) << 8 | *c as u32),
        _ => Err(FrameError::PayloadTooShort {
            expected: 3,
            actual: payload.len(),
        }),
    }
}

/// Decode a 16-bit big-endian value.
pub fn unpack_u16(payload: &[u8]) -> Result<u16, FrameError> {
    match payload {
        [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(FrameError::PayloadTooShort {
            expected: 2,
            actual: payload.len(),
        }),
    }
}

/// Single status byte (e.g. `MC_SLEW_DONE`, `GPS_LINKED`).
pub fn unpack_u8(payload: &[u8]) -> Result<u8, FrameError> {
    payload.first().copied().ok_or(FrameError::PayloadTooShort {
        expected: 1,
        actual: 0,
    })
}

/// Firmware version reported by `GET_VER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl FirmwareVersion {
    /// Motor controllers answer with four bytes (`a.b.(c<<8|d)`), accessories
    /// with two (`a.b`).
    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        match payload {
            [major, minor, hi, lo, ..] => Ok(Self {
                major: *major,
                minor: *minor,
                build: u16::from_be_bytes([*hi, *lo]),
            }),
            [major, minor] => Ok(Self {
                major: *major,
                minor: *minor,
                build: 0,
            }),
            _ => Err(FrameError::PayloadTooShort {
                expected: 2,
                actual: payload.len(),
            }),
        }
    }

    pub fn to_payload(self) -> [u8; 4] {
        let [hi, lo] = self.build.to_be_bytes();
        [self.major, self.minor, hi, lo]
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Mechanical layout of a mount family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    AltAz,
    Equatorial,
}

/// Mount identification from `MC_GET_MODEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountModel {
    pub id: u16,
}

const KNOWN_MODELS: &[(u16, &str, MountKind)] = &[
    (0x0001, "Nexstar GPS", MountKind::AltAz),
    (0x0783, "Nexstar SLT", MountKind::AltAz),
    (0x0B83, "4/5SE", MountKind::AltAz),
    (0x0C82, "6/8SE", MountKind::AltAz),
    (0x1189, "CPC Deluxe", MountKind::AltAz),
    (0x1283, "GT Series", MountKind::AltAz),
    (0x1687, "Nexstar Evolution", MountKind::AltAz),
    (0x0984, "Advanced GT", MountKind::Equatorial),
    (0x0A84, "CGE", MountKind::Equatorial),
    (0x0E85, "CGEM", MountKind::Equatorial),
    (0x1485, "AVX", MountKind::Equatorial),
    (0x1788, "CGX", MountKind::Equatorial),
    (0x1888, "CGX-L", MountKind::Equatorial),
];

impl MountModel {
    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        Ok(Self {
            id: unpack_u16(payload)?,
        })
    }

    pub fn name(&self) -> Option<&'static str> {
        KNOWN_MODELS
            .iter()
            .find(|(id, _, _)| *id == self.id)
            .map(|(_, name, _)| *name)
    }

    /// Unknown models are assumed to be Alt-Az.
    pub fn kind(&self) -> MountKind {
        KNOWN_MODELS
            .iter()
            .find(|(id, _, _)| *id == self.id)
            .map(|(_, _, kind)| *kind)
            .unwrap_or(MountKind::AltAz)
    }
}

impl fmt::Display for MountModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#06x})", self.id),
            None => write!(f, "unknown model {:#06x}", self.id),
        }
    }
}

/// GPS latitude / longitude payload: degrees, minutes, seconds, sign flag.
pub fn decode_dms(payload: &[u8]) -> Result<f64, FrameError> {
    match payload {
        [deg, min, sec, sign, ..] => {
            let value = *deg as f64 + *min as f64 / 60.0 + *sec as f64 / 3600.0;
            Ok(if *sign != 0 { -value } else { value })
        }
        _ => Err(FrameError::PayloadTooShort {
            expected: 4,
            actual: payload.len(),
        }),
    }
}

/// Inverse of [`decode_dms`], rounding to whole arcseconds.
pub fn encode_dms(degrees: f64) -> [u8; 4] {
    let total = (degrees.abs() * 3600.0).round() as u32;
    let deg = (total / 3600).min(255) as u8;
    let min = ((total / 60) % 60) as u8;
    let sec = (total % 60) as u8;
    [deg, min, sec, u8::from(degrees < 0.0)]
}
