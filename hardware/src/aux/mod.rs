//! Celestron AUX bus protocol
//!
//! The AUX bus connects the motor controllers, hand controller, GPS and
//! accessories of a mount. This module provides:
//!
//! - [`frame`]: byte-exact frame codec and a resynchronizing stream decoder
//! - [`device`]: device addresses and per-device opcode tables
//! - [`payload`]: 24-bit positions, firmware versions, mount models
//! - [`link`]: serial and TCP transports
//! - [`bus`]: serialized request/reply transactions with echo suppression
//!   and bounded retries
//! - [`sim`]: a simulated mount for tests and the `aux_sim` server

pub mod bus;
pub mod checksum;
pub mod device;
pub mod frame;
pub mod link;
pub mod payload;
pub mod sim;

pub use bus::{AbortSignal, AuxBus, BusConfig, BusError, BusResult, BusStatsSnapshot, PriorityLane};
pub use checksum::{compute_checksum, verify_checksum_bytes};
pub use device::{focuser, gps, mc, power, Device, DeviceClass};
pub use frame::{Frame, FrameDecoder, FrameError, MAX_PAYLOAD_LEN, START_BYTE};
pub use link::{
    is_network_address, open_link, Link, SerialLink, TcpLink, DEFAULT_BAUD, DEFAULT_TCP_PORT,
};
pub use payload::{
    pack_u24, unpack_u16, unpack_u24, unpack_u8, FirmwareVersion, MountKind, MountModel, U24_MAX,
};
pub use sim::{SimClock, SimLink, SimulatedMount, STEPS_PER_REV};
