//! Hardware drivers for telescope mount equipment.
//!
//! This crate provides the transport layer for mounts speaking the Celestron
//! AUX protocol. Drivers are feature-gated for optional compilation.
//!
//! # Features
//!
//! - `aux` - AUX bus codec, serial/TCP transports and mount simulator (default)

#[cfg(feature = "aux")]
pub mod aux;
