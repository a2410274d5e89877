//! Numerical building blocks for mount alignment.
//!
//! - [`procrustes`]: weighted best-fit rotation between two sets of unit
//!   vectors (SVD / Kabsch), with the single-pair minimal rotation
//! - [`least_squares`]: Levenberg–Marquardt for small dense problems
//! - [`sphere`]: unit-vector / spherical-angle conversions

pub mod least_squares;
pub mod procrustes;
pub mod sphere;

pub use least_squares::{levenberg_marquardt, LmConfig, LmReport, SolverError};
pub use procrustes::{minimal_rotation, weighted_rotation, ProcrustesError};
pub use sphere::{angle_between, from_spherical, to_spherical};
