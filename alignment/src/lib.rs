//! Star alignment for Alt-Az mounts.
//!
//! An [`AlignmentEngine`] collects pairs of (ideal sky direction, encoder
//! direction), thins them over a grid of sky sectors and fits a pointing
//! model whose complexity grows with the number of points:
//!
//! | points | model                                            |
//! |--------|--------------------------------------------------|
//! | 0      | identity                                         |
//! | 1–2    | rotation (Procrustes / minimal rotation)          |
//! | 3–5    | axis tilt + azimuth and altitude zero-points      |
//! | ≥ 6    | adds cone error and axis non-perpendicularity     |
//!
//! A failed fit falls back to the next simpler model; if nothing fits the
//! previous model is kept and the status reports the degradation.

pub mod engine;
pub mod fit;
pub mod model;
pub mod point;
pub mod record;

pub use engine::{AddOutcome, AlignmentConfig, AlignmentDiagnostics, AlignmentEngine, FitStatus};
pub use fit::FitError;
pub use model::{select_tier, AlignmentModel, ModelTier, MountGeometry};
pub use point::{horizontal_to_vector, vector_to_horizontal, AlignmentPoint, SectorKey};
pub use record::{AlignmentRecord, PointRecord};
