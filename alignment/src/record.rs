//! JSON persistence of an alignment session.

use std::path::Path;

use chrono::{DateTime, Utc};
use ephemeris::Horizontal;
use serde::{Deserialize, Serialize};

use crate::engine::{AlignmentConfig, AlignmentDiagnostics, AlignmentEngine, AddOutcome};
use crate::point::{horizontal_to_vector, vector_to_horizontal};

/// One stored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub sky: Horizontal,
    pub mount: Horizontal,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "unit_weight")]
    pub weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

/// Saved points plus a summary of the model they produced.
///
/// The model itself is refitted on load; `model` records what it was
/// when saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub saved_at: DateTime<Utc>,
    pub config: AlignmentConfig,
    /// Oldest first
    pub points: Vec<PointRecord>,
    pub model: AlignmentDiagnostics,
}

impl AlignmentRecord {
    /// Save to JSON file, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl AlignmentEngine {
    pub fn to_record(&self) -> AlignmentRecord {
        AlignmentRecord {
            saved_at: Utc::now(),
            config: self.config().clone(),
            points: self
                .points()
                .iter()
                .map(|p| PointRecord {
                    sky: vector_to_horizontal(&p.sky),
                    mount: vector_to_horizontal(&p.mount),
                    timestamp: p.timestamp,
                    weight: p.weight,
                })
                .collect(),
            model: self.diagnostics(),
        }
    }

    /// Rebuild an engine from `record` and refit once.
    ///
    /// Points are thinned again under the record's configuration, so a
    /// hand-edited record cannot overfill a sector.
    pub fn from_record(record: &AlignmentRecord) -> Self {
        let mut engine = AlignmentEngine::new(record.config.clone());
        let mut dropped = 0usize;
        for p in &record.points {
            let outcome = engine.insert(
                horizontal_to_vector(&p.sky),
                horizontal_to_vector(&p.mount),
                p.timestamp,
                p.weight,
            );
            if outcome != AddOutcome::Added {
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!(
                "{} of {} stored alignment points not restored",
                dropped,
                record.points.len()
            );
        }
        engine.refit();
        log::info!(
            "restored {} alignment points ({} model, rms {:.1}\")",
            engine.len(),
            engine.tier(),
            engine.rms_residual()
        );
        engine
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        self.to_record().save_to_file(path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        Ok(Self::from_record(&AlignmentRecord::load_from_file(path)?))
    }
}
