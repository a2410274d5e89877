//! Bounded, spatially thinned alignment point set with automatic refit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ephemeris::Horizontal;
use itertools::Itertools;
use meter_math::LmConfig;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::fit::{self, residual_arcsec, FitError};
use crate::model::{select_tier, AlignmentModel, ModelTier};
use crate::point::{horizontal_to_vector, vector_to_horizontal, AlignmentPoint, SectorKey};

const ARCMIN_PER_RADIAN: f64 = 180.0 * 60.0 / std::f64::consts::PI;

/// Thinning and weighting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Edge of a square sky sector, degrees
    pub sector_size_deg: f64,
    /// Points retained per sector
    pub max_per_sector: usize,
    /// Proximity bias towards the target for rotation-tier pointing (0 disables)
    pub local_bias: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            sector_size_deg: 15.0,
            max_per_sector: 2,
            local_bias: 0.0,
        }
    }
}

/// What happened to a submitted point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored in a sector with room
    Added,
    /// Stored in place of the sector's worst-fitting point
    Replaced,
    /// Sector full of better-fitting points, or the observation was unusable
    Rejected,
}

/// Result of the most recent refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Fitted,
    /// The requested tier failed; `achieved` is the tier now in use
    Degraded {
        requested: ModelTier,
        achieved: ModelTier,
    },
}

/// Summary of the current model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentDiagnostics {
    pub point_count: usize,
    pub tier: ModelTier,
    pub status: FitStatus,
    pub rms_arcsec: f64,
    pub roll_arcmin: f64,
    pub pitch_arcmin: f64,
    pub azimuth_zero_deg: f64,
    pub altitude_index_arcmin: f64,
    pub cone_arcmin: f64,
    pub non_perpendicularity_arcmin: f64,
}

/// Owner of the alignment points and the model fitted to them.
#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    config: AlignmentConfig,
    solver: LmConfig,
    sectors: BTreeMap<SectorKey, Vec<AlignmentPoint>>,
    model: AlignmentModel,
    status: FitStatus,
    rms_arcsec: f64,
    next_sequence: u64,
}

impl Default for AlignmentEngine {
    fn default() -> Self {
        Self::new(AlignmentConfig::default())
    }
}

impl AlignmentEngine {
    pub fn new(config: AlignmentConfig) -> Self {
        let config = if config.sector_size_deg.is_finite() && config.sector_size_deg > 0.0 {
            config
        } else {
            log::warn!(
                "invalid sector size {}, using {}",
                config.sector_size_deg,
                AlignmentConfig::default().sector_size_deg
            );
            AlignmentConfig {
                sector_size_deg: AlignmentConfig::default().sector_size_deg,
                ..config
            }
        };
        Self {
            config,
            solver: LmConfig::default(),
            sectors: BTreeMap::new(),
            model: AlignmentModel::Identity,
            status: FitStatus::Fitted,
            rms_arcsec: 0.0,
            next_sequence: 0,
        }
    }

    /// Use `solver` for the offset-tier fits.
    pub fn with_solver(mut self, solver: LmConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn model(&self) -> &AlignmentModel {
        &self.model
    }

    pub fn tier(&self) -> ModelTier {
        self.model.tier()
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.sectors.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// RMS residual over all points under the current model, arcseconds.
    pub fn rms_residual(&self) -> f64 {
        self.rms_arcsec
    }

    /// All points, oldest first.
    pub fn points(&self) -> Vec<AlignmentPoint> {
        self.sectors
            .values()
            .flatten()
            .cloned()
            .sorted_by_key(|p| p.sequence)
            .collect()
    }

    /// Add an observation with unit weight and refit.
    pub fn add_point(
        &mut self,
        sky: Vector3<f64>,
        mount: Vector3<f64>,
        timestamp: DateTime<Utc>,
    ) -> AddOutcome {
        self.add_weighted_point(sky, mount, timestamp, 1.0)
    }

    /// Add an observation given as Alt/Az pairs.
    pub fn add_observation(
        &mut self,
        sky: &Horizontal,
        mount: &Horizontal,
        timestamp: DateTime<Utc>,
    ) -> AddOutcome {
        self.add_point(horizontal_to_vector(sky), horizontal_to_vector(mount), timestamp)
    }

    pub fn add_weighted_point(
        &mut self,
        sky: Vector3<f64>,
        mount: Vector3<f64>,
        timestamp: DateTime<Utc>,
        weight: f64,
    ) -> AddOutcome {
        let outcome = self.insert(sky, mount, timestamp, weight);
        if outcome != AddOutcome::Rejected {
            self.refit();
        }
        outcome
    }

    /// Thin `point` into its sector without refitting.
    pub(crate) fn insert(
        &mut self,
        sky: Vector3<f64>,
        mount: Vector3<f64>,
        timestamp: DateTime<Utc>,
        weight: f64,
    ) -> AddOutcome {
        let (sky_norm, mount_norm) = (sky.norm(), mount.norm());
        let usable = sky_norm.is_finite()
            && mount_norm.is_finite()
            && sky_norm > 0.0
            && mount_norm > 0.0
            && weight.is_finite()
            && weight > 0.0;
        if !usable {
            log::warn!(
                "rejecting unusable alignment observation {sky:?} -> {mount:?} (weight {weight})"
            );
            return AddOutcome::Rejected;
        }

        let sky = sky / sky_norm;
        let mount = mount / mount_norm;
        let sector = SectorKey::of(&sky, self.config.sector_size_deg);
        let mut point = AlignmentPoint {
            sky,
            mount,
            timestamp,
            weight,
            residual_arcsec: 0.0,
            sector,
            sequence: self.next_sequence,
        };
        point.residual_arcsec = residual_arcsec(&self.model, &point);

        let max_per_sector = self.config.max_per_sector;
        let bucket = self.sectors.entry(sector).or_default();
        let outcome = if bucket.len() < max_per_sector {
            bucket.push(point);
            AddOutcome::Added
        } else {
            let worst = bucket
                .iter()
                .position_max_by(|a, b| a.residual_arcsec.total_cmp(&b.residual_arcsec));
            match worst {
                Some(i) if point.residual_arcsec < bucket[i].residual_arcsec => {
                    log::debug!(
                        "sector {:?}: replacing point at {:.1}\" with one at {:.1}\"",
                        sector,
                        bucket[i].residual_arcsec,
                        point.residual_arcsec
                    );
                    bucket[i] = point;
                    AddOutcome::Replaced
                }
                _ => AddOutcome::Rejected,
            }
        };
        if bucket.is_empty() {
            self.sectors.remove(&sector);
        }
        if outcome != AddOutcome::Rejected {
            self.next_sequence += 1;
        }
        outcome
    }

    /// Refit the tier the point count calls for, falling back to simpler
    /// tiers on failure. If nothing can be fitted the previous model stays.
    pub fn refit(&mut self) -> FitStatus {
        let points = self.points();
        let requested = select_tier(points.len());

        let mut candidate = Some(requested);
        let mut fitted = None;
        while let Some(tier) = candidate {
            if tier == ModelTier::Identity && requested != ModelTier::Identity {
                break;
            }
            match fit::fit_model(&points, tier, &self.solver) {
                Ok(model) => {
                    fitted = Some(model);
                    break;
                }
                Err(e) => {
                    log::warn!("{} fit over {} points failed: {}", tier, points.len(), e);
                    candidate = tier.fallback();
                }
            }
        }

        match fitted {
            Some(model) => {
                let achieved = model.tier();
                self.model = model;
                self.status = if achieved == requested {
                    FitStatus::Fitted
                } else {
                    FitStatus::Degraded { requested, achieved }
                };
            }
            None => {
                log::warn!("keeping previous {} model", self.model.tier());
                self.status = FitStatus::Degraded {
                    requested,
                    achieved: self.model.tier(),
                };
            }
        }

        self.update_residuals();
        log::debug!(
            "alignment refit: {} points, {} model, rms {:.2}\"",
            points.len(),
            self.model.tier(),
            self.rms_arcsec
        );
        self.status
    }

    fn update_residuals(&mut self) {
        let model = &self.model;
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        for point in self.sectors.values_mut().flatten() {
            point.residual_arcsec = residual_arcsec(model, point);
            sum_sq += point.residual_arcsec.powi(2);
            count += 1;
        }
        self.rms_arcsec = if count == 0 { 0.0 } else { (sum_sq / count as f64).sqrt() };
    }

    /// Sky direction to mount direction under the global model.
    pub fn apply(&self, sky: &Vector3<f64>) -> Vector3<f64> {
        self.model.apply(sky)
    }

    /// Mount direction to sky direction under the global model.
    pub fn inverse(&self, mount: &Vector3<f64>) -> Vector3<f64> {
        self.model.inverse(mount)
    }

    /// Like [`apply`](Self::apply), but with the rotation refitted with
    /// extra weight on points close to `target`.
    ///
    /// Only the rotation tier is re-weighted; richer tiers model the
    /// mechanics globally and are used as fitted.
    pub fn apply_weighted(
        &self,
        sky: &Vector3<f64>,
        target: &Vector3<f64>,
        bias: f64,
    ) -> Vector3<f64> {
        if bias <= 0.0 || self.tier() != ModelTier::Rotation {
            return self.apply(sky);
        }
        match fit::local_rotation(&self.points(), target, bias) {
            Ok(rotation) => rotation * sky,
            Err(e) => {
                log::warn!("local rotation failed, using global model: {e}");
                self.apply(sky)
            }
        }
    }

    pub fn apply_horizontal(&self, sky: &Horizontal) -> Horizontal {
        let v = horizontal_to_vector(sky);
        vector_to_horizontal(&self.apply_weighted(&v, &v, self.config.local_bias))
    }

    pub fn inverse_horizontal(&self, mount: &Horizontal) -> Horizontal {
        vector_to_horizontal(&self.inverse(&horizontal_to_vector(mount)))
    }

    /// Remove the most recently added point and refit.
    pub fn clear_last(&mut self) -> Option<AlignmentPoint> {
        let key = self
            .sectors
            .iter()
            .flat_map(|(key, bucket)| bucket.iter().map(move |p| (*key, p.sequence)))
            .max_by_key(|(_, sequence)| *sequence)
            .map(|(key, _)| key)?;

        let bucket = self.sectors.get_mut(&key)?;
        let index = bucket.iter().position_max_by_key(|p| p.sequence)?;
        let removed = bucket.remove(index);
        if bucket.is_empty() {
            self.sectors.remove(&key);
        }
        self.refit();
        Some(removed)
    }

    /// Drop every point and return to the identity model.
    pub fn clear_all(&mut self) {
        self.sectors.clear();
        self.model = AlignmentModel::Identity;
        self.status = FitStatus::Fitted;
        self.rms_arcsec = 0.0;
    }

    pub fn diagnostics(&self) -> AlignmentDiagnostics {
        let g = self.model.geometry();
        AlignmentDiagnostics {
            point_count: self.len(),
            tier: self.tier(),
            status: self.status,
            rms_arcsec: self.rms_arcsec,
            roll_arcmin: g.roll * ARCMIN_PER_RADIAN,
            pitch_arcmin: g.pitch * ARCMIN_PER_RADIAN,
            azimuth_zero_deg: g.yaw.to_degrees(),
            altitude_index_arcmin: g.altitude_index * ARCMIN_PER_RADIAN,
            cone_arcmin: g.cone * ARCMIN_PER_RADIAN,
            non_perpendicularity_arcmin: g.non_perpendicularity * ARCMIN_PER_RADIAN,
        }
    }

    /// Fit `tier` to the current points without installing it.
    pub fn trial_fit(&self, tier: ModelTier) -> Result<AlignmentModel, FitError> {
        fit::fit_model(&self.points(), tier, &self.solver)
    }
}
