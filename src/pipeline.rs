//! End-to-end driver: surface fit, annotation, effect fit, rankings.

use crate::effects::{EffectTable, EffectsConfig, fit_entity_effects};
use crate::error::Error;
use crate::rank::{DEFAULT_RANK_SIZE, Direction, RankedEntity, rank};
use crate::records::{EntityKind, PitchRecord, PredictionRow};
use crate::surface::{FittedSurface, SurfaceConfig, fit_surface};

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Rows the surface is fitted on when no sample size is given.
pub const DEFAULT_SAMPLE_SIZE: usize = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rows drawn for the surface fit. `None` uses `DEFAULT_SAMPLE_SIZE`, or
    /// every record when there are fewer.
    pub sample_size: Option<usize>,
    pub seed: u64,
    pub top_n: usize,
    pub surface: SurfaceConfig,
    pub effects: EffectsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_size: None,
            seed: 42,
            top_n: DEFAULT_RANK_SIZE,
            surface: SurfaceConfig::default(),
            effects: EffectsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn resolved_sample_size(&self, available: usize) -> usize {
        self.sample_size
            .unwrap_or_else(|| DEFAULT_SAMPLE_SIZE.min(available))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingTable {
    pub kind: EntityKind,
    pub direction: Direction,
    pub entries: Vec<RankedEntity>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub surface: FittedSurface,
    /// Every input record with its fitted strike probability.
    pub annotated: Vec<PredictionRow>,
    pub effects: EffectTable,
    /// Highest and lowest for each of catcher, umpire and pitcher.
    pub rankings: Vec<RankingTable>,
}

impl PipelineOutput {
    pub fn ranking(&self, kind: EntityKind, direction: Direction) -> Option<&RankingTable> {
        self.rankings
            .iter()
            .find(|t| t.kind == kind && t.direction == direction)
    }
}

/// Runs both model stages over `records`.
///
/// The surface is fitted on a seeded subsample but annotates every record, so
/// the effect model always sees the full table.
pub fn run(records: &[PitchRecord], config: &PipelineConfig) -> Result<PipelineOutput, Error> {
    let start = Instant::now();
    let sample_size = config.resolved_sample_size(records.len());

    let surface = fit_surface(records, sample_size, config.seed, &config.surface)?;
    log::info!(
        "Strike surface fitted in {:.2?} (EDF {:.2}).",
        start.elapsed(),
        surface.edf
    );

    let annotated = surface.annotate(records)?;
    let effects = fit_entity_effects(&annotated, &config.effects)?;
    log::info!("Entity effects fitted in {:.2?} total.", start.elapsed());

    let mut rankings = Vec::with_capacity(EntityKind::ALL.len() * Direction::BOTH.len());
    for kind in EntityKind::ALL {
        for direction in Direction::BOTH {
            rankings.push(RankingTable {
                kind,
                direction,
                entries: rank(&effects, kind, direction, config.top_n),
            });
        }
    }

    Ok(PipelineOutput {
        surface,
        annotated,
        effects,
        rankings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_defaults_to_cap_or_table_length() {
        let config = PipelineConfig::default();
        assert_eq!(config.resolved_sample_size(1_000), 1_000);
        assert_eq!(config.resolved_sample_size(200_000), DEFAULT_SAMPLE_SIZE);
        let explicit = PipelineConfig {
            sample_size: Some(123),
            ..PipelineConfig::default()
        };
        assert_eq!(explicit.resolved_sample_size(1_000), 123);
    }
}
