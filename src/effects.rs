//! # Entity-effect model
//!
//! `logit P(strike) = α + β·fitted_probability + u_catcher + u_umpire + u_pitcher`
//!
//! with independent crossed random intercepts `u_g ~ N(0, σ²_g)`. Each group's
//! intercepts are coefficients with an identity penalty weighted by
//! `λ_g = 1/σ²_g`, so the penalized fit is the joint conditional mode and the
//! LAML over `log λ_g` is the Laplace approximate marginal likelihood of the
//! variance components.

use crate::error::{Error, InputError, Stage};
use crate::gam::construction::{ModelLayout, PenalizedBlock};
use crate::gam::estimate::{
    EstimationConfig, FitError, coefficient_standard_errors, fit_penalized_logit,
};
use crate::gam::matrix::{DesignMatrix, GroupedDesign};
use crate::records::{EntityKind, PredictionRow};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffectsConfig {
    pub estimation: EstimationConfig,
}

/// One entity's random intercept on the log-odds scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEffect {
    pub kind: EntityKind,
    pub entity_id: String,
    /// Conditional mode of the intercept.
    pub effect: f64,
    /// Conditional standard deviation from the inverse penalized Hessian.
    pub conditional_sd: f64,
    pub num_pitches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedEffects {
    pub intercept: f64,
    pub fitted_probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupVariance {
    pub kind: EntityKind,
    pub variance: f64,
    pub num_entities: usize,
}

/// Output of one effect-model fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectTable {
    /// Grouped by kind (catcher, umpire, pitcher), ids ascending within a kind.
    pub effects: Vec<EntityEffect>,
    pub fixed: FixedEffects,
    pub variances: Vec<GroupVariance>,
    pub num_rows: usize,
    pub laml: f64,
}

impl EffectTable {
    pub fn effects_of(&self, kind: EntityKind) -> impl Iterator<Item = &EntityEffect> + '_ {
        self.effects.iter().filter(move |e| e.kind == kind)
    }

    pub fn variance_of(&self, kind: EntityKind) -> Option<f64> {
        self.variances
            .iter()
            .find(|v| v.kind == kind)
            .map(|v| v.variance)
    }
}

/// Distinct ids of one grouping in ascending order and each row's level index.
struct GroupLevels {
    kind: EntityKind,
    ids: Vec<String>,
    level_index: Vec<usize>,
    counts: Vec<usize>,
}

impl GroupLevels {
    fn index(rows: &[PredictionRow], kind: EntityKind) -> Self {
        let mut levels: BTreeMap<&str, usize> = BTreeMap::new();
        for row in rows {
            levels.insert(row.record.entity_id(kind), 0);
        }
        for (position, value) in levels.values_mut().enumerate() {
            *value = position;
        }
        let mut counts = vec![0; levels.len()];
        let level_index: Vec<usize> = rows
            .iter()
            .map(|row| {
                let level = levels[row.record.entity_id(kind)];
                counts[level] += 1;
                level
            })
            .collect();
        Self {
            kind,
            ids: levels.keys().map(|id| id.to_string()).collect(),
            level_index,
            counts,
        }
    }
}

/// Fits the entity-effect model to annotated rows.
///
/// Group variances maximize the Laplace marginal likelihood with the intercept and
/// fitted-probability slope integrated out as well, a REML-type criterion.
pub fn fit_entity_effects(rows: &[PredictionRow], config: &EffectsConfig) -> Result<EffectTable, Error> {
    let stage = Stage::Effects;
    if rows.is_empty() {
        return Err(stage.fit_error(FitError::EmptyInput));
    }
    validate_rows(rows).map_err(|e| stage.input_error(e))?;
    fit_validated(rows, config).map_err(|e| stage.fit_error(e))
}

fn validate_rows(rows: &[PredictionRow]) -> Result<(), InputError> {
    for (row, prediction) in rows.iter().enumerate() {
        let value = prediction.fitted_probability;
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(InputError::ProbabilityOutOfRange { row, value });
        }
        for kind in EntityKind::ALL {
            if prediction.record.entity_id(kind).trim().is_empty() {
                return Err(InputError::MissingEntityId { row, kind });
            }
        }
    }
    Ok(())
}

fn fit_validated(rows: &[PredictionRow], config: &EffectsConfig) -> Result<EffectTable, FitError> {
    let n = rows.len();
    let y: Array1<f64> = rows.iter().map(|r| r.record.outcome.as_response()).collect();
    let strikes = y.sum();
    if strikes == 0.0 || strikes == n as f64 {
        return Err(FitError::SingleOutcomeClass { n });
    }

    let groups: Vec<GroupLevels> = EntityKind::ALL
        .iter()
        .map(|&kind| GroupLevels::index(rows, kind))
        .collect();
    for group in &groups {
        if group.ids.len() < 2 {
            return Err(FitError::TooFewEntities {
                kind: group.kind.name().to_string(),
                found: group.ids.len(),
            });
        }
    }

    let mut fixed = Array2::<f64>::zeros((n, 2));
    for (i, row) in rows.iter().enumerate() {
        fixed[[i, 0]] = 1.0;
        fixed[[i, 1]] = row.fitted_probability;
    }
    let num_fixed = fixed.ncols();
    let design = GroupedDesign::new(
        fixed,
        groups
            .iter()
            .map(|g| (g.level_index.clone(), g.ids.len()))
            .collect(),
    );

    let mut penalty_map = Vec::with_capacity(groups.len());
    let mut s_list = Vec::with_capacity(groups.len());
    for (idx, (group, factor)) in groups.iter().zip(design.factors()).enumerate() {
        penalty_map.push(PenalizedBlock {
            term_name: format!("u({})", group.kind),
            col_range: factor.offset..factor.offset + factor.num_levels,
            penalty_idx: idx,
        });
        s_list.push(Array2::eye(factor.num_levels));
    }
    let x = DesignMatrix::Grouped(design);
    let layout = ModelLayout::new(x.ncols(), penalty_map)?;

    log::info!(
        "Fitting entity effects on {} rows: {} catchers, {} umpires, {} pitchers.",
        n,
        groups[0].ids.len(),
        groups[1].ids.len(),
        groups[2].ids.len()
    );

    let fit = fit_penalized_logit(&x, y.view(), &layout, s_list, &config.estimation)?;
    let sds = coefficient_standard_errors(&fit.covariance);

    let mut effects = Vec::with_capacity(x.ncols() - num_fixed);
    let mut variances = Vec::with_capacity(groups.len());
    for (group, block) in groups.iter().zip(&layout.penalty_map) {
        for (level, id) in group.ids.iter().enumerate() {
            let col = block.col_range.start + level;
            effects.push(EntityEffect {
                kind: group.kind,
                entity_id: id.clone(),
                effect: fit.beta[col],
                conditional_sd: sds[col],
                num_pitches: group.counts[level],
            });
        }
        let variance = 1.0 / fit.lambdas[block.penalty_idx];
        log::info!(
            "  {} intercept SD {:.4} ({} entities)",
            group.kind,
            variance.sqrt(),
            group.ids.len()
        );
        variances.push(GroupVariance {
            kind: group.kind,
            variance,
            num_entities: group.ids.len(),
        });
    }

    Ok(EffectTable {
        effects,
        fixed: FixedEffects {
            intercept: fit.beta[0],
            fitted_probability: fit.beta[1],
        },
        variances,
        num_rows: n,
        laml: fit.laml,
    })
}
