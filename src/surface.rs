//! # Spatial strike-probability surface
//!
//! Fits
//!
//! `logit P(strike) = α + β·[throws = R] + γ·[stands = R] + f(horizontal, vertical)`
//!
//! where `f` is a tensor product of two cubic P-spline bases with quantile knots,
//! centred against the intercept by a sum-to-zero constraint and penalized by one
//! second-difference penalty per direction. Both smoothing parameters are chosen
//! by LAML in `gam::estimate`.
//!
//! The fitted surface keeps everything needed to rebuild the design for new
//! points (knots, constraint, ranges, seen levels) and the coefficient
//! covariance, and round-trips through TOML.

use crate::error::{Error, InputError, PredictionError, Stage};
use crate::gam::basis::{
    BasisError, KnotStrategy, apply_sum_to_zero_constraint, create_bspline_basis,
    create_bspline_basis_with_knots, create_difference_penalty_matrix, kronecker,
    tensor_product_rows,
};
use crate::gam::construction::{ModelLayout, PenalizedBlock};
use crate::gam::estimate::{
    EstimationConfig, FitError, fit_penalized_logit, linear_predictor_variance,
};
use crate::gam::matrix::DesignMatrix;
use crate::records::{EntityKind, Handedness, PitchRecord, PredictionRow, SurfacePoint};

use ndarray::{Array1, Array2, ArrayView2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Rows evaluated per block during prediction.
const PREDICTION_CHUNK_ROWS: usize = 10_000;

/// Configuration for one marginal basis of the surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasisConfig {
    pub num_knots: usize,
    pub degree: usize,
    pub penalty_order: usize,
    pub knot_strategy: KnotStrategy,
}

impl Default for BasisConfig {
    fn default() -> Self {
        Self {
            num_knots: 8,
            degree: 3,
            penalty_order: 2,
            knot_strategy: KnotStrategy::Quantile,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceConfig {
    pub horizontal_basis: BasisConfig,
    pub vertical_basis: BasisConfig,
    pub estimation: EstimationConfig,
}

/// Fitted coefficients in a readable layout.
///
/// Handedness coefficients are `None` when only one level was seen during fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceCoefficients {
    pub intercept: f64,
    pub pitcher_throws_right: Option<f64>,
    pub batter_stands_right: Option<f64>,
    /// Coefficients of the constrained tensor-product basis.
    pub smooth: Vec<f64>,
}

impl SurfaceCoefficients {
    fn from_flat(beta: &Array1<f64>, throws_column: bool, stands_column: bool) -> Self {
        let mut col = 1;
        let mut take_optional = |present: bool| {
            present.then(|| {
                let value = beta[col];
                col += 1;
                value
            })
        };
        let pitcher_throws_right = take_optional(throws_column);
        let batter_stands_right = take_optional(stands_column);
        Self {
            intercept: beta[0],
            pitcher_throws_right,
            batter_stands_right,
            smooth: beta.slice(s![col..]).to_vec(),
        }
    }

    /// Coefficients in design-column order: intercept, indicators, smooth.
    fn flatten(&self) -> Array1<f64> {
        let mut flat = vec![self.intercept];
        flat.extend(self.pitcher_throws_right);
        flat.extend(self.batter_stands_right);
        flat.extend_from_slice(&self.smooth);
        Array1::from_vec(flat)
    }
}

/// The fitted spatial strike-probability model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedSurface {
    pub config: SurfaceConfig,
    pub horizontal_range: (f64, f64),
    pub vertical_range: (f64, f64),
    pub horizontal_knots: Array1<f64>,
    pub vertical_knots: Array1<f64>,
    /// Sum-to-zero transform `Z` applied to the tensor-product basis.
    pub constraint: Array2<f64>,
    pub pitcher_throws_levels: Vec<Handedness>,
    pub batter_stands_levels: Vec<Handedness>,
    pub coefficients: SurfaceCoefficients,
    /// Posterior covariance of the flattened coefficients.
    pub covariance: Array2<f64>,
    pub lambdas: Vec<f64>,
    pub edf: f64,
    pub num_rows: usize,
}

/// Probability of a called strike at one point, with its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrikePrediction {
    pub probability: f64,
    pub standard_error: f64,
}

/// Custom error type for surface loading and saving.
#[derive(Error, Debug)]
pub enum SurfaceFileError {
    #[error("Failed to read or write surface file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML surface file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize surface to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Fits the strike surface on `sample_size` records drawn without replacement.
///
/// Equal `seed`, `sample_size` and records give an identical surface. Passing
/// `records.len()` fits on every record.
pub fn fit_surface(
    records: &[PitchRecord],
    sample_size: usize,
    seed: u64,
    config: &SurfaceConfig,
) -> Result<FittedSurface, Error> {
    let stage = Stage::Surface;
    if records.is_empty() {
        return Err(stage.fit_error(FitError::EmptyInput));
    }
    validate_records(records).map_err(|e| stage.input_error(e))?;
    if sample_size == 0 {
        return Err(stage.input_error(InputError::ZeroSampleSize {
            available: records.len(),
        }));
    }
    if sample_size > records.len() {
        return Err(stage.input_error(InputError::SampleSizeTooLarge {
            requested: sample_size,
            available: records.len(),
        }));
    }

    let sample = draw_sample(records, sample_size, seed);
    log::info!(
        "Fitting strike surface on {} of {} records (seed {}).",
        sample.len(),
        records.len(),
        seed
    );
    internal::fit_on_sample(&sample, config).map_err(|e| stage.fit_error(e))
}

fn validate_records(records: &[PitchRecord]) -> Result<(), InputError> {
    for (row, record) in records.iter().enumerate() {
        if record.catcher_id.trim().is_empty() {
            return Err(InputError::MissingEntityId {
                row,
                kind: EntityKind::Catcher,
            });
        }
        for (field, value) in [
            ("horizontal", record.horizontal_location),
            ("vertical", record.vertical_location),
        ] {
            if !value.is_finite() {
                return Err(InputError::NonFiniteLocation { row, field, value });
            }
        }
    }
    Ok(())
}

fn draw_sample(records: &[PitchRecord], sample_size: usize, seed: u64) -> Vec<&PitchRecord> {
    if sample_size >= records.len() {
        return records.iter().collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = index::sample(&mut rng, records.len(), sample_size).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| &records[i]).collect()
}

/// Regular grid of `steps × steps` points over the given ranges, horizontal-major.
pub fn evaluation_grid(
    horizontal_range: (f64, f64),
    vertical_range: (f64, f64),
    steps: usize,
    pitcher_throws: Handedness,
    batter_stands: Handedness,
) -> Vec<SurfacePoint> {
    let at = |(lo, hi): (f64, f64), i: usize| {
        if steps <= 1 {
            0.5 * (lo + hi)
        } else {
            lo + (hi - lo) * i as f64 / (steps - 1) as f64
        }
    };
    let mut grid = Vec::with_capacity(steps * steps);
    for i in 0..steps {
        for j in 0..steps {
            grid.push(SurfacePoint {
                horizontal: at(horizontal_range, i),
                vertical: at(vertical_range, j),
                pitcher_throws,
                batter_stands,
            });
        }
    }
    grid
}

impl FittedSurface {
    /// Probability of a called strike and its standard error at each point.
    ///
    /// The standard error is the delta-method transform of the linear predictor's
    /// posterior standard error. Coordinates outside the training range are
    /// evaluated at the nearest edge of the range.
    pub fn predict(&self, points: &[SurfacePoint]) -> Result<Vec<StrikePrediction>, PredictionError> {
        let link = self.config.estimation.link_function;
        Ok(self
            .predict_link(points)?
            .into_iter()
            .map(|(eta, se_eta)| StrikePrediction {
                probability: link.inverse(eta),
                standard_error: link.mu_eta(eta) * se_eta,
            })
            .collect())
    }

    /// Linear predictor and its standard error at each point.
    pub fn predict_link(&self, points: &[SurfacePoint]) -> Result<Vec<(f64, f64)>, PredictionError> {
        self.validate_points(points)?;
        let beta = self.coefficients.flatten();
        let mut out = Vec::with_capacity(points.len());
        for chunk in points.chunks(PREDICTION_CHUNK_ROWS) {
            let x = DesignMatrix::Dense(self.design_for(chunk)?);
            let eta = x.matrix_vector_multiply(&beta);
            let variance = linear_predictor_variance(&x, &self.covariance);
            out.extend(eta.iter().zip(variance.iter()).map(|(&e, &v)| (e, v.sqrt())));
        }
        Ok(out)
    }

    /// Attaches the surface's probability and standard error to every record.
    pub fn annotate(&self, records: &[PitchRecord]) -> Result<Vec<PredictionRow>, PredictionError> {
        let points: Vec<SurfacePoint> = records.iter().map(PitchRecord::location).collect();
        let predictions = self.predict(&points)?;
        Ok(records
            .iter()
            .zip(predictions)
            .map(|(record, prediction)| PredictionRow {
                record: record.clone(),
                fitted_probability: prediction.probability,
                fitted_se: prediction.standard_error,
            })
            .collect())
    }

    fn validate_points(&self, points: &[SurfacePoint]) -> Result<(), PredictionError> {
        for (index, point) in points.iter().enumerate() {
            if !point.horizontal.is_finite() || !point.vertical.is_finite() {
                return Err(PredictionError::NonFiniteLocation {
                    index,
                    horizontal: point.horizontal,
                    vertical: point.vertical,
                });
            }
            if !self.pitcher_throws_levels.contains(&point.pitcher_throws) {
                return Err(PredictionError::UnseenLevel {
                    index,
                    field: "pitcher_throws",
                    level: point.pitcher_throws,
                });
            }
            if !self.batter_stands_levels.contains(&point.batter_stands) {
                return Err(PredictionError::UnseenLevel {
                    index,
                    field: "batter_stands",
                    level: point.batter_stands,
                });
            }
        }
        Ok(())
    }

    fn design_for(&self, points: &[SurfacePoint]) -> Result<Array2<f64>, BasisError> {
        let horizontal: Array1<f64> = points
            .iter()
            .map(|p| p.horizontal.clamp(self.horizontal_range.0, self.horizontal_range.1))
            .collect();
        let vertical: Array1<f64> = points
            .iter()
            .map(|p| p.vertical.clamp(self.vertical_range.0, self.vertical_range.1))
            .collect();
        let bx = create_bspline_basis_with_knots(
            horizontal.view(),
            self.horizontal_knots.view(),
            self.config.horizontal_basis.degree,
        )?;
        let bz = create_bspline_basis_with_knots(
            vertical.view(),
            self.vertical_knots.view(),
            self.config.vertical_basis.degree,
        )?;
        let smooth = tensor_product_rows(bx.view(), bz.view())?.dot(&self.constraint);
        Ok(internal::assemble_design(
            points,
            self.coefficients.pitcher_throws_right.is_some(),
            self.coefficients.batter_stands_right.is_some(),
            smooth.view(),
        ))
    }

    /// Saves the surface to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), SurfaceFileError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a surface from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SurfaceFileError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

mod internal {
    use super::*;

    /// Intercept, present handedness indicators, then the smooth columns.
    pub(super) fn assemble_design(
        points: &[SurfacePoint],
        throws_column: bool,
        stands_column: bool,
        smooth: ArrayView2<f64>,
    ) -> Array2<f64> {
        let num_fixed = 1 + usize::from(throws_column) + usize::from(stands_column);
        let mut x = Array2::zeros((points.len(), num_fixed + smooth.ncols()));
        for (i, point) in points.iter().enumerate() {
            x[[i, 0]] = 1.0;
            let mut col = 1;
            if throws_column {
                x[[i, col]] = indicator(point.pitcher_throws == Handedness::Right);
                col += 1;
            }
            if stands_column {
                x[[i, col]] = indicator(point.batter_stands == Handedness::Right);
            }
        }
        x.slice_mut(s![.., num_fixed..]).assign(&smooth);
        x
    }

    fn indicator(flag: bool) -> f64 {
        if flag { 1.0 } else { 0.0 }
    }

    fn range_of(values: &Array1<f64>) -> (f64, f64) {
        values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }

    pub(super) fn fit_on_sample(
        sample: &[&PitchRecord],
        config: &SurfaceConfig,
    ) -> Result<FittedSurface, FitError> {
        let n = sample.len();
        let y: Array1<f64> = sample.iter().map(|r| r.outcome.as_response()).collect();
        let strikes = y.sum();
        if strikes == 0.0 || strikes == n as f64 {
            return Err(FitError::SingleOutcomeClass { n });
        }

        let points: Vec<SurfacePoint> = sample.iter().map(|r| r.location()).collect();
        let horizontal: Array1<f64> = points.iter().map(|p| p.horizontal).collect();
        let vertical: Array1<f64> = points.iter().map(|p| p.vertical).collect();
        let horizontal_range = range_of(&horizontal);
        let vertical_range = range_of(&vertical);

        let hb = &config.horizontal_basis;
        let vb = &config.vertical_basis;
        let (bx, horizontal_knots) = create_bspline_basis(
            horizontal.view(),
            (hb.knot_strategy == KnotStrategy::Quantile).then(|| horizontal.view()),
            horizontal_range,
            hb.num_knots,
            hb.degree,
        )?;
        let (bz, vertical_knots) = create_bspline_basis(
            vertical.view(),
            (vb.knot_strategy == KnotStrategy::Quantile).then(|| vertical.view()),
            vertical_range,
            vb.num_knots,
            vb.degree,
        )?;
        let (kx, kz) = (bx.ncols(), bz.ncols());

        let tensor = tensor_product_rows(bx.view(), bz.view())?;
        let (smooth, constraint) = apply_sum_to_zero_constraint(tensor.view())?;

        let dx = create_difference_penalty_matrix(kx, hb.penalty_order)?;
        let dz = create_difference_penalty_matrix(kz, vb.penalty_order)?;
        let s_horizontal = kronecker(dx.view(), Array2::<f64>::eye(kz).view());
        let s_vertical = kronecker(Array2::<f64>::eye(kx).view(), dz.view());
        let s_list = vec![
            constraint.t().dot(&s_horizontal).dot(&constraint),
            constraint.t().dot(&s_vertical).dot(&constraint),
        ];

        let throws_seen: BTreeSet<Handedness> = points.iter().map(|p| p.pitcher_throws).collect();
        let stands_seen: BTreeSet<Handedness> = points.iter().map(|p| p.batter_stands).collect();
        let throws_column = throws_seen.len() == 2;
        let stands_column = stands_seen.len() == 2;
        if !throws_column || !stands_column {
            log::warn!(
                "Only one handedness level present (throws {:?}, stands {:?}); its indicator is dropped.",
                throws_seen,
                stands_seen
            );
        }

        let x = assemble_design(&points, throws_column, stands_column, smooth.view());
        let num_fixed = x.ncols() - smooth.ncols();
        let surface_cols = num_fixed..x.ncols();
        let layout = ModelLayout::new(
            x.ncols(),
            vec![
                PenalizedBlock {
                    term_name: "te(horizontal, vertical) horizontal roughness".to_string(),
                    col_range: surface_cols.clone(),
                    penalty_idx: 0,
                },
                PenalizedBlock {
                    term_name: "te(horizontal, vertical) vertical roughness".to_string(),
                    col_range: surface_cols,
                    penalty_idx: 1,
                },
            ],
        )?;
        log::info!(
            "Surface basis: {} x {} marginal functions, {} constrained tensor columns, {} fixed columns.",
            kx,
            kz,
            smooth.ncols(),
            num_fixed
        );

        let fit = fit_penalized_logit(
            &DesignMatrix::Dense(x),
            y.view(),
            &layout,
            s_list,
            &config.estimation,
        )?;

        Ok(FittedSurface {
            config: config.clone(),
            horizontal_range,
            vertical_range,
            horizontal_knots,
            vertical_knots,
            constraint,
            pitcher_throws_levels: throws_seen.into_iter().collect(),
            batter_stands_levels: stands_seen.into_iter().collect(),
            coefficients: SurfaceCoefficients::from_flat(&fit.beta, throws_column, stands_column),
            covariance: fit.covariance,
            lambdas: fit.lambdas.to_vec(),
            edf: fit.edf,
            num_rows: n,
        })
    }
}
