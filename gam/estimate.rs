//! # Smoothing-parameter estimation by Laplace approximate marginal likelihood
//!
//! Both models in this crate are penalized logistic regressions: a coefficient
//! vector `β`, a design `X`, and penalties `S_k` weighted by `λ_k = exp(ρ_k)`.
//! For the strike surface the penalties are spline roughness penalties; for the
//! entity model they are identity (ridge) penalties on the random intercepts, and
//! `λ_g` is the inverse random-intercept variance.
//!
//! Estimation is nested:
//!
//! 1.  **Outer loop (BFGS):** minimizes the negative LAML over `ρ`,
//!
//!     `V(ρ) = ½D(β̂) + ½β̂'S_λβ̂ - ½log|S_λ|₊ + ½log|H|`, with `H = X'WX + S_λ`,
//!
//!     using its analytic gradient. BFGS runs on `z`, with `ρ = B·tanh(z/B)`, so
//!     the smoothing parameters stay within `±B` without a constrained optimizer.
//! 2.  **Inner loop (P-IRLS):** for each trial `ρ`, finds `β̂` by penalized IRLS.
//!     Results are cached by the bit pattern of `ρ`, and each new solve starts from
//!     the last converged `β̂`.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::gam::basis::BasisError;
use crate::gam::construction::{ModelLayout, PenaltyStructure};
use crate::gam::matrix::DesignMatrix;
use crate::gam::pirls::{self, PirlsConfig, PirlsResult};
use crate::gam::seeding::{SeedConfig, generate_rho_candidates};
use crate::gam::types::{Coefficients, LinkFunction, LogSmoothingParamsView};

use ndarray::{Array1, Array2, ArrayView1, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use thiserror::Error;

/// Bound on `|ρ|`; `λ` ranges over `[e⁻¹², e¹²]`.
pub const RHO_BOUND: f64 = 12.0;

/// Cost handed to BFGS where the LAML cannot be evaluated.
const INFEASIBLE_COST: f64 = 1e10;

/// Largest projected gradient norm at which the best point seen is accepted
/// after BFGS itself reports failure.
const FALLBACK_GRADIENT_TOLERANCE: f64 = 1e-1;

const MAX_CACHED_FITS: usize = 32;

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("No records were supplied for fitting.")]
    EmptyInput,

    #[error(
        "All {n} outcomes in the fitting sample are the same class; both called strikes and called balls are required."
    )]
    SingleOutcomeClass { n: usize },

    #[error("The {kind} grouping has {found} distinct entities; at least 2 are required.")]
    TooFewEntities { kind: String, found: usize },

    #[error("Underlying basis function generation failed: {0}")]
    Basis(#[from] BasisError),

    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(LinalgError),

    #[error(
        "The P-IRLS inner loop did not converge within {max_iterations} iterations. Last penalized deviance change was {last_change:.6e}."
    )]
    PirlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error(
        "The linear predictor reached |eta| = {max_abs_eta:.1}; the outcomes are perfectly or quasi-perfectly separated."
    )]
    PerfectSeparation { max_abs_eta: f64 },

    #[error("REML/BFGS optimization failed to converge: {0}")]
    RemlOptimizationFailed(String),

    #[error("An internal error occurred during model layout: {0}")]
    LayoutError(String),
}

/// Settings shared by every penalized fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimationConfig {
    pub link_function: LinkFunction,
    pub reml_convergence_tolerance: f64,
    pub reml_max_iterations: usize,
    pub pirls: PirlsConfig,
    pub seeds: SeedConfig,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            link_function: LinkFunction::Logit,
            reml_convergence_tolerance: 1e-4,
            reml_max_iterations: 150,
            pirls: PirlsConfig::default(),
            seeds: SeedConfig::default(),
        }
    }
}

/// Result of a penalized fit at the LAML-optimal smoothing parameters.
#[derive(Clone, Debug)]
pub struct PenalizedFit {
    pub beta: Coefficients,
    /// `H⁻¹`, the Bayesian posterior covariance of the coefficients.
    pub covariance: Array2<f64>,
    pub lambdas: Array1<f64>,
    /// Effective degrees of freedom, `p - tr(H⁻¹ S_λ)`.
    pub edf: f64,
    pub deviance: f64,
    /// Laplace approximate log marginal likelihood, up to an additive constant.
    pub laml: f64,
    pub outer_iterations: usize,
}

/// Maps the unconstrained BFGS variable to bounded log smoothing parameters.
pub fn to_rho_from_z(z: &Array1<f64>) -> Array1<f64> {
    z.mapv(|v| RHO_BOUND * (v / RHO_BOUND).tanh())
}

/// Inverse of `to_rho_from_z`; `ρ` at the bound maps to a large finite `z`.
pub fn to_z_from_rho(rho: &Array1<f64>) -> Array1<f64> {
    rho.mapv(|r| {
        let ratio = (r / RHO_BOUND).clamp(-1.0 + 1e-12, 1.0 - 1e-12);
        RHO_BOUND * ratio.atanh()
    })
}

/// `dρ/dz` expressed through `ρ`: `1 - (ρ/B)²`.
pub fn jacobian_drho_dz_from_rho(rho: &Array1<f64>) -> Array1<f64> {
    rho.mapv(|r| 1.0 - (r / RHO_BOUND).powi(2))
}

/// Chain rule from a gradient in `ρ` to a gradient in `z`.
pub fn project_rho_gradient(grad_rho: &Array1<f64>, rho: &Array1<f64>) -> Array1<f64> {
    grad_rho * &jacobian_drho_dz_from_rho(rho)
}

/// Selects smoothing parameters by LAML and returns the final penalized fit.
///
/// `s_list[k]` is the penalty for `layout.penalty_map[k]`, sized to its block.
pub fn fit_penalized_logit<'a>(
    x: &'a DesignMatrix,
    y: ArrayView1<'a, f64>,
    layout: &'a ModelLayout,
    s_list: Vec<Array2<f64>>,
    config: &'a EstimationConfig,
) -> Result<PenalizedFit, FitError> {
    if x.nrows() != y.len() {
        return Err(FitError::LayoutError(format!(
            "design has {} rows but there are {} outcomes",
            x.nrows(),
            y.len()
        )));
    }
    if x.ncols() != layout.total_coeffs {
        return Err(FitError::LayoutError(format!(
            "design has {} columns but the layout expects {}",
            x.ncols(),
            layout.total_coeffs
        )));
    }
    log_layout_info(layout);

    let penalties = PenaltyStructure::new(layout, s_list)?;
    let reml_state = RemlState::new(y, x, penalties, layout, config);

    let (final_rho, outer_iterations) = if layout.num_penalties == 0 {
        (Array1::zeros(0), 0)
    } else {
        optimize_rho(&reml_state, layout.num_penalties, config)?
    };

    let final_fit = reml_state.execute_pirls_if_needed(&final_rho)?;
    let final_cost = reml_state.compute_cost(&final_rho)?;
    let lambdas = final_rho.mapv(f64::exp);
    let covariance = final_fit
        .penalized_hessian
        .inv()
        .map_err(FitError::LinearSystemSolveFailed)?;
    let s_lambda = reml_state
        .penalties
        .construct_s_lambda(lambdas.view(), layout);
    let edf = layout.total_coeffs as f64 - (&covariance * &s_lambda).sum();

    log::info!(
        "Penalized fit complete: lambdas {:?}, EDF {:.2}, deviance {:.3}",
        lambdas.to_vec(),
        edf,
        final_fit.deviance
    );

    Ok(PenalizedFit {
        beta: final_fit.beta,
        covariance,
        lambdas,
        edf,
        deviance: final_fit.deviance,
        laml: -final_cost,
        outer_iterations,
    })
}

/// Screens seed points, then runs BFGS from the best one.
fn optimize_rho(
    reml_state: &RemlState<'_>,
    num_penalties: usize,
    config: &EstimationConfig,
) -> Result<(Array1<f64>, usize), FitError> {
    let bounded_seeds = SeedConfig {
        bounds: (
            config.seeds.bounds.0.max(-RHO_BOUND + 1.0),
            config.seeds.bounds.1.min(RHO_BOUND - 1.0),
        ),
        ..config.seeds
    };
    let heuristic = heuristic_lambdas(
        reml_state.x,
        reml_state.layout,
        &reml_state.penalties.s_list,
    );
    log::debug!("Heuristic lambdas: {:?}", heuristic);
    let candidates = generate_rho_candidates(num_penalties, Some(&heuristic), &bounded_seeds);

    let mut best_seed: Option<(f64, Array1<f64>)> = None;
    let separation_seen = Cell::new(false);
    for rho in candidates {
        match reml_state.compute_cost(&rho) {
            Ok(cost) if cost.is_finite() => {
                log::debug!("Seed {:?}: cost {:.6}", rho.to_vec(), cost);
                if best_seed.as_ref().is_none_or(|(best, _)| cost < *best) {
                    best_seed = Some((cost, rho));
                }
            }
            Ok(cost) => log::debug!("Seed {:?}: non-finite cost {}", rho.to_vec(), cost),
            Err(e) => {
                if matches!(e, FitError::PerfectSeparation { .. }) {
                    separation_seen.set(true);
                }
                log::debug!("Seed {:?}: {}", rho.to_vec(), e);
            }
        }
    }
    let Some((initial_cost, initial_rho)) = best_seed else {
        return Err(FitError::RemlOptimizationFailed(
            "no starting point produced a finite LAML".to_string(),
        ));
    };
    log::info!(
        "Starting BFGS from rho = {:?} (cost {:.6})",
        initial_rho.to_vec(),
        initial_cost
    );

    let best_seen: RefCell<(f64, Array1<f64>)> = RefCell::new((initial_cost, initial_rho.clone()));
    let cost_and_grad = |z: &Array1<f64>| -> (f64, Array1<f64>) {
        let rho = to_rho_from_z(z);
        let evaluated = reml_state
            .compute_cost(&rho)
            .and_then(|cost| Ok((cost, reml_state.compute_gradient(&rho)?)));
        match evaluated {
            Ok((cost, grad)) if cost.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                let mut best = best_seen.borrow_mut();
                if cost < best.0 {
                    *best = (cost, rho.clone());
                }
                (cost, project_rho_gradient(&grad, &rho))
            }
            Ok((cost, _)) => {
                log::warn!("Non-finite LAML at rho = {:?}: {}", rho.to_vec(), cost);
                (INFEASIBLE_COST, Array1::zeros(z.len()))
            }
            Err(FitError::PerfectSeparation { max_abs_eta }) => {
                // Separation only appears as λ shrinks, so retreat toward larger ρ.
                log::debug!(
                    "Separated fit at rho = {:?} (|eta| = {:.1}); retreating",
                    rho.to_vec(),
                    max_abs_eta
                );
                separation_seen.set(true);
                (INFEASIBLE_COST, -jacobian_drho_dz_from_rho(&rho))
            }
            Err(e) => {
                log::warn!("LAML evaluation failed at rho = {:?}: {}", rho.to_vec(), e);
                (INFEASIBLE_COST, Array1::zeros(z.len()))
            }
        }
    };

    let outcome = Bfgs::new(to_z_from_rho(&initial_rho), cost_and_grad)
        .with_tolerance(config.reml_convergence_tolerance)
        .with_max_iterations(config.reml_max_iterations)
        .run();

    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::info!(
                "BFGS converged in {} iterations with LAML cost {:.6}",
                iterations,
                final_value
            );
            Ok((to_rho_from_z(&final_point), iterations))
        }
        Err(e) => {
            let (best_cost, best_rho) = best_seen.into_inner();
            let grad = reml_state.compute_gradient(&best_rho)?;
            let grad_norm = project_rho_gradient(&grad, &best_rho)
                .dot(&project_rho_gradient(&grad, &best_rho))
                .sqrt();
            if grad_norm <= FALLBACK_GRADIENT_TOLERANCE {
                log::warn!(
                    "BFGS stopped early ({:?}); using best point seen, cost {:.6}, gradient norm {:.3e}",
                    e,
                    best_cost,
                    grad_norm
                );
                Ok((best_rho, config.reml_max_iterations))
            } else if separation_seen.get() {
                // Separation bounds ρ from below; the best feasible point is the constrained optimum.
                log::warn!(
                    "BFGS stopped against separated fits ({:?}); using best feasible rho = {:?}, cost {:.6}",
                    e,
                    best_rho.to_vec(),
                    best_cost
                );
                Ok((best_rho, config.reml_max_iterations))
            } else {
                Err(FitError::RemlOptimizationFailed(format!(
                    "BFGS failed: {:?} (best gradient norm {:.3e})",
                    e, grad_norm
                )))
            }
        }
    }
}

/// One `λ` per penalty that puts its block's data curvature and penalty on the
/// same scale: `tr(X_k'WX_k) / tr(S_k)` with `W = ¼`, the logit weight at `μ = ½`.
fn heuristic_lambdas(x: &DesignMatrix, layout: &ModelLayout, s_list: &[Array2<f64>]) -> Vec<f64> {
    let column_norms = x.column_squared_norms();
    layout
        .penalty_map
        .iter()
        .zip(s_list)
        .map(|(block, s_k)| {
            let data_curvature = 0.25 * column_norms.slice(s![block.col_range.clone()]).sum();
            let penalty_scale = s_k.diag().sum();
            let lambda = data_curvature / penalty_scale;
            if lambda.is_finite() && lambda > 0.0 { lambda } else { 1.0 }
        })
        .collect()
}

/// Helper to log the model structure before fitting.
fn log_layout_info(layout: &ModelLayout) {
    log::info!(
        "Model structure has {} total coefficients and {} penalties.",
        layout.total_coeffs,
        layout.num_penalties
    );
    for block in &layout.penalty_map {
        log::debug!(
            "  - {}: columns {:?} (penalty {})",
            block.term_name,
            block.col_range,
            block.penalty_idx
        );
    }
}

/// Holds the state for the outer LAML optimization.
pub struct RemlState<'a> {
    y: ArrayView1<'a, f64>,
    x: &'a DesignMatrix,
    penalties: PenaltyStructure,
    layout: &'a ModelLayout,
    config: &'a EstimationConfig,
    cache: RefCell<HashMap<Vec<u64>, PirlsResult>>,
    last_beta: RefCell<Option<Array1<f64>>>,
}

impl<'a> RemlState<'a> {
    pub fn new(
        y: ArrayView1<'a, f64>,
        x: &'a DesignMatrix,
        penalties: PenaltyStructure,
        layout: &'a ModelLayout,
        config: &'a EstimationConfig,
    ) -> Self {
        Self {
            y,
            x,
            penalties,
            layout,
            config,
            cache: RefCell::new(HashMap::new()),
            last_beta: RefCell::new(None),
        }
    }

    /// Runs the inner P-IRLS loop, caching the result.
    fn execute_pirls_if_needed(&self, rho: &Array1<f64>) -> Result<PirlsResult, FitError> {
        let key: Vec<u64> = rho.iter().map(|&v| v.to_bits()).collect();
        if let Some(cached) = self.cache.borrow().get(&key) {
            return Ok(cached.clone());
        }

        let lambdas = LogSmoothingParamsView::new(rho.view()).exp();
        let s_lambda = self.penalties.construct_s_lambda(lambdas.view(), self.layout);
        let warm_start = self.last_beta.borrow().clone();
        let result = pirls::fit_model_for_fixed_rho(
            self.x,
            self.y,
            &s_lambda,
            warm_start.as_ref(),
            self.config.link_function,
            &self.config.pirls,
        )?;

        *self.last_beta.borrow_mut() = Some(result.beta.0.clone());
        let mut cache = self.cache.borrow_mut();
        if cache.len() >= MAX_CACHED_FITS {
            cache.clear();
        }
        cache.insert(key, result.clone());
        Ok(result)
    }

    /// The negative LAML at `ρ`.
    pub fn compute_cost(&self, rho: &Array1<f64>) -> Result<f64, FitError> {
        let pirls_result = self.execute_pirls_if_needed(rho)?;
        let lambdas = rho.mapv(f64::exp);

        let log_det_s = self
            .penalties
            .determinant(lambdas.view())
            .map_err(FitError::LinearSystemSolveFailed)?
            .log_det;
        let log_det_h = log_det_cholesky(&pirls_result.penalized_hessian)?;

        Ok(0.5 * pirls_result.deviance + 0.5 * pirls_result.penalty_term - 0.5 * log_det_s
            + 0.5 * log_det_h)
    }

    /// Analytic gradient of `compute_cost` with respect to `ρ`.
    ///
    /// For each `k`, with `A_k = λ_k S_k`:
    ///
    /// `∂V/∂ρ_k = ½β̂'A_kβ̂ - ½tr(S_λ⁺A_k) + ½tr(H⁻¹ ∂H/∂ρ_k)`,
    ///
    /// where `∂H/∂ρ_k = X' diag(w'(η) ∘ X ∂β̂/∂ρ_k) X + A_k` and
    /// `∂β̂/∂ρ_k = -H⁻¹A_kβ̂`. The trace of the first part reduces to
    /// `Σ_i w'_i (∂η_i/∂ρ_k) x_i'H⁻¹x_i`, so `H⁻¹` is formed once.
    pub fn compute_gradient(&self, rho: &Array1<f64>) -> Result<Array1<f64>, FitError> {
        let pirls_result = self.execute_pirls_if_needed(rho)?;
        let lambdas = rho.mapv(f64::exp);
        let beta = pirls_result.beta.as_view();

        let h_inv = pirls_result
            .penalized_hessian
            .inv()
            .map_err(FitError::LinearSystemSolveFailed)?;
        let determinant = self
            .penalties
            .determinant(lambdas.view())
            .map_err(FitError::LinearSystemSolveFailed)?;
        let leverages = self.x.quadratic_form_diag(&h_inv);
        let mu = &pirls_result.final_mu;
        let dw_deta = mu * &(1.0 - mu) * &(1.0 - &(mu * 2.0));

        let mut gradient = Array1::zeros(rho.len());
        for k in 0..rho.len() {
            let range = self.layout.penalty_map[k].col_range.clone();
            let s_k = &self.penalties.s_list[k];
            let a_k_beta = self
                .penalties
                .scaled_penalty_times(k, lambdas[k], beta, self.layout);

            let penalty_term = 0.5 * beta.dot(&a_k_beta);

            let group = self.penalties.group_of(k);
            let log_det_s_term =
                -0.5 * lambdas[k] * (&determinant.pseudo_inverses[group] * s_k).sum();

            let d_beta = -h_inv.dot(&a_k_beta);
            let d_eta = self.x.matrix_vector_multiply(&d_beta);
            let weight_trace: f64 = (&dw_deta * &d_eta * &leverages).sum();
            let penalty_trace =
                lambdas[k] * (&h_inv.slice(s![range.clone(), range]) * s_k).sum();
            let log_det_h_term = 0.5 * (weight_trace + penalty_trace);

            gradient[k] = penalty_term + log_det_s_term + log_det_h_term;
        }
        Ok(gradient)
    }
}

fn log_det_cholesky(matrix: &Array2<f64>) -> Result<f64, FitError> {
    let factor = matrix
        .cholesky(UPLO::Lower)
        .map_err(FitError::LinearSystemSolveFailed)?;
    Ok(2.0 * factor.diag().mapv(f64::ln).sum())
}

/// Posterior standard deviations, `sqrt(diag(H⁻¹))`.
pub fn coefficient_standard_errors(covariance: &Array2<f64>) -> Array1<f64> {
    covariance.diag().mapv(|v| v.max(0.0).sqrt())
}

/// Linear-predictor variances `x_i' V x_i` for the rows of a design block.
pub fn linear_predictor_variance(x: &DesignMatrix, covariance: &Array2<f64>) -> Array1<f64> {
    x.quadratic_form_diag(covariance).mapv(|v| v.max(0.0))
}
