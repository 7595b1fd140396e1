use crate::gam::estimate::FitError;
use crate::gam::matrix::DesignMatrix;
use crate::gam::types::{Coefficients, LinkFunction};
use ndarray::{Array1, Array2, ArrayView1, Zip};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

/// Floor on the IRLS weights `μ(1-μ)` so the working response stays finite.
const MIN_WEIGHT: f64 = 1e-10;

/// Controls for the inner penalized IRLS loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PirlsConfig {
    pub max_iterations: usize,
    /// Relative change in penalized deviance below which the loop stops.
    pub convergence_tolerance: f64,
    pub max_step_halvings: usize,
    /// Largest `|η|` accepted before the fit is treated as separated.
    pub max_abs_eta: f64,
}

impl Default for PirlsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-9,
            max_step_halvings: 30,
            max_abs_eta: 40.0,
        }
    }
}

/// The status of the P-IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// No step along the Newton direction lowers the penalized deviance any further.
    StalledAtValidMinimum,
}

/// Holds the result of a converged P-IRLS inner loop for a fixed rho.
///
/// * `penalized_hessian`: `X'WX + S_λ` at `beta`, with `W` evaluated at the final fit.
/// * `deviance`: the binomial deviance, `-2` times the log-likelihood.
/// * `penalty_term`: `β' S_λ β`.
#[derive(Clone, Debug)]
pub struct PirlsResult {
    pub beta: Coefficients,
    pub penalized_hessian: Array2<f64>,
    pub deviance: f64,
    pub penalty_term: f64,
    pub final_mu: Array1<f64>,
    pub status: PirlsStatus,
    pub iteration: usize,
}

/// Fits the penalized logistic model for fixed smoothing parameters.
///
/// Each iteration solves `(X'WX + S_λ) β = X'Wz` and halves the step until the
/// penalized deviance `D(β) + β' S_λ β` does not increase. `warm_start` seeds `β`
/// from a nearby smoothing-parameter fit.
pub fn fit_model_for_fixed_rho(
    x: &DesignMatrix,
    y: ArrayView1<f64>,
    s_lambda: &Array2<f64>,
    warm_start: Option<&Array1<f64>>,
    link: LinkFunction,
    config: &PirlsConfig,
) -> Result<PirlsResult, FitError> {
    let p = x.ncols();
    let mut beta = match warm_start {
        Some(start) if start.len() == p => start.clone(),
        _ => Array1::zeros(p),
    };
    let mut eta = x.matrix_vector_multiply(&beta);
    let mut penalized_deviance =
        calculate_deviance(y, eta.view()) + beta.dot(&s_lambda.dot(&beta));
    let mut status = None;
    let mut last_change = f64::INFINITY;
    let mut iteration = 0;

    for iter in 1..=config.max_iterations {
        iteration = iter;
        let (_, weights, z) = update_glm_vectors(y, eta.view(), link);

        let mut hessian = x.weighted_gram(weights.view());
        hessian += s_lambda;
        let rhs = x.transpose_vector_multiply(&(&weights * &z));
        let beta_target = hessian
            .solve_into(rhs)
            .map_err(FitError::LinearSystemSolveFailed)?;
        if !beta_target.iter().all(|v| v.is_finite()) {
            return Err(FitError::PirlsDidNotConverge {
                max_iterations: config.max_iterations,
                last_change: f64::NAN,
            });
        }

        let direction = &beta_target - &beta;
        let mut step = 1.0;
        let mut accepted = None;
        for halving in 0..=config.max_step_halvings {
            let beta_trial = &beta + &(&direction * step);
            let eta_trial = x.matrix_vector_multiply(&beta_trial);
            let trial_objective =
                calculate_deviance(y, eta_trial.view()) + beta_trial.dot(&s_lambda.dot(&beta_trial));
            if trial_objective.is_finite() && trial_objective <= penalized_deviance {
                if halving > 0 {
                    log::trace!("P-IRLS iteration {}: accepted step {:.3e}", iter, step);
                }
                accepted = Some((beta_trial, eta_trial, trial_objective));
                break;
            }
            step *= 0.5;
        }

        let Some((beta_next, eta_next, objective_next)) = accepted else {
            log::debug!(
                "P-IRLS iteration {}: no descent after {} halvings, penalized deviance {:.8e}",
                iter,
                config.max_step_halvings,
                penalized_deviance
            );
            status = Some(PirlsStatus::StalledAtValidMinimum);
            break;
        };

        last_change = (penalized_deviance - objective_next).abs() / (objective_next.abs() + 0.1);
        beta = beta_next;
        eta = eta_next;
        penalized_deviance = objective_next;

        let max_abs_eta = eta.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if max_abs_eta > config.max_abs_eta {
            log::debug!(
                "P-IRLS iteration {}: |η| reached {:.1}, treating the fit as separated",
                iter,
                max_abs_eta
            );
            return Err(FitError::PerfectSeparation { max_abs_eta });
        }

        if last_change < config.convergence_tolerance {
            status = Some(PirlsStatus::Converged);
            break;
        }
    }

    let Some(status) = status else {
        return Err(FitError::PirlsDidNotConverge {
            max_iterations: config.max_iterations,
            last_change,
        });
    };

    let (final_mu, final_weights, _) = update_glm_vectors(y, eta.view(), link);
    let mut penalized_hessian = x.weighted_gram(final_weights.view());
    penalized_hessian += s_lambda;
    let penalty_term = beta.dot(&s_lambda.dot(&beta));
    let deviance = penalized_deviance - penalty_term;

    log::trace!(
        "P-IRLS finished after {} iterations ({:?}), deviance {:.6}",
        iteration,
        status,
        deviance
    );

    Ok(PirlsResult {
        beta: Coefficients::new(beta),
        penalized_hessian,
        deviance,
        penalty_term,
        final_mu,
        status,
        iteration,
    })
}

/// Mean, IRLS weights and working response at `η`.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: ArrayView1<f64>,
    link: LinkFunction,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let mu = eta.mapv(|e| link.inverse(e));
    let weights = eta.mapv(|e| link.mu_eta(e).max(MIN_WEIGHT));
    let z = Zip::from(eta)
        .and(y)
        .and(&mu)
        .and(&weights)
        .map_collect(|&e, &yi, &m, &w| e + (yi - m) / w);
    (mu, weights, z)
}

/// Binomial deviance for 0/1 outcomes, computed from `η` without clamping `μ`.
pub fn calculate_deviance(y: ArrayView1<f64>, eta: ArrayView1<f64>) -> f64 {
    let total = Zip::from(y).and(eta).fold(0.0, |acc, &yi, &e| {
        // -log μ = softplus(-η), -log(1-μ) = softplus(η)
        acc + yi * softplus(-e) + (1.0 - yi) * softplus(e)
    });
    2.0 * total
}

fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}
