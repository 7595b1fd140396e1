use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Link between the linear predictor and the outcome probability.
///
/// Both fitted models are binary regressions. Only the logistic link is
/// implemented; probit or complementary log-log would slot in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkFunction {
    #[default]
    Logit,
}

impl LinkFunction {
    /// Inverse link, `μ = g⁻¹(η)`.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1.0 + e)
                }
            }
        }
    }

    /// `dμ/dη`, used by the delta method to move standard errors to the probability scale.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                let mu = self.inverse(eta);
                mu * (1.0 - mu)
            }
        }
    }
}

/// Fitted coefficient vector in design-column order.
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Log smoothing parameters `ρ = log λ`, one per penalty.
#[derive(Clone, Copy, Debug)]
pub struct LogSmoothingParamsView<'a>(pub ArrayView1<'a, f64>);

impl<'a> LogSmoothingParamsView<'a> {
    pub fn new(values: ArrayView1<'a, f64>) -> Self {
        Self(values)
    }

    pub fn exp(&self) -> Array1<f64> {
        self.0.mapv(f64::exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn logit_inverse_is_stable_in_both_tails() {
        let link = LinkFunction::Logit;
        assert_abs_diff_eq!(link.inverse(0.0), 0.5);
        assert!(link.inverse(-800.0) >= 0.0);
        assert!(link.inverse(800.0) <= 1.0);
        assert_abs_diff_eq!(link.inverse(2.0) + link.inverse(-2.0), 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(link.mu_eta(0.0), 0.25);
    }
}
