use crate::gam::estimate::FitError;
use ndarray::{Array1, Array2, ArrayView1, s};
use ndarray_linalg::{Eigh, UPLO, error::LinalgError};
use std::ops::Range;

/// Relative eigenvalue threshold below which a penalty direction counts as unpenalized.
const PENALTY_RANK_TOLERANCE: f64 = 1e-10;

/// Holds the layout of the coefficient vector and which penalties act where.
#[derive(Clone, Debug)]
pub struct ModelLayout {
    pub penalty_map: Vec<PenalizedBlock>,
    pub total_coeffs: usize,
    pub num_penalties: usize,
}

/// Information about a single penalty and the coefficient columns it acts on.
///
/// Several penalties may share one column range: the two directional penalties
/// of a tensor-product surface both act on the full surface block.
#[derive(Clone, Debug)]
pub struct PenalizedBlock {
    pub term_name: String,
    pub col_range: Range<usize>,
    pub penalty_idx: usize,
}

impl ModelLayout {
    /// Validates a list of penalized blocks against the total coefficient count.
    ///
    /// Penalty indices must be `0..n` in order, and every range must lie inside the
    /// coefficient vector. Blocks whose ranges overlap must coincide exactly.
    pub fn new(total_coeffs: usize, penalty_map: Vec<PenalizedBlock>) -> Result<Self, FitError> {
        for (expected, block) in penalty_map.iter().enumerate() {
            if block.penalty_idx != expected {
                return Err(FitError::LayoutError(format!(
                    "penalty '{}' has index {} but is in position {}",
                    block.term_name, block.penalty_idx, expected
                )));
            }
            if block.col_range.is_empty() || block.col_range.end > total_coeffs {
                return Err(FitError::LayoutError(format!(
                    "penalty '{}' covers columns {:?}, outside 0..{}",
                    block.term_name, block.col_range, total_coeffs
                )));
            }
        }
        for (i, a) in penalty_map.iter().enumerate() {
            for b in penalty_map.iter().skip(i + 1) {
                let overlaps = a.col_range.start < b.col_range.end && b.col_range.start < a.col_range.end;
                if overlaps && a.col_range != b.col_range {
                    return Err(FitError::LayoutError(format!(
                        "penalties '{}' and '{}' partially overlap",
                        a.term_name, b.term_name
                    )));
                }
            }
        }
        let num_penalties = penalty_map.len();
        Ok(Self {
            penalty_map,
            total_coeffs,
            num_penalties,
        })
    }
}

/// Penalties sharing one column range. `log|S_λ|₊` factorizes over groups.
#[derive(Clone, Debug)]
pub struct PenaltyGroup {
    pub col_range: Range<usize>,
    pub members: Vec<usize>,
    /// Rank of `Σ S_k` over the members; independent of `λ`.
    pub rank: usize,
}

/// The penalty matrices (each sized to its own block) plus their grouping.
#[derive(Clone, Debug)]
pub struct PenaltyStructure {
    pub s_list: Vec<Array2<f64>>,
    pub groups: Vec<PenaltyGroup>,
}

/// `log|S_λ|₊` and the per-group pseudo-inverses at one `λ`.
pub struct PenaltyDeterminant {
    pub log_det: f64,
    /// Indexed like `PenaltyStructure::groups`; each is sized to the group's block.
    pub pseudo_inverses: Vec<Array2<f64>>,
}

impl PenaltyStructure {
    /// Groups penalties by column range and detects each group's rank once.
    ///
    /// Rank is measured on the Frobenius-normalized sum of the member penalties so
    /// that it does not depend on the current smoothing parameters.
    pub fn new(layout: &ModelLayout, s_list: Vec<Array2<f64>>) -> Result<Self, FitError> {
        if s_list.len() != layout.num_penalties {
            return Err(FitError::LayoutError(format!(
                "{} penalty matrices for {} penalized blocks",
                s_list.len(),
                layout.num_penalties
            )));
        }
        for block in &layout.penalty_map {
            let size = block.col_range.len();
            if s_list[block.penalty_idx].dim() != (size, size) {
                return Err(FitError::LayoutError(format!(
                    "penalty '{}' is {:?} but its block has {} columns",
                    block.term_name,
                    s_list[block.penalty_idx].dim(),
                    size
                )));
            }
        }

        let mut groups: Vec<PenaltyGroup> = Vec::new();
        for block in &layout.penalty_map {
            match groups.iter_mut().find(|g| g.col_range == block.col_range) {
                Some(group) => group.members.push(block.penalty_idx),
                None => groups.push(PenaltyGroup {
                    col_range: block.col_range.clone(),
                    members: vec![block.penalty_idx],
                    rank: 0,
                }),
            }
        }

        for group in &mut groups {
            let size = group.col_range.len();
            let mut balanced = Array2::<f64>::zeros((size, size));
            for &k in &group.members {
                let norm = s_list[k].iter().map(|v| v * v).sum::<f64>().sqrt();
                if norm > 0.0 {
                    balanced.scaled_add(1.0 / norm, &s_list[k]);
                }
            }
            let (eigenvalues, _) = balanced
                .eigh(UPLO::Lower)
                .map_err(FitError::LinearSystemSolveFailed)?;
            let max_ev = eigenvalues.iter().cloned().fold(0.0_f64, f64::max);
            group.rank = eigenvalues
                .iter()
                .filter(|&&ev| ev > max_ev * PENALTY_RANK_TOLERANCE)
                .count();
            log::debug!(
                "Penalty group over columns {:?}: {} penalties, rank {} of {}",
                group.col_range,
                group.members.len(),
                group.rank,
                size
            );
        }

        Ok(Self { s_list, groups })
    }

    /// `S_λ = Σ λ_k S_k`, embedded in the full `p × p` coefficient space.
    pub fn construct_s_lambda(&self, lambdas: ArrayView1<f64>, layout: &ModelLayout) -> Array2<f64> {
        let p = layout.total_coeffs;
        let mut s_lambda = Array2::zeros((p, p));
        for block in &layout.penalty_map {
            let range = block.col_range.clone();
            s_lambda
                .slice_mut(s![range.clone(), range])
                .scaled_add(lambdas[block.penalty_idx], &self.s_list[block.penalty_idx]);
        }
        s_lambda
    }

    /// `λ_k S_k β`, as a full-length vector.
    pub fn scaled_penalty_times(
        &self,
        k: usize,
        lambda: f64,
        beta: ArrayView1<f64>,
        layout: &ModelLayout,
    ) -> Array1<f64> {
        let range = layout.penalty_map[k].col_range.clone();
        let mut out = Array1::zeros(layout.total_coeffs);
        out.slice_mut(s![range.clone()])
            .assign(&(self.s_list[k].dot(&beta.slice(s![range])) * lambda));
        out
    }

    /// Computes `log|S_λ|₊` over the detected ranks and each group's pseudo-inverse.
    pub fn determinant(&self, lambdas: ArrayView1<f64>) -> Result<PenaltyDeterminant, LinalgError> {
        let mut log_det = 0.0;
        let mut pseudo_inverses = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let size = group.col_range.len();
            let mut s_group = Array2::<f64>::zeros((size, size));
            for &k in &group.members {
                s_group.scaled_add(lambdas[k], &self.s_list[k]);
            }
            let (eigenvalues, eigenvectors) = s_group.eigh(UPLO::Lower)?;
            // eigh sorts ascending; the penalized range is the top `rank` eigenpairs.
            let first = size - group.rank;
            let mut pinv = Array2::<f64>::zeros((size, size));
            for j in first..size {
                let ev = eigenvalues[j].max(f64::MIN_POSITIVE);
                log_det += ev.ln();
                let u = eigenvectors.column(j);
                for r in 0..size {
                    let scaled = u[r] / ev;
                    if scaled == 0.0 {
                        continue;
                    }
                    for c in 0..size {
                        pinv[[r, c]] += scaled * u[c];
                    }
                }
            }
            pseudo_inverses.push(pinv);
        }
        Ok(PenaltyDeterminant {
            log_det,
            pseudo_inverses,
        })
    }

    /// Index of the group containing penalty `k`.
    pub fn group_of(&self, k: usize) -> usize {
        self.groups
            .iter()
            .position(|g| g.members.contains(&k))
            .unwrap_or(0)
    }
}
