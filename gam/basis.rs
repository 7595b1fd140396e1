use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::SVD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defines the strategy for placing the internal knots of a spline.
/// This is saved with the fitted surface so prediction rebuilds the same basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnotStrategy {
    /// Place knots uniformly across the data range.
    Uniform,
    /// Place knots at the quantiles of the training coordinates. Pitch locations
    /// pile up around the zone, so this puts basis resolution where the data are.
    Quantile,
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Quantile strategy requires a non-empty training data set for quantile calculation.")]
    QuantileDataMissing,

    #[error("Cannot compute {num_quantiles} quantiles from only {num_points} data points.")]
    InsufficientDataForQuantiles {
        num_quantiles: usize,
        num_points: usize,
    },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error(
        "Knot vector of length {num_knots} is too short for a degree {degree} spline (need at least {required})."
    )]
    InvalidKnotVector {
        num_knots: usize,
        degree: usize,
        required: usize,
    },

    #[error("Tensor product inputs disagree on row count: {left} vs {right}.")]
    TensorRowMismatch { left: usize, right: usize },

    #[error("SVD of the constraint row returned no right singular vectors.")]
    MissingSingularVectors,

    #[error("SVD failed while applying the identifiability constraint: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Creates a B-spline basis expansion matrix and its corresponding knot vector.
///
/// # Arguments
///
/// * `data`: the coordinates to expand (one pitch coordinate per row).
/// * `training_data_for_quantiles`: `Some` to place internal knots at quantiles of
///   these values, `None` for uniform knots.
/// * `data_range`: `(min, max)` boundaries for the knot vector. This must be the
///   range of the training data, also when expanding new points for prediction.
/// * `num_internal_knots`: knots strictly between the boundaries.
/// * `degree`: polynomial degree (3 for cubic).
///
/// # Returns
///
/// 1. The basis matrix `[data.len(), num_internal_knots + degree + 1]`.
/// 2. The full knot vector, which must be kept to rebuild the basis later.
pub fn create_bspline_basis(
    data: ArrayView1<f64>,
    training_data_for_quantiles: Option<ArrayView1<f64>>,
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Result<(Array2<f64>, Array1<f64>), BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if !(data_range.0 < data_range.1) {
        return Err(BasisError::InvalidRange(data_range.0, data_range.1));
    }

    let knot_vector = internal::generate_full_knot_vector(
        data_range,
        num_internal_knots,
        degree,
        training_data_for_quantiles,
    )?;
    let basis_matrix = create_bspline_basis_with_knots(data, knot_vector.view(), degree)?;

    Ok((basis_matrix, knot_vector))
}

/// Evaluates the B-spline basis defined by an existing knot vector.
///
/// Points outside `[knots[0], knots[last]]` are clamped onto the boundary, so the
/// basis never extrapolates the end polynomials.
pub fn create_bspline_basis_with_knots(
    data: ArrayView1<f64>,
    knot_vector: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    let required = 2 * (degree + 1);
    if knot_vector.len() < required {
        return Err(BasisError::InvalidKnotVector {
            num_knots: knot_vector.len(),
            degree,
            required,
        });
    }

    // n = k - d - 1 basis functions for k knots of degree d.
    let num_basis_functions = knot_vector.len() - degree - 1;
    let mut basis_matrix = Array2::zeros((data.len(), num_basis_functions));

    for (i, &x) in data.iter().enumerate() {
        let (start, values) = internal::evaluate_splines_at_point(x, degree, knot_vector);
        basis_matrix
            .slice_mut(s![i, start..start + degree + 1])
            .assign(&values);
    }

    Ok(basis_matrix)
}

/// Creates a penalty matrix `S = D' * D` for a B-spline basis, where `D` takes
/// `order`-th differences of adjacent coefficients. This is the core of P-splines.
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);

    // Each pass differences adjacent rows and drops one row.
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }

    Ok(d.t().dot(&d))
}

/// Applies a sum-to-zero constraint to a basis matrix for model identifiability.
///
/// The constraint vector is `c = B' 1`; the returned transform `Z` spans the null
/// space of `c'`, so every column of `B Z` sums to zero over the training rows and
/// the smooth no longer competes with the intercept.
///
/// # Returns
/// 1. The constrained basis `B Z` (one fewer column).
/// 2. The transformation `Z`, `[n_basis, n_basis - 1]`.
pub fn apply_sum_to_zero_constraint(
    basis_matrix: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let constraint_vec = basis_matrix.sum_axis(Axis(0));
    let c_row = constraint_vec.insert_axis(Axis(0));

    // The full right singular vectors of the 1 x p constraint row: the first is
    // parallel to c, the remaining p - 1 are orthonormal and orthogonal to it.
    let (_, _, vt) = c_row.svd(false, true)?;
    let vt = vt.ok_or(BasisError::MissingSingularVectors)?;
    let z_transform = vt.slice(s![1.., ..]).t().to_owned();

    let constrained_basis = basis_matrix.dot(&z_transform);

    Ok((constrained_basis, z_transform))
}

/// Kronecker product `a ⊗ b`.
pub fn kronecker(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let (ra, ca) = a.dim();
    let (rb, cb) = b.dim();
    let mut out = Array2::zeros((ra * rb, ca * cb));
    for i in 0..ra {
        for j in 0..ca {
            let aij = a[[i, j]];
            if aij == 0.0 {
                continue;
            }
            out.slice_mut(s![i * rb..(i + 1) * rb, j * cb..(j + 1) * cb])
                .scaled_add(aij, &b);
        }
    }
    out
}

/// Row-wise tensor product of two marginal bases.
///
/// Column `a * kz + b` of the result is the product of column `a` of `bx` and
/// column `b` of `bz`. This ordering matches `kronecker(Sx, I)` / `kronecker(I, Sz)`
/// penalties.
pub fn tensor_product_rows(
    bx: ArrayView2<f64>,
    bz: ArrayView2<f64>,
) -> Result<Array2<f64>, BasisError> {
    if bx.nrows() != bz.nrows() {
        return Err(BasisError::TensorRowMismatch {
            left: bx.nrows(),
            right: bz.nrows(),
        });
    }
    let (n, kx) = bx.dim();
    let kz = bz.ncols();
    let mut out = Array2::zeros((n, kx * kz));
    for (mut out_row, (x_row, z_row)) in out
        .axis_iter_mut(Axis(0))
        .zip(bx.axis_iter(Axis(0)).zip(bz.axis_iter(Axis(0))))
    {
        for (a, &xa) in x_row.iter().enumerate() {
            if xa == 0.0 {
                continue;
            }
            out_row
                .slice_mut(s![a * kz..(a + 1) * kz])
                .scaled_add(xa, &z_row);
        }
    }
    Ok(out)
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Generates the full knot vector, including repeated boundary knots.
    pub(super) fn generate_full_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
        training_data_for_quantiles: Option<ArrayView1<f64>>,
    ) -> Result<Array1<f64>, BasisError> {
        let (min_val, max_val) = data_range;

        let uniform = || {
            if num_internal_knots == 0 {
                Array1::from_vec(vec![])
            } else {
                let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
                Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h))
            }
        };

        let internal_knots = match training_data_for_quantiles {
            Some(training_data) => {
                if training_data.is_empty() {
                    return Err(BasisError::QuantileDataMissing);
                }
                if training_data.len() < num_internal_knots {
                    return Err(BasisError::InsufficientDataForQuantiles {
                        num_quantiles: num_internal_knots,
                        num_points: training_data.len(),
                    });
                }
                let candidate = quantiles(training_data, num_internal_knots);
                if knots_are_separated(&candidate, data_range) {
                    candidate
                } else {
                    log::warn!(
                        "Quantile knots collapse on tied coordinates; using {num_internal_knots} uniform knots on ({min_val:.3}, {max_val:.3})."
                    );
                    uniform()
                }
            }
            None => uniform(),
        };

        // B-splines require `degree + 1` repeated knots at each boundary.
        let min_knots = Array1::from_elem(degree + 1, min_val);
        let max_knots = Array1::from_elem(degree + 1, max_val);

        let mut full = Vec::with_capacity(internal_knots.len() + 2 * (degree + 1));
        full.extend(min_knots.iter().copied());
        full.extend(internal_knots.iter().copied());
        full.extend(max_knots.iter().copied());
        Ok(Array1::from_vec(full))
    }

    /// Quantile knots must lie strictly inside the range and strictly increase.
    fn knots_are_separated(knots: &Array1<f64>, data_range: (f64, f64)) -> bool {
        let min_gap = (data_range.1 - data_range.0) * 1e-6;
        let mut previous = data_range.0;
        for &k in knots.iter() {
            if k - previous <= min_gap {
                return false;
            }
            previous = k;
        }
        data_range.1 - previous > min_gap
    }

    /// Calculates quantiles from a data vector using linear interpolation (Type 7 in R).
    fn quantiles(data: ArrayView1<f64>, num_quantiles: usize) -> Array1<f64> {
        if num_quantiles == 0 {
            return Array1::from_vec(vec![]);
        }

        let mut sorted_data = data.to_vec();
        sorted_data.sort_unstable_by(|a, b| a.total_cmp(b));

        let n = sorted_data.len();
        (1..=num_quantiles)
            .map(|k| {
                let p = k as f64 / (num_quantiles as f64 + 1.0);
                let float_idx = (n as f64 - 1.0) * p;
                let lower_idx = float_idx.floor() as usize;
                let upper_idx = float_idx.ceil() as usize;

                if lower_idx == upper_idx {
                    sorted_data[lower_idx]
                } else {
                    let fraction = float_idx - lower_idx as f64;
                    sorted_data[lower_idx] * (1.0 - fraction) + sorted_data[upper_idx] * fraction
                }
            })
            .collect()
    }

    /// Evaluates the `degree + 1` non-zero B-splines at `x` (Cox-de Boor, triangular scheme).
    ///
    /// Returns the index of the first non-zero basis function and their values.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> (usize, Array1<f64>) {
        let num_basis = knots.len() - degree - 1;
        let lo = knots[degree];
        let hi = knots[num_basis];
        let x = if x.is_nan() { lo } else { x.clamp(lo, hi) };

        // Knot span `mu` with knots[mu] <= x < knots[mu + 1]; the right boundary
        // belongs to the last non-degenerate span.
        let mu = if x >= hi {
            num_basis - 1
        } else {
            knots
                .iter()
                .rposition(|&k| k <= x)
                .unwrap_or(degree)
                .clamp(degree, num_basis - 1)
        };

        let mut values = Array1::<f64>::zeros(degree + 1);
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        values[0] = 1.0;

        for j in 1..=degree {
            left[j] = x - knots[mu + 1 - j];
            right[j] = knots[mu + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom > 0.0 { values[r] / denom } else { 0.0 };
                values[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            values[j] = saved;
        }

        (mu - degree, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_knot_generation_uniform() {
        let knots = internal::generate_full_knot_vector((0.0, 10.0), 3, 2, None).unwrap();
        // 3 internal + 2 * (2+1) boundary = 9 knots
        assert_eq!(knots.len(), 9);
        assert_eq!(knots, array![0.0, 0.0, 0.0, 2.5, 5.0, 7.5, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_knot_generation_quantile() {
        let training_data = array![0., 1., 2., 5., 8., 9., 10.];
        let knots =
            internal::generate_full_knot_vector((0.0, 10.0), 3, 2, Some(training_data.view()))
                .unwrap();
        // p=0.25 -> (1+2)/2, p=0.5 -> 5, p=0.75 -> (8+9)/2
        assert_eq!(knots, array![0.0, 0.0, 0.0, 1.5, 5.0, 8.5, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn quantile_knots_on_tied_data_fall_back_to_uniform() {
        let tied = array![0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0];
        let knots =
            internal::generate_full_knot_vector((0.0, 2.0), 3, 3, Some(tied.view())).unwrap();
        assert_eq!(
            knots,
            array![0.0, 0.0, 0.0, 0.0, 0.5, 1.0, 1.5, 2.0, 2.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_penalty_matrix_creation() {
        let s = create_difference_penalty_matrix(5, 2).unwrap();
        let expected_s = array![
            [1., -2., 1., 0., 0.],
            [-2., 5., -4., 1., 0.],
            [1., -4., 6., -4., 1.],
            [0., 1., -4., 5., -2.],
            [0., 0., 1., -2., 1.]
        ];
        assert!(s.abs_diff_eq(&expected_s, 1e-12));
    }

    #[test]
    fn test_bspline_basis_sums_to_one() {
        let data = Array::linspace(0.0, 10.0, 101);
        let (basis, _) = create_bspline_basis(data.view(), None, (0.0, 10.0), 10, 3).unwrap();

        for &sum in basis.sum_axis(Axis(1)).iter() {
            assert!((sum - 1.0).abs() < 1e-9, "Basis did not sum to 1, got {sum}");
        }
    }

    #[test]
    fn test_single_point_evaluation_degree_one() {
        // Knots t = [0,0,1,2,2] give three hat functions; at x = 0.5 the first two share the mass.
        let knots = array![0.0, 0.0, 1.0, 2.0, 2.0];
        let basis = create_bspline_basis_with_knots(array![0.5].view(), knots.view(), 1).unwrap();
        assert!((basis[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((basis[[0, 1]] - 0.5).abs() < 1e-12);
        assert!(basis[[0, 2]].abs() < 1e-12);
    }

    #[test]
    fn points_outside_range_are_clamped_to_the_boundary() {
        let knots = array![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 2.0, 2.0, 2.0];
        let basis =
            create_bspline_basis_with_knots(array![-5.0, 0.0, 2.0, 7.0].view(), knots.view(), 3)
                .unwrap();
        assert_eq!(basis.row(0), basis.row(1));
        assert_eq!(basis.row(2), basis.row(3));
        assert!((basis[[3, 4]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sum_to_zero_constraint_removes_one_column_and_centers() {
        let data = Array::linspace(0.0, 1.0, 40);
        let (basis, _) = create_bspline_basis(data.view(), None, (0.0, 1.0), 4, 3).unwrap();
        let (constrained, z) = apply_sum_to_zero_constraint(basis.view()).unwrap();
        assert_eq!(constrained.ncols(), basis.ncols() - 1);
        assert_eq!(z.dim(), (basis.ncols(), basis.ncols() - 1));
        for &col_sum in constrained.sum_axis(Axis(0)).iter() {
            assert!(col_sum.abs() < 1e-9, "constrained column sums to {col_sum}");
        }
    }

    #[test]
    fn tensor_product_matches_kronecker_row_by_row() {
        let bx = array![[0.2, 0.8], [1.0, 0.0]];
        let bz = array![[0.5, 0.25, 0.25], [0.0, 0.0, 1.0]];
        let t = tensor_product_rows(bx.view(), bz.view()).unwrap();
        for r in 0..2 {
            let row_x = bx.row(r).insert_axis(Axis(0));
            let row_z = bz.row(r).insert_axis(Axis(0));
            let expected = kronecker(row_x, row_z);
            assert!(t.row(r).abs_diff_eq(&expected.row(0), 1e-15));
        }
    }

    #[test]
    fn test_error_conditions() {
        match create_bspline_basis(array![].view(), None, (0.0, 10.0), 5, 0).unwrap_err() {
            BasisError::InvalidDegree(deg) => assert_eq!(deg, 0),
            other => panic!("Expected InvalidDegree error, got {other:?}"),
        }

        match create_bspline_basis(array![].view(), None, (10.0, 0.0), 5, 1).unwrap_err() {
            BasisError::InvalidRange(start, end) => {
                assert_eq!(start, 10.0);
                assert_eq!(end, 0.0);
            }
            other => panic!("Expected InvalidRange error, got {other:?}"),
        }

        match create_bspline_basis(
            array![].view(),
            Some(array![1., 2.].view()),
            (0.0, 10.0),
            3,
            1,
        )
        .unwrap_err()
        {
            BasisError::InsufficientDataForQuantiles {
                num_quantiles,
                num_points,
            } => {
                assert_eq!(num_quantiles, 3);
                assert_eq!(num_points, 2);
            }
            other => panic!("Expected InsufficientDataForQuantiles error, got {other:?}"),
        }

        match create_difference_penalty_matrix(5, 5).unwrap_err() {
            BasisError::InvalidPenaltyOrder { order, num_basis } => {
                assert_eq!(order, 5);
                assert_eq!(num_basis, 5);
            }
            other => panic!("Expected InvalidPenaltyOrder error, got {other:?}"),
        }
    }
}
