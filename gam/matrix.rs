use ndarray::{Array1, Array2, ArrayView1, Axis, s};

/// One categorical grouping factor in a `GroupedDesign`.
///
/// Row `i` contributes a single indicator column, `offset + level_index[i]`.
#[derive(Clone, Debug)]
pub struct FactorColumns {
    pub level_index: Vec<usize>,
    pub num_levels: usize,
    pub offset: usize,
}

/// Dense fixed-effect columns followed by indicator columns for each factor.
///
/// Entity intercepts for a few hundred catchers, umpires and pitchers over
/// hundreds of thousands of pitches would need gigabytes as a dense matrix; the
/// grouped form keeps only one level index per row and factor.
#[derive(Clone, Debug)]
pub struct GroupedDesign {
    fixed: Array2<f64>,
    factors: Vec<FactorColumns>,
    ncols: usize,
}

impl GroupedDesign {
    /// Builds the design from dense fixed columns and `(level_index, num_levels)` per factor.
    /// Factor columns are laid out after the fixed columns in the given order.
    pub fn new(fixed: Array2<f64>, factors: Vec<(Vec<usize>, usize)>) -> Self {
        let mut offset = fixed.ncols();
        let factors = factors
            .into_iter()
            .map(|(level_index, num_levels)| {
                debug_assert_eq!(level_index.len(), fixed.nrows());
                debug_assert!(level_index.iter().all(|&l| l < num_levels));
                let block = FactorColumns {
                    level_index,
                    num_levels,
                    offset,
                };
                offset += num_levels;
                block
            })
            .collect();
        Self {
            fixed,
            factors,
            ncols: offset,
        }
    }

    pub fn factors(&self) -> &[FactorColumns] {
        &self.factors
    }

    pub fn num_fixed(&self) -> usize {
        self.fixed.ncols()
    }

    /// Column indices of the indicator entries that are set in row `i`.
    fn indicator_columns(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.factors.iter().map(move |f| f.offset + f.level_index[i])
    }
}

/// Unified design matrix representation for the spatial smoother (dense) and the
/// entity-effect model (grouped).
#[derive(Clone, Debug)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Grouped(GroupedDesign),
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Grouped(design) => design.fixed.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Grouped(design) => design.ncols,
        }
    }

    /// `X β`
    pub fn matrix_vector_multiply(&self, vector: &Array1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(vector),
            Self::Grouped(design) => {
                let p_fixed = design.num_fixed();
                let mut output = design.fixed.dot(&vector.slice(s![..p_fixed]));
                for factor in &design.factors {
                    for (out, &level) in output.iter_mut().zip(factor.level_index.iter()) {
                        *out += vector[factor.offset + level];
                    }
                }
                output
            }
        }
    }

    /// `X' v`
    pub fn transpose_vector_multiply(&self, vector: &Array1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.t().dot(vector),
            Self::Grouped(design) => {
                let p_fixed = design.num_fixed();
                let mut output = Array1::<f64>::zeros(design.ncols);
                output
                    .slice_mut(s![..p_fixed])
                    .assign(&design.fixed.t().dot(vector));
                for factor in &design.factors {
                    for (&v, &level) in vector.iter().zip(factor.level_index.iter()) {
                        output[factor.offset + level] += v;
                    }
                }
                output
            }
        }
    }

    /// `X' diag(w) X`
    pub fn weighted_gram(&self, weights: ArrayView1<f64>) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => {
                let weighted = matrix * &weights.insert_axis(Axis(1));
                weighted.t().dot(matrix)
            }
            Self::Grouped(design) => {
                let p_fixed = design.num_fixed();
                let p = design.ncols;
                let mut gram = Array2::<f64>::zeros((p, p));

                let weighted_fixed = &design.fixed * &weights.insert_axis(Axis(1));
                gram.slice_mut(s![..p_fixed, ..p_fixed])
                    .assign(&weighted_fixed.t().dot(&design.fixed));

                let mut cols: Vec<usize> = Vec::with_capacity(design.factors.len());
                for (i, &w) in weights.iter().enumerate() {
                    cols.clear();
                    cols.extend(design.indicator_columns(i));
                    let wf = weighted_fixed.row(i);
                    for &c in &cols {
                        for j in 0..p_fixed {
                            gram[[j, c]] += wf[j];
                        }
                        for &c2 in &cols {
                            gram[[c, c2]] += w;
                        }
                    }
                }

                // Mirror the fixed-by-indicator block into the lower triangle.
                for j in 0..p_fixed {
                    for c in p_fixed..p {
                        gram[[c, j]] = gram[[j, c]];
                    }
                }
                gram
            }
        }
    }

    /// `diag(X'X)`, the squared norm of every column.
    pub fn column_squared_norms(&self) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.map_axis(Axis(0), |column| column.dot(&column)),
            Self::Grouped(design) => {
                let mut norms = Array1::<f64>::zeros(design.ncols);
                norms
                    .slice_mut(s![..design.num_fixed()])
                    .assign(&design.fixed.map_axis(Axis(0), |column| column.dot(&column)));
                for factor in &design.factors {
                    for &level in &factor.level_index {
                        norms[factor.offset + level] += 1.0;
                    }
                }
                norms
            }
        }
    }

    /// Per-row quadratic form `x_i' A x_i` for a symmetric `A`.
    ///
    /// With `A = H⁻¹` this gives the variance of each row's linear predictor and
    /// the leverage-type terms needed by the LAML gradient.
    pub fn quadratic_form_diag(&self, a: &Array2<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => (matrix.dot(a) * matrix).sum_axis(Axis(1)),
            Self::Grouped(design) => {
                let p_fixed = design.num_fixed();
                let a_ff = a.slice(s![..p_fixed, ..p_fixed]);
                let fixed_part = (design.fixed.dot(&a_ff) * &design.fixed).sum_axis(Axis(1));

                let mut cols: Vec<usize> = Vec::with_capacity(design.factors.len());
                let mut out = fixed_part;
                for (i, value) in out.iter_mut().enumerate() {
                    cols.clear();
                    cols.extend(design.indicator_columns(i));
                    let f = design.fixed.row(i);
                    for &c in &cols {
                        let cross: f64 = (0..p_fixed).map(|j| f[j] * a[[j, c]]).sum();
                        *value += 2.0 * cross;
                        for &c2 in &cols {
                            *value += a[[c, c2]];
                        }
                    }
                }
                out
            }
        }
    }

    /// The whole design as a dense matrix, indicator columns expanded to 0/1.
    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Grouped(design) => {
                let n = design.fixed.nrows();
                let p_fixed = design.num_fixed();
                let mut dense = Array2::<f64>::zeros((n, design.ncols));
                dense.slice_mut(s![.., ..p_fixed]).assign(&design.fixed);
                for i in 0..n {
                    for c in design.indicator_columns(i) {
                        dense[[i, c]] = 1.0;
                    }
                }
                dense
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grouped_fixture() -> DesignMatrix {
        let fixed = array![[1.0, 0.2], [1.0, 0.9], [1.0, 0.4], [1.0, 0.7]];
        DesignMatrix::Grouped(GroupedDesign::new(
            fixed,
            vec![(vec![0, 1, 1, 0], 2), (vec![2, 0, 1, 2], 3)],
        ))
    }

    #[test]
    fn grouped_products_match_dense_equivalent() {
        let grouped = grouped_fixture();
        let dense = DesignMatrix::Dense(grouped.to_dense());
        assert_eq!(grouped.ncols(), 7);

        let beta = array![0.5, -1.0, 0.3, -0.3, 0.1, 0.2, -0.4];
        let v = array![1.0, -2.0, 0.5, 3.0];
        let w = array![0.25, 0.1, 0.2, 0.05];

        assert!(
            grouped
                .matrix_vector_multiply(&beta)
                .abs_diff_eq(&dense.matrix_vector_multiply(&beta), 1e-12)
        );
        assert!(
            grouped
                .transpose_vector_multiply(&v)
                .abs_diff_eq(&dense.transpose_vector_multiply(&v), 1e-12)
        );
        assert!(
            grouped
                .weighted_gram(w.view())
                .abs_diff_eq(&dense.weighted_gram(w.view()), 1e-12)
        );
        assert!(
            grouped
                .column_squared_norms()
                .abs_diff_eq(&dense.column_squared_norms(), 1e-12)
        );
    }

    #[test]
    fn to_dense_expands_every_row_and_column() {
        let dense = grouped_fixture().to_dense();
        let expected = array![
            [1.0, 0.2, 1.0, 0.0, 0.0, 0.0, 1.0],
            [1.0, 0.9, 0.0, 1.0, 1.0, 0.0, 0.0],
            [1.0, 0.4, 0.0, 1.0, 0.0, 1.0, 0.0],
            [1.0, 0.7, 1.0, 0.0, 0.0, 0.0, 1.0],
        ];
        assert_eq!(dense, expected);
    }

    #[test]
    fn quadratic_form_diag_matches_dense() {
        let grouped = grouped_fixture();
        let dense = DesignMatrix::Dense(grouped.to_dense());
        let p = grouped.ncols();
        let b = Array2::from_shape_fn((p, p), |(i, j)| ((i * 7 + j * 3) % 5) as f64 - 2.0);
        let a = &b + &b.t();
        assert!(
            grouped
                .quadratic_form_diag(&a)
                .abs_diff_eq(&dense.quadratic_form_diag(&a), 1e-10)
        );
    }
}
