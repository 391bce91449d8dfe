use faer::{
    sparse::{SparseColMat, Triplet},
    Mat,
};
use rayon::prelude::*;

use crate::{
    error::BridgeError,
    likelihood::Weights,
    math::{axpy, vector_dot},
};

/// Below this many touched entries the products run on the calling thread.
const PARALLEL_MIN_ENTRIES: usize = 1 << 16;
const ROW_CHUNK: usize = 1024;

/// The full `n × p` design matrix. Only the columns of the active set take part
/// in any product, so the per-sweep cost scales with `k`, not `p`.
#[derive(Debug, Clone)]
pub enum DesignMatrix {
    Dense(Mat<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl DesignMatrix {
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, BridgeError> {
        let nrows = rows.len();
        let ncols = rows.first().map(|row| row.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|row| row.len() != ncols) {
            return Err(BridgeError::Configuration(format!(
                "design row {} has {} entries, expected {}",
                bad,
                rows[bad].len(),
                ncols
            )));
        }
        Self::dense(Mat::from_fn(nrows, ncols, |i, j| rows[i][j]))
    }

    pub fn dense(matrix: Mat<f64>) -> Result<Self, BridgeError> {
        for j in 0..matrix.ncols() {
            if let Some(&value) = matrix.col_as_slice(j).iter().find(|x| !x.is_finite()) {
                return Err(BridgeError::domain(
                    "design entry",
                    value,
                    "design matrix entries must be finite",
                ));
            }
        }
        Ok(DesignMatrix::Dense(matrix))
    }

    /// Build a sparse design from `(row, column, value)` entries.
    pub fn sparse_from_triplets(
        nrows: usize,
        ncols: usize,
        entries: &[(usize, usize, f64)],
    ) -> Result<Self, BridgeError> {
        if let Some(&(_, _, value)) = entries.iter().find(|(_, _, v)| !v.is_finite()) {
            return Err(BridgeError::domain(
                "design entry",
                value,
                "design matrix entries must be finite",
            ));
        }
        let triplets: Vec<Triplet<usize, usize, f64>> = entries
            .iter()
            .map(|&(row, col, value)| Triplet::new(row, col, value))
            .collect();
        let matrix = SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(
            |err| BridgeError::Configuration(format!("invalid sparse design: {err:?}")),
        )?;
        Ok(DesignMatrix::Sparse(matrix))
    }

    pub fn nrows(&self) -> usize {
        match self {
            DesignMatrix::Dense(x) => x.nrows(),
            DesignMatrix::Sparse(x) => x.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            DesignMatrix::Dense(x) => x.ncols(),
            DesignMatrix::Sparse(x) => x.ncols(),
        }
    }

    /// `out += a * x_j`
    pub(crate) fn column_axpy(&self, j: usize, a: f64, out: &mut [f64]) {
        assert!(out.len() == self.nrows());
        match self {
            DesignMatrix::Dense(x) => axpy(x.col_as_slice(j), out, a),
            DesignMatrix::Sparse(x) => {
                let (rows, values) = sparse_column(x, j);
                for (&i, &v) in rows.iter().zip(values) {
                    out[i] += a * v;
                }
            }
        }
    }

    /// `x_jᵀ v`
    pub(crate) fn column_dot(&self, j: usize, v: &[f64]) -> f64 {
        assert!(v.len() == self.nrows());
        match self {
            DesignMatrix::Dense(x) => vector_dot(x.col_as_slice(j), v),
            DesignMatrix::Sparse(x) => {
                let (rows, values) = sparse_column(x, j);
                rows.iter().zip(values).map(|(&i, &val)| val * v[i]).sum()
            }
        }
    }

    /// `out = X_A β`
    pub fn predict(&self, active: &[usize], coefficients: &[f64], out: &mut [f64]) {
        assert!(active.len() == coefficients.len());
        assert!(out.len() == self.nrows());
        out.fill(0f64);
        match self {
            DesignMatrix::Dense(x) if self.nrows() * active.len() >= PARALLEL_MIN_ENTRIES => {
                // Each row chunk accumulates the columns in the same order as the
                // sequential loop, so the result does not depend on the thread count.
                out.par_chunks_mut(ROW_CHUNK)
                    .enumerate()
                    .for_each(|(chunk_idx, chunk)| {
                        let start = chunk_idx * ROW_CHUNK;
                        let end = start + chunk.len();
                        for (&j, &beta) in active.iter().zip(coefficients) {
                            axpy(&x.col_as_slice(j)[start..end], chunk, beta);
                        }
                    });
            }
            _ => {
                for (&j, &beta) in active.iter().zip(coefficients) {
                    self.column_axpy(j, beta, out);
                }
            }
        }
    }

    /// `out = X_Aᵀ v`
    pub fn transpose_predict(&self, active: &[usize], v: &[f64], out: &mut [f64]) {
        assert!(active.len() == out.len());
        if self.nrows() * active.len() >= PARALLEL_MIN_ENTRIES {
            out.par_iter_mut()
                .zip(active.par_iter())
                .for_each(|(out, &j)| *out = self.column_dot(j, v));
        } else {
            out.iter_mut()
                .zip(active)
                .for_each(|(out, &j)| *out = self.column_dot(j, v));
        }
    }

    /// Dense copy of the active columns, `n × k`.
    pub(crate) fn active_columns(&self, active: &[usize]) -> Mat<f64> {
        let mut columns = Mat::zeros(self.nrows(), active.len());
        for (c, &j) in active.iter().enumerate() {
            let dest = columns.col_as_slice_mut(c);
            match self {
                DesignMatrix::Dense(x) => dest.copy_from_slice(x.col_as_slice(j)),
                DesignMatrix::Sparse(x) => {
                    let (rows, values) = sparse_column(x, j);
                    for (&i, &v) in rows.iter().zip(values) {
                        dest[i] = v;
                    }
                }
            }
        }
        columns
    }

    /// `X_Aᵀ W X_A`
    pub fn weighted_gram(&self, active: &[usize], weights: &Weights) -> Mat<f64> {
        let xa = self.active_columns(active);
        let wxa = Mat::from_fn(xa.nrows(), xa.ncols(), |i, c| weights.get(i) * xa[(i, c)]);
        xa.transpose() * &wxa
    }

    /// Diagonal of `X_Aᵀ W X_A` without forming the product.
    pub(crate) fn weighted_column_norms(&self, active: &[usize], weights: &Weights) -> Vec<f64> {
        active
            .iter()
            .map(|&j| match self {
                DesignMatrix::Dense(x) => x
                    .col_as_slice(j)
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| weights.get(i) * v * v)
                    .sum(),
                DesignMatrix::Sparse(x) => {
                    let (rows, values) = sparse_column(x, j);
                    rows.iter()
                        .zip(values)
                        .map(|(&i, &v)| weights.get(i) * v * v)
                        .sum()
                }
            })
            .collect()
    }
}

fn sparse_column(matrix: &SparseColMat<usize, f64>, j: usize) -> (&[usize], &[f64]) {
    let (symbolic, values) = matrix.as_ref().parts();
    let col_ptr = symbolic.col_ptr();
    let range = col_ptr[j]..col_ptr[j + 1];
    (&symbolic.row_idx()[range.clone()], &values[range])
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn dense_and_sparse() -> (DesignMatrix, DesignMatrix) {
        let rows = vec![
            vec![1., 0., 2., 0.],
            vec![0., 3., 0., -1.],
            vec![4., 0., 0., 0.5],
        ];
        let mut entries = vec![];
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if v != 0. {
                    entries.push((i, j, v));
                }
            }
        }
        (
            DesignMatrix::from_rows(&rows).unwrap(),
            DesignMatrix::sparse_from_triplets(3, 4, &entries).unwrap(),
        )
    }

    #[test]
    fn dense_and_sparse_products_agree() {
        let (dense, sparse) = dense_and_sparse();
        let active = [3, 0, 2];
        let beta = [2., -1., 0.5];

        let mut out_dense = vec![0.; 3];
        let mut out_sparse = vec![0.; 3];
        dense.predict(&active, &beta, &mut out_dense);
        sparse.predict(&active, &beta, &mut out_sparse);
        assert_eq!(out_dense, vec![0., -2., -3.]);
        assert_eq!(out_dense, out_sparse);

        let v = [1., 2., 3.];
        let mut t_dense = vec![0.; 3];
        let mut t_sparse = vec![0.; 3];
        dense.transpose_predict(&active, &v, &mut t_dense);
        sparse.transpose_predict(&active, &v, &mut t_sparse);
        assert_eq!(t_dense, vec![-0.5, 13., 2.]);
        assert_eq!(t_dense, t_sparse);

        let weights = Weights::Diagonal(vec![1., 2., 0.5]);
        let gram_dense = dense.weighted_gram(&active, &weights);
        let gram_sparse = sparse.weighted_gram(&active, &weights);
        let norms = sparse.weighted_column_norms(&active, &weights);
        for a in 0..3 {
            assert_abs_diff_eq!(gram_dense[(a, a)], norms[a], epsilon = 1e-12);
            for b in 0..3 {
                assert_abs_diff_eq!(gram_dense[(a, b)], gram_sparse[(a, b)], epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(gram_dense[(0, 1)], 2. * 0. * -1. + 0.5 * 0.5 * 4., epsilon = 1e-12);
    }

    #[test]
    fn parallel_predict_matches_sequential() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 5000;
        let p = 30;
        let x = Mat::from_fn(n, p, |_, _| rng.random::<f64>() - 0.5);
        let design = DesignMatrix::dense(x).unwrap();
        let active: Vec<usize> = (0..p).rev().collect();
        let beta: Vec<f64> = (0..p).map(|i| i as f64 * 0.1 - 1.).collect();

        let mut parallel = vec![0.; n];
        design.predict(&active, &beta, &mut parallel);

        let mut sequential = vec![0.; n];
        for (&j, &b) in active.iter().zip(&beta) {
            design.column_axpy(j, b, &mut sequential);
        }
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn rejects_ragged_rows() {
        let rows = vec![vec![1., 2.], vec![1.]];
        assert!(matches!(
            DesignMatrix::from_rows(&rows),
            Err(BridgeError::Configuration(_))
        ));
    }
}
