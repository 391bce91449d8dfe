//! Dense factorization and matrix-free solvers for Gaussian conditionals of the
//! form `N(Φ⁻¹ b, Φ⁻¹)`.

use faer::{
    linalg::{
        solvers::{Llt, Solve},
        triangular_solve::{solve_lower_triangular_in_place, solve_upper_triangular_in_place},
    },
    Mat, MatMut, MatRef, Par, Side,
};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    error::NumericalError,
    math::{axpy, axpy_out, multiply, norm, vector_dot},
};

/// A symmetric positive definite matrix that is only available through products.
pub trait LinearOperator {
    fn dim(&self) -> usize;

    /// `out = A x`
    fn apply(&self, x: &[f64], out: &mut [f64]);
}

/// A precision matrix with a known sum-of-squares structure `Φ = Σ_t B_tᵀ B_t`.
///
/// `sample_root_noise` must return `Σ_t B_tᵀ ε_t` for independent standard
/// normal `ε_t`, which is a draw from `N(0, Φ)`. Solving `Φ β = b + Σ_t B_tᵀ ε_t`
/// then yields an exact draw from `N(Φ⁻¹ b, Φ⁻¹)`. Noise injected in any
/// other way (for example only through one of the terms) biases the covariance
/// without any visible failure.
pub trait GaussianPrecision: LinearOperator {
    fn sample_root_noise<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]);

    fn diagonal(&self) -> Vec<f64>;

    fn to_dense(&self) -> Mat<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Preconditioner {
    Identity,
    /// Stores the inverse of a positive diagonal approximation of the operator.
    InverseDiagonal(Vec<f64>),
}

impl Preconditioner {
    pub fn from_diagonal(diagonal: &[f64]) -> Self {
        Preconditioner::InverseDiagonal(
            diagonal
                .iter()
                .map(|&d| if d > 0. && d.is_finite() { d.recip() } else { 1. })
                .collect(),
        )
    }

    fn apply(&self, residual: &[f64], out: &mut [f64]) {
        match self {
            Preconditioner::Identity => out.copy_from_slice(residual),
            Preconditioner::InverseDiagonal(inv) => multiply(inv, residual, out),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgOutcome {
    pub solution: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    /// `‖b - A x‖ / ‖b‖` at the returned solution.
    pub relative_residual: f64,
}

/// Preconditioned conjugate gradients for `A x = rhs`.
///
/// Stops once `‖r‖ ≤ tol ‖rhs‖`. Running out of iterations is not an error: the
/// caller receives the last iterate with `converged = false`.
pub fn solve_via_cg<A: LinearOperator + ?Sized>(
    operator: &A,
    rhs: &[f64],
    preconditioner: &Preconditioner,
    initial: Option<&[f64]>,
    tol: f64,
    max_iter: usize,
) -> CgOutcome {
    let n = operator.dim();
    assert!(rhs.len() == n);

    let rhs_norm = norm(rhs);
    if rhs_norm == 0. {
        return CgOutcome {
            solution: vec![0f64; n],
            converged: true,
            iterations: 0,
            relative_residual: 0.,
        };
    }

    let mut x = match initial {
        Some(init) => {
            assert!(init.len() == n);
            init.to_vec()
        }
        None => vec![0f64; n],
    };
    let mut scratch = vec![0f64; n];
    let mut residual = vec![0f64; n];
    operator.apply(&x, &mut scratch);
    axpy_out(rhs, &scratch, -1., &mut residual);

    let mut z = vec![0f64; n];
    preconditioner.apply(&residual, &mut z);
    let mut direction = z.clone();
    let mut rz = vector_dot(&residual, &z);

    let mut iterations = 0;
    let mut residual_norm = norm(&residual);
    while residual_norm > tol * rhs_norm && iterations < max_iter {
        operator.apply(&direction, &mut scratch);
        let curvature = vector_dot(&direction, &scratch);
        if !(curvature > 0.) {
            // Loss of positive definiteness or a breakdown: report what we have.
            break;
        }
        let step = rz / curvature;
        axpy(&direction, &mut x, step);
        axpy(&scratch, &mut residual, -step);

        preconditioner.apply(&residual, &mut z);
        let rz_next = vector_dot(&residual, &z);
        let beta = rz_next / rz;
        rz = rz_next;
        for (d, &zi) in direction.iter_mut().zip(&z) {
            *d = zi + beta * *d;
        }

        iterations += 1;
        residual_norm = norm(&residual);
    }

    let relative_residual = residual_norm / rhs_norm;
    CgOutcome {
        solution: x,
        converged: relative_residual <= tol,
        iterations,
        relative_residual,
    }
}

/// Cholesky factorization `A = L Lᵀ` of a dense precision matrix.
#[derive(Debug, Clone)]
pub struct CholeskyFactor {
    llt: Llt<f64>,
}

pub fn factorize_cholesky(matrix: MatRef<'_, f64>) -> Result<CholeskyFactor, NumericalError> {
    let dim = matrix.nrows();
    assert!(matrix.ncols() == dim);
    for j in 0..dim {
        for i in j..dim {
            let value = matrix[(i, j)];
            if !value.is_finite() {
                return Err(NumericalError::NonFinite {
                    context: "matrix to factorize",
                    value,
                });
            }
        }
    }
    let llt = matrix
        .llt(Side::Lower)
        .map_err(|_| NumericalError::NotPositiveDefinite { dim })?;
    Ok(CholeskyFactor { llt })
}

impl CholeskyFactor {
    pub fn dim(&self) -> usize {
        self.llt.L().nrows()
    }

    /// Overwrite `b` with `L⁻¹ b`.
    pub fn solve_lower_in_place(&self, b: &mut [f64]) {
        let n = self.dim();
        assert!(b.len() == n);
        solve_lower_triangular_in_place(
            self.llt.L(),
            MatMut::from_column_major_slice_mut(b, n, 1),
            Par::Seq,
        );
    }

    /// Overwrite `b` with `L⁻ᵀ b`.
    pub fn solve_upper_in_place(&self, b: &mut [f64]) {
        let n = self.dim();
        assert!(b.len() == n);
        solve_upper_triangular_in_place(
            self.llt.L().transpose(),
            MatMut::from_column_major_slice_mut(b, n, 1),
            Par::Seq,
        );
    }

    /// `A⁻¹ rhs`
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        let n = self.dim();
        assert!(rhs.len() == n);
        let mut x = rhs.to_vec();
        self.llt
            .solve_in_place(MatMut::from_column_major_slice_mut(&mut x, n, 1));
        x
    }

    pub fn log_determinant(&self) -> f64 {
        let lower = self.llt.L();
        2. * (0..self.dim()).map(|j| lower[(j, j)].ln()).sum::<f64>()
    }
}

/// Exact draw from `N(Φ⁻¹ b, Φ⁻¹)` via `β = L⁻ᵀ (L⁻¹ b + ε)`.
pub fn sample_gaussian_direct<R: Rng + ?Sized>(
    precision: MatRef<'_, f64>,
    linear_term: &[f64],
    rng: &mut R,
) -> Result<Vec<f64>, NumericalError> {
    let factor = factorize_cholesky(precision)?;
    let mut draw = linear_term.to_vec();
    factor.solve_lower_in_place(&mut draw);
    for value in draw.iter_mut() {
        *value += rng.sample::<f64, _>(StandardNormal);
    }
    factor.solve_upper_in_place(&mut draw);
    Ok(draw)
}

#[derive(Debug, Clone)]
pub struct CgSample {
    pub outcome: CgOutcome,
    /// The right-hand side `b + Σ_t B_tᵀ ε_t` that was solved; a fallback solver
    /// must reuse it to keep the draw exact.
    pub perturbed_rhs: Vec<f64>,
}

/// Draw from `N(Φ⁻¹ b, Φ⁻¹)` by solving one perturbed system with CG.
pub fn sample_gaussian_via_cg<P: GaussianPrecision, R: Rng + ?Sized>(
    precision: &P,
    linear_term: &[f64],
    preconditioner: &Preconditioner,
    initial: Option<&[f64]>,
    tol: f64,
    max_iter: usize,
    rng: &mut R,
) -> CgSample {
    let mut perturbed_rhs = vec![0f64; precision.dim()];
    precision.sample_root_noise(rng, &mut perturbed_rhs);
    axpy(linear_term, &mut perturbed_rhs, 1.);
    let outcome = solve_via_cg(
        precision,
        &perturbed_rhs,
        preconditioner,
        initial,
        tol,
        max_iter,
    );
    CgSample {
        outcome,
        perturbed_rhs,
    }
}
