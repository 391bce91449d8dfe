use faer::Mat;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    design::DesignMatrix,
    error::NumericalError,
    likelihood::{Weights, WorkingResponse},
    linalg::{
        factorize_cholesky, sample_gaussian_direct, sample_gaussian_via_cg, GaussianPrecision,
        LinearOperator, Preconditioner,
    },
};

/// Preconditioner used by the conjugate gradient path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreconditionerKind {
    Identity,
    /// Diagonal of the prior precision only.
    Prior,
    /// Diagonal of the full conditional precision.
    #[default]
    Jacobi,
}

/// Settings of the coefficient sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgOptions {
    /// Relative residual at which CG stops.
    pub tolerance: f64,
    /// Iteration budget of a single CG solve.
    pub max_iterations: usize,
    /// Active sets up to this size are sampled by dense Cholesky.
    pub threshold: usize,
    pub preconditioner: PreconditionerKind,
}

impl Default for CgOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 500,
            threshold: 200,
            preconditioner: PreconditionerKind::default(),
        }
    }
}

/// The conditional precision `Φ = X_Aᵀ W X_A + D` of the active coefficients,
/// applied without forming it. Its square-root terms are `W^{1/2} X_A` and `D^{1/2}`.
pub struct RegressionPrecision<'a> {
    design: &'a DesignMatrix,
    active: &'a [usize],
    weights: &'a Weights,
    prior_precision: &'a [f64],
}

impl<'a> RegressionPrecision<'a> {
    pub fn new(
        design: &'a DesignMatrix,
        active: &'a [usize],
        weights: &'a Weights,
        prior_precision: &'a [f64],
    ) -> Self {
        assert!(active.len() == prior_precision.len());
        Self {
            design,
            active,
            weights,
            prior_precision,
        }
    }
}

impl LinearOperator for RegressionPrecision<'_> {
    fn dim(&self) -> usize {
        self.active.len()
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        let mut fitted = vec![0f64; self.design.nrows()];
        self.design.predict(self.active, x, &mut fitted);
        for (i, value) in fitted.iter_mut().enumerate() {
            *value *= self.weights.get(i);
        }
        self.design.transpose_predict(self.active, &fitted, out);
        for ((out, &d), &x) in out.iter_mut().zip(self.prior_precision).zip(x) {
            *out += d * x;
        }
    }
}

impl GaussianPrecision for RegressionPrecision<'_> {
    fn sample_root_noise<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        let noise: Vec<f64> = (0..self.design.nrows())
            .map(|i| self.weights.get(i).sqrt() * rng.sample::<f64, _>(StandardNormal))
            .collect();
        self.design.transpose_predict(self.active, &noise, out);
        for (out, &d) in out.iter_mut().zip(self.prior_precision) {
            *out += d.sqrt() * rng.sample::<f64, _>(StandardNormal);
        }
    }

    fn diagonal(&self) -> Vec<f64> {
        let mut diag = self.design.weighted_column_norms(self.active, self.weights);
        for (diag, &d) in diag.iter_mut().zip(self.prior_precision) {
            *diag += d;
        }
        diag
    }

    fn to_dense(&self) -> Mat<f64> {
        let mut phi = self.design.weighted_gram(self.active, self.weights);
        for (j, &d) in self.prior_precision.iter().enumerate() {
            phi[(j, j)] += d;
        }
        phi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    Direct,
    ConjugateGradient { iterations: usize },
    /// CG did not converge and the perturbed system was solved by Cholesky.
    Fallback { iterations: usize },
}

#[derive(Debug, Clone)]
pub struct CoefficientDraw {
    pub coefficients: Vec<f64>,
    pub method: SolveMethod,
}

/// Draws the active coefficients from `N(Φ⁻¹ X_Aᵀ W z, Φ⁻¹)`.
#[derive(Debug, Clone)]
pub struct CoefficientSampler {
    options: CgOptions,
}

impl CoefficientSampler {
    pub fn new(options: CgOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CgOptions {
        &self.options
    }

    pub(crate) fn set_max_iterations(&mut self, max_iterations: usize) {
        self.options.max_iterations = max_iterations;
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        design: &DesignMatrix,
        active: &[usize],
        working: &WorkingResponse,
        prior_precision: &[f64],
        warm_start: &[f64],
        rng: &mut R,
    ) -> Result<CoefficientDraw, NumericalError> {
        let k = active.len();
        if k == 0 {
            return Ok(CoefficientDraw {
                coefficients: vec![],
                method: SolveMethod::Direct,
            });
        }

        let mut linear_term = vec![0f64; k];
        design.transpose_predict(active, &working.weighted_response, &mut linear_term);
        let precision = RegressionPrecision::new(design, active, &working.weights, prior_precision);

        let draw = if k <= self.options.threshold {
            let phi = precision.to_dense();
            CoefficientDraw {
                coefficients: sample_gaussian_direct(phi.as_ref(), &linear_term, rng)?,
                method: SolveMethod::Direct,
            }
        } else {
            let preconditioner = match self.options.preconditioner {
                PreconditionerKind::Identity => Preconditioner::Identity,
                PreconditionerKind::Prior => Preconditioner::from_diagonal(prior_precision),
                PreconditionerKind::Jacobi => Preconditioner::from_diagonal(&precision.diagonal()),
            };
            let warm_start = (warm_start.len() == k).then_some(warm_start);
            let sample = sample_gaussian_via_cg(
                &precision,
                &linear_term,
                &preconditioner,
                warm_start,
                self.options.tolerance,
                self.options.max_iterations,
                rng,
            );
            let iterations = sample.outcome.iterations;
            if sample.outcome.converged {
                CoefficientDraw {
                    coefficients: sample.outcome.solution,
                    method: SolveMethod::ConjugateGradient { iterations },
                }
            } else {
                log::warn!(
                    "conjugate gradient stopped at relative residual {:.3e} after {} iterations \
                     for {} coefficients, falling back to Cholesky",
                    sample.outcome.relative_residual,
                    iterations,
                    k
                );
                let factor = factorize_cholesky(precision.to_dense().as_ref())?;
                CoefficientDraw {
                    coefficients: factor.solve(&sample.perturbed_rhs),
                    method: SolveMethod::Fallback { iterations },
                }
            }
        };

        if let Some(&value) = draw.coefficients.iter().find(|x| !x.is_finite()) {
            return Err(NumericalError::NonFinite {
                context: "coefficient draw",
                value,
            });
        }
        Ok(draw)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    struct Problem {
        design: DesignMatrix,
        active: Vec<usize>,
        working: WorkingResponse,
        prior_precision: Vec<f64>,
    }

    fn problem() -> Problem {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 40;
        let p = 8;
        let x = Mat::from_fn(n, p, |_, _| rng.sample::<f64, _>(StandardNormal));
        let weights: Vec<f64> = (0..n).map(|i| 0.5 + (i % 5) as f64 * 0.3).collect();
        let weighted_response = (0..n).map(|i| (i as f64 * 0.7).sin()).collect();
        Problem {
            design: DesignMatrix::dense(x).unwrap(),
            active: vec![6, 1, 3, 0, 5],
            working: WorkingResponse {
                weights: Weights::Diagonal(weights),
                weighted_response,
            },
            prior_precision: vec![0.5, 2., 10., 0.1, 1.],
        }
    }

    /// Exact mean and covariance of the conditional.
    fn exact_moments(problem: &Problem) -> (Vec<f64>, Mat<f64>) {
        let k = problem.active.len();
        let precision = RegressionPrecision::new(
            &problem.design,
            &problem.active,
            &problem.working.weights,
            &problem.prior_precision,
        );
        let factor = factorize_cholesky(precision.to_dense().as_ref()).unwrap();
        let mut b = vec![0.; k];
        problem
            .design
            .transpose_predict(&problem.active, &problem.working.weighted_response, &mut b);
        let mean = factor.solve(&b);
        let mut cov = Mat::zeros(k, k);
        for j in 0..k {
            let mut unit = vec![0.; k];
            unit[j] = 1.;
            cov.col_as_slice_mut(j).copy_from_slice(&factor.solve(&unit));
        }
        (mean, cov)
    }

    /// Largest moment discrepancy in units of its Monte Carlo standard error.
    fn max_standardized_error(draws: &[Vec<f64>], mean: &[f64], cov: &Mat<f64>) -> f64 {
        let k = mean.len();
        let n = draws.len() as f64;
        let sample_mean: Vec<f64> = (0..k)
            .map(|j| draws.iter().map(|d| d[j]).sum::<f64>() / n)
            .collect();
        let mut worst = 0f64;
        for a in 0..k {
            let se = (cov[(a, a)] / n).sqrt();
            worst = worst.max((sample_mean[a] - mean[a]).abs() / se);
            for b in 0..k {
                let sample_cov = draws
                    .iter()
                    .map(|d| (d[a] - mean[a]) * (d[b] - mean[b]))
                    .sum::<f64>()
                    / n;
                let se = ((cov[(a, a)] * cov[(b, b)] + cov[(a, b)].powi(2)) / n).sqrt();
                worst = worst.max((sample_cov - cov[(a, b)]).abs() / se);
            }
        }
        worst
    }

    fn draws_with(problem: &Problem, options: CgOptions, seed: u64) -> (Vec<Vec<f64>>, SolveMethod) {
        let sampler = CoefficientSampler::new(options);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut method = SolveMethod::Direct;
        let mut current = vec![0.; problem.active.len()];
        let draws = (0..10_000)
            .map(|_| {
                let draw = sampler
                    .sample(
                        &problem.design,
                        &problem.active,
                        &problem.working,
                        &problem.prior_precision,
                        &current,
                        &mut rng,
                    )
                    .unwrap();
                method = draw.method;
                current = draw.coefficients.clone();
                draw.coefficients
            })
            .collect();
        (draws, method)
    }

    #[test]
    fn cg_and_direct_moments_agree() {
        let problem = problem();
        let (mean, cov) = exact_moments(&problem);

        let direct = CgOptions {
            threshold: usize::MAX,
            ..CgOptions::default()
        };
        let (draws, method) = draws_with(&problem, direct, 1);
        assert_eq!(method, SolveMethod::Direct);
        let err = max_standardized_error(&draws, &mean, &cov);
        assert!(err < 5., "direct sampler off by {err} standard errors");

        for preconditioner in [
            PreconditionerKind::Identity,
            PreconditionerKind::Prior,
            PreconditionerKind::Jacobi,
        ] {
            let cg = CgOptions {
                threshold: 0,
                preconditioner,
                ..CgOptions::default()
            };
            let (draws, method) = draws_with(&problem, cg, 2);
            assert!(matches!(method, SolveMethod::ConjugateGradient { .. }));
            let err = max_standardized_error(&draws, &mean, &cov);
            assert!(
                err < 5.,
                "{preconditioner:?} CG sampler off by {err} standard errors"
            );
        }
    }

    /// Injecting noise through the prior term only must be caught by the moment check.
    #[test]
    fn moment_check_detects_wrong_noise() {
        struct PriorNoiseOnly<'a>(RegressionPrecision<'a>);

        impl LinearOperator for PriorNoiseOnly<'_> {
            fn dim(&self) -> usize {
                self.0.dim()
            }
            fn apply(&self, x: &[f64], out: &mut [f64]) {
                self.0.apply(x, out)
            }
        }

        impl GaussianPrecision for PriorNoiseOnly<'_> {
            fn sample_root_noise<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
                for (out, &d) in out.iter_mut().zip(self.0.prior_precision) {
                    *out = d.sqrt() * rng.sample::<f64, _>(StandardNormal);
                }
            }
            fn diagonal(&self) -> Vec<f64> {
                self.0.diagonal()
            }
            fn to_dense(&self) -> Mat<f64> {
                self.0.to_dense()
            }
        }

        let problem = problem();
        let (mean, cov) = exact_moments(&problem);
        let precision = PriorNoiseOnly(RegressionPrecision::new(
            &problem.design,
            &problem.active,
            &problem.working.weights,
            &problem.prior_precision,
        ));
        let mut b = vec![0.; problem.active.len()];
        problem
            .design
            .transpose_predict(&problem.active, &problem.working.weighted_response, &mut b);
        let mut rng = StdRng::seed_from_u64(3);
        let draws: Vec<Vec<f64>> = (0..10_000)
            .map(|_| {
                sample_gaussian_via_cg(
                    &precision,
                    &b,
                    &Preconditioner::Identity,
                    None,
                    1e-10,
                    500,
                    &mut rng,
                )
                .outcome
                .solution
            })
            .collect();
        assert!(max_standardized_error(&draws, &mean, &cov) > 10.);
    }

    #[test]
    fn falls_back_when_cg_stalls() {
        let problem = problem();
        let sampler = CoefficientSampler::new(CgOptions {
            threshold: 0,
            max_iterations: 1,
            tolerance: 1e-14,
            ..CgOptions::default()
        });
        let mut rng = StdRng::seed_from_u64(42);
        let draw = sampler
            .sample(
                &problem.design,
                &problem.active,
                &problem.working,
                &problem.prior_precision,
                &[],
                &mut rng,
            )
            .unwrap();
        assert_eq!(draw.method, SolveMethod::Fallback { iterations: 1 });
        assert_eq!(draw.coefficients.len(), 5);
    }

    #[test]
    fn empty_active_set() {
        let problem = problem();
        let sampler = CoefficientSampler::new(CgOptions::default());
        let mut rng = StdRng::seed_from_u64(42);
        let draw = sampler
            .sample(&problem.design, &[], &problem.working, &[], &[], &mut rng)
            .unwrap();
        assert!(draw.coefficients.is_empty());
    }

    #[test]
    fn indefinite_prior_fails_direct_path() {
        let problem = problem();
        let sampler = CoefficientSampler::new(CgOptions::default());
        let mut rng = StdRng::seed_from_u64(42);
        let working = WorkingResponse {
            weights: Weights::Constant(0.),
            weighted_response: vec![0.; 40],
        };
        let err = sampler
            .sample(
                &problem.design,
                &problem.active,
                &working,
                &[1., -1., 1., 1., 1.],
                &[],
                &mut rng,
            )
            .unwrap_err();
        assert_eq!(err, NumericalError::NotPositiveDefinite { dim: 5 });
    }
}
