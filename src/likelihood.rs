use std::fmt::Debug;

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::{
    error::{check_finite, BridgeError, NumericalError},
    polya_gamma::sample_polya_gamma,
};

/// Diagonal observation weights `W` of the conditionally Gaussian working model.
#[derive(Debug, Clone, PartialEq)]
pub enum Weights {
    /// `W = c I`
    Constant(f64),
    Diagonal(Vec<f64>),
}

impl Weights {
    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        match self {
            Weights::Constant(c) => *c,
            Weights::Diagonal(w) => w[i],
        }
    }
}

/// The Gaussian working model `z ~ N(η, W⁻¹)` implied by the current latent variables,
/// stored as `W` and the weighted pseudo-response `W z`.
#[derive(Debug, Clone)]
pub struct WorkingResponse {
    pub weights: Weights,
    pub weighted_response: Vec<f64>,
}

/// A regression family, made conditionally Gaussian in the linear predictor
/// `η = X_A β` by family-specific latent variables.
///
/// Implementations are stateless with respect to the chain: the latent
/// variables live in the model state and are passed in explicitly, so a
/// proposal can evaluate a modified `η` without touching the current state.
pub trait Likelihood: Clone + Send + Sync + 'static {
    type Latent: Clone + Debug + PartialEq + Send + Sync;

    fn num_observations(&self) -> usize;

    fn initial_latent(&self) -> Self::Latent;

    /// Draw the latent variables from their full conditional given `η`.
    fn sample_latent<R: Rng + ?Sized>(
        &self,
        current: &Self::Latent,
        linear_predictor: &[f64],
        rng: &mut R,
    ) -> Result<Self::Latent, BridgeError>;

    fn working_response(&self, latent: &Self::Latent) -> WorkingResponse;

    /// Log-likelihood of `η` conditional on the latent variables, up to a
    /// constant that does not depend on `η`.
    fn log_likelihood(&self, latent: &Self::Latent, linear_predictor: &[f64]) -> f64;

    /// Scalar summary of the latent variables stored with each snapshot.
    fn dispersion(&self, _latent: &Self::Latent) -> Option<f64> {
        None
    }
}

/// Prior of the Gaussian noise variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseVariance {
    Known(f64),
    /// Inverse-gamma prior; `shape = scale = 0` is the Jeffreys prior.
    InverseGamma { shape: f64, scale: f64 },
}

impl Default for NoiseVariance {
    fn default() -> Self {
        NoiseVariance::InverseGamma {
            shape: 0.,
            scale: 0.,
        }
    }
}

/// Linear regression `y ~ N(η, σ² I)`. The latent variable is `σ²`.
#[derive(Debug, Clone)]
pub struct GaussianLikelihood {
    response: Vec<f64>,
    variance: NoiseVariance,
}

impl GaussianLikelihood {
    pub fn new(response: Vec<f64>, variance: NoiseVariance) -> Result<Self, BridgeError> {
        if let Some(&value) = response.iter().find(|y| !y.is_finite()) {
            return Err(BridgeError::domain("response", value, "responses must be finite"));
        }
        match variance {
            NoiseVariance::Known(var) if !(var > 0. && var.is_finite()) => {
                return Err(BridgeError::domain(
                    "noise variance",
                    var,
                    "a known variance must be positive",
                ))
            }
            NoiseVariance::InverseGamma { shape, scale } if !(shape >= 0. && scale >= 0.) => {
                return Err(BridgeError::domain(
                    "noise variance prior",
                    shape.min(scale),
                    "inverse-gamma parameters must be non-negative",
                ))
            }
            _ => {}
        }
        Ok(Self { response, variance })
    }

    fn residual_sum_of_squares(&self, linear_predictor: &[f64]) -> f64 {
        self.response
            .iter()
            .zip(linear_predictor)
            .map(|(y, eta)| (y - eta).powi(2))
            .sum()
    }
}

impl Likelihood for GaussianLikelihood {
    type Latent = f64;

    fn num_observations(&self) -> usize {
        self.response.len()
    }

    fn initial_latent(&self) -> f64 {
        match self.variance {
            NoiseVariance::Known(var) => var,
            NoiseVariance::InverseGamma { .. } => {
                let n = self.response.len().max(1) as f64;
                let mean = self.response.iter().sum::<f64>() / n;
                let var = self.response.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
                if var > 0. {
                    var
                } else {
                    1.
                }
            }
        }
    }

    fn sample_latent<R: Rng + ?Sized>(
        &self,
        _current: &f64,
        linear_predictor: &[f64],
        rng: &mut R,
    ) -> Result<f64, BridgeError> {
        let (shape, scale) = match self.variance {
            NoiseVariance::Known(var) => return Ok(var),
            NoiseVariance::InverseGamma { shape, scale } => (shape, scale),
        };
        let rss = check_finite("residual sum of squares", self.residual_sum_of_squares(linear_predictor))?;
        let post_shape = shape + 0.5 * self.response.len() as f64;
        let post_rate = scale + 0.5 * rss;
        let precision = Gamma::new(post_shape, 1. / post_rate)
            .map_err(|_| NumericalError::NonFinite {
                context: "noise variance posterior rate",
                value: post_rate,
            })?
            .sample(rng);
        Ok(check_finite("noise variance", precision.recip())?)
    }

    fn working_response(&self, variance: &f64) -> WorkingResponse {
        let precision = variance.recip();
        WorkingResponse {
            weights: Weights::Constant(precision),
            weighted_response: self.response.iter().map(|y| y * precision).collect(),
        }
    }

    fn log_likelihood(&self, variance: &f64, linear_predictor: &[f64]) -> f64 {
        let n = self.response.len() as f64;
        -0.5 * n * variance.ln() - 0.5 * self.residual_sum_of_squares(linear_predictor) / variance
    }

    fn dispersion(&self, variance: &f64) -> Option<f64> {
        Some(*variance)
    }
}

/// Binomial regression with the logit link, `y_i ~ Bin(n_i, σ(η_i))`, made
/// conditionally Gaussian with Pólya-Gamma variables `ω_i ~ PG(n_i, η_i)`.
#[derive(Debug, Clone)]
pub struct LogisticLikelihood {
    trials: Vec<u32>,
    /// `y - n/2`
    kappa: Vec<f64>,
}

impl LogisticLikelihood {
    /// Bernoulli responses coded as 0/1.
    pub fn bernoulli(outcomes: &[bool]) -> Self {
        Self {
            trials: vec![1; outcomes.len()],
            kappa: outcomes
                .iter()
                .map(|&y| if y { 0.5 } else { -0.5 })
                .collect(),
        }
    }

    pub fn binomial(successes: &[u32], trials: &[u32]) -> Result<Self, BridgeError> {
        if successes.len() != trials.len() {
            return Err(BridgeError::Configuration(format!(
                "{} success counts for {} trial counts",
                successes.len(),
                trials.len()
            )));
        }
        if let Some((&y, _)) = successes.iter().zip(trials).find(|(y, n)| y > n) {
            return Err(BridgeError::domain(
                "successes",
                y as f64,
                "success count exceeds the number of trials",
            ));
        }
        Ok(Self {
            trials: trials.to_vec(),
            kappa: successes
                .iter()
                .zip(trials)
                .map(|(&y, &n)| y as f64 - 0.5 * n as f64)
                .collect(),
        })
    }
}

impl Likelihood for LogisticLikelihood {
    type Latent = Vec<f64>;

    fn num_observations(&self) -> usize {
        self.kappa.len()
    }

    fn initial_latent(&self) -> Vec<f64> {
        // E[PG(n, 0)] = n / 4
        self.trials.iter().map(|&n| 0.25 * n as f64).collect()
    }

    fn sample_latent<R: Rng + ?Sized>(
        &self,
        _current: &Vec<f64>,
        linear_predictor: &[f64],
        rng: &mut R,
    ) -> Result<Vec<f64>, BridgeError> {
        self.trials
            .iter()
            .zip(linear_predictor)
            .map(|(&n, &eta)| -> Result<f64, BridgeError> {
                // Observations with zero trials carry no information; keep a
                // positive weight so the working model stays well defined.
                let omega = if n == 0 {
                    f64::MIN_POSITIVE
                } else {
                    sample_polya_gamma(rng, n, eta)
                };
                Ok(check_finite("Polya-Gamma draw", omega)?)
            })
            .collect()
    }

    fn working_response(&self, omega: &Vec<f64>) -> WorkingResponse {
        WorkingResponse {
            weights: Weights::Diagonal(omega.clone()),
            weighted_response: self.kappa.clone(),
        }
    }

    fn log_likelihood(&self, omega: &Vec<f64>, linear_predictor: &[f64]) -> f64 {
        self.kappa
            .iter()
            .zip(omega)
            .zip(linear_predictor)
            .map(|((&kappa, &omega), &eta)| kappa * eta - 0.5 * omega * eta * eta)
            .sum()
    }
}
