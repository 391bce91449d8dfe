use std::f64::consts::{FRAC_1_SQRT_2, LN_2};

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use statrs::function::gamma::ln_gamma;

use crate::{
    error::{check_finite, BridgeError, NumericalError},
    stable::{sample_inverse_gaussian, sample_tilted_stable},
};

/// Hyperprior of the global scale `τ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalScalePrior {
    /// Keep `τ` at this value for the whole run.
    Fixed(f64),
    /// Gamma prior with the given shape and rate on the precision `τ⁻²`.
    Gamma { shape: f64, rate: f64 },
}

impl Default for GlobalScalePrior {
    fn default() -> Self {
        GlobalScalePrior::Gamma {
            shape: 1.,
            rate: 1.,
        }
    }
}

/// The Bridge prior `p(β | τ) = α / (2 τ Γ(1/α)) exp(-(|β|/τ)^α)` written as a
/// scale mixture of normals, `β | λ, τ ~ N(0, τ² λ²)`.
///
/// The mixing variable is `x = 1 / (2 λ²)`, whose prior density is proportional to
/// `x^(-1/2) f_{α/2}(x)` for the positive `α/2`-stable density `f`. Given `β` it
/// follows an exponentially tilted stable law with tilt `(β/τ)²`.
#[derive(Debug, Clone)]
pub struct BridgePrior {
    exponent: f64,
    global: GlobalScalePrior,
    log_normalizer: f64,
    magnitude: Gamma<f64>,
}

impl BridgePrior {
    pub fn new(exponent: f64, global: GlobalScalePrior) -> Result<Self, BridgeError> {
        if !(exponent > 0. && exponent <= 2.) {
            return Err(BridgeError::domain(
                "prior_exponent",
                exponent,
                "the Bridge exponent must lie in (0, 2]",
            ));
        }
        match global {
            GlobalScalePrior::Fixed(scale) if !(scale > 0. && scale.is_finite()) => {
                return Err(BridgeError::domain(
                    "global_scale",
                    scale,
                    "a fixed global scale must be positive and finite",
                ));
            }
            GlobalScalePrior::Gamma { shape, rate } => {
                for (name, value) in [("global scale shape", shape), ("global scale rate", rate)] {
                    if !(value > 0. && value.is_finite()) {
                        return Err(BridgeError::domain(
                            name,
                            value,
                            "gamma hyperparameters must be positive and finite",
                        ));
                    }
                }
            }
            _ => {}
        }
        let magnitude = Gamma::new(1. / exponent, 1.).map_err(|_| {
            BridgeError::domain("prior_exponent", exponent, "1/alpha is not a valid gamma shape")
        })?;
        Ok(Self {
            exponent,
            global,
            log_normalizer: exponent.ln() - LN_2 - ln_gamma(1. / exponent),
            magnitude,
        })
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }

    pub fn global_prior(&self) -> GlobalScalePrior {
        self.global
    }

    /// Normalized log density of the marginal prior of one coefficient.
    pub fn log_prior_density(&self, coefficient: f64, global_scale: f64) -> f64 {
        let u = coefficient.abs() / global_scale;
        // powf keeps 0^alpha = 0, so no log of |β| is ever taken
        self.log_normalizer - global_scale.ln() - u.powf(self.exponent)
    }

    /// A draw from the marginal prior, using `|β/τ|^α ~ Gamma(1/α, 1)`.
    pub fn sample_coefficient<R: Rng + ?Sized>(
        &self,
        global_scale: f64,
        rng: &mut R,
    ) -> Result<f64, NumericalError> {
        let g = self.magnitude.sample(rng);
        let magnitude = global_scale * g.powf(1. / self.exponent);
        let value = if rng.random::<bool>() {
            magnitude
        } else {
            -magnitude
        };
        check_finite("bridge prior draw", value)
    }

    /// Gibbs draw of the local scale `λ` given its coefficient.
    ///
    /// Fails with a domain error for a coefficient of exactly zero when `α < 2`;
    /// see [`BridgePrior::sample_local_scale_at_zero`].
    pub fn sample_local_scale<R: Rng + ?Sized>(
        &self,
        coefficient: f64,
        global_scale: f64,
        rng: &mut R,
    ) -> Result<f64, BridgeError> {
        if self.exponent == 2. {
            return Ok(FRAC_1_SQRT_2);
        }
        if coefficient == 0. {
            return Err(BridgeError::domain(
                "coefficient",
                coefficient,
                "the local scale conditional is degenerate at zero",
            ));
        }
        let u = coefficient.abs() / global_scale;
        let x = if self.exponent == 1. {
            sample_inverse_gaussian(rng, 0.5 / u, 0.5)?
        } else {
            sample_tilted_stable(rng, 0.5 * self.exponent, u * u)?
        };
        Ok(local_scale_from_mixing(x)?)
    }

    /// The local-scale conditional at `β = 0`, where the tilt vanishes and
    /// the mixing variable follows the untilted stable law.
    pub fn sample_local_scale_at_zero<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, BridgeError> {
        if self.exponent == 2. {
            return Ok(FRAC_1_SQRT_2);
        }
        let x = sample_tilted_stable(rng, 0.5 * self.exponent, 0.)?;
        Ok(local_scale_from_mixing(x)?)
    }

    /// Gibbs draw of the global scale given the active coefficients and local scales.
    pub fn sample_global_scale<R: Rng + ?Sized>(
        &self,
        coefficients: &[f64],
        local_scales: &[f64],
        rng: &mut R,
    ) -> Result<f64, BridgeError> {
        assert!(coefficients.len() == local_scales.len());
        match self.global {
            GlobalScalePrior::Fixed(scale) => Ok(scale),
            GlobalScalePrior::Gamma { shape, rate } => {
                let quad: f64 = coefficients
                    .iter()
                    .zip(local_scales)
                    .map(|(&beta, &lambda)| (beta / lambda).powi(2))
                    .sum();
                let quad = check_finite("global scale quadratic form", quad)?;
                let post_shape = shape + 0.5 * coefficients.len() as f64;
                let post_rate = rate + 0.5 * quad;
                let precision = Gamma::new(post_shape, 1. / post_rate)
                    .map_err(|_| NumericalError::NonFinite {
                        context: "global scale posterior rate",
                        value: post_rate,
                    })?
                    .sample(rng);
                Ok(check_finite("global scale", precision.sqrt().recip())?)
            }
        }
    }

    /// Conditional prior precision `1 / (τ λ)²` of a coefficient.
    pub fn prior_precision(global_scale: f64, local_scale: f64) -> f64 {
        (global_scale * local_scale).powi(-2)
    }
}

fn local_scale_from_mixing(x: f64) -> Result<f64, NumericalError> {
    let lambda = (2. * x).sqrt().recip();
    if lambda > 0. {
        check_finite("local scale", lambda)
    } else {
        Err(NumericalError::NonFinite {
            context: "local scale",
            value: lambda,
        })
    }
}
