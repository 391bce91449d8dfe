use itertools::Itertools;

use crate::{
    adapt::AdaptOptions,
    coefficients::{CgOptions, PreconditionerKind},
    error::BridgeError,
    moves::BirthProposal,
    prior::GlobalScalePrior,
};

/// Settings of a Bridge regression run.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    /// Exponent `α` of the Bridge prior, in `(0, 2]`. Smaller values shrink
    /// small coefficients harder; `α = 1` is the Bayesian lasso and `α = 2`
    /// ridge regression.
    pub prior_exponent: f64,
    /// Hyperprior of the global scale `τ`.
    pub regularization_strength_prior: GlobalScalePrior,
    /// Starting value of `τ` when it is not fixed.
    pub initial_global_scale: f64,
    /// Prior probability that an eligible predictor is active.
    pub inclusion_probability: f64,
    /// Upper bound of the number of active predictors. Defaults to all
    /// predictors that are not excluded.
    pub max_active_predictors: Option<usize>,
    /// Predictors that are always active.
    pub required_predictors: Vec<usize>,
    /// Predictors that are never active.
    pub excluded_predictors: Vec<usize>,
    /// Predictors active in the initial state besides the required ones.
    pub initial_active_predictors: Vec<usize>,
    /// Proposal of the coefficient value of an entering predictor.
    pub birth_proposal: BirthProposal,
    /// Probability of a swap move. Birth and death split the rest evenly.
    pub swap_probability: f64,
    /// Relative residual at which conjugate gradient stops.
    pub cg_tolerance: f64,
    /// Initial iteration budget of conjugate gradient.
    pub cg_max_iterations: usize,
    /// Active sets up to this size use a dense Cholesky factorization.
    pub cg_threshold: usize,
    pub preconditioner: PreconditionerKind,
    /// Settings for burn-in adaptation.
    pub adapt_options: AdaptOptions,
    /// The number of sweeps discarded as burn-in.
    pub burn_in_iterations: u64,
    /// The number of sweeps after burn-in.
    pub num_iterations: u64,
    /// Keep every n-th sweep after burn-in.
    pub thinning_interval: u64,
    /// How often a sweep that hit a numerical failure is retried before the
    /// run is aborted.
    pub max_sweep_retries: u32,
    /// Log move statistics every n sweeps.
    pub log_interval: Option<u64>,

    pub num_chains: usize,
    pub random_seed: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            prior_exponent: 0.5,
            regularization_strength_prior: GlobalScalePrior::default(),
            initial_global_scale: 1.,
            inclusion_probability: 0.1,
            max_active_predictors: None,
            required_predictors: vec![],
            excluded_predictors: vec![],
            initial_active_predictors: vec![],
            birth_proposal: BirthProposal::default(),
            swap_probability: 0.,
            cg_tolerance: 1e-10,
            cg_max_iterations: 500,
            cg_threshold: 200,
            preconditioner: PreconditionerKind::default(),
            adapt_options: AdaptOptions::default(),
            burn_in_iterations: 1000,
            num_iterations: 1000,
            thinning_interval: 1,
            max_sweep_retries: 3,
            log_interval: Some(1000),
            num_chains: 4,
            random_seed: 0,
        }
    }
}

impl BridgeSettings {
    pub fn cg_options(&self) -> CgOptions {
        CgOptions {
            tolerance: self.cg_tolerance,
            max_iterations: self.cg_max_iterations,
            threshold: self.cg_threshold,
            preconditioner: self.preconditioner,
        }
    }

    /// Total number of sweeps of a chain.
    pub fn total_iterations(&self) -> u64 {
        self.burn_in_iterations + self.num_iterations
    }

    /// Check the settings against a design with `num_predictors` columns.
    pub fn validate(&self, num_predictors: usize) -> Result<(), BridgeError> {
        if !(self.prior_exponent > 0. && self.prior_exponent <= 2.) {
            return Err(BridgeError::domain(
                "prior_exponent",
                self.prior_exponent,
                "the Bridge exponent must lie in (0, 2]",
            ));
        }
        if self.prior_exponent < 0.1 {
            log::warn!(
                "prior exponent {} is very small, local scale draws may be unstable",
                self.prior_exponent
            );
        }
        if !(self.inclusion_probability > 0. && self.inclusion_probability < 1.) {
            return Err(BridgeError::domain(
                "inclusion_probability",
                self.inclusion_probability,
                "must lie in (0, 1)",
            ));
        }
        if !(self.swap_probability >= 0. && self.swap_probability < 1.) {
            return Err(BridgeError::domain(
                "swap_probability",
                self.swap_probability,
                "must lie in [0, 1)",
            ));
        }
        if !(self.initial_global_scale > 0. && self.initial_global_scale.is_finite()) {
            return Err(BridgeError::domain(
                "initial_global_scale",
                self.initial_global_scale,
                "must be positive and finite",
            ));
        }
        if !(self.cg_tolerance > 0.) {
            return Err(BridgeError::domain(
                "cg_tolerance",
                self.cg_tolerance,
                "must be positive",
            ));
        }
        if let BirthProposal::Gaussian { scale, .. } = self.birth_proposal {
            if !(scale > 0. && scale.is_finite()) {
                return Err(BridgeError::domain(
                    "birth proposal scale",
                    scale,
                    "must be positive and finite",
                ));
            }
        }
        if !(self.adapt_options.cg_budget_growth >= 1.) {
            return Err(BridgeError::domain(
                "cg_budget_growth",
                self.adapt_options.cg_budget_growth,
                "must be at least 1",
            ));
        }
        if self.cg_max_iterations == 0 {
            return Err(BridgeError::Configuration(
                "cg_max_iterations must be positive".into(),
            ));
        }
        if self.thinning_interval == 0 {
            return Err(BridgeError::Configuration(
                "thinning_interval must be positive".into(),
            ));
        }
        if self.num_chains == 0 {
            return Err(BridgeError::Configuration(
                "at least one chain is needed".into(),
            ));
        }

        for (name, indices) in [
            ("required", &self.required_predictors),
            ("excluded", &self.excluded_predictors),
            ("initially active", &self.initial_active_predictors),
        ] {
            if let Some(&j) = indices.iter().find(|&&j| j >= num_predictors) {
                return Err(BridgeError::Configuration(format!(
                    "{name} predictor {j} is out of range for {num_predictors} predictors"
                )));
            }
            if let Some(j) = indices.iter().duplicates().next() {
                return Err(BridgeError::Configuration(format!(
                    "{name} predictor {j} is listed twice"
                )));
            }
        }
        if let Some(j) = self
            .required_predictors
            .iter()
            .find(|j| self.excluded_predictors.contains(j))
        {
            return Err(BridgeError::Configuration(format!(
                "predictor {j} is both required and excluded"
            )));
        }
        if let Some(j) = self
            .initial_active_predictors
            .iter()
            .find(|j| self.excluded_predictors.contains(j))
        {
            return Err(BridgeError::Configuration(format!(
                "excluded predictor {j} is initially active"
            )));
        }

        let eligible = num_predictors - self.excluded_predictors.len();
        let max_active = self.max_active_predictors.unwrap_or(eligible);
        let num_required = self.required_predictors.len();
        if max_active < num_required {
            return Err(BridgeError::Configuration(format!(
                "max_active_predictors = {max_active} is below the {num_required} required predictors"
            )));
        }
        let initial = self
            .required_predictors
            .iter()
            .chain(&self.initial_active_predictors)
            .unique()
            .count();
        if initial > max_active {
            return Err(BridgeError::Configuration(format!(
                "{initial} initially active predictors exceed max_active_predictors = {max_active}"
            )));
        }
        Ok(())
    }
}
