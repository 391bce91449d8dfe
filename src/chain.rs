use std::sync::Arc;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    adapt::Adaptation,
    coefficients::{CoefficientSampler, SolveMethod},
    design::DesignMatrix,
    error::{BridgeError, SweepStage},
    likelihood::Likelihood,
    moves::{MoveContext, MoveEngine, MoveKind, MoveOutcome, MoveStatistics},
    prior::{BridgePrior, GlobalScalePrior},
    samples::{PosteriorSamples, Snapshot},
    settings::BridgeSettings,
    state::{ActiveSet, ModelState},
};

/// Summary of one completed sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct Progress {
    pub iteration: u64,
    pub chain: u64,
    pub burn_in: bool,
    /// Whether the sweep produced a snapshot.
    pub retained: bool,
    pub move_kind: MoveKind,
    /// False when the move had no valid target and was rejected outright.
    pub move_possible: bool,
    pub move_accepted: bool,
    pub log_acceptance: Option<f64>,
    pub active_size: usize,
    pub solve_method: SolveMethod,
    /// Failed attempts before the sweep went through.
    pub retries: u32,
    pub global_scale: f64,
}

impl Progress {
    pub fn cg_iterations(&self) -> Option<usize> {
        match self.solve_method {
            SolveMethod::Direct => None,
            SolveMethod::ConjugateGradient { iterations } | SolveMethod::Fallback { iterations } => {
                Some(iterations)
            }
        }
    }

    pub fn fallback(&self) -> bool {
        matches!(self.solve_method, SolveMethod::Fallback { .. })
    }
}

type StageResult<T> = Result<T, (SweepStage, BridgeError)>;

fn at<E: Into<BridgeError>>(stage: SweepStage) -> impl FnOnce(E) -> (SweepStage, BridgeError) {
    move |err| (stage, err.into())
}

/// A single reversible-jump Gibbs chain over sparse Bridge regression models.
///
/// The chain owns the model state. Each sweep updates, in order, the latent
/// likelihood variables, the active coefficients, the local and global
/// scales, and then attempts one birth, death or swap move. A sweep either
/// commits completely or leaves the state as it was.
pub struct BridgeChain<L: Likelihood, R: Rng = ChaCha8Rng> {
    design: Arc<DesignMatrix>,
    likelihood: L,
    settings: BridgeSettings,
    prior: BridgePrior,
    coefficient_sampler: CoefficientSampler,
    moves: MoveEngine,
    adaptation: Adaptation,
    state: ModelState<L::Latent>,
    linear_predictor: Vec<f64>,
    excluded: Vec<bool>,
    statistics: MoveStatistics,
    rng: R,
    chain: u64,
    iteration: u64,
}

impl<L: Likelihood> BridgeChain<L, ChaCha8Rng> {
    /// Create chain `chain`, seeded from `settings.random_seed` with its own
    /// random stream.
    pub fn new(
        design: Arc<DesignMatrix>,
        likelihood: L,
        settings: &BridgeSettings,
        chain: u64,
    ) -> Result<Self, BridgeError> {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.random_seed);
        rng.set_stream(chain);
        Self::with_rng(design, likelihood, settings, chain, rng)
    }
}

impl<L: Likelihood, R: Rng> BridgeChain<L, R> {
    pub fn with_rng(
        design: Arc<DesignMatrix>,
        likelihood: L,
        settings: &BridgeSettings,
        chain: u64,
        rng: R,
    ) -> Result<Self, BridgeError> {
        let p = design.ncols();
        let n = design.nrows();
        settings.validate(p)?;
        if likelihood.num_observations() != n {
            return Err(BridgeError::Configuration(format!(
                "the design has {n} rows but the likelihood has {} observations",
                likelihood.num_observations()
            )));
        }
        let prior = BridgePrior::new(
            settings.prior_exponent,
            settings.regularization_strength_prior,
        )?;

        let initial = settings
            .required_predictors
            .iter()
            .chain(&settings.initial_active_predictors)
            .unique()
            .copied()
            .collect::<Vec<_>>();
        let active_set = ActiveSet::from_indices(p, &initial)?;
        let k = active_set.len();
        let global_scale = match prior.global_prior() {
            GlobalScalePrior::Fixed(scale) => scale,
            GlobalScalePrior::Gamma { .. } => settings.initial_global_scale,
        };
        let state = ModelState {
            active_set,
            coefficients: vec![0.; k],
            global_scale,
            local_scales: vec![1.; k],
            likelihood_params: likelihood.initial_latent(),
        };

        let mut excluded = vec![false; p];
        for &j in &settings.excluded_predictors {
            excluded[j] = true;
        }
        state.check_invariants(&excluded)?;

        Ok(Self {
            design,
            likelihood,
            settings: settings.clone(),
            prior,
            coefficient_sampler: CoefficientSampler::new(settings.cg_options()),
            moves: MoveEngine::new(settings, p)?,
            adaptation: Adaptation::new(settings.adapt_options),
            state,
            linear_predictor: vec![0.; n],
            excluded,
            statistics: MoveStatistics::default(),
            rng,
            chain,
            iteration: 0,
        })
    }

    pub fn state(&self) -> &ModelState<L::Latent> {
        &self.state
    }

    /// `X_A β` of the current state.
    pub fn linear_predictor(&self) -> &[f64] {
        &self.linear_predictor
    }

    pub fn statistics(&self) -> &MoveStatistics {
        &self.statistics
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    /// Number of completed sweeps.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_finished(&self) -> bool {
        self.iteration >= self.settings.total_iterations()
    }

    pub fn new_samples(&self) -> PosteriorSamples {
        PosteriorSamples::new(self.chain, self.design.ncols())
    }

    /// Run all remaining sweeps. The samples collected so far are returned
    /// even if the run fails.
    pub fn run(&mut self) -> (Result<(), BridgeError>, PosteriorSamples) {
        let mut samples = self.new_samples();
        let result = self.run_into(&mut samples);
        (result, samples)
    }

    pub fn run_into(&mut self, samples: &mut PosteriorSamples) -> Result<(), BridgeError> {
        while !self.is_finished() {
            let progress = self.draw()?;
            self.record(samples, progress);
        }
        Ok(())
    }

    /// Store the statistics of a sweep, and a snapshot if it is retained.
    pub fn record(&self, samples: &mut PosteriorSamples, progress: Progress) {
        if progress.retained {
            samples.push_snapshot(Snapshot {
                iteration: progress.iteration,
                state: self.state.project(),
                dispersion: self.likelihood.dispersion(&self.state.likelihood_params),
                log_likelihood: self
                    .likelihood
                    .log_likelihood(&self.state.likelihood_params, &self.linear_predictor),
            });
        }
        samples.push_sweep(progress);
    }

    /// Perform one sweep, retrying it from the last committed state after
    /// recoverable numerical failures.
    pub fn draw(&mut self) -> Result<Progress, BridgeError> {
        let committed = self.state.clone();
        let committed_predictor = self.linear_predictor.clone();
        let mut attempts = 0u32;
        let (outcome, method) = loop {
            attempts += 1;
            match self.sweep() {
                Ok(result) => break result,
                Err((stage, err)) => {
                    self.state.clone_from(&committed);
                    self.linear_predictor.clone_from(&committed_predictor);
                    if err.is_recoverable() && attempts <= self.settings.max_sweep_retries {
                        log::warn!(
                            "chain {}: sweep {} failed during {stage}: {err}. Retrying ({attempts}/{})",
                            self.chain,
                            self.iteration,
                            self.settings.max_sweep_retries
                        );
                        continue;
                    }
                    return Err(BridgeError::SweepFailed {
                        iteration: self.iteration,
                        stage,
                        attempts,
                        source: Box::new(err),
                    });
                }
            }
        };

        let iteration = self.iteration;
        let burn_in = iteration < self.settings.burn_in_iterations;
        let retained = !burn_in
            && iteration < self.settings.total_iterations()
            && (iteration - self.settings.burn_in_iterations) % self.settings.thinning_interval
                == 0;
        self.statistics.record(&outcome);
        if burn_in {
            self.adaptation.observe(
                &self.state,
                method,
                &mut self.coefficient_sampler,
                &mut self.moves,
            );
        }
        self.iteration += 1;

        if let Some(interval) = self.settings.log_interval {
            if interval > 0 && self.iteration % interval == 0 {
                log::info!(
                    "chain {}: {} sweeps, {} active predictors, {}",
                    self.chain,
                    self.iteration,
                    self.state.dim(),
                    self.statistics
                );
            }
        }

        Ok(Progress {
            iteration,
            chain: self.chain,
            burn_in,
            retained,
            move_kind: outcome.kind(),
            move_possible: !matches!(outcome, MoveOutcome::Impossible(_)),
            move_accepted: outcome.is_accepted(),
            log_acceptance: outcome.log_acceptance(),
            active_size: self.state.dim(),
            solve_method: method,
            retries: attempts - 1,
            global_scale: self.state.global_scale,
        })
    }

    fn sweep(&mut self) -> StageResult<(MoveOutcome, SolveMethod)> {
        let method = self.update_conditionals()?;
        let outcome = self.attempt_move()?;
        self.state
            .check_invariants(&self.excluded)
            .map_err(at(SweepStage::Commit))?;
        Ok((outcome, method))
    }

    /// The fixed-dimension Gibbs updates of a sweep.
    fn update_conditionals(&mut self) -> StageResult<SolveMethod> {
        let latent = self
            .likelihood
            .sample_latent(
                &self.state.likelihood_params,
                &self.linear_predictor,
                &mut self.rng,
            )
            .map_err(at(SweepStage::Latent))?;
        self.state.likelihood_params = latent;

        let working = self.likelihood.working_response(&self.state.likelihood_params);
        let tau = self.state.global_scale;
        let prior_precision = self
            .state
            .local_scales
            .iter()
            .map(|&lambda| BridgePrior::prior_precision(tau, lambda))
            .collect::<Vec<_>>();
        let draw = self
            .coefficient_sampler
            .sample(
                &self.design,
                self.state.active_set.indices(),
                &working,
                &prior_precision,
                &self.state.coefficients,
                &mut self.rng,
            )
            .map_err(at(SweepStage::Coefficients))?;
        self.state.coefficients = draw.coefficients;
        // Recomputed from scratch so that move updates never accumulate drift.
        self.design.predict(
            self.state.active_set.indices(),
            &self.state.coefficients,
            &mut self.linear_predictor,
        );

        let prior = &self.prior;
        let rng = &mut self.rng;
        let local_scales = self
            .state
            .coefficients
            .iter()
            .map(|&beta| {
                if beta == 0. {
                    prior.sample_local_scale_at_zero(rng)
                } else {
                    prior.sample_local_scale(beta, tau, rng)
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(at(SweepStage::LocalScales))?;
        self.state.local_scales = local_scales;

        self.state.global_scale = self
            .prior
            .sample_global_scale(
                &self.state.coefficients,
                &self.state.local_scales,
                &mut self.rng,
            )
            .map_err(at(SweepStage::GlobalScale))?;

        Ok(draw.method)
    }

    fn attempt_move(&mut self) -> StageResult<MoveOutcome> {
        let kind = self.moves.choose_kind(&mut self.rng);
        let ctx = MoveContext {
            design: &self.design,
            likelihood: &self.likelihood,
            prior: &self.prior,
            state: &self.state,
            linear_predictor: &self.linear_predictor,
        };
        let outcome = self
            .moves
            .attempt_kind(kind, &ctx, &mut self.rng)
            .map_err(at(SweepStage::Move(kind)))?;
        if let MoveOutcome::Accepted(proposal) = &outcome {
            proposal
                .clone()
                .commit(&mut self.state, &mut self.linear_predictor)
                .map_err(at(SweepStage::Commit))?;
        }
        Ok(outcome)
    }
}
