use std::f64::consts::PI;
use std::fmt::Display;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    design::DesignMatrix,
    error::{check_finite, BridgeError, NumericalError},
    likelihood::Likelihood,
    prior::BridgePrior,
    settings::BridgeSettings,
    state::ModelState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveKind {
    Birth,
    Death,
    Swap,
}

impl MoveKind {
    pub const ALL: [MoveKind; 3] = [MoveKind::Birth, MoveKind::Death, MoveKind::Swap];

    fn index(self) -> usize {
        match self {
            MoveKind::Birth => 0,
            MoveKind::Death => 1,
            MoveKind::Swap => 2,
        }
    }
}

impl Display for MoveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveKind::Birth => write!(f, "birth"),
            MoveKind::Death => write!(f, "death"),
            MoveKind::Swap => write!(f, "swap"),
        }
    }
}

/// Distribution of the coefficient value proposed for an entering predictor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BirthProposal {
    /// Draw from the marginal Bridge prior at the current global scale.
    #[default]
    Prior,
    /// Draw from `N(0, scale²)`. With `adapt`, the scale follows the spread
    /// of the active coefficients during burn-in.
    Gaussian { scale: f64, adapt: bool },
}

impl BirthProposal {
    fn sample<R: Rng + ?Sized>(
        &self,
        prior: &BridgePrior,
        global_scale: f64,
        rng: &mut R,
    ) -> Result<f64, NumericalError> {
        match *self {
            BirthProposal::Prior => prior.sample_coefficient(global_scale, rng),
            BirthProposal::Gaussian { scale, .. } => {
                let z: f64 = rng.sample(StandardNormal);
                check_finite("birth proposal", scale * z)
            }
        }
    }

    fn log_density(&self, prior: &BridgePrior, value: f64, global_scale: f64) -> f64 {
        match *self {
            BirthProposal::Prior => prior.log_prior_density(value, global_scale),
            BirthProposal::Gaussian { scale, .. } => {
                -0.5 * (2. * PI).ln() - scale.ln() - 0.5 * (value / scale).powi(2)
            }
        }
    }
}

/// A predictor entering the model together with its proposed values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entering {
    pub predictor: usize,
    pub coefficient: f64,
    pub local_scale: f64,
}

/// A predictor leaving the model and the coefficient it had.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leaving {
    pub predictor: usize,
    pub coefficient: f64,
}

/// A fully evaluated trans-dimensional proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub kind: MoveKind,
    pub entering: Option<Entering>,
    pub leaving: Option<Leaving>,
    pub log_likelihood_ratio: f64,
    pub log_prior_ratio: f64,
    pub log_proposal_ratio: f64,
    /// Values are drawn directly in the target parameterization.
    pub log_jacobian: f64,
    linear_predictor: Vec<f64>,
}

impl Proposal {
    pub fn log_acceptance(&self) -> f64 {
        self.log_likelihood_ratio + self.log_prior_ratio + self.log_proposal_ratio + self.log_jacobian
    }

    /// Linear predictor of the proposed state.
    pub fn linear_predictor(&self) -> &[f64] {
        &self.linear_predictor
    }

    /// Apply the proposal to `state` and replace `linear_predictor` with the
    /// proposed one.
    pub(crate) fn commit<L>(
        self,
        state: &mut ModelState<L>,
        linear_predictor: &mut Vec<f64>,
    ) -> Result<(), BridgeError> {
        if let Some(leaving) = self.leaving {
            if state.delete(leaving.predictor).is_none() {
                return Err(BridgeError::CorruptState(format!(
                    "predictor {} left the model but was not active",
                    leaving.predictor
                )));
            }
        }
        if let Some(entering) = self.entering {
            if state.active_set.contains(entering.predictor) {
                return Err(BridgeError::CorruptState(format!(
                    "predictor {} entered the model twice",
                    entering.predictor
                )));
            }
            state.insert(entering.predictor, entering.coefficient, entering.local_scale);
        }
        *linear_predictor = self.linear_predictor;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// The chosen move has no valid target from the current state.
    Impossible(MoveKind),
    Rejected(Proposal),
    Accepted(Proposal),
}

impl MoveOutcome {
    pub fn kind(&self) -> MoveKind {
        match self {
            MoveOutcome::Impossible(kind) => *kind,
            MoveOutcome::Rejected(proposal) | MoveOutcome::Accepted(proposal) => proposal.kind,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, MoveOutcome::Accepted(_))
    }

    pub fn log_acceptance(&self) -> Option<f64> {
        match self {
            MoveOutcome::Impossible(_) => None,
            MoveOutcome::Rejected(proposal) | MoveOutcome::Accepted(proposal) => {
                Some(proposal.log_acceptance())
            }
        }
    }
}

/// Everything a move reads from the current sweep.
pub struct MoveContext<'a, L: Likelihood> {
    pub design: &'a DesignMatrix,
    pub likelihood: &'a L,
    pub prior: &'a BridgePrior,
    pub state: &'a ModelState<L::Latent>,
    pub linear_predictor: &'a [f64],
}

impl<L: Likelihood> MoveContext<'_, L> {
    fn log_likelihood_ratio(&self, proposed: &[f64]) -> Result<f64, NumericalError> {
        let latent = &self.state.likelihood_params;
        let diff = self.likelihood.log_likelihood(latent, proposed)
            - self.likelihood.log_likelihood(latent, self.linear_predictor);
        check_finite("log-likelihood ratio", diff)
    }
}

/// Proposes and accepts birth, death and swap moves over the active set.
///
/// Required predictors are never proposed for removal and excluded predictors
/// never for addition, so only the remaining "free" predictors move. The move
/// type is chosen with fixed probabilities; a type without a valid target from
/// the current state is rejected outright.
#[derive(Debug, Clone)]
pub struct MoveEngine {
    birth_probability: f64,
    death_probability: f64,
    swap_probability: f64,
    log_inclusion_odds: f64,
    max_active: usize,
    free: Vec<bool>,
    num_free: usize,
    num_required: usize,
    birth_proposal: BirthProposal,
}

impl MoveEngine {
    pub fn new(settings: &BridgeSettings, num_predictors: usize) -> Result<Self, BridgeError> {
        settings.validate(num_predictors)?;
        let mut free = vec![true; num_predictors];
        for &j in settings
            .required_predictors
            .iter()
            .chain(&settings.excluded_predictors)
        {
            free[j] = false;
        }
        let num_free = free.iter().filter(|&&f| f).count();
        let pi = settings.inclusion_probability;
        let birth_death = 0.5 * (1. - settings.swap_probability);
        Ok(Self {
            birth_probability: birth_death,
            death_probability: birth_death,
            swap_probability: settings.swap_probability,
            log_inclusion_odds: pi.ln() - (-pi).ln_1p(),
            max_active: settings
                .max_active_predictors
                .unwrap_or(num_predictors - settings.excluded_predictors.len()),
            free,
            num_free,
            num_required: settings.required_predictors.len(),
            birth_proposal: settings.birth_proposal,
        })
    }

    pub fn move_probability(&self, kind: MoveKind) -> f64 {
        match kind {
            MoveKind::Birth => self.birth_probability,
            MoveKind::Death => self.death_probability,
            MoveKind::Swap => self.swap_probability,
        }
    }

    pub fn birth_proposal(&self) -> BirthProposal {
        self.birth_proposal
    }

    /// Update the scale of an adaptive Gaussian birth proposal.
    pub(crate) fn set_birth_scale(&mut self, new_scale: f64) {
        if let BirthProposal::Gaussian { scale, adapt: true } = &mut self.birth_proposal {
            *scale = new_scale;
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Active predictors that may leave the model.
    fn num_removable<L>(&self, state: &ModelState<L>) -> usize {
        state.dim() - self.num_required
    }

    /// Inactive predictors that may enter the model.
    fn num_addable<L>(&self, state: &ModelState<L>) -> usize {
        self.num_free - self.num_removable(state)
    }

    fn is_possible<L>(&self, kind: MoveKind, state: &ModelState<L>) -> bool {
        match kind {
            MoveKind::Birth => state.dim() < self.max_active && self.num_addable(state) > 0,
            MoveKind::Death => self.num_removable(state) > 0,
            MoveKind::Swap => self.num_removable(state) > 0 && self.num_addable(state) > 0,
        }
    }

    /// Pick a move type with the fixed move probabilities.
    pub fn choose_kind<R: Rng + ?Sized>(&self, rng: &mut R) -> MoveKind {
        let u: f64 = rng.random();
        if u < self.birth_probability {
            MoveKind::Birth
        } else if u < self.birth_probability + self.death_probability {
            MoveKind::Death
        } else {
            MoveKind::Swap
        }
    }

    fn check_addable<L>(&self, state: &ModelState<L>, predictor: usize) -> Result<(), BridgeError> {
        if !self.free.get(predictor).copied().unwrap_or(false)
            || state.active_set.contains(predictor)
        {
            return Err(BridgeError::Configuration(format!(
                "predictor {predictor} cannot enter the model"
            )));
        }
        Ok(())
    }

    fn check_removable<L>(&self, state: &ModelState<L>, predictor: usize) -> Result<(), BridgeError> {
        if !self.free.get(predictor).copied().unwrap_or(false)
            || !state.active_set.contains(predictor)
        {
            return Err(BridgeError::Configuration(format!(
                "predictor {predictor} cannot leave the model"
            )));
        }
        Ok(())
    }

    /// Evaluate the birth of `entering` from the current state.
    pub fn birth<L: Likelihood>(
        &self,
        ctx: &MoveContext<'_, L>,
        entering: Entering,
    ) -> Result<Proposal, BridgeError> {
        let state = ctx.state;
        self.check_addable(state, entering.predictor)?;
        if state.dim() >= self.max_active {
            return Err(BridgeError::Configuration(format!(
                "birth from {} active predictors exceeds the maximum of {}",
                state.dim(),
                self.max_active
            )));
        }
        let tau = state.global_scale;

        let mut proposed = ctx.linear_predictor.to_vec();
        ctx.design
            .column_axpy(entering.predictor, entering.coefficient, &mut proposed);

        let log_prior_ratio =
            self.log_inclusion_odds + ctx.prior.log_prior_density(entering.coefficient, tau);
        let forward = self.birth_probability.ln() - (self.num_addable(state) as f64).ln()
            + self
                .birth_proposal
                .log_density(ctx.prior, entering.coefficient, tau);
        let reverse =
            self.death_probability.ln() - ((self.num_removable(state) + 1) as f64).ln();

        Ok(Proposal {
            kind: MoveKind::Birth,
            entering: Some(entering),
            leaving: None,
            log_likelihood_ratio: ctx.log_likelihood_ratio(&proposed)?,
            log_prior_ratio,
            log_proposal_ratio: reverse - forward,
            log_jacobian: 0.,
            linear_predictor: proposed,
        })
    }

    /// Evaluate removing `predictor` from the current state.
    pub fn death<L: Likelihood>(
        &self,
        ctx: &MoveContext<'_, L>,
        predictor: usize,
    ) -> Result<Proposal, BridgeError> {
        let state = ctx.state;
        self.check_removable(state, predictor)?;
        let tau = state.global_scale;
        let coefficient = state.coefficient(predictor);

        let mut proposed = ctx.linear_predictor.to_vec();
        ctx.design.column_axpy(predictor, -coefficient, &mut proposed);

        let log_prior_ratio =
            -self.log_inclusion_odds - ctx.prior.log_prior_density(coefficient, tau);
        let forward = self.death_probability.ln() - (self.num_removable(state) as f64).ln();
        let reverse = self.birth_probability.ln() - ((self.num_addable(state) + 1) as f64).ln()
            + self.birth_proposal.log_density(ctx.prior, coefficient, tau);

        Ok(Proposal {
            kind: MoveKind::Death,
            entering: None,
            leaving: Some(Leaving {
                predictor,
                coefficient,
            }),
            log_likelihood_ratio: ctx.log_likelihood_ratio(&proposed)?,
            log_prior_ratio,
            log_proposal_ratio: reverse - forward,
            log_jacobian: 0.,
            linear_predictor: proposed,
        })
    }

    /// Evaluate replacing `leaving` by `entering` at constant model size.
    pub fn swap<L: Likelihood>(
        &self,
        ctx: &MoveContext<'_, L>,
        leaving: usize,
        entering: Entering,
    ) -> Result<Proposal, BridgeError> {
        let state = ctx.state;
        self.check_removable(state, leaving)?;
        self.check_addable(state, entering.predictor)?;
        let tau = state.global_scale;
        let old = state.coefficient(leaving);

        let mut proposed = ctx.linear_predictor.to_vec();
        ctx.design.column_axpy(leaving, -old, &mut proposed);
        ctx.design
            .column_axpy(entering.predictor, entering.coefficient, &mut proposed);

        let log_prior_ratio = ctx.prior.log_prior_density(entering.coefficient, tau)
            - ctx.prior.log_prior_density(old, tau);
        let log_proposal_ratio = self.birth_proposal.log_density(ctx.prior, old, tau)
            - self
                .birth_proposal
                .log_density(ctx.prior, entering.coefficient, tau);

        Ok(Proposal {
            kind: MoveKind::Swap,
            entering: Some(entering),
            leaving: Some(Leaving {
                predictor: leaving,
                coefficient: old,
            }),
            log_likelihood_ratio: ctx.log_likelihood_ratio(&proposed)?,
            log_prior_ratio,
            log_proposal_ratio,
            log_jacobian: 0.,
            linear_predictor: proposed,
        })
    }

    fn draw_entering<L: Likelihood, R: Rng + ?Sized>(
        &self,
        ctx: &MoveContext<'_, L>,
        rng: &mut R,
    ) -> Result<Entering, BridgeError> {
        let state = ctx.state;
        let candidates: Vec<usize> = (0..self.free.len())
            .filter(|&j| self.free[j] && !state.active_set.contains(j))
            .collect();
        let predictor = candidates[rng.random_range(0..candidates.len())];
        let tau = state.global_scale;
        let coefficient = self.birth_proposal.sample(ctx.prior, tau, rng)?;
        let local_scale = if coefficient == 0. {
            ctx.prior.sample_local_scale_at_zero(rng)?
        } else {
            ctx.prior.sample_local_scale(coefficient, tau, rng)?
        };
        Ok(Entering {
            predictor,
            coefficient,
            local_scale,
        })
    }

    fn draw_leaving<L: Likelihood, R: Rng + ?Sized>(
        &self,
        ctx: &MoveContext<'_, L>,
        rng: &mut R,
    ) -> usize {
        let candidates: Vec<usize> = ctx
            .state
            .active_set
            .iter()
            .filter(|&j| self.free[j])
            .collect();
        candidates[rng.random_range(0..candidates.len())]
    }

    /// Choose a move type, propose, and accept or reject by Metropolis-Hastings.
    /// The caller commits accepted proposals.
    pub fn attempt<L: Likelihood, R: Rng + ?Sized>(
        &self,
        ctx: &MoveContext<'_, L>,
        rng: &mut R,
    ) -> Result<MoveOutcome, BridgeError> {
        let kind = self.choose_kind(rng);
        self.attempt_kind(kind, ctx, rng)
    }

    /// Like [`MoveEngine::attempt`] for a move type chosen by the caller.
    pub fn attempt_kind<L: Likelihood, R: Rng + ?Sized>(
        &self,
        kind: MoveKind,
        ctx: &MoveContext<'_, L>,
        rng: &mut R,
    ) -> Result<MoveOutcome, BridgeError> {
        if !self.is_possible(kind, ctx.state) {
            return Ok(MoveOutcome::Impossible(kind));
        }
        let proposal = match kind {
            MoveKind::Birth => {
                let entering = self.draw_entering(ctx, rng)?;
                self.birth(ctx, entering)?
            }
            MoveKind::Death => {
                let leaving = self.draw_leaving(ctx, rng);
                self.death(ctx, leaving)?
            }
            MoveKind::Swap => {
                let leaving = self.draw_leaving(ctx, rng);
                let entering = self.draw_entering(ctx, rng)?;
                self.swap(ctx, leaving, entering)?
            }
        };
        let log_acceptance = proposal.log_acceptance();
        if log_acceptance.is_nan() {
            return Err(NumericalError::NonFinite {
                context: "log acceptance ratio",
                value: log_acceptance,
            }
            .into());
        }
        let u: f64 = rng.random();
        if u.ln() < log_acceptance {
            Ok(MoveOutcome::Accepted(proposal))
        } else {
            Ok(MoveOutcome::Rejected(proposal))
        }
    }
}

/// Per-type counts of trans-dimensional moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStatistics {
    proposed: [u64; 3],
    accepted: [u64; 3],
    impossible: [u64; 3],
}

impl MoveStatistics {
    pub fn record(&mut self, outcome: &MoveOutcome) {
        let i = outcome.kind().index();
        self.proposed[i] += 1;
        match outcome {
            MoveOutcome::Impossible(_) => self.impossible[i] += 1,
            MoveOutcome::Accepted(_) => self.accepted[i] += 1,
            MoveOutcome::Rejected(_) => {}
        }
    }

    pub fn proposed(&self, kind: MoveKind) -> u64 {
        self.proposed[kind.index()]
    }

    pub fn accepted(&self, kind: MoveKind) -> u64 {
        self.accepted[kind.index()]
    }

    /// Moves of this type that were rejected because no target existed.
    pub fn impossible(&self, kind: MoveKind) -> u64 {
        self.impossible[kind.index()]
    }

    /// Fraction of proposals of this type that were accepted, counting
    /// impossible moves as rejections.
    pub fn acceptance_rate(&self, kind: MoveKind) -> Option<f64> {
        let i = kind.index();
        (self.proposed[i] > 0).then(|| self.accepted[i] as f64 / self.proposed[i] as f64)
    }
}

impl Display for MoveStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for kind in MoveKind::ALL {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(
                f,
                "{kind} {}/{} accepted ({} impossible)",
                self.accepted(kind),
                self.proposed(kind),
                self.impossible(kind)
            )?;
        }
        Ok(())
    }
}
