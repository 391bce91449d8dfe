//! Sparse Bayesian regression under the Bridge prior
//! `p(β | τ) ∝ exp(-(|β|/τ)^α)`, sampled by a reversible-jump Gibbs sampler.
//!
//! Each sweep draws the latent variables of the likelihood, the coefficients
//! of the active predictors from their joint Gaussian conditional, the local
//! and global scales of the prior, and then proposes to add, remove or swap
//! one predictor. Large active sets are sampled with a conjugate gradient
//! solver on a perturbed linear system instead of a Cholesky factorization.
//!
//! [`BridgeChain`] runs a single chain; [`sample_parallel`] and [`Sampler`]
//! run several, the latter on a background thread pool that can be paused,
//! inspected and aborted.

pub(crate) mod adapt;
pub(crate) mod chain;
pub(crate) mod coefficients;
pub(crate) mod design;
pub(crate) mod error;
pub(crate) mod likelihood;
pub(crate) mod linalg;
pub(crate) mod math;
pub(crate) mod moves;
pub(crate) mod polya_gamma;
pub(crate) mod prior;
pub(crate) mod sampler;
pub(crate) mod samples;
pub(crate) mod settings;
pub(crate) mod stable;
pub(crate) mod state;

pub use adapt::AdaptOptions;
pub use chain::{BridgeChain, Progress};
pub use coefficients::{
    CgOptions, CoefficientDraw, CoefficientSampler, PreconditionerKind, RegressionPrecision,
    SolveMethod,
};
pub use design::DesignMatrix;
pub use error::{BridgeError, NumericalError, SweepStage};
pub use likelihood::{
    GaussianLikelihood, Likelihood, LogisticLikelihood, NoiseVariance, Weights, WorkingResponse,
};
pub use linalg::{
    factorize_cholesky, sample_gaussian_direct, sample_gaussian_via_cg, solve_via_cg, CgOutcome,
    CgSample, CholeskyFactor, GaussianPrecision, LinearOperator, Preconditioner,
};
pub use moves::{
    BirthProposal, Entering, Leaving, MoveContext, MoveEngine, MoveKind, MoveOutcome,
    MoveStatistics, Proposal,
};
pub use polya_gamma::sample_polya_gamma;
pub use prior::{BridgePrior, GlobalScalePrior};
pub use sampler::{
    sample_parallel, sample_sequential, ChainProgress, Sampler,
    SamplerWaitResult, Trace,
};
pub use samples::{PosteriorSamples, Snapshot};
pub use settings::BridgeSettings;
pub use stable::{sample_inverse_gaussian, sample_positive_stable, sample_tilted_stable};
pub use state::{ActiveSet, ModelState};
