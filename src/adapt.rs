use crate::{
    coefficients::{CoefficientSampler, SolveMethod},
    moves::{BirthProposal, MoveEngine},
    state::ModelState,
};

/// Settings of burn-in adaptation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptOptions {
    /// Factor by which the CG iteration budget grows after a fallback.
    pub cg_budget_growth: f64,
    /// The CG iteration budget never grows beyond this.
    pub cg_max_iterations_cap: usize,
    /// Lower bound of an adapted Gaussian birth proposal scale.
    pub min_birth_scale: f64,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            cg_budget_growth: 1.5,
            cg_max_iterations_cap: 10_000,
            min_birth_scale: 1e-3,
        }
    }
}

pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Tunes sampler parameters from the chain's own history. Only called
/// during burn-in; after that all tuned values stay frozen.
pub(crate) struct Adaptation {
    options: AdaptOptions,
    squared_coefficients: RunningMean,
}

impl Adaptation {
    pub(crate) fn new(options: AdaptOptions) -> Self {
        Self {
            options,
            squared_coefficients: RunningMean::new(),
        }
    }

    pub(crate) fn observe<L>(
        &mut self,
        state: &ModelState<L>,
        method: SolveMethod,
        coefficient_sampler: &mut CoefficientSampler,
        moves: &mut MoveEngine,
    ) {
        if let SolveMethod::Fallback { iterations } = method {
            let current = coefficient_sampler.options().max_iterations;
            let grown = ((current as f64) * self.options.cg_budget_growth).ceil() as usize;
            // A budget configured above the cap is never lowered.
            let next = grown.min(self.options.cg_max_iterations_cap.max(current));
            if next != current {
                log::debug!(
                    "CG budget {current} exhausted after {iterations} iterations, raising it to {next}"
                );
                coefficient_sampler.set_max_iterations(next);
            }
        }

        if let BirthProposal::Gaussian { scale, adapt: true } = moves.birth_proposal() {
            for &beta in &state.coefficients {
                self.squared_coefficients.add(beta * beta);
            }
            if self.squared_coefficients.count() > 0 {
                let next = self
                    .squared_coefficients
                    .current()
                    .sqrt()
                    .max(self.options.min_birth_scale);
                if (next - scale).abs() > 1e-3 * scale {
                    log::debug!("birth proposal scale {scale:.4} -> {next:.4}");
                }
                moves.set_birth_scale(next);
            }
        }
    }
}
