use std::fmt::Display;

use thiserror::Error;

use crate::moves::MoveKind;

/// Failures of the numerical kernels. All of them are recoverable by
/// retrying the sweep from the last committed state.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NumericalError {
    #[error("matrix of dimension {dim} is not positive definite")]
    NotPositiveDefinite { dim: usize },
    #[error("conjugate gradient stopped after {iterations} iterations with relative residual {residual:.3e}")]
    CgNotConverged { iterations: usize, residual: f64 },
    #[error("non-finite value {value} produced in {context}")]
    NonFinite { context: &'static str, value: f64 },
}

/// The stage of a sweep in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStage {
    Latent,
    Coefficients,
    LocalScales,
    GlobalScale,
    Move(MoveKind),
    Commit,
}

impl Display for SweepStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepStage::Latent => write!(f, "latent likelihood update"),
            SweepStage::Coefficients => write!(f, "coefficient draw"),
            SweepStage::LocalScales => write!(f, "local scale draw"),
            SweepStage::GlobalScale => write!(f, "global scale draw"),
            SweepStage::Move(kind) => write!(f, "{kind} move"),
            SweepStage::Commit => write!(f, "state commit"),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error(transparent)]
    Numerical(#[from] NumericalError),
    #[error("{name} = {value} is outside its domain: {reason}")]
    Domain {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("invalid sampler configuration: {0}")]
    Configuration(String),
    #[error("sweep {iteration} failed during {stage} after {attempts} attempt(s)")]
    SweepFailed {
        iteration: u64,
        stage: SweepStage,
        attempts: u32,
        #[source]
        source: Box<BridgeError>,
    },
    #[error("model state invariant violated: {0}")]
    CorruptState(String),
}

impl BridgeError {
    pub(crate) fn domain(name: &'static str, value: f64, reason: &'static str) -> Self {
        BridgeError::Domain {
            name,
            value,
            reason,
        }
    }

    /// Whether retrying the sweep from the previous state can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BridgeError::Numerical(_))
    }
}

/// Return a `NonFinite` error unless `value` is finite.
pub(crate) fn check_finite(context: &'static str, value: f64) -> Result<f64, NumericalError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(NumericalError::NonFinite { context, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors() {
        let err: BridgeError = NumericalError::NotPositiveDefinite { dim: 3 }.into();
        assert!(err.is_recoverable());
        assert!(!BridgeError::domain("alpha", 3.0, "must lie in (0, 2]").is_recoverable());

        let wrapped = BridgeError::SweepFailed {
            iteration: 12,
            stage: SweepStage::Move(MoveKind::Birth),
            attempts: 3,
            source: Box::new(err),
        };
        assert!(!wrapped.is_recoverable());
        assert_eq!(
            wrapped.to_string(),
            "sweep 12 failed during birth move after 3 attempt(s)"
        );
    }

    #[test]
    fn finite_check() {
        assert_eq!(check_finite("x", 1.5), Ok(1.5));
        assert!(matches!(
            check_finite("x", f64::NAN),
            Err(NumericalError::NonFinite { context: "x", .. })
        ));
    }
}
