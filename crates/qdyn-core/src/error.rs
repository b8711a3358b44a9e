//! Error types for the integration engine.

use thiserror::Error;

use crate::integrator::DivergenceReason;

/// Errors produced while validating, integrating or differentiating a problem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SolveError {
    /// Operator, state or batch dimensions are inconsistent.
    #[error("shape error: {context}")]
    Shape {
        /// What was being checked.
        context: String,
    },

    /// The save schedule is empty or not strictly increasing.
    #[error("invalid save schedule: {0}")]
    InvalidSaveSchedule(String),

    /// A solver option is out of range.
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    /// The chosen method cannot integrate this equation or problem.
    #[error("method {method} cannot be used here: {reason}")]
    IncompatibleMethod {
        /// Method name.
        method: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A trajectory terminated without reaching the final save time.
    #[error("trajectory {lane} diverged: {reason}")]
    Divergence {
        /// Index of the trajectory in the batch.
        lane: usize,
        /// What stopped it.
        reason: DivergenceReason,
    },

    /// Checkpoint replay produced a different state than the forward pass.
    #[error(
        "adjoint replay of trajectory {lane} disagrees with its checkpoint at t = {t} (deviation {deviation:.3e})"
    )]
    AdjointInconsistency {
        /// Index of the trajectory in the batch.
        lane: usize,
        /// Checkpoint time.
        t: f64,
        /// Largest absolute entry deviation.
        deviation: f64,
    },

    /// The method has no adjoint rule.
    #[error("method {method} does not support adjoint gradients (supported: Dopri5, Dopri8, Tsit5, Euler, Propagator)")]
    GradientUnsupported {
        /// Method name.
        method: &'static str,
    },
}

impl SolveError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
        }
    }
}

/// Result type for engine operations.
pub type SolveResult<T> = Result<T, SolveError>;
