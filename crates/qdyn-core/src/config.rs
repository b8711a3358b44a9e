//! Solver configuration.
//!
//! Every field has a default, so a YAML or JSON document only needs to list
//! the options it changes:
//!
//! ```yaml
//! relative_tolerance: 1.0e-8
//! absolute_tolerance: 1.0e-8
//! max_steps: 5000
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SolveError, SolveResult};

/// Options shared by every trajectory of a solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Relative tolerance of the embedded error estimate.
    #[serde(default = "default_tolerance")]
    pub relative_tolerance: f64,

    /// Absolute tolerance of the embedded error estimate.
    #[serde(default = "default_tolerance")]
    pub absolute_tolerance: f64,

    /// Attempted steps (accepted plus rejected) allowed per trajectory.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// First step size; chosen automatically when absent.
    #[serde(default)]
    pub initial_step: Option<f64>,

    /// Smallest step the controller will shrink to.
    #[serde(default = "default_min_step")]
    pub min_step: f64,

    /// Largest step the controller will grow to.
    #[serde(default)]
    pub max_step: Option<f64>,

    /// Multiplier applied to every proposed step factor.
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,

    /// Lower clamp of the step factor.
    #[serde(default = "default_min_factor")]
    pub min_factor: f64,

    /// Upper clamp of the step factor.
    #[serde(default = "default_max_factor")]
    pub max_factor: f64,

    /// PI controller memory exponent; 0 gives a plain I controller.
    #[serde(default = "default_pi_beta")]
    pub pi_beta: f64,

    /// Relative distance under which a step end snaps onto a save point.
    #[serde(default = "default_save_epsilon")]
    pub save_epsilon: f64,

    /// Clip steps to land on save points instead of interpolating.
    #[serde(default = "default_true")]
    pub step_to_save_points: bool,

    /// Accepted steps between two adjoint checkpoints.
    #[serde(default = "default_checkpoint_stride")]
    pub checkpoint_stride: usize,

    /// Seed for stochastic increments.
    #[serde(default)]
    pub random_seed: u64,

    /// Fail the whole solve on the first diverged trajectory.
    #[serde(default)]
    pub strict: bool,
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_steps() -> usize {
    100_000
}

fn default_min_step() -> f64 {
    1e-12
}

fn default_safety_factor() -> f64 {
    0.9
}

fn default_min_factor() -> f64 {
    0.2
}

fn default_max_factor() -> f64 {
    5.0
}

fn default_pi_beta() -> f64 {
    0.04
}

fn default_save_epsilon() -> f64 {
    1e-12
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_stride() -> usize {
    32
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            relative_tolerance: default_tolerance(),
            absolute_tolerance: default_tolerance(),
            max_steps: default_max_steps(),
            initial_step: None,
            min_step: default_min_step(),
            max_step: None,
            safety_factor: default_safety_factor(),
            min_factor: default_min_factor(),
            max_factor: default_max_factor(),
            pi_beta: default_pi_beta(),
            save_epsilon: default_save_epsilon(),
            step_to_save_points: true,
            checkpoint_stride: default_checkpoint_stride(),
            random_seed: 0,
            strict: false,
        }
    }
}

impl SolverConfig {
    /// Set both tolerances.
    #[must_use]
    pub fn with_tolerances(mut self, relative: f64, absolute: f64) -> Self {
        self.relative_tolerance = relative;
        self.absolute_tolerance = absolute;
        self
    }

    /// Set the per-trajectory step budget.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Fix the first step size.
    #[must_use]
    pub fn with_initial_step(mut self, h: f64) -> Self {
        self.initial_step = Some(h);
        self
    }

    /// Set the minimum step size.
    #[must_use]
    pub fn with_min_step(mut self, h: f64) -> Self {
        self.min_step = h;
        self
    }

    /// Cap the step size.
    #[must_use]
    pub fn with_max_step(mut self, h: f64) -> Self {
        self.max_step = Some(h);
        self
    }

    /// Set the safety factor.
    #[must_use]
    pub fn with_safety_factor(mut self, safety: f64) -> Self {
        self.safety_factor = safety;
        self
    }

    /// Set the PI memory exponent.
    #[must_use]
    pub fn with_pi_beta(mut self, beta: f64) -> Self {
        self.pi_beta = beta;
        self
    }

    /// Interpolate save points instead of stepping onto them.
    #[must_use]
    pub fn with_step_to_save_points(mut self, enabled: bool) -> Self {
        self.step_to_save_points = enabled;
        self
    }

    /// Set the adjoint checkpoint stride.
    #[must_use]
    pub fn with_checkpoint_stride(mut self, stride: usize) -> Self {
        self.checkpoint_stride = stride;
        self
    }

    /// Set the stochastic seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Escalate the first divergence to an error.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Reject out-of-range options.
    pub fn validate(&self) -> SolveResult<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(SolveError::InvalidConfig(format!(
                    "{name} must be positive and finite, got {v}"
                )))
            }
        };
        positive("relative_tolerance", self.relative_tolerance)?;
        positive("absolute_tolerance", self.absolute_tolerance)?;
        positive("min_step", self.min_step)?;
        positive("safety_factor", self.safety_factor)?;
        positive("min_factor", self.min_factor)?;
        positive("max_factor", self.max_factor)?;
        if let Some(h) = self.initial_step {
            positive("initial_step", h)?;
        }
        if let Some(h) = self.max_step {
            positive("max_step", h)?;
            if h < self.min_step {
                return Err(SolveError::InvalidConfig(format!(
                    "max_step {h} is below min_step {}",
                    self.min_step
                )));
            }
        }
        if self.safety_factor > 1.0 {
            return Err(SolveError::InvalidConfig(format!(
                "safety_factor must not exceed 1, got {}",
                self.safety_factor
            )));
        }
        if self.min_factor > 1.0 || self.max_factor < 1.0 {
            return Err(SolveError::InvalidConfig(format!(
                "step factor clamp [{}, {}] must contain 1",
                self.min_factor, self.max_factor
            )));
        }
        if !(0.0..=0.2).contains(&self.pi_beta) {
            return Err(SolveError::InvalidConfig(format!(
                "pi_beta must lie in [0, 0.2], got {}",
                self.pi_beta
            )));
        }
        if !(self.save_epsilon >= 0.0 && self.save_epsilon < 1e-3) {
            return Err(SolveError::InvalidConfig(format!(
                "save_epsilon must lie in [0, 1e-3), got {}",
                self.save_epsilon
            )));
        }
        if self.max_steps == 0 {
            return Err(SolveError::InvalidConfig("max_steps must be at least 1".into()));
        }
        if self.checkpoint_stride == 0 {
            return Err(SolveError::InvalidConfig(
                "checkpoint_stride must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
