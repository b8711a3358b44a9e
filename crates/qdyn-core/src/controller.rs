//! Adaptive step-size control.
//!
//! Embedded-pair error norm, PI accept/reject rule, Hairer–Wanner initial
//! step selection and clipping of steps onto save points.

use ndarray::Array2;
use num_complex::Complex64;

use crate::config::SolverConfig;
use crate::error::SolveResult;

/// Floor for the error of an accepted step, used as PI memory.
const MIN_ERROR_MEMORY: f64 = 1e-4;

/// RMS over all complex entries of `|err| / (atol + rtol · max(|y|, |y_new|))`.
pub fn error_norm(
    err: &Array2<Complex64>,
    y: &Array2<Complex64>,
    y_new: &Array2<Complex64>,
    rtol: f64,
    atol: f64,
) -> f64 {
    let n = err.len().max(1) as f64;
    let sum_sq: f64 = err
        .iter()
        .zip(y.iter().zip(y_new.iter()))
        .map(|(e, (a, b))| {
            let scale = atol + rtol * a.norm().max(b.norm());
            (e.norm() / scale).powi(2)
        })
        .sum();
    (sum_sq / n).sqrt()
}

/// Blend of a high- and a low-order error norm, `e_h² / √(e_h² + 0.01 e_l²)`.
///
/// Tracks the high-order estimate where both agree and backs off when the
/// low-order one signals that the high-order estimate is unreliable.
pub fn blended_error_norm(high: f64, low: f64) -> f64 {
    if high == 0.0 {
        return 0.0;
    }
    high * high / (high * high + 0.01 * low * low).sqrt()
}

fn scaled_rms(v: &Array2<Complex64>, scale: &Array2<f64>) -> f64 {
    let n = v.len().max(1) as f64;
    let sum_sq: f64 = v
        .iter()
        .zip(scale.iter())
        .map(|(z, s)| (z.norm() / s).powi(2))
        .sum();
    (sum_sq / n).sqrt()
}

/// Outcome of one accept/reject decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the step advances time.
    pub accepted: bool,
    /// The step was accepted only because it sat at `min_step`.
    pub forced: bool,
    /// Proposed size of the next attempt.
    pub next_step: f64,
}

/// PI step-size controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepController {
    safety: f64,
    min_factor: f64,
    max_factor: f64,
    beta: f64,
    min_step: f64,
    max_step: f64,
    /// Exponent denominator: the order of the error estimate plus one.
    error_order: u32,
}

impl StepController {
    /// Controller for a method whose error estimate has the given order.
    pub fn new(config: &SolverConfig, error_order: u32) -> Self {
        Self {
            safety: config.safety_factor,
            min_factor: config.min_factor,
            max_factor: config.max_factor,
            beta: config.pi_beta,
            min_step: config.min_step,
            max_step: config.max_step.unwrap_or(f64::INFINITY),
            error_order: error_order.max(1),
        }
    }

    /// Smallest allowed step.
    pub fn min_step(&self) -> f64 {
        self.min_step
    }

    /// Largest allowed step.
    pub fn max_step(&self) -> f64 {
        self.max_step
    }

    /// Decide on a step of size `h` with error norm `err`.
    ///
    /// `proposed` is the controller's step before it was clipped onto a
    /// save point; only a proposal at `min_step` is accepted regardless of
    /// the error. `prev_err` is the error of the last accepted step and
    /// `after_reject` is set when the previous attempt was rejected; in that
    /// case the step may not grow.
    pub fn decide(
        &self,
        h: f64,
        proposed: f64,
        err: f64,
        prev_err: f64,
        after_reject: bool,
    ) -> Decision {
        let k = f64::from(self.error_order);
        if err.is_nan() {
            return self.reject(h, proposed, self.min_factor);
        }
        if err <= 1.0 {
            let err = err.max(1e-10);
            let mut factor = self.safety
                * err.powf(-1.0 / k + 0.75 * self.beta)
                * prev_err.max(MIN_ERROR_MEMORY).powf(self.beta);
            factor = factor.clamp(self.min_factor, self.max_factor);
            if after_reject {
                factor = factor.min(1.0);
            }
            Decision {
                accepted: true,
                forced: false,
                next_step: (h * factor).clamp(self.min_step, self.max_step),
            }
        } else {
            let factor = (self.safety * err.powf(-1.0 / k)).clamp(self.min_factor, 1.0);
            self.reject(h, proposed, factor)
        }
    }

    fn reject(&self, h: f64, proposed: f64, factor: f64) -> Decision {
        if proposed.max(h) <= self.min_step * (1.0 + 1e-12) {
            return Decision {
                accepted: true,
                forced: true,
                next_step: self.min_step,
            };
        }
        Decision {
            accepted: false,
            forced: false,
            next_step: (h * factor).max(self.min_step),
        }
    }

    /// PI memory after accepting a step with error `err`.
    pub fn memory(err: f64) -> f64 {
        err.max(MIN_ERROR_MEMORY)
    }

    /// Initial memory before any step was accepted.
    pub fn initial_memory() -> f64 {
        MIN_ERROR_MEMORY
    }
}

/// Hairer–Wanner starting step for a method of order `order`.
///
/// `f0` is the derivative at `(t0, y0)` and `rhs` evaluates the derivative
/// once more at a trial point.
#[allow(clippy::too_many_arguments)]
pub fn initial_step(
    rhs: impl FnOnce(f64, &Array2<Complex64>) -> SolveResult<Array2<Complex64>>,
    t0: f64,
    y0: &Array2<Complex64>,
    f0: &Array2<Complex64>,
    order: u32,
    rtol: f64,
    atol: f64,
    span: f64,
) -> SolveResult<f64> {
    let scale = y0.mapv(|z| atol + rtol * z.norm());
    let d0 = scaled_rms(y0, &scale);
    let d1 = scaled_rms(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(span);

    let mut y1 = y0.clone();
    y1.scaled_add(Complex64::new(h0, 0.0), f0);
    let f1 = rhs(t0 + h0, &y1)?;
    let d2 = scaled_rms(&(&f1 - f0), &scale) / h0;

    let d = d1.max(d2);
    let h1 = if d <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d).powf(1.0 / f64::from(order.max(1)))
    };
    Ok((100.0 * h0).min(h1).min(span))
}

/// Truncate a step so it does not overshoot `target`.
///
/// Returns the possibly shortened step and whether it ends exactly on
/// `target`. A step ending within `epsilon · max(1, |target|)` of the target
/// snaps onto it.
pub fn clip_step(t: f64, h: f64, target: f64, epsilon: f64) -> (f64, bool) {
    let tolerance = epsilon * target.abs().max(1.0);
    if t + h >= target - tolerance {
        (target - t, true)
    } else {
        (h, false)
    }
}
