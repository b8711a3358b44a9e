//! Per-trajectory stepping loop.
//!
//! A [`Lane`] is one trajectory of a batch. [`Integrator::step`] moves it
//! through `Running → (accepted | rejected) → … → Finished | Diverged`,
//! recording save points as they are reached. All resumable stepping state
//! lives in [`LaneState`], which is what the adjoint engine checkpoints.

use std::fmt;

use ndarray::Array2;
use num_complex::Complex64;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SolverConfig;
use crate::controller::{StepController, blended_error_norm, clip_step, error_norm, initial_step};
use crate::equation::Evaluator;
use crate::error::SolveResult;
use crate::method::{self, Method};
use crate::state::is_finite;

/// Per-trajectory step counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Steps that advanced time.
    pub accepted_steps: u64,
    /// Steps retried with a smaller size.
    pub rejected_steps: u64,
    /// Derivative evaluations.
    pub rhs_evaluations: u64,
    /// Steps accepted at `min_step` despite failing the error test.
    pub min_step_hits: u64,
}

impl StepRecord {
    /// Accepted plus rejected steps.
    pub fn attempted(&self) -> u64 {
        self.accepted_steps + self.rejected_steps
    }
}

/// Why a trajectory stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceReason {
    /// The step budget ran out.
    MaxStepsExceeded {
        /// The budget.
        max_steps: usize,
    },
    /// The state stopped being finite.
    NonFinite {
        /// Time of the offending step.
        t: f64,
    },
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DivergenceReason::MaxStepsExceeded { max_steps } => {
                write!(f, "exceeded max_steps = {max_steps}")
            }
            DivergenceReason::NonFinite { t } => write!(f, "non-finite state at t = {t}"),
        }
    }
}

/// Lifecycle of one trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    /// Still stepping.
    Running,
    /// Every save point recorded.
    Finished,
    /// Stopped early; saved states past the stop are invalid.
    Diverged(DivergenceReason),
}

impl TrajectoryStatus {
    /// True for `Finished` and `Diverged`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrajectoryStatus::Running)
    }

    /// True for `Finished`.
    pub fn is_finished(&self) -> bool {
        matches!(self, TrajectoryStatus::Finished)
    }
}

impl fmt::Display for TrajectoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrajectoryStatus::Running => f.write_str("running"),
            TrajectoryStatus::Finished => f.write_str("finished"),
            TrajectoryStatus::Diverged(reason) => write!(f, "diverged ({reason})"),
        }
    }
}

/// Everything needed to resume stepping a trajectory.
#[derive(Debug, Clone)]
pub struct LaneState {
    /// Current time.
    pub t: f64,
    /// Current state.
    pub y: Array2<Complex64>,
    /// Next step size to try; zero before the first step.
    pub h: f64,
    /// Derivative at `(t, y)` carried over from an FSAL stage.
    pub fsal: Option<Array2<Complex64>>,
    /// PI controller memory.
    pub prev_err: f64,
    /// The previous attempt was rejected.
    pub last_rejected: bool,
    /// Index of the next save point to record.
    pub next_save: usize,
    /// Step counters.
    pub record: StepRecord,
    /// Lifecycle.
    pub status: TrajectoryStatus,
    /// Stochastic increment source.
    pub rng: StdRng,
    /// Measurement increments accumulated since the last save point.
    pub pending_signal: Vec<f64>,
}

/// What a call to [`Integrator::step`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEvent {
    /// Time advanced from `t` by `h`.
    Accepted {
        /// Start of the step.
        t: f64,
        /// Step size.
        h: f64,
    },
    /// The attempt was discarded.
    Rejected,
    /// The lane was already terminal or just became terminal without
    /// stepping.
    Idle,
}

/// One trajectory with its outputs.
#[derive(Debug, Clone)]
pub struct Lane {
    /// Position in the batch.
    pub index: usize,
    /// Resumable stepping state.
    pub state: LaneState,
    /// States recorded at save points so far.
    pub saved: Vec<Array2<Complex64>>,
    /// Mean measurement current per channel and save interval.
    pub measurements: Vec<Vec<f64>>,
    propagators: FxHashMap<u64, Array2<Complex64>>,
    warned: bool,
}

impl Lane {
    /// Rebuild a lane from a snapshot, without outputs.
    pub fn resume(index: usize, state: LaneState) -> Self {
        let channels = state.pending_signal.len();
        Self {
            index,
            state,
            saved: Vec::new(),
            measurements: vec![Vec::new(); channels],
            propagators: FxHashMap::default(),
            warned: false,
        }
    }

    /// Lifecycle.
    pub fn status(&self) -> TrajectoryStatus {
        self.state.status
    }
}

/// Seed of lane `index` derived from the configured seed.
///
/// The default stream of a trajectory depends on its position in the batch.
/// [`Problem::with_trajectory_seeds`](crate::Problem::with_trajectory_seeds)
/// pins explicit seeds so a lane can be rerun on its own.
pub fn lane_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add((index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Steps trajectories of one problem instance.
#[derive(Debug)]
pub struct Integrator<'a> {
    eval: Evaluator<'a>,
    method: Method,
    config: &'a SolverConfig,
    controller: StepController,
    tsave: &'a [f64],
    seed: Option<u64>,
}

impl<'a> Integrator<'a> {
    /// Bind an evaluator, a method and a save schedule.
    pub fn new(
        eval: Evaluator<'a>,
        method: Method,
        config: &'a SolverConfig,
        tsave: &'a [f64],
    ) -> Self {
        let error_order = method.tableau().map_or(1, |tab| tab.order);
        Self {
            eval,
            method,
            config,
            controller: StepController::new(config, error_order),
            tsave,
            seed: None,
        }
    }

    /// Use `seed` for the stochastic stream instead of deriving it from the
    /// lane index.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The evaluator.
    pub fn evaluator(&self) -> &Evaluator<'a> {
        &self.eval
    }

    /// The stepping method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Save schedule.
    pub fn tsave(&self) -> &'a [f64] {
        self.tsave
    }

    /// A fresh lane at `tsave[0]` holding `y0`.
    pub fn start(&self, index: usize, y0: Array2<Complex64>) -> Lane {
        let channels = self.eval.n_channels();
        let status = if self.tsave.len() <= 1 {
            TrajectoryStatus::Finished
        } else {
            TrajectoryStatus::Running
        };
        let state = LaneState {
            t: self.tsave.first().copied().unwrap_or(0.0),
            y: y0.clone(),
            h: 0.0,
            fsal: None,
            prev_err: StepController::initial_memory(),
            last_rejected: false,
            next_save: 1,
            record: StepRecord::default(),
            status,
            rng: StdRng::seed_from_u64(
                self.seed
                    .unwrap_or_else(|| lane_seed(self.config.random_seed, index)),
            ),
            pending_signal: vec![0.0; channels],
        };
        let mut lane = Lane::resume(index, state);
        lane.saved.push(y0);
        lane
    }

    /// Step until the lane is terminal.
    pub fn run(&self, lane: &mut Lane) -> SolveResult<()> {
        while !lane.status().is_terminal() {
            self.step(lane)?;
        }
        Ok(())
    }

    /// Attempt one step.
    ///
    /// Fails only when an operator stops honouring its shape contract; a
    /// trajectory that blows up diverges instead.
    pub fn step(&self, lane: &mut Lane) -> SolveResult<StepEvent> {
        if lane.state.status.is_terminal() {
            return Ok(StepEvent::Idle);
        }
        if lane.state.record.attempted() >= self.config.max_steps as u64 {
            let reason = DivergenceReason::MaxStepsExceeded {
                max_steps: self.config.max_steps,
            };
            self.diverge(lane, reason);
            return Ok(StepEvent::Idle);
        }
        match self.method {
            Method::Dopri5 | Method::Dopri8 | Method::Tsit5 => self.step_adaptive(lane),
            Method::Euler { dt } | Method::Rouchon1 { dt } | Method::EulerMaruyama { dt } => {
                self.step_fixed(lane, dt)
            }
            Method::Propagator => self.step_propagator(lane),
        }
    }

    fn step_adaptive(&self, lane: &mut Lane) -> SolveResult<StepEvent> {
        let Some(tableau) = self.method.tableau() else {
            return Ok(StepEvent::Idle);
        };
        let eval = &self.eval;
        let t = lane.state.t;
        let t_final = self.tsave[self.tsave.len() - 1];

        if lane.state.h <= 0.0 {
            let f0 = eval.drift(t, &lane.state.y)?;
            lane.state.record.rhs_evaluations += 1;
            let h0 = match self.config.initial_step {
                Some(h) => h,
                None => {
                    lane.state.record.rhs_evaluations += 1;
                    initial_step(
                        |t, y| eval.drift(t, y),
                        t,
                        &lane.state.y,
                        &f0,
                        tableau.order,
                        self.config.relative_tolerance,
                        self.config.absolute_tolerance,
                        t_final - t,
                    )?
                }
            };
            lane.state.h = h0.clamp(self.controller.min_step(), self.controller.max_step());
            lane.state.fsal = Some(f0);
        }

        let h = lane.state.h.min(self.controller.max_step());
        let target = if self.config.step_to_save_points || !self.method.has_dense_output() {
            self.tsave[lane.state.next_save]
        } else {
            t_final
        };
        let (h_step, lands) = clip_step(t, h, target, self.config.save_epsilon);

        let proposal = method::rk_step(
            tableau,
            |t, y| eval.drift(t, y),
            t,
            &lane.state.y,
            h_step,
            lane.state.fsal.as_ref(),
        )?;
        lane.state.record.rhs_evaluations += proposal.evaluations;

        let norm = |e: &Array2<Complex64>| {
            error_norm(
                e,
                &lane.state.y,
                &proposal.y_new,
                self.config.relative_tolerance,
                self.config.absolute_tolerance,
            )
        };
        let err = match (&proposal.error, &proposal.error_low) {
            (Some(high), Some(low)) => blended_error_norm(norm(high), norm(low)),
            (Some(high), None) => norm(high),
            _ => 0.0,
        };
        let decision = self.controller.decide(
            h_step,
            h,
            err,
            lane.state.prev_err,
            lane.state.last_rejected,
        );

        if !decision.accepted {
            lane.state.record.rejected_steps += 1;
            lane.state.last_rejected = true;
            lane.state.h = decision.next_step;
            return Ok(StepEvent::Rejected);
        }

        if decision.forced {
            self.note_min_step(lane, t, err);
        }
        let t_new = if lands { target } else { t + h_step };
        let next_h = if lands && h_step < h {
            decision.next_step.max(h)
        } else {
            decision.next_step
        };
        let fsal = proposal.fsal(tableau).cloned();
        let y_old = std::mem::replace(&mut lane.state.y, proposal.y_new);
        lane.state.record.accepted_steps += 1;
        lane.state.prev_err = StepController::memory(err);
        lane.state.last_rejected = false;
        lane.state.h = next_h;
        lane.state.fsal = fsal;
        lane.state.t = t_new;

        if !is_finite(&lane.state.y) {
            self.diverge(lane, DivergenceReason::NonFinite { t: t_new });
            return Ok(StepEvent::Accepted { t, h: h_step });
        }

        self.record_saves(lane, t, &y_old, h_step, &proposal.stages);
        Ok(StepEvent::Accepted { t, h: h_step })
    }

    fn step_fixed(&self, lane: &mut Lane, dt: f64) -> SolveResult<StepEvent> {
        let t = lane.state.t;
        let target = self.tsave[lane.state.next_save];
        let (h, _) = clip_step(t, dt, target, self.config.save_epsilon);
        let y = &lane.state.y;

        let y_new = match self.method {
            Method::Rouchon1 { .. } => method::rouchon1_step(&self.eval, t, y, h)?,
            Method::EulerMaruyama { .. } => {
                let (y_new, increments) =
                    method::euler_maruyama_step(&self.eval, t, y, h, &mut lane.state.rng)?;
                for (acc, dy) in lane.state.pending_signal.iter_mut().zip(increments) {
                    *acc += dy;
                }
                y_new
            }
            _ => {
                let mut y_new = y.clone();
                y_new.scaled_add(Complex64::new(h, 0.0), &self.eval.drift(t, y)?);
                y_new
            }
        };
        lane.state.record.rhs_evaluations += 1;
        Ok(self.advance(lane, t, h, y_new))
    }

    fn step_propagator(&self, lane: &mut Lane) -> SolveResult<StepEvent> {
        let t = lane.state.t;
        let h = self.tsave[lane.state.next_save] - t;
        let key = h.to_bits();
        if !lane.propagators.contains_key(&key) {
            let u = method::propagator(&self.eval, h)?;
            lane.propagators.insert(key, u);
        }
        let y_new = method::apply_propagator(&self.eval, &lane.propagators[&key], &lane.state.y);
        lane.state.record.rhs_evaluations += 1;
        Ok(self.advance(lane, t, h, y_new))
    }

    /// Accept a step of a non-embedded method that was clipped onto or
    /// before the next save point.
    fn advance(&self, lane: &mut Lane, t: f64, h: f64, y_new: Array2<Complex64>) -> StepEvent {
        let target = self.tsave[lane.state.next_save];
        let tolerance = self.config.save_epsilon * target.abs().max(1.0);
        let lands = (t + h - target).abs() <= tolerance;
        lane.state.record.accepted_steps += 1;
        lane.state.h = h;
        lane.state.t = if lands { target } else { t + h };
        lane.state.y = y_new;

        if !is_finite(&lane.state.y) {
            self.diverge(lane, DivergenceReason::NonFinite { t: lane.state.t });
            return StepEvent::Accepted { t, h };
        }
        if lands {
            self.push_save(lane, None);
        }
        StepEvent::Accepted { t, h }
    }

    /// Record every save point reached by the step `[t, t + h]`.
    fn record_saves(
        &self,
        lane: &mut Lane,
        t: f64,
        y_old: &Array2<Complex64>,
        h: f64,
        stages: &[Array2<Complex64>],
    ) {
        let t_new = lane.state.t;
        while lane.state.next_save < self.tsave.len() {
            let ts = self.tsave[lane.state.next_save];
            let tolerance = self.config.save_epsilon * ts.abs().max(1.0);
            if ts > t_new + tolerance {
                break;
            }
            if (ts - t_new).abs() <= tolerance {
                self.push_save(lane, None);
            } else {
                let theta = ((ts - t) / h).clamp(0.0, 1.0);
                let y = self
                    .method
                    .interpolate(y_old, &lane.state.y, stages, h, theta);
                self.push_save(lane, Some(y));
            }
        }
    }

    fn push_save(&self, lane: &mut Lane, y: Option<Array2<Complex64>>) {
        let index = lane.state.next_save;
        lane.saved.push(y.unwrap_or_else(|| lane.state.y.clone()));
        if !lane.state.pending_signal.is_empty() {
            let width = self.tsave[index] - self.tsave[index - 1];
            for (channel, acc) in lane.state.pending_signal.iter_mut().enumerate() {
                lane.measurements[channel].push(*acc / width);
                *acc = 0.0;
            }
        }
        lane.state.next_save += 1;
        if lane.state.next_save == self.tsave.len() {
            lane.state.status = TrajectoryStatus::Finished;
            debug!(
                lane = lane.index,
                accepted = lane.state.record.accepted_steps,
                rejected = lane.state.record.rejected_steps,
                "trajectory finished"
            );
        }
    }

    fn note_min_step(&self, lane: &mut Lane, t: f64, err: f64) {
        lane.state.record.min_step_hits += 1;
        if lane.warned {
            return;
        }
        lane.warned = true;
        warn!(
            lane = lane.index,
            t,
            error = err,
            min_step = self.controller.min_step(),
            "tolerance cannot be met at the minimum step size, continuing with min_step"
        );
    }

    fn diverge(&self, lane: &mut Lane, reason: DivergenceReason) {
        debug!(lane = lane.index, t = lane.state.t, %reason, "trajectory diverged");
        lane.state.status = TrajectoryStatus::Diverged(reason);
    }
}
