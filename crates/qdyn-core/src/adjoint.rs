//! Adjoint sensitivities with checkpointed recomputation.
//!
//! The forward pass steps each trajectory once, keeping only snapshots of
//! its [`LaneState`] every `checkpoint_stride` accepted steps. The backward
//! pass walks the snapshots in reverse. Each segment is replayed from its
//! snapshot and checked against the next one, then the costate
//!
//!   da/dt = −f*(a),   a(T) = ∂J/∂y(T)
//!
//! is integrated backwards over the replayed steps with the forward
//! method's own tableau, jumping by `∂J/∂y_s` at every save time. Parameter
//! gradients accumulate as `∫ Re Tr(a† ∂f/∂θ) dt`.
//!
//! The propagator method has no tableau. Its intervals are differentiated
//! exactly through a block matrix exponential, so its gradients carry no
//! discretisation error.

use ndarray::{Array1, Array2};
use num_complex::Complex64;
use tracing::{debug, instrument};

use crate::backend::{ArrayBackend, CpuBackend};
use crate::config::SolverConfig;
use crate::equation::{Evaluator, ParamGrads};
use crate::error::{SolveError, SolveResult};
use crate::functional::Functional;
use crate::integrator::{Integrator, Lane, LaneState, StepEvent, TrajectoryStatus};
use crate::method::{self, Method, Tableau, combine};
use crate::problem::Problem;
use crate::state::{dag, is_ket, max_abs};

/// Which gradients to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientTargets {
    /// Term matrices of the Hamiltonian.
    pub hamiltonian: bool,
    /// Term matrices of every jump operator.
    pub jump_ops: bool,
    /// The initial state as given to the problem.
    pub initial_state: bool,
}

impl Default for GradientTargets {
    fn default() -> Self {
        Self::all()
    }
}

impl GradientTargets {
    /// Everything.
    pub fn all() -> Self {
        Self {
            hamiltonian: true,
            jump_ops: true,
            initial_state: true,
        }
    }

    /// Nothing; only the functional value is computed.
    pub fn none() -> Self {
        Self {
            hamiltonian: false,
            jump_ops: false,
            initial_state: false,
        }
    }

    /// Add the Hamiltonian terms.
    #[must_use]
    pub fn with_hamiltonian(mut self) -> Self {
        self.hamiltonian = true;
        self
    }

    /// Add the jump-operator terms.
    #[must_use]
    pub fn with_jump_ops(mut self) -> Self {
        self.jump_ops = true;
        self
    }

    /// Add the initial state.
    #[must_use]
    pub fn with_initial_state(mut self) -> Self {
        self.initial_state = true;
        self
    }
}

/// Gradients of one trajectory, in the `dJ = Re Tr(G† dX)` convention.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// Functional value.
    pub value: f64,
    /// One matrix per Hamiltonian term.
    pub hamiltonian: Option<Vec<Array2<Complex64>>>,
    /// One list per jump operator, one matrix per term.
    pub jump_ops: Option<Vec<Vec<Array2<Complex64>>>>,
    /// Gradient with respect to the initial state in the shape it was given.
    pub initial_state: Option<Array2<Complex64>>,
}

/// Snapshots of one trajectory's stepping state.
#[derive(Debug, Clone)]
pub struct CheckpointSet {
    snapshots: Vec<LaneState>,
}

impl CheckpointSet {
    /// Number of snapshots, including start and end.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True when no snapshot was taken.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Snapshots in time order.
    pub fn snapshots(&self) -> &[LaneState] {
        &self.snapshots
    }
}

/// Gradients of `functional` for every trajectory, on the CPU backend.
pub fn gradient(
    problem: &Problem,
    method: &Method,
    config: &SolverConfig,
    functional: &dyn Functional,
    targets: GradientTargets,
) -> SolveResult<Vec<Gradients>> {
    gradient_with_backend(problem, method, config, functional, targets, &CpuBackend)
}

/// Gradients of `functional` for every trajectory.
#[instrument(skip_all, fields(method = method.name(), kind = %problem.kind()))]
pub fn gradient_with_backend(
    problem: &Problem,
    method: &Method,
    config: &SolverConfig,
    functional: &dyn Functional,
    targets: GradientTargets,
    backend: &dyn ArrayBackend,
) -> SolveResult<Vec<Gradients>> {
    let reverse = match (method.tableau(), method) {
        (Some(tableau), _) => Reverse::Stages(tableau),
        (None, Method::Propagator) => Reverse::Exact,
        _ => {
            return Err(SolveError::GradientUnsupported {
                method: method.name(),
            });
        }
    };
    config.validate()?;
    let batch = problem.validate(method)?;

    let mut config = config.clone();
    config.step_to_save_points = true;
    let efficiencies = problem.efficiencies();

    (0..batch)
        .map(|lane| {
            let inputs = problem.lane(lane);
            let eval = Evaluator::new(
                problem.kind(),
                inputs.hamiltonian,
                inputs.jump_ops,
                &efficiencies,
                backend,
            );
            let integrator = Integrator::new(eval, *method, &config, problem.tsave());
            let engine = Adjoint {
                integrator: &integrator,
                reverse,
                config: &config,
                lane,
            };
            let mut grads = engine.run(problem.integrated_initial_state(lane), functional)?;

            let given = inputs.initial_state;
            if let Some(a0) = grads.initial_state.take() {
                grads.initial_state = Some(if problem.kind().uses_density_matrix() && is_ket(given)
                {
                    // ρ = ψψ† ⇒ G_ψ = (a + a†) ψ
                    (&a0 + &dag(&a0)).dot(given)
                } else {
                    a0
                });
            }
            if !targets.hamiltonian {
                grads.hamiltonian = None;
            }
            if !targets.jump_ops {
                grads.jump_ops = None;
            }
            if !targets.initial_state {
                grads.initial_state = None;
            }
            Ok(grads)
        })
        .collect()
}

/// One accepted step regenerated from a checkpoint.
struct ReplayedStep {
    t: f64,
    h: f64,
    y_start: Array2<Complex64>,
    y_end: Array2<Complex64>,
    /// Save index recorded at the end of the step.
    saved: Option<usize>,
}

/// How a replayed step is run backwards.
#[derive(Debug, Clone, Copy)]
enum Reverse {
    /// Stage-by-stage with the forward tableau.
    Stages(&'static Tableau),
    /// Exact interval sensitivity of `exp(G Δt)`.
    Exact,
}

struct Adjoint<'i, 'a> {
    integrator: &'i Integrator<'a>,
    reverse: Reverse,
    config: &'i SolverConfig,
    lane: usize,
}

impl Adjoint<'_, '_> {
    fn run(&self, y0: Array2<Complex64>, functional: &dyn Functional) -> SolveResult<Gradients> {
        let (checkpoints, saved) = self.forward(y0)?;
        debug!(
            lane = self.lane,
            checkpoints = checkpoints.len(),
            "forward pass recorded"
        );

        let value = functional.value(&saved);
        let mut jumps: Vec<Option<Array2<Complex64>>> = vec![None; saved.len()];
        for (s, g) in functional.state_gradients(&saved) {
            if s >= saved.len() || g.dim() != saved[s].dim() {
                return Err(SolveError::shape(format!(
                    "functional gradient for save index {s} has shape {:?}",
                    g.dim()
                )));
            }
            match &mut jumps[s] {
                Some(acc) => *acc += &g,
                slot => *slot = Some(g),
            }
        }

        let eval = self.integrator.evaluator();
        let mut a = Array2::<Complex64>::zeros(saved[0].dim());
        let mut params = ParamGrads::zeros(eval.hamiltonian(), eval.jump_ops());

        for pair in checkpoints.snapshots.windows(2).rev() {
            let steps = self.replay(&pair[0], &pair[1])?;
            for step in steps.iter().rev() {
                if let Some(g) = step.saved.and_then(|s| jumps[s].as_ref()) {
                    a += g;
                }
                a = self.backward_step(step, a, &mut params)?;
            }
        }
        if let Some(g) = &jumps[0] {
            a += g;
        }

        Ok(Gradients {
            value,
            hamiltonian: Some(params.hamiltonian),
            jump_ops: Some(params.jump_ops),
            initial_state: Some(a),
        })
    }

    /// Step to the end, snapshotting every `checkpoint_stride` accepted steps.
    fn forward(
        &self,
        y0: Array2<Complex64>,
    ) -> SolveResult<(CheckpointSet, Vec<Array2<Complex64>>)> {
        let stride = self.config.checkpoint_stride as u64;
        let mut lane = self.integrator.start(self.lane, y0);
        let mut snapshots = vec![lane.state.clone()];
        while !lane.status().is_terminal() {
            if let StepEvent::Accepted { .. } = self.integrator.step(&mut lane)? {
                let accepted = lane.state.record.accepted_steps;
                if accepted % stride == 0 {
                    snapshots.push(lane.state.clone());
                }
            }
        }
        if let TrajectoryStatus::Diverged(reason) = lane.status() {
            return Err(SolveError::Divergence {
                lane: self.lane,
                reason,
            });
        }
        let last = snapshots.last().map(|s| s.record.accepted_steps);
        if last != Some(lane.state.record.accepted_steps) {
            snapshots.push(lane.state.clone());
        }
        Ok((CheckpointSet { snapshots }, lane.saved))
    }

    /// Regenerate the accepted steps between two snapshots and check that
    /// the replay ends where the forward pass did.
    fn replay(&self, from: &LaneState, to: &LaneState) -> SolveResult<Vec<ReplayedStep>> {
        let mut lane = Lane::resume(self.lane, from.clone());
        let mut steps = Vec::new();
        while lane.state.record.accepted_steps < to.record.accepted_steps
            && !lane.status().is_terminal()
        {
            let next_save = lane.state.next_save;
            let y_start = lane.state.y.clone();
            if let StepEvent::Accepted { t, h } = self.integrator.step(&mut lane)? {
                let saved = (lane.state.next_save > next_save).then(|| lane.state.next_save - 1);
                steps.push(ReplayedStep {
                    t,
                    h,
                    y_start,
                    y_end: lane.state.y.clone(),
                    saved,
                });
            }
        }

        let deviation = if lane.state.y.dim() == to.y.dim() {
            max_abs(&(&lane.state.y - &to.y))
        } else {
            f64::INFINITY
        };
        let tolerance =
            self.config.absolute_tolerance + self.config.relative_tolerance * max_abs(&to.y);
        if deviation > tolerance || lane.state.t != to.t {
            return Err(SolveError::AdjointInconsistency {
                lane: self.lane,
                t: to.t,
                deviation,
            });
        }
        Ok(steps)
    }

    /// Carry the costate from the end of `step` to its start.
    fn backward_step(
        &self,
        step: &ReplayedStep,
        a1: Array2<Complex64>,
        params: &mut ParamGrads,
    ) -> SolveResult<Array2<Complex64>> {
        match self.reverse {
            Reverse::Stages(tab) => self.stage_backward(tab, step, a1, params),
            Reverse::Exact => self.exact_backward(step, a1, params),
        }
    }

    /// Integrate `(y, a, θ)` backwards over one replayed step.
    fn stage_backward(
        &self,
        tab: &Tableau,
        step: &ReplayedStep,
        a1: Array2<Complex64>,
        params: &mut ParamGrads,
    ) -> SolveResult<Array2<Complex64>> {
        let eval = self.integrator.evaluator();
        let t1 = step.t + step.h;
        let h = step.h;
        // The FSAL stage has zero weight and feeds no other stage.
        let stages = if tab.fsal { tab.stages() - 1 } else { tab.stages() };

        let mut ky: Vec<Array2<Complex64>> = Vec::with_capacity(stages);
        let mut ka: Vec<Array2<Complex64>> = Vec::with_capacity(stages);
        for i in 0..stages {
            let ti = t1 - tab.c[i] * h;
            let (yi, ai) = if i == 0 {
                (step.y_end.clone(), a1.clone())
            } else {
                let row = tab.a[i - 1];
                (combine(&step.y_end, &ky, row, -h), combine(&a1, &ka, row, h))
            };
            eval.accumulate_param_grads(ti, &yi, &ai, h * tab.b[i], params)?;
            if i + 1 < stages {
                ky.push(eval.drift(ti, &yi)?);
            }
            ka.push(eval.adjoint_drift(ti, &ai)?);
        }
        Ok(combine(&a1, &ka, tab.b, h))
    }

    /// Pull the costate through `y_end = exp(G h) y_start` exactly.
    ///
    /// The generator sensitivity `W` is split column by column,
    /// `W = Σ_j W e_j e_j†`, and each column is handed to the same parameter
    /// accumulator the stage path uses with `y = unvec(e_j)`.
    fn exact_backward(
        &self,
        step: &ReplayedStep,
        a1: Array2<Complex64>,
        params: &mut ParamGrads,
    ) -> SolveResult<Array2<Complex64>> {
        let eval = self.integrator.evaluator();
        let kind = eval.kind();
        let n = a1.nrows();
        let g = method::generator(eval, step.t)?;
        let (u_dag, w) = method::propagator_sensitivity(eval, &g, &a1, &step.y_start, step.h);

        for j in 0..w.ncols() {
            let mut e = Array1::<Complex64>::zeros(w.ncols());
            e[j] = Complex64::new(1.0, 0.0);
            let basis = method::unvectorize(kind, e.view(), n);
            let column = method::unvectorize(kind, w.column(j), n);
            eval.accumulate_param_grads(step.t, &basis, &column, 1.0, params)?;
        }

        let a0 = eval
            .backend()
            .matmul(&u_dag, &method::vectorize(kind, &a1));
        Ok(method::unvectorize(kind, a0.column(0), n))
    }
}
