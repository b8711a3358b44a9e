//! Problem definition and validation.
//!
//! A [`Problem`] holds batches of Hamiltonians, jump-operator sets and
//! initial states. Each batch has either one entry, broadcast to every
//! trajectory, or a common length `N`.

use ndarray::Array2;
use num_complex::Complex64;
use tracing::warn;

use crate::equation::EquationKind;
use crate::error::{SolveError, SolveResult};
use crate::method::Method;
use crate::operator::Operator;
use crate::state::{hermiticity_error, is_ket, ket_to_dm, norm};

/// An evolution problem over a shared save schedule.
#[derive(Debug, Clone)]
pub struct Problem {
    kind: EquationKind,
    hamiltonians: Vec<Operator>,
    jump_ops: Vec<Vec<Operator>>,
    initial_states: Vec<Array2<Complex64>>,
    tsave: Vec<f64>,
    efficiencies: Option<Vec<f64>>,
    seeds: Option<Vec<u64>>,
}

/// The inputs of one trajectory after broadcasting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LaneInputs<'a> {
    pub hamiltonian: &'a Operator,
    pub jump_ops: &'a [Operator],
    pub initial_state: &'a Array2<Complex64>,
}

fn pick<T>(items: &[T], lane: usize) -> &T {
    if items.len() == 1 { &items[0] } else { &items[lane] }
}

impl Problem {
    /// Problem with one Hamiltonian, one initial state and no jump
    /// operators.
    pub fn new(
        kind: EquationKind,
        hamiltonian: impl Into<Operator>,
        initial_state: Array2<Complex64>,
        tsave: Vec<f64>,
    ) -> Self {
        Self {
            kind,
            hamiltonians: vec![hamiltonian.into()],
            jump_ops: vec![Vec::new()],
            initial_states: vec![initial_state],
            tsave,
            efficiencies: None,
            seeds: None,
        }
    }

    /// `dψ/dt = −i H ψ`.
    pub fn schrodinger(
        hamiltonian: impl Into<Operator>,
        psi0: Array2<Complex64>,
        tsave: Vec<f64>,
    ) -> Self {
        Self::new(EquationKind::Schrodinger, hamiltonian, psi0, tsave)
    }

    /// Lindblad master equation. A ket initial state is turned into
    /// `|ψ⟩⟨ψ|`.
    pub fn lindblad(
        hamiltonian: impl Into<Operator>,
        jump_ops: Vec<Operator>,
        rho0: Array2<Complex64>,
        tsave: Vec<f64>,
    ) -> Self {
        Self::new(EquationKind::Lindblad, hamiltonian, rho0, tsave).with_jump_ops(jump_ops)
    }

    /// Diffusive stochastic master equation; every jump operator is a
    /// measured channel.
    pub fn stochastic(
        hamiltonian: impl Into<Operator>,
        jump_ops: Vec<Operator>,
        rho0: Array2<Complex64>,
        tsave: Vec<f64>,
    ) -> Self {
        Self::new(EquationKind::StochasticMaster, hamiltonian, rho0, tsave)
            .with_jump_ops(jump_ops)
    }

    /// Replace the jump operators with a single set.
    #[must_use]
    pub fn with_jump_ops(mut self, jump_ops: Vec<Operator>) -> Self {
        self.jump_ops = vec![jump_ops];
        self
    }

    /// Batch of Hamiltonians.
    #[must_use]
    pub fn with_hamiltonian_batch(mut self, hamiltonians: Vec<Operator>) -> Self {
        self.hamiltonians = hamiltonians;
        self
    }

    /// Batch of jump-operator sets.
    #[must_use]
    pub fn with_jump_ops_batch(mut self, jump_ops: Vec<Vec<Operator>>) -> Self {
        self.jump_ops = jump_ops;
        self
    }

    /// Batch of initial states.
    #[must_use]
    pub fn with_initial_state_batch(mut self, states: Vec<Array2<Complex64>>) -> Self {
        self.initial_states = states;
        self
    }

    /// Detection efficiencies of the measured channels, one per jump
    /// operator. Defaults to 1.
    #[must_use]
    pub fn with_efficiencies(mut self, efficiencies: Vec<f64>) -> Self {
        self.efficiencies = Some(efficiencies);
        self
    }

    /// Explicit seeds of the stochastic streams, one per trajectory.
    ///
    /// Without them each trajectory derives its seed from
    /// [`SolverConfig::random_seed`](crate::SolverConfig) and its position in
    /// the batch, so lane `i` of a batch only repeats inside the same batch
    /// layout. With explicit seeds a lane run alone with the same seed draws
    /// the same noise.
    #[must_use]
    pub fn with_trajectory_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    /// Equation class.
    pub fn kind(&self) -> EquationKind {
        self.kind
    }

    /// Save schedule.
    pub fn tsave(&self) -> &[f64] {
        &self.tsave
    }

    /// Hamiltonian batch.
    pub fn hamiltonians(&self) -> &[Operator] {
        &self.hamiltonians
    }

    /// Jump-operator batch.
    pub fn jump_op_sets(&self) -> &[Vec<Operator>] {
        &self.jump_ops
    }

    /// Initial-state batch as given.
    pub fn initial_states(&self) -> &[Array2<Complex64>] {
        &self.initial_states
    }

    /// Number of jump operators per trajectory.
    pub fn n_jump_ops(&self) -> usize {
        self.jump_ops.first().map_or(0, Vec::len)
    }

    /// Channel efficiencies, defaulting to 1.
    pub fn efficiencies(&self) -> Vec<f64> {
        self.efficiencies
            .clone()
            .unwrap_or_else(|| vec![1.0; self.n_jump_ops()])
    }

    /// Broadcast batch size.
    pub fn batch_size(&self) -> SolveResult<usize> {
        let sizes = [
            ("hamiltonian", self.hamiltonians.len()),
            ("jump operators", self.jump_ops.len()),
            ("initial state", self.initial_states.len()),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, n)| *n == 0) {
            return Err(SolveError::shape(format!("empty {name} batch")));
        }
        let n = sizes.iter().map(|(_, n)| *n).max().unwrap_or(1);
        for (name, size) in sizes {
            if size != 1 && size != n {
                return Err(SolveError::shape(format!(
                    "{name} batch of size {size} cannot broadcast to {n}"
                )));
            }
        }
        Ok(n)
    }

    /// True when every operator is time independent.
    pub fn is_constant(&self) -> bool {
        self.hamiltonians.iter().all(Operator::is_constant)
            && self.jump_ops.iter().flatten().all(Operator::is_constant)
    }

    /// Shape of the integrated state: `(n, 1)` for kets under Schrödinger
    /// evolution, `(n, n)` for density matrices.
    pub fn state_shape(&self) -> (usize, usize) {
        let dim = self.initial_states.first().map_or((0, 0), |s| s.dim());
        if self.kind.uses_density_matrix() {
            (dim.0, dim.0)
        } else {
            dim
        }
    }

    /// Validate everything that can be checked before stepping; returns the
    /// batch size.
    pub fn validate(&self, method: &Method) -> SolveResult<usize> {
        self.validate_tsave()?;
        let batch = self.batch_size()?;
        let t0 = self.tsave[0];

        let shape = self.initial_states[0].dim();
        let n = shape.0;
        if n == 0 {
            return Err(SolveError::shape("initial state has dimension 0"));
        }
        for (i, state) in self.initial_states.iter().enumerate() {
            if state.dim() != shape {
                return Err(SolveError::shape(format!(
                    "initial state {i} has shape {:?}, expected {shape:?}",
                    state.dim()
                )));
            }
        }
        if self.kind.uses_density_matrix() && !(is_ket(&self.initial_states[0]) || shape.1 == n)
        {
            return Err(SolveError::shape(format!(
                "{} problems need a ket or a square density matrix, got {shape:?}",
                self.kind
            )));
        }

        for (i, h) in self.hamiltonians.iter().enumerate() {
            check_operator(h, n, t0).map_err(|e| SolveError::shape(format!("hamiltonian {i}: {e}")))?;
            let m = h.at(t0)?;
            if hermiticity_error(&m) > 1e-10 * norm(&m).max(1.0) {
                warn!(batch_index = i, "hamiltonian is not Hermitian at t0");
            }
        }

        let n_jumps = self.n_jump_ops();
        for (i, set) in self.jump_ops.iter().enumerate() {
            if set.len() != n_jumps {
                return Err(SolveError::shape(format!(
                    "jump operator set {i} has {} operators, expected {n_jumps}",
                    set.len()
                )));
            }
            for (k, l) in set.iter().enumerate() {
                check_operator(l, n, t0)
                    .map_err(|e| SolveError::shape(format!("jump operator {k} of set {i}: {e}")))?;
            }
        }
        if self.kind == EquationKind::Schrodinger && n_jumps > 0 {
            return Err(SolveError::shape(
                "schrodinger problems take no jump operators",
            ));
        }

        if let Some(eff) = &self.efficiencies {
            if eff.len() != n_jumps {
                return Err(SolveError::shape(format!(
                    "{} efficiencies given for {n_jumps} jump operators",
                    eff.len()
                )));
            }
            if let Some(bad) = eff.iter().find(|e| !(0.0..=1.0).contains(*e)) {
                return Err(SolveError::InvalidConfig(format!(
                    "efficiency {bad} is outside [0, 1]"
                )));
            }
        }

        if let Some(seeds) = &self.seeds {
            if seeds.len() != batch {
                return Err(SolveError::shape(format!(
                    "{} trajectory seeds given for a batch of {batch}",
                    seeds.len()
                )));
            }
        }

        method.check_compatible(self.kind, self.is_constant())?;
        Ok(batch)
    }

    fn validate_tsave(&self) -> SolveResult<()> {
        if self.tsave.is_empty() {
            return Err(SolveError::InvalidSaveSchedule("no save times".into()));
        }
        if let Some(t) = self.tsave.iter().find(|t| !t.is_finite()) {
            return Err(SolveError::InvalidSaveSchedule(format!(
                "save time {t} is not finite"
            )));
        }
        if let Some(w) = self.tsave.windows(2).find(|w| w[1] <= w[0]) {
            return Err(SolveError::InvalidSaveSchedule(format!(
                "save times must be strictly increasing, found {} then {}",
                w[0], w[1]
            )));
        }
        Ok(())
    }

    /// Broadcast inputs of trajectory `lane`.
    pub(crate) fn lane(&self, lane: usize) -> LaneInputs<'_> {
        LaneInputs {
            hamiltonian: pick(&self.hamiltonians, lane),
            jump_ops: pick(&self.jump_ops, lane).as_slice(),
            initial_state: pick(&self.initial_states, lane),
        }
    }

    /// Explicit seed of trajectory `lane`, if any.
    pub(crate) fn trajectory_seed(&self, lane: usize) -> Option<u64> {
        self.seeds.as_ref().and_then(|seeds| seeds.get(lane).copied())
    }

    /// Initial state of trajectory `lane` in integrated form.
    pub(crate) fn integrated_initial_state(&self, lane: usize) -> Array2<Complex64> {
        let y0 = pick(&self.initial_states, lane);
        if self.kind.uses_density_matrix() {
            ket_to_dm(y0)
        } else {
            y0.clone()
        }
    }
}

fn check_operator(op: &Operator, n: usize, t0: f64) -> Result<(), String> {
    if op.dim() != n {
        return Err(format!("dimension {} does not match state dimension {n}", op.dim()));
    }
    op.check_shape(t0)
}
