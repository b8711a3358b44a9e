//! Equation-of-motion evaluator.
//!
//! The evaluator is a pure function of `(t, state)`. It owns nothing but
//! borrowed operators and the injected backend, so the integrator can replay
//! any step bit-for-bit.

use ndarray::Array2;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::backend::ArrayBackend;
use crate::error::SolveResult;
use crate::operator::Operator;
use crate::state::{dag, trace};

const I: Complex64 = Complex64::new(0.0, 1.0);

/// Which equation of motion is integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquationKind {
    /// `dψ/dt = −i H ψ`.
    Schrodinger,
    /// Lindblad master equation.
    Lindblad,
    /// Diffusive (homodyne) stochastic master equation.
    StochasticMaster,
}

impl EquationKind {
    /// True when the state is a density matrix.
    pub fn uses_density_matrix(self) -> bool {
        !matches!(self, EquationKind::Schrodinger)
    }
}

impl std::fmt::Display for EquationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EquationKind::Schrodinger => write!(f, "schrodinger"),
            EquationKind::Lindblad => write!(f, "lindblad"),
            EquationKind::StochasticMaster => write!(f, "stochastic_master"),
        }
    }
}

/// Gradient accumulators for the term matrices of `H` and of every jump
/// operator, in the `dJ = Re Tr(G† dX)` convention.
#[derive(Debug, Clone)]
pub struct ParamGrads {
    /// One matrix per Hamiltonian term.
    pub hamiltonian: Vec<Array2<Complex64>>,
    /// One list per jump operator, one matrix per term.
    pub jump_ops: Vec<Vec<Array2<Complex64>>>,
}

impl ParamGrads {
    /// Zero accumulators shaped like the given operators.
    pub fn zeros(hamiltonian: &Operator, jump_ops: &[Operator]) -> Self {
        let zeros = |op: &Operator| {
            op.terms()
                .iter()
                .map(|term| Array2::zeros(term.matrix.dim()))
                .collect::<Vec<_>>()
        };
        Self {
            hamiltonian: zeros(hamiltonian),
            jump_ops: jump_ops.iter().map(zeros).collect(),
        }
    }
}

/// Evaluates drift, diffusion and their adjoints for one trajectory.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    kind: EquationKind,
    hamiltonian: &'a Operator,
    jump_ops: &'a [Operator],
    efficiencies: &'a [f64],
    backend: &'a dyn ArrayBackend,
}

impl<'a> Evaluator<'a> {
    /// Bind operators and a backend. `efficiencies` is only read for
    /// stochastic problems and must have one entry per jump operator.
    pub fn new(
        kind: EquationKind,
        hamiltonian: &'a Operator,
        jump_ops: &'a [Operator],
        efficiencies: &'a [f64],
        backend: &'a dyn ArrayBackend,
    ) -> Self {
        Self {
            kind,
            hamiltonian,
            jump_ops,
            efficiencies,
            backend,
        }
    }

    /// Equation class.
    pub fn kind(&self) -> EquationKind {
        self.kind
    }

    /// Hilbert-space dimension.
    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    /// Backend used for all products.
    pub fn backend(&self) -> &'a dyn ArrayBackend {
        self.backend
    }

    /// The Hamiltonian.
    pub fn hamiltonian(&self) -> &'a Operator {
        self.hamiltonian
    }

    /// The jump operators.
    pub fn jump_ops(&self) -> &'a [Operator] {
        self.jump_ops
    }

    /// Number of measured channels of a stochastic problem.
    pub fn n_channels(&self) -> usize {
        match self.kind {
            EquationKind::StochasticMaster => self.jump_ops.len(),
            _ => 0,
        }
    }

    /// `H(t)` and every `L_k(t)`.
    pub fn operators_at(&self, t: f64) -> SolveResult<(Array2<Complex64>, Vec<Array2<Complex64>>)> {
        Ok((
            self.hamiltonian.at(t)?,
            self.jump_ops
                .iter()
                .map(|l| l.at(t))
                .collect::<SolveResult<_>>()?,
        ))
    }

    /// Deterministic time derivative.
    pub fn drift(&self, t: f64, y: &Array2<Complex64>) -> SolveResult<Array2<Complex64>> {
        let b = self.backend;
        let h = self.hamiltonian.at(t)?;
        Ok(match self.kind {
            EquationKind::Schrodinger => b.matmul(&h, y).mapv_into(|z| -I * z),
            EquationKind::Lindblad | EquationKind::StochasticMaster => {
                let mut out = (b.matmul(&h, y) - b.matmul(y, &h)).mapv_into(|z| -I * z);
                for op in self.jump_ops {
                    let l = op.at(t)?;
                    let ld = dag(&l);
                    let ldl = b.matmul(&ld, &l);
                    out += &b.matmul(&b.matmul(&l, y), &ld);
                    out.scaled_add(
                        Complex64::new(-0.5, 0.0),
                        &(b.matmul(&ldl, y) + b.matmul(y, &ldl)),
                    );
                }
                out
            }
        })
    }

    /// Measurement-backaction terms, one per channel:
    /// `√η (L ρ + ρ L† − Tr[(L + L†) ρ] ρ)`.
    pub fn diffusion(&self, t: f64, rho: &Array2<Complex64>) -> SolveResult<Vec<Array2<Complex64>>> {
        let b = self.backend;
        self.jump_ops
            .iter()
            .zip(self.efficiencies)
            .map(|(op, &eta)| {
                let l = op.at(t)?;
                let l_rho = b.matmul(&l, rho);
                let rho_ld = dag(&l_rho);
                let expectation = 2.0 * trace(&l_rho).re;
                let mut d = l_rho + rho_ld;
                d.scaled_add(Complex64::new(-expectation, 0.0), rho);
                Ok(d.mapv_into(|z| z * eta.sqrt()))
            })
            .collect()
    }

    /// Noise-free part of the measurement currents:
    /// `√η Tr[(L + L†) ρ]` per channel.
    pub fn signal(&self, t: f64, rho: &Array2<Complex64>) -> SolveResult<Vec<f64>> {
        self.jump_ops
            .iter()
            .zip(self.efficiencies)
            .map(|(op, &eta)| {
                let l_rho = self.backend.matmul(&op.at(t)?, rho);
                Ok(eta.sqrt() * 2.0 * trace(&l_rho).re)
            })
            .collect()
    }

    /// Real adjoint `f*` of the (linear) drift: `Re Tr(a† f(y)) = Re Tr(f*(a)† y)`.
    ///
    /// The costate obeys `da/dt = −f*(a)`.
    pub fn adjoint_drift(&self, t: f64, a: &Array2<Complex64>) -> SolveResult<Array2<Complex64>> {
        let b = self.backend;
        let hd = dag(&self.hamiltonian.at(t)?);
        Ok(match self.kind {
            EquationKind::Schrodinger => b.matmul(&hd, a).mapv_into(|z| I * z),
            EquationKind::Lindblad | EquationKind::StochasticMaster => {
                let mut out = (b.matmul(&hd, a) - b.matmul(a, &hd)).mapv_into(|z| I * z);
                for op in self.jump_ops {
                    let l = op.at(t)?;
                    let ld = dag(&l);
                    let ldl = b.matmul(&ld, &l);
                    out += &b.matmul(&b.matmul(&ld, a), &l);
                    out.scaled_add(
                        Complex64::new(-0.5, 0.0),
                        &(b.matmul(&ldl, a) + b.matmul(a, &ldl)),
                    );
                }
                out
            }
        })
    }

    /// Add `weight · ∂/∂A Re Tr(a† f(t, y))` for every term matrix `A`.
    pub fn accumulate_param_grads(
        &self,
        t: f64,
        y: &Array2<Complex64>,
        a: &Array2<Complex64>,
        weight: f64,
        grads: &mut ParamGrads,
    ) -> SolveResult<()> {
        let b = self.backend;
        let yd = dag(y);
        let ad = dag(a);
        let w = Complex64::new(weight, 0.0);

        // Hamiltonian: G = i c̄ a y†  (Schrödinger) or i c̄ (a ρ† − ρ† a).
        let h_base = match self.kind {
            EquationKind::Schrodinger => b.matmul(a, &yd),
            _ => b.matmul(a, &yd) - b.matmul(&yd, a),
        }
        .mapv_into(|z| I * z);
        for (term, grad) in self.hamiltonian.terms().iter().zip(&mut grads.hamiltonian) {
            grad.scaled_add(w * term.coeff.at(t).conj(), &h_base);
        }

        if !self.kind.uses_density_matrix() {
            return Ok(());
        }
        for (op, op_grads) in self.jump_ops.iter().zip(&mut grads.jump_ops) {
            let l = op.at(t)?;
            let l_rho = b.matmul(&l, y);
            let l_rhod = b.matmul(&l, &yd);
            let l_a = b.matmul(&l, a);
            let l_ad = b.matmul(&l, &ad);
            let mut base = b.matmul(a, &b.matmul(&l, &yd)) + b.matmul(&ad, &l_rho);
            let half = b.matmul(&l_rho, &ad)
                + b.matmul(&l_a, &yd)
                + b.matmul(&l_ad, y)
                + b.matmul(&l_rhod, a);
            base.scaled_add(Complex64::new(-0.5, 0.0), &half);
            for (term, grad) in op.terms().iter().zip(op_grads.iter_mut()) {
                grad.scaled_add(w * term.coeff.at(t).conj(), &base);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Evaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("kind", &self.kind)
            .field("dim", &self.dim())
            .field("jump_ops", &self.jump_ops.len())
            .field("backend", &self.backend.name())
            .finish()
    }
}
