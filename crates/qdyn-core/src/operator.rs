//! Time-dependent operators.
//!
//! Hamiltonians and jump operators share one representation: a sum of
//! weighted dense matrices
//!
//!   O(t) = Σ_k  c_k(t) · A_k  +  F(t)
//!
//! where each `c_k` is either the constant 1 or a scalar envelope, and `F` is
//! an optional opaque callable. The matrices `A_k` are the quantities the
//! adjoint engine differentiates with respect to; `F` is treated as fixed.
//!
//! # Example
//!
//! ```rust
//! use qdyn_core::operator::{Operator, PauliOp, PauliString, PauliTerm};
//!
//! // H = 0.5·Z₀ + 0.1·X₀X₁ with a drive envelope on X₁
//! let static_part = Operator::from_pauli_terms(
//!     2,
//!     &[
//!         PauliTerm::new(0.5, PauliString::from_ops([(0, PauliOp::Z)])),
//!         PauliTerm::new(0.1, PauliString::from_ops([(0, PauliOp::X), (1, PauliOp::X)])),
//!     ],
//! );
//! let drive = Operator::modulated(
//!     PauliString::from_ops([(1, PauliOp::X)]).to_dense(2),
//!     |t| num_complex::Complex64::new(t.cos(), 0.0),
//! );
//! let h = static_part + drive;
//! assert_eq!(h.dim(), 4);
//! assert!(!h.is_constant());
//! ```

use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use ndarray::{Array2, array};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::backend::{ArrayBackend, CpuBackend};
use crate::error::{SolveError, SolveResult};

/// Scalar time envelope `t → c(t)`.
pub type Envelope = Arc<dyn Fn(f64) -> Complex64 + Send + Sync>;

/// Opaque matrix-valued callable `t → F(t)`.
pub type OperatorFn = Arc<dyn Fn(f64) -> Array2<Complex64> + Send + Sync>;

// ---------------------------------------------------------------------------
// Pauli helpers
// ---------------------------------------------------------------------------

/// Single-qubit Pauli operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauliOp {
    /// Identity.
    I,
    /// Pauli-X.
    X,
    /// Pauli-Y.
    Y,
    /// Pauli-Z.
    Z,
}

impl PauliOp {
    /// Dense 2×2 matrix.
    pub fn matrix(self) -> Array2<Complex64> {
        let o = Complex64::new(0.0, 0.0);
        let l = Complex64::new(1.0, 0.0);
        let i = Complex64::new(0.0, 1.0);
        match self {
            PauliOp::I => array![[l, o], [o, l]],
            PauliOp::X => array![[o, l], [l, o]],
            PauliOp::Y => array![[o, -i], [i, o]],
            PauliOp::Z => array![[l, o], [o, -l]],
        }
    }
}

/// A tensor product of Pauli operators on indexed qubits.
///
/// Stored as a sorted `Vec<(qubit_index, PauliOp)>` with identities dropped;
/// unlisted qubits are implicitly I.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauliString {
    ops: Vec<(u32, PauliOp)>,
}

impl PauliString {
    /// Construct from `(qubit, op)` pairs. Identities are dropped and the
    /// remaining ops sorted by qubit.
    pub fn from_ops(ops: impl IntoIterator<Item = (u32, PauliOp)>) -> Self {
        let mut v: Vec<(u32, PauliOp)> = ops
            .into_iter()
            .filter(|(_, op)| *op != PauliOp::I)
            .collect();
        v.sort_by_key(|(q, _)| *q);
        Self { ops: v }
    }

    /// Non-identity `(qubit, op)` pairs sorted by qubit.
    pub fn ops(&self) -> &[(u32, PauliOp)] {
        &self.ops
    }

    /// True for the identity string.
    pub fn is_identity(&self) -> bool {
        self.ops.is_empty()
    }

    /// The highest qubit index referenced.
    pub fn max_qubit(&self) -> Option<u32> {
        self.ops.last().map(|(q, _)| *q)
    }

    /// Dense `2^n × 2^n` matrix. Qubit 0 is the leftmost tensor factor.
    pub fn to_dense(&self, n_qubits: u32) -> Array2<Complex64> {
        let mut out = Array2::from_elem((1, 1), Complex64::new(1.0, 0.0));
        for q in 0..n_qubits {
            let op = self
                .ops
                .iter()
                .find(|(qq, _)| *qq == q)
                .map_or(PauliOp::I, |(_, op)| *op);
            out = CpuBackend.kron(&out, &op.matrix());
        }
        out
    }
}

/// A real-weighted Pauli string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauliTerm {
    /// Real coefficient.
    pub coeff: f64,
    /// The Pauli string.
    pub pauli: PauliString,
}

impl PauliTerm {
    /// Create a new term.
    pub fn new(coeff: f64, pauli: PauliString) -> Self {
        Self { coeff, pauli }
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Time dependence of a single operator term.
#[derive(Clone)]
pub enum Coefficient {
    /// Always 1.
    Constant,
    /// Scalar envelope.
    Envelope(Envelope),
}

impl Coefficient {
    /// Value at time `t`.
    pub fn at(&self, t: f64) -> Complex64 {
        match self {
            Coefficient::Constant => Complex64::new(1.0, 0.0),
            Coefficient::Envelope(f) => f(t),
        }
    }
}

impl fmt::Debug for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coefficient::Constant => f.write_str("Constant"),
            Coefficient::Envelope(_) => f.write_str("Envelope(..)"),
        }
    }
}

/// One `c(t) · A` term.
#[derive(Debug, Clone)]
pub struct OperatorTerm {
    /// The dense matrix `A`.
    pub matrix: Array2<Complex64>,
    /// Its time dependence.
    pub coeff: Coefficient,
}

/// A possibly time-dependent square operator.
#[derive(Clone)]
pub struct Operator {
    dim: usize,
    terms: Vec<OperatorTerm>,
    callable: Option<OperatorFn>,
}

impl Operator {
    /// Constant operator.
    pub fn constant(matrix: Array2<Complex64>) -> Self {
        Self {
            dim: matrix.nrows(),
            terms: vec![OperatorTerm {
                matrix,
                coeff: Coefficient::Constant,
            }],
            callable: None,
        }
    }

    /// `envelope(t) · matrix`.
    pub fn modulated(
        matrix: Array2<Complex64>,
        envelope: impl Fn(f64) -> Complex64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            dim: matrix.nrows(),
            terms: vec![OperatorTerm {
                matrix,
                coeff: Coefficient::Envelope(Arc::new(envelope)),
            }],
            callable: None,
        }
    }

    /// Opaque callable returning a `dim × dim` matrix for every time.
    ///
    /// The callable must be pure: repeated calls at the same time return the
    /// same matrix. It is not differentiated by the adjoint engine.
    pub fn from_fn(
        dim: usize,
        f: impl Fn(f64) -> Array2<Complex64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            dim,
            terms: Vec::new(),
            callable: Some(Arc::new(f)),
        }
    }

    /// Constant sum of real-weighted Pauli strings on `n_qubits` qubits.
    pub fn from_pauli_terms(n_qubits: u32, terms: &[PauliTerm]) -> Self {
        let dim = 1usize << n_qubits;
        let mut m = Array2::<Complex64>::zeros((dim, dim));
        for term in terms {
            m.scaled_add(Complex64::new(term.coeff, 0.0), &term.pauli.to_dense(n_qubits));
        }
        Self::constant(m)
    }

    /// Sum of several operators; `None` for an empty iterator.
    pub fn sum(ops: impl IntoIterator<Item = Operator>) -> Option<Operator> {
        ops.into_iter().reduce(|acc, op| acc + op)
    }

    /// Hilbert-space dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The differentiable terms.
    pub fn terms(&self) -> &[OperatorTerm] {
        &self.terms
    }

    /// Number of differentiable terms.
    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    /// True when the operator has no time dependence.
    pub fn is_constant(&self) -> bool {
        self.callable.is_none()
            && self
                .terms
                .iter()
                .all(|t| matches!(t.coeff, Coefficient::Constant))
    }

    /// Evaluate the operator at time `t`.
    ///
    /// Fails with [`SolveError::Shape`] when the callable returns a matrix
    /// that is not `dim × dim`.
    pub fn at(&self, t: f64) -> SolveResult<Array2<Complex64>> {
        let mut out = match self.callable_at(t).map_err(SolveError::shape)? {
            Some(m) => m,
            None => Array2::zeros((self.dim, self.dim)),
        };
        for term in &self.terms {
            out.scaled_add(term.coeff.at(t), &term.matrix);
        }
        Ok(out)
    }

    fn callable_at(&self, t: f64) -> Result<Option<Array2<Complex64>>, String> {
        let Some(f) = &self.callable else {
            return Ok(None);
        };
        let m = f(t);
        if m.dim() != (self.dim, self.dim) {
            return Err(format!(
                "callable returned shape {:?} at t = {t}, expected ({}, {})",
                m.dim(),
                self.dim,
                self.dim
            ));
        }
        Ok(Some(m))
    }

    /// Check that every part is `dim × dim`; the callable is evaluated at `t`.
    pub(crate) fn check_shape(&self, t: f64) -> Result<(), String> {
        for (k, term) in self.terms.iter().enumerate() {
            if term.matrix.dim() != (self.dim, self.dim) {
                return Err(format!(
                    "term {k} has shape {:?}, expected ({}, {})",
                    term.matrix.dim(),
                    self.dim,
                    self.dim
                ));
            }
        }
        self.callable_at(t).map(|_| ())
    }
}

impl Add for Operator {
    type Output = Operator;

    fn add(mut self, rhs: Operator) -> Operator {
        self.terms.extend(rhs.terms);
        self.callable = match (self.callable, rhs.callable) {
            (Some(a), Some(b)) => {
                let both: OperatorFn = Arc::new(move |t: f64| a(t) + b(t));
                Some(both)
            }
            (a, b) => a.or(b),
        };
        self.dim = self.dim.max(rhs.dim);
        self
    }
}

impl From<Array2<Complex64>> for Operator {
    fn from(matrix: Array2<Complex64>) -> Self {
        Operator::constant(matrix)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("dim", &self.dim)
            .field("terms", &self.terms.len())
            .field("callable", &self.callable.is_some())
            .finish()
    }
}
