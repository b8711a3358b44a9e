//! State helpers.
//!
//! States are plain `Array2<Complex64>`: a ket is an `n × 1` column, a
//! density matrix is `n × n`.

use ndarray::Array2;
use num_complex::Complex64;

/// Conjugate transpose.
pub fn dag(m: &Array2<Complex64>) -> Array2<Complex64> {
    m.t().mapv(|z| z.conj())
}

/// True for an `n × 1` column.
pub fn is_ket(state: &Array2<Complex64>) -> bool {
    state.ncols() == 1
}

/// Matrix trace.
pub fn trace(m: &Array2<Complex64>) -> Complex64 {
    m.diag().sum()
}

/// Frobenius norm.
pub fn norm(m: &Array2<Complex64>) -> f64 {
    m.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// `‖m − m†‖_F`, zero for Hermitian matrices.
pub fn hermiticity_error(m: &Array2<Complex64>) -> f64 {
    norm(&(m - &dag(m)))
}

/// `|ψ⟩⟨ψ|` for a ket, identity map for anything else.
pub fn ket_to_dm(state: &Array2<Complex64>) -> Array2<Complex64> {
    if is_ket(state) {
        state.dot(&dag(state))
    } else {
        state.clone()
    }
}

/// Expectation value `⟨ψ|O|ψ⟩` for a ket or `Tr(O ρ)` for a density matrix.
pub fn expect(op: &Array2<Complex64>, state: &Array2<Complex64>) -> Complex64 {
    if is_ket(state) {
        (dag(state).dot(&op.dot(state)))[[0, 0]]
    } else {
        trace(&op.dot(state))
    }
}

/// Fidelity with a pure target `|φ⟩`: `|⟨φ|ψ⟩|²` or `⟨φ|ρ|φ⟩`.
pub fn fidelity(target: &Array2<Complex64>, state: &Array2<Complex64>) -> f64 {
    if is_ket(state) {
        (dag(target).dot(state))[[0, 0]].norm_sqr()
    } else {
        (dag(target).dot(&state.dot(target)))[[0, 0]].re
    }
}

/// Largest absolute entry.
pub(crate) fn max_abs(m: &Array2<Complex64>) -> f64 {
    m.iter().map(|z| z.norm()).fold(0.0, f64::max)
}

/// True when every entry is finite.
pub(crate) fn is_finite(m: &Array2<Complex64>) -> bool {
    m.iter().all(|z| z.re.is_finite() && z.im.is_finite())
}
