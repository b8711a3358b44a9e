//! Scalar functionals of saved trajectories.
//!
//! A [`Functional`] maps the saved states of one trajectory to a real number
//! and reports its gradient with respect to each saved state in the
//! `dJ = Re Tr(G† dy)` convention. States are seen in integrated form:
//! kets for Schrödinger problems, density matrices otherwise.

use ndarray::Array2;
use num_complex::Complex64;

use crate::state::{dag, expect, fidelity, is_ket};

/// A differentiable scalar of a trajectory's saved states.
pub trait Functional: Send + Sync {
    /// Value of the functional.
    fn value(&self, saved: &[Array2<Complex64>]) -> f64;

    /// `(save index, ∂J/∂y)` for every save point the functional depends on.
    fn state_gradients(&self, saved: &[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)>;
}

fn resolve(index: Option<usize>, len: usize) -> usize {
    index.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1))
}

/// `Re ⟨O⟩` at one save point.
#[derive(Debug, Clone)]
pub struct ExpectationValue {
    operator: Array2<Complex64>,
    save_index: Option<usize>,
}

impl ExpectationValue {
    /// At the final save time.
    pub fn final_time(operator: Array2<Complex64>) -> Self {
        Self {
            operator,
            save_index: None,
        }
    }

    /// At save index `index`.
    pub fn at(operator: Array2<Complex64>, index: usize) -> Self {
        Self {
            operator,
            save_index: Some(index),
        }
    }
}

impl Functional for ExpectationValue {
    fn value(&self, saved: &[Array2<Complex64>]) -> f64 {
        let s = resolve(self.save_index, saved.len());
        expect(&self.operator, &saved[s]).re
    }

    fn state_gradients(&self, saved: &[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)> {
        let s = resolve(self.save_index, saved.len());
        let y = &saved[s];
        let grad = if is_ket(y) {
            self.operator.dot(y) + dag(&self.operator).dot(y)
        } else {
            dag(&self.operator)
        };
        vec![(s, grad)]
    }
}

/// Fidelity with a pure target state at one save point.
#[derive(Debug, Clone)]
pub struct StateOverlap {
    target: Array2<Complex64>,
    save_index: Option<usize>,
}

impl StateOverlap {
    /// At the final save time.
    pub fn final_time(target: Array2<Complex64>) -> Self {
        Self {
            target,
            save_index: None,
        }
    }

    /// At save index `index`.
    pub fn at(target: Array2<Complex64>, index: usize) -> Self {
        Self {
            target,
            save_index: Some(index),
        }
    }
}

impl Functional for StateOverlap {
    fn value(&self, saved: &[Array2<Complex64>]) -> f64 {
        let s = resolve(self.save_index, saved.len());
        fidelity(&self.target, &saved[s])
    }

    fn state_gradients(&self, saved: &[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)> {
        let s = resolve(self.save_index, saved.len());
        let y = &saved[s];
        let grad = if is_ket(y) {
            let overlap = dag(&self.target).dot(y)[[0, 0]];
            self.target.mapv(|z| z * overlap * 2.0)
        } else {
            self.target.dot(&dag(&self.target))
        };
        vec![(s, grad)]
    }
}

type ValueFn = Box<dyn Fn(&[Array2<Complex64>]) -> f64 + Send + Sync>;
type GradientFn = Box<dyn Fn(&[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)> + Send + Sync>;

/// Functional built from two closures.
pub struct FnFunctional {
    value: ValueFn,
    gradient: GradientFn,
}

impl FnFunctional {
    /// `value` computes `J`, `gradient` its per-save-point state gradients.
    pub fn new(
        value: impl Fn(&[Array2<Complex64>]) -> f64 + Send + Sync + 'static,
        gradient: impl Fn(&[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            value: Box::new(value),
            gradient: Box::new(gradient),
        }
    }
}

impl Functional for FnFunctional {
    fn value(&self, saved: &[Array2<Complex64>]) -> f64 {
        (self.value)(saved)
    }

    fn state_gradients(&self, saved: &[Array2<Complex64>]) -> Vec<(usize, Array2<Complex64>)> {
        (self.gradient)(saved)
    }
}

impl std::fmt::Debug for FnFunctional {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnFunctional(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::PauliOp;
    use crate::state::ket_to_dm;
    use approx::assert_abs_diff_eq;

    fn inner(a: &Array2<Complex64>, b: &Array2<Complex64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x.conj() * y).re).sum()
    }

    fn directional_check(f: &dyn Functional, y: &Array2<Complex64>, dy: &Array2<Complex64>) {
        let eps = 1e-6;
        let plus = vec![y + &dy.mapv(|z| z * eps)];
        let minus = vec![y - &dy.mapv(|z| z * eps)];
        let fd = (f.value(&plus) - f.value(&minus)) / (2.0 * eps);
        let grads = f.state_gradients(std::slice::from_ref(y));
        assert_eq!(grads.len(), 1);
        assert_abs_diff_eq!(inner(&grads[0].1, dy), fd, epsilon = 1e-8);
    }

    #[test]
    fn expectation_gradients() {
        let psi = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(0.6, 0.1), Complex64::new(0.2, -0.7)],
        )
        .unwrap();
        let dpsi = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(-0.3, 0.5), Complex64::new(0.4, 0.2)],
        )
        .unwrap();
        let f = ExpectationValue::final_time(PauliOp::Y.matrix());
        directional_check(&f, &psi, &dpsi);
        directional_check(&f, &ket_to_dm(&psi), &ket_to_dm(&dpsi));
    }

    #[test]
    fn overlap_gradients() {
        let target = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)],
        )
        .unwrap();
        let psi = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(0.6, 0.0), Complex64::new(0.0, 0.8)],
        )
        .unwrap();
        let dpsi = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(0.1, 0.2), Complex64::new(-0.3, 0.4)],
        )
        .unwrap();
        let f = StateOverlap::final_time(target);
        assert_abs_diff_eq!(f.value(std::slice::from_ref(&psi)), 0.64, epsilon = 1e-14);
        directional_check(&f, &psi, &dpsi);
        directional_check(&f, &ket_to_dm(&psi), &ket_to_dm(&dpsi));
    }

    #[test]
    fn save_index_is_clamped() {
        let f = ExpectationValue::at(PauliOp::Z.matrix(), 10);
        let up = Array2::from_shape_vec(
            (2, 1),
            vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
        )
        .unwrap();
        let saved = vec![up.clone(), up];
        assert_eq!(f.state_gradients(&saved)[0].0, 1);
    }
}
