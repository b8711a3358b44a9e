//! `qdyn-core`: differentiable adaptive time integration for quantum
//! dynamics.
//!
//! Integrates batches of
//!
//! - **Schrödinger** problems `dψ/dt = −i H(t) ψ`,
//! - **Lindblad** master equations, and
//! - diffusive **stochastic master** equations with recorded measurement
//!   currents,
//!
//! with embedded Runge–Kutta pairs under PI step-size control, fixed-step
//! structure-preserving maps or exact propagators. Gradients of scalar
//! functionals of the saved states are computed by an adjoint pass that
//! recomputes the forward trajectory from sparse checkpoints.
//!
//! # Quick start
//!
//! ```rust
//! use std::f64::consts::PI;
//!
//! use ndarray::Array2;
//! use num_complex::Complex64;
//! use qdyn_core::operator::PauliOp;
//! use qdyn_core::{Method, Problem, SolverConfig, solve};
//!
//! let h = PauliOp::Z.matrix().mapv(|z| z * 0.5);
//! let plus = Array2::from_elem((2, 1), Complex64::new(0.5f64.sqrt(), 0.0));
//! let problem = Problem::schrodinger(h, plus, vec![0.0, PI]);
//!
//! let result = solve(&problem, &Method::Dopri5, &SolverConfig::default()).unwrap();
//! assert!(result.is_success());
//! println!("{result}");
//! ```

pub mod adjoint;
pub mod backend;
pub mod batch;
pub mod config;
pub mod controller;
pub mod equation;
pub mod error;
pub mod functional;
pub mod integrator;
pub mod method;
pub mod operator;
pub mod problem;
pub mod solution;
pub mod state;

pub use adjoint::{CheckpointSet, GradientTargets, Gradients, gradient, gradient_with_backend};
pub use backend::{ArrayBackend, CpuBackend};
pub use batch::solve_with_backend;
pub use config::SolverConfig;
pub use equation::EquationKind;
pub use error::{SolveError, SolveResult};
pub use functional::{ExpectationValue, FnFunctional, Functional, StateOverlap};
pub use integrator::{DivergenceReason, StepRecord, TrajectoryStatus};
pub use method::Method;
pub use operator::Operator;
pub use problem::Problem;
pub use solution::Solution;

/// Integrate every trajectory of `problem` on the CPU backend.
pub fn solve(problem: &Problem, method: &Method, config: &SolverConfig) -> SolveResult<Solution> {
    solve_with_backend(problem, method, config, &CpuBackend)
}
