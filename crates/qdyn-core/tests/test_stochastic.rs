//! Tests for diffusive stochastic master equation trajectories.

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Axis};
use num_complex::Complex64;
use qdyn_core::operator::{Operator, PauliOp};
use qdyn_core::state::{hermiticity_error, trace};
use qdyn_core::{Method, Problem, SolveError, SolverConfig, solve};

fn plus_dm() -> Array2<Complex64> {
    Array2::from_elem((2, 2), Complex64::new(0.5, 0.0))
}

fn dephasing_measurement(batch: usize) -> Problem {
    let zero = Operator::constant(Array2::zeros((2, 2)));
    let gamma: f64 = 0.5;
    let l = Operator::constant(PauliOp::Z.matrix().mapv(|z| z * gamma.sqrt()));
    Problem::stochastic(zero, vec![l], plus_dm(), vec![0.0, 0.5, 1.0])
        .with_initial_state_batch(vec![plus_dm(); batch])
}

const EM: Method = Method::EulerMaruyama { dt: 1e-3 };

// ---------------------------------------------------------------------------
// Reproducibility
// ---------------------------------------------------------------------------

#[test]
fn same_seed_reproduces_trajectories() {
    let problem = dephasing_measurement(4);
    let config = SolverConfig::default().with_seed(7);
    let a = solve(&problem, &EM, &config).unwrap();
    let b = solve(&problem, &EM, &config).unwrap();
    assert_eq!(a.states(), b.states());
    assert_eq!(a.measurements(), b.measurements());
}

#[test]
fn seeds_and_lanes_draw_independent_noise() {
    let problem = dephasing_measurement(2);
    let a = solve(&problem, &EM, &SolverConfig::default().with_seed(1)).unwrap();
    let b = solve(&problem, &EM, &SolverConfig::default().with_seed(2)).unwrap();
    assert_ne!(a.states(), b.states());
    // identical inputs, different lanes
    assert_ne!(a.lane_states(0), a.lane_states(1));
}

#[test]
fn explicit_seed_reproduces_a_lane_on_its_own() {
    let batch = dephasing_measurement(2).with_trajectory_seeds(vec![7, 9]);
    let single = dephasing_measurement(1).with_trajectory_seeds(vec![9]);
    let config = SolverConfig::default();
    let a = solve(&batch, &EM, &config).unwrap();
    let b = solve(&single, &EM, &config).unwrap();
    assert_eq!(a.lane_states(1), b.lane_states(0));
    let (ma, mb) = (a.measurements().unwrap(), b.measurements().unwrap());
    assert_eq!(ma.index_axis(Axis(0), 1), mb.index_axis(Axis(0), 0));
    assert_ne!(a.lane_states(0), a.lane_states(1));
}

#[test]
fn trajectory_seeds_must_cover_the_batch() {
    let problem = dephasing_measurement(3).with_trajectory_seeds(vec![1, 2]);
    let err = solve(&problem, &EM, &SolverConfig::default()).unwrap_err();
    assert!(matches!(err, SolveError::Shape { .. }));
}

// ---------------------------------------------------------------------------
// Physics
// ---------------------------------------------------------------------------

#[test]
fn trajectories_stay_physical() {
    let result = solve(&dephasing_measurement(8), &EM, &SolverConfig::default()).unwrap();
    assert!(result.is_success());
    for lane in 0..result.batch_size() {
        for k in 0..result.tsave().len() {
            let rho = result.state(lane, k).to_owned();
            assert_abs_diff_eq!(trace(&rho).re, 1.0, epsilon = 1e-9);
            assert!(hermiticity_error(&rho) < 1e-9);
        }
    }
}

#[test]
fn ensemble_average_follows_lindblad_dephasing() {
    // ⟨σx⟩ decays as exp(−2γt) on average.
    let batch = 256;
    let result = solve(
        &dephasing_measurement(batch),
        &EM,
        &SolverConfig::default().with_seed(42),
    )
    .unwrap();
    let sx = result.expectation(&PauliOp::X.matrix());
    let mean = sx.map(|z| z.re).mean_axis(Axis(0)).unwrap();
    assert_abs_diff_eq!(mean[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(mean[1], (-0.5f64).exp(), epsilon = 0.12);
    assert_abs_diff_eq!(mean[2], (-1.0f64).exp(), epsilon = 0.12);
}

#[test]
fn measurement_record_shape_and_values() {
    let result = solve(&dephasing_measurement(3), &EM, &SolverConfig::default()).unwrap();
    let record = result.measurements().unwrap();
    assert_eq!(record.shape(), &[3, 1, 2]);
    assert!(record.iter().all(|v| v.is_finite()));
}

#[test]
fn zero_efficiency_removes_measurement_backaction() {
    let problem = dephasing_measurement(2).with_efficiencies(vec![0.0]);
    let result = solve(&problem, &EM, &SolverConfig::default()).unwrap();
    // Without backaction every lane follows the same deterministic map.
    assert_eq!(result.lane_states(0), result.lane_states(1));
    let sx = result.expectation(&PauliOp::X.matrix());
    assert_abs_diff_eq!(sx[[0, 2]].re, (-1.0f64).exp(), epsilon = 1e-3);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn stochastic_problems_need_a_stochastic_method() {
    let err = solve(&dephasing_measurement(1), &Method::Dopri5, &SolverConfig::default())
        .unwrap_err();
    assert!(matches!(err, SolveError::IncompatibleMethod { method: "Dopri5", .. }));
}

#[test]
fn efficiencies_must_be_probabilities() {
    let problem = dephasing_measurement(1).with_efficiencies(vec![1.5]);
    let err = solve(&problem, &EM, &SolverConfig::default()).unwrap_err();
    assert!(matches!(err, SolveError::Shape { .. } | SolveError::InvalidConfig(_)));
}

#[test]
fn deterministic_problems_reject_euler_maruyama() {
    let problem = Problem::lindblad(PauliOp::X.matrix(), Vec::new(), plus_dm(), vec![0.0, 1.0]);
    let err = solve(&problem, &EM, &SolverConfig::default()).unwrap_err();
    assert!(matches!(err, SolveError::IncompatibleMethod { .. }));
}
