//! End-to-end tests of the forward solver.

use std::f64::consts::PI;
use std::io;
use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use ndarray::{Array2, array};
use num_complex::Complex64;
use qdyn_core::operator::{Operator, PauliOp};
use qdyn_core::state::{dag, fidelity, hermiticity_error, trace};
use qdyn_core::{
    DivergenceReason, Method, Problem, SolveError, SolverConfig, TrajectoryStatus, solve,
};
use tracing_subscriber::fmt::MakeWriter;

fn c(re: f64, im: f64) -> Complex64 {
    Complex64::new(re, im)
}

fn ket(amplitudes: &[Complex64]) -> Array2<Complex64> {
    Array2::from_shape_vec((amplitudes.len(), 1), amplitudes.to_vec()).unwrap()
}

fn plus() -> Array2<Complex64> {
    let s = 0.5f64.sqrt();
    ket(&[c(s, 0.0), c(s, 0.0)])
}

fn minus() -> Array2<Complex64> {
    let s = 0.5f64.sqrt();
    ket(&[c(s, 0.0), c(-s, 0.0)])
}

/// |0⟩⟨1|: lowers index 1 to index 0.
fn sigma_minus() -> Array2<Complex64> {
    array![[c(0.0, 0.0), c(1.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]]
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    (0..num)
        .map(|k| start + (stop - start) * k as f64 / (num - 1) as f64)
        .collect()
}

fn max_diff(a: &Array2<Complex64>, b: &Array2<Complex64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}

// ---------------------------------------------------------------------------
// Reference scenarios
// ---------------------------------------------------------------------------

#[test]
fn half_sigma_z_rotates_plus_into_minus() {
    let h = PauliOp::Z.matrix().mapv(|z| z * 0.5);
    let problem = Problem::schrodinger(h, plus(), vec![0.0, PI]);
    let result = solve(&problem, &Method::Dopri5, &SolverConfig::default()).unwrap();

    assert!(result.is_success());
    let psi = result.state(0, 1).to_owned();
    assert_abs_diff_eq!(fidelity(&minus(), &psi), 1.0, epsilon = 1e-5);
    assert_abs_diff_eq!(trace(&psi.dot(&dag(&psi))).re, 1.0, epsilon = 1e-5);
    // exactly −i|−⟩
    assert_abs_diff_eq!(psi[[0, 0]].im, -(0.5f64.sqrt()), epsilon = 1e-5);
    assert_eq!(result.stats()[0].rejected_steps, 0);
    assert!(result.stats()[0].accepted_steps > 0);
}

#[test]
fn growing_non_hermitian_generator_diverges_within_budget() {
    let h = Array2::<Complex64>::eye(2).mapv(|z| z * c(0.0, 5.0));
    let problem = Problem::schrodinger(h, plus(), vec![0.0, 5.0, 10.0]);
    let config = SolverConfig::default().with_max_steps(10);
    let result = solve(&problem, &Method::Dopri5, &config).unwrap();

    assert_eq!(
        result.status()[0],
        TrajectoryStatus::Diverged(DivergenceReason::MaxStepsExceeded { max_steps: 10 })
    );
    assert!(result.stats()[0].accepted_steps + result.stats()[0].rejected_steps <= 10);
    assert!(!result.is_success());
    assert!(result.state(0, 2).iter().all(|z| z.re.is_nan()));
    assert!(result.state(0, 0).iter().all(|z| z.re.is_finite()));
}

#[test]
fn strict_mode_turns_divergence_into_error() {
    let h = Array2::<Complex64>::eye(2).mapv(|z| z * c(0.0, 5.0));
    let problem = Problem::schrodinger(h, plus(), vec![0.0, 10.0]);
    let config = SolverConfig::default().with_max_steps(10).with_strict(true);
    let err = solve(&problem, &Method::Dopri5, &config).unwrap_err();
    assert!(matches!(err, SolveError::Divergence { lane: 0, .. }));
}

#[test]
fn summary_string_layout() {
    let h = PauliOp::Z.matrix().mapv(|z| z * 0.5);
    let problem = Problem::schrodinger(h, plus(), vec![0.0, PI]);
    let result = solve(&problem, &Method::Dopri5, &SolverConfig::default()).unwrap();
    let (accepted, rejected) = result.total_steps();

    let expected = format!(
        "==== Result ====\nSolver  : Dopri5\nStates  : complex128 (1, 2, 2, 1) | 64 b\nInfos   : {} steps ({accepted} accepted, {rejected} rejected)",
        accepted + rejected
    );
    assert_eq!(result.to_string(), expected);
}

// ---------------------------------------------------------------------------
// Physical invariants
// ---------------------------------------------------------------------------

fn damped_rabi(method: Method) -> qdyn_core::Solution {
    let h = Operator::constant(PauliOp::X.matrix())
        + Operator::constant(PauliOp::Z.matrix().mapv(|z| z * 0.3));
    let jumps = vec![Operator::constant(sigma_minus().mapv(|z| z * 0.5))];
    let rho0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::lindblad(h, jumps, rho0, linspace(0.0, 5.0, 11));
    let config = SolverConfig::default().with_tolerances(1e-7, 1e-7);
    solve(&problem, &method, &config).unwrap()
}

#[test]
fn lindblad_preserves_trace_and_hermiticity() {
    for method in [Method::Dopri5, Method::Tsit5] {
        let result = damped_rabi(method);
        assert!(result.is_success());
        for k in 0..result.tsave().len() {
            let rho = result.state(0, k).to_owned();
            assert_abs_diff_eq!(trace(&rho).re, 1.0, epsilon = 1e-5);
            assert!(hermiticity_error(&rho) < 1e-5, "{method}: {}", hermiticity_error(&rho));
        }
    }
}

#[test]
fn methods_agree_on_lindblad_dynamics() {
    let reference = damped_rabi(Method::Propagator);
    for method in [Method::Dopri5, Method::Tsit5] {
        let result = damped_rabi(method);
        let a = result.final_states().index_axis(ndarray::Axis(0), 0).to_owned();
        let b = reference.final_states().index_axis(ndarray::Axis(0), 0).to_owned();
        assert!(max_diff(&a, &b) < 1e-5, "{method}");
    }

    let rouchon = damped_rabi(Method::Rouchon1 { dt: 2e-4 });
    let a = rouchon.state(0, 10).to_owned();
    let b = reference.state(0, 10).to_owned();
    assert_abs_diff_eq!(trace(&a).re, 1.0, epsilon = 1e-12);
    assert!(max_diff(&a, &b) < 1e-2);
}

#[test]
fn tighter_tolerance_is_more_accurate_and_takes_more_steps() {
    let h = PauliOp::X.matrix() + PauliOp::Z.matrix().mapv(|z| z * 0.5);
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::schrodinger(h, psi0, vec![0.0, 5.0]);
    let exact = solve(&problem, &Method::Propagator, &SolverConfig::default()).unwrap();
    let exact = exact.state(0, 1).to_owned();

    let run = |tol: f64| {
        let config = SolverConfig::default().with_tolerances(tol, tol);
        let result = solve(&problem, &Method::Dopri5, &config).unwrap();
        let error = max_diff(&result.state(0, 1).to_owned(), &exact);
        (error, result.stats()[0].accepted_steps)
    };
    let (loose_err, loose_steps) = run(1e-5);
    let (tight_err, tight_steps) = run(1e-6);
    assert!(tight_err <= loose_err, "{tight_err} > {loose_err}");
    assert!(tight_steps >= loose_steps);
}

#[test]
fn time_dependent_drive_matches_closed_form() {
    // H(t) = (t/2) σx commutes with itself: P₁(T) = sin²(T²/4).
    let h = Operator::modulated(PauliOp::X.matrix(), |t| c(0.5 * t, 0.0));
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::schrodinger(h, psi0, linspace(0.0, 2.0, 5));
    let config = SolverConfig::default().with_tolerances(1e-9, 1e-9);
    let result = solve(&problem, &Method::Dopri5, &config).unwrap();
    let p1 = array![[c(0.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(1.0, 0.0)]];
    let populations = result.expectation(&p1);
    for (k, &t) in result.tsave().iter().enumerate() {
        assert_abs_diff_eq!(populations[[0, k]].re, (t * t / 4.0).sin().powi(2), epsilon = 1e-7);
    }
}

#[test]
fn free_stepping_interpolates_save_points() {
    let h = PauliOp::Y.matrix();
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::schrodinger(h, psi0, linspace(0.0, 3.0, 31));
    let config = SolverConfig::default()
        .with_tolerances(1e-8, 1e-8)
        .with_step_to_save_points(false);
    for method in [Method::Dopri5, Method::Tsit5] {
        let result = solve(&problem, &method, &config).unwrap();
        let z = result.expectation(&PauliOp::Z.matrix());
        for (k, &t) in result.tsave().iter().enumerate() {
            assert_abs_diff_eq!(z[[0, k]].re, (2.0 * t).cos(), epsilon = 1e-4);
        }
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[test]
fn batched_lanes_match_individual_runs() {
    let hamiltonians: Vec<Operator> = [0.5, 1.0, 4.0]
        .iter()
        .map(|&w| Operator::constant(PauliOp::X.matrix().mapv(|z| z * w)))
        .collect();
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let tsave = linspace(0.0, 2.0, 5);
    let config = SolverConfig::default();

    let batched = Problem::schrodinger(hamiltonians[0].clone(), psi0.clone(), tsave.clone())
        .with_hamiltonian_batch(hamiltonians.clone());
    let batch_result = solve(&batched, &Method::Dopri5, &config).unwrap();
    assert_eq!(batch_result.batch_size(), 3);

    for (i, h) in hamiltonians.into_iter().enumerate() {
        let single = Problem::schrodinger(h, psi0.clone(), tsave.clone());
        let result = solve(&single, &Method::Dopri5, &config).unwrap();
        assert_eq!(result.lane_states(0), batch_result.lane_states(i));
        assert_eq!(result.stats()[0], batch_result.stats()[i]);
    }
    // lanes desynchronise: the fastest rotation needs the most steps
    assert!(batch_result.stats()[2].accepted_steps > batch_result.stats()[0].accepted_steps);
}

#[test]
fn diverged_lane_does_not_stop_siblings() {
    let good = Operator::constant(PauliOp::X.matrix());
    let bad = Operator::constant(Array2::<Complex64>::eye(2).mapv(|z| z * c(0.0, 50.0)));
    let problem = Problem::schrodinger(good.clone(), plus(), vec![0.0, 10.0])
        .with_hamiltonian_batch(vec![good, bad]);
    let config = SolverConfig::default().with_max_steps(500);
    let result = solve(&problem, &Method::Dopri5, &config).unwrap();
    assert!(result.status()[0].is_finished());
    assert!(matches!(result.status()[1], TrajectoryStatus::Diverged(_)));
    assert!(result.to_string().contains("1 of 2 trajectories diverged"));
}

#[test]
fn mismatched_batches_fail_before_stepping() {
    let problem = Problem::schrodinger(PauliOp::X.matrix(), plus(), vec![0.0, 1.0])
        .with_hamiltonian_batch(vec![
            Operator::constant(PauliOp::X.matrix()),
            Operator::constant(PauliOp::Y.matrix()),
        ])
        .with_initial_state_batch(vec![plus(), minus(), plus()]);
    let err = solve(&problem, &Method::Dopri5, &SolverConfig::default()).unwrap_err();
    assert!(matches!(err, SolveError::Shape { .. }));
}

#[test]
fn incompatible_method_is_rejected() {
    let problem = Problem::schrodinger(PauliOp::X.matrix(), plus(), vec![0.0, 1.0]);
    let err = solve(&problem, &Method::Rouchon1 { dt: 0.01 }, &SolverConfig::default())
        .unwrap_err();
    assert!(matches!(err, SolveError::IncompatibleMethod { method: "Rouchon1", .. }));
}

#[test]
fn fixed_step_euler_lands_on_save_points() {
    let problem = Problem::schrodinger(PauliOp::X.matrix(), plus(), linspace(0.0, 1.0, 4));
    let result = solve(&problem, &Method::Euler { dt: 0.01 }, &SolverConfig::default()).unwrap();
    assert!(result.is_success());
    // |+⟩ is an eigenstate of X; Euler only rescales it.
    let psi = result.state(0, 3).to_owned();
    assert_abs_diff_eq!(fidelity(&plus(), &psi) / trace(&psi.dot(&dag(&psi))).re, 1.0, epsilon = 1e-12);
    assert!(result.stats()[0].accepted_steps >= 100);
}

#[test]
fn dopri8_matches_closed_form_drive() {
    let h = Operator::modulated(PauliOp::X.matrix(), |t| c(0.5 * t, 0.0));
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::schrodinger(h, psi0, linspace(0.0, 2.0, 5));
    let config = SolverConfig::default().with_tolerances(1e-10, 1e-10);
    let result = solve(&problem, &Method::Dopri8, &config).unwrap();
    assert!(result.is_success());
    let p1 = array![[c(0.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(1.0, 0.0)]];
    let populations = result.expectation(&p1);
    for (k, &t) in result.tsave().iter().enumerate() {
        assert_abs_diff_eq!(populations[[0, k]].re, (t * t / 4.0).sin().powi(2), epsilon = 1e-8);
    }
}

#[test]
fn dopri8_always_steps_onto_save_points() {
    let h = PauliOp::Y.matrix();
    let psi0 = ket(&[c(1.0, 0.0), c(0.0, 0.0)]);
    let problem = Problem::schrodinger(h, psi0, linspace(0.0, 3.0, 31));
    let config = SolverConfig::default()
        .with_tolerances(1e-8, 1e-8)
        .with_step_to_save_points(false);
    let result = solve(&problem, &Method::Dopri8, &config).unwrap();
    let z = result.expectation(&PauliOp::Z.matrix());
    for (k, &t) in result.tsave().iter().enumerate() {
        assert_abs_diff_eq!(z[[0, k]].re, (2.0 * t).cos(), epsilon = 1e-7);
    }
    // no dense output: every interval ends on its save point
    assert!(result.stats()[0].accepted_steps >= 30);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[test]
fn overflowing_state_diverges_as_non_finite() {
    let h = Array2::<Complex64>::eye(2).mapv(|z| z * c(0.0, 1e200));
    let problem = Problem::schrodinger(h, plus(), vec![0.0, 5.0]);
    let method = Method::Euler { dt: 1.0 };
    let result = solve(&problem, &method, &SolverConfig::default()).unwrap();
    assert_eq!(
        result.status()[0],
        TrajectoryStatus::Diverged(DivergenceReason::NonFinite { t: 2.0 })
    );
    assert!(result.state(0, 1).iter().all(|z| z.re.is_nan()));

    let strict = SolverConfig::default().with_strict(true);
    let err = solve(&problem, &method, &strict).unwrap_err();
    assert!(matches!(
        err,
        SolveError::Divergence {
            lane: 0,
            reason: DivergenceReason::NonFinite { .. }
        }
    ));
}

#[test]
fn callable_changing_shape_mid_run_is_a_shape_error() {
    let x = PauliOp::X.matrix();
    let h = Operator::from_fn(2, move |t| {
        if t > 0.5 { Array2::eye(3) } else { x.clone() }
    });
    let problem = Problem::schrodinger(h, plus(), vec![0.0, 1.0]);
    let err = solve(&problem, &Method::Dopri5, &SolverConfig::default()).unwrap_err();
    assert!(matches!(err, SolveError::Shape { .. }), "{err}");
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn unreachable_tolerance_continues_at_min_step_and_warns_once() {
    let h = PauliOp::X.matrix().mapv(|z| z * 200.0);
    let problem = Problem::schrodinger(h, plus(), vec![0.0, 1.0]);
    let config = SolverConfig::default().with_min_step(0.05);

    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(log.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, || {
        solve(&problem, &Method::Dopri5, &config)
    })
    .unwrap();

    assert!(result.status()[0].is_finished());
    let stats = &result.stats()[0];
    assert!(stats.min_step_hits > 0);
    assert!(stats.min_step_hits <= stats.accepted_steps);
    assert_eq!(log.contents().matches("tolerance cannot be met").count(), 1);
}
