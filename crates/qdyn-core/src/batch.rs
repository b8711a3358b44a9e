//! Batch orchestration.
//!
//! Every trajectory gets its own [`Integrator`] and [`Lane`]. Rounds step
//! each running lane once; lanes that finished or diverged are skipped until
//! the whole batch is terminal.

use tracing::{debug, instrument, warn};

use crate::backend::ArrayBackend;
use crate::config::SolverConfig;
use crate::equation::Evaluator;
use crate::error::{SolveError, SolveResult};
use crate::integrator::{Integrator, Lane, TrajectoryStatus};
use crate::method::Method;
use crate::problem::Problem;
use crate::solution::Solution;

/// Validate, integrate every trajectory and assemble the result.
#[instrument(skip_all, fields(method = method.name(), kind = %problem.kind(), backend = backend.name()))]
pub fn solve_with_backend(
    problem: &Problem,
    method: &Method,
    config: &SolverConfig,
    backend: &dyn ArrayBackend,
) -> SolveResult<Solution> {
    config.validate()?;
    let batch = problem.validate(method)?;
    let efficiencies = problem.efficiencies();
    debug!(batch, saves = problem.tsave().len(), "starting batch");

    let integrators: Vec<Integrator<'_>> = (0..batch)
        .map(|i| {
            let inputs = problem.lane(i);
            let eval = Evaluator::new(
                problem.kind(),
                inputs.hamiltonian,
                inputs.jump_ops,
                &efficiencies,
                backend,
            );
            let integrator = Integrator::new(eval, *method, config, problem.tsave());
            match problem.trajectory_seed(i) {
                Some(seed) => integrator.with_seed(seed),
                None => integrator,
            }
        })
        .collect();
    let mut lanes: Vec<Lane> = integrators
        .iter()
        .enumerate()
        .map(|(i, integrator)| integrator.start(i, problem.integrated_initial_state(i)))
        .collect();

    let mut rounds = 0u64;
    loop {
        let mut running = 0usize;
        for (integrator, lane) in integrators.iter().zip(lanes.iter_mut()) {
            if lane.status().is_terminal() {
                continue;
            }
            integrator.step(lane)?;
            match lane.status() {
                TrajectoryStatus::Running => running += 1,
                TrajectoryStatus::Diverged(reason) if config.strict => {
                    return Err(SolveError::Divergence {
                        lane: lane.index,
                        reason,
                    });
                }
                _ => {}
            }
        }
        rounds += 1;
        if running == 0 {
            break;
        }
    }

    for lane in &lanes {
        if let TrajectoryStatus::Diverged(reason) = lane.status() {
            warn!(
                lane = lane.index,
                %reason,
                saved = lane.saved.len(),
                "trajectory diverged, later save points are NaN"
            );
        }
    }
    debug!(rounds, "batch finished");

    Ok(Solution::assemble(
        method.name(),
        problem.kind(),
        problem.tsave(),
        problem.state_shape(),
        integrators.first().map_or(0, |it| it.evaluator().n_channels()),
        lanes,
    ))
}
