//! Solve command implementation.

use std::fs;

use anyhow::{Context, Result};
use console::style;
use ndarray::Axis;
use serde::Serialize;
use tracing::info;

use qdyn_core::state::is_ket;
use qdyn_core::{EquationKind, Solution, StepRecord, TrajectoryStatus, solve};

use super::problem_file;

/// JSON export of a finished run.
#[derive(Debug, Serialize)]
struct Export<'a> {
    method: &'static str,
    equation: EquationKind,
    tsave: &'a [f64],
    status: &'a [TrajectoryStatus],
    stats: &'a [StepRecord],
    /// Basis-state populations, `lane × time × basis`. NaN becomes null.
    populations: Vec<Vec<Vec<f64>>>,
    /// Mean measurement currents, `lane × channel × interval`.
    #[serde(skip_serializing_if = "Option::is_none")]
    measurements: Option<Vec<Vec<Vec<f64>>>>,
}

/// Execute the solve command.
pub fn execute(input: &str, output: Option<&str>, strict: bool) -> Result<()> {
    println!(
        "{} Solving {}",
        style("→").cyan().bold(),
        style(input).green()
    );

    let file = problem_file::load(input)?;
    let problem = file.to_problem()?;
    let mut config = file.config.clone();
    if strict {
        config.strict = true;
    }
    println!(
        "  Loaded: {} on {} qubit(s), {} save points, method {}",
        file.equation,
        file.qubits,
        problem.tsave().len(),
        style(file.method).yellow()
    );
    info!(input, method = file.method.name(), "solving");

    let solution = solve(&problem, &file.method, &config)?;
    println!("\n{solution}");

    for (lane, status) in solution.status().iter().enumerate() {
        if !status.is_finished() {
            println!(
                "  {} trajectory {lane}: {status}",
                style("!").yellow().bold()
            );
        }
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&export(&solution))?;
        fs::write(path, json).with_context(|| format!("Failed to write output: {path}"))?;
        println!("\n{} Wrote {}", style("✓").green().bold(), style(path).green());
    }

    Ok(())
}

fn export(solution: &Solution) -> Export<'_> {
    let populations = solution
        .states()
        .outer_iter()
        .map(|lane| {
            lane.outer_iter()
                .map(|state| {
                    let state = state.to_owned();
                    if is_ket(&state) {
                        state.iter().map(|z| z.norm_sqr()).collect()
                    } else {
                        state.diag().iter().map(|z| z.re).collect()
                    }
                })
                .collect()
        })
        .collect();

    let measurements = solution.measurements().map(|m| {
        m.outer_iter()
            .map(|lane| {
                lane.axis_iter(Axis(0))
                    .map(|channel| channel.to_vec())
                    .collect()
            })
            .collect()
    });

    Export {
        method: solution.method(),
        equation: solution.kind(),
        tsave: solution.tsave(),
        status: solution.status(),
        stats: solution.stats(),
        populations,
        measurements,
    }
}
