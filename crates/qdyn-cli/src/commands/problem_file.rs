//! YAML problem files.
//!
//! ```yaml
//! equation: lindblad
//! qubits: 1
//! hamiltonian:
//!   - { pauli: X, coeff: 0.5 }
//! jump_ops:
//!   - [{ pauli: X, coeff: 0.25 }, { pauli: Y, coeff: 0.0, imag: 0.25 }]
//! initial_state: "0"
//! tsave: { start: 0.0, stop: 10.0, num: 101 }
//! method: { name: dopri5 }
//! config: { relative_tolerance: 1.0e-8 }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use num_complex::Complex64;
use serde::Deserialize;

use qdyn_core::operator::{Operator, PauliOp, PauliString};
use qdyn_core::{EquationKind, Method, Problem, SolverConfig};

/// Largest register the dense representation is built for.
const MAX_QUBITS: u32 = 12;

/// A deserialized problem file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemFile {
    pub equation: EquationKind,
    pub qubits: u32,
    #[serde(default)]
    pub hamiltonian: Vec<PauliTermEntry>,
    #[serde(default)]
    pub jump_ops: Vec<Vec<PauliTermEntry>>,
    #[serde(default)]
    pub efficiencies: Option<Vec<f64>>,
    pub initial_state: String,
    pub tsave: TimeGrid,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub config: SolverConfig,
}

/// One complex-weighted Pauli string, e.g. `{ pauli: XZ, coeff: 0.5 }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PauliTermEntry {
    /// One of `IXYZ` per qubit, qubit 0 first.
    pub pauli: String,
    pub coeff: f64,
    #[serde(default)]
    pub imag: f64,
}

/// Save times as an explicit list or an evenly spaced grid.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeGrid {
    List(Vec<f64>),
    Linspace { start: f64, stop: f64, num: usize },
}

impl TimeGrid {
    /// Expand into save times.
    pub fn times(&self) -> Vec<f64> {
        match self {
            TimeGrid::List(ts) => ts.clone(),
            &TimeGrid::Linspace { start, stop, num } => match num {
                0 => Vec::new(),
                1 => vec![start],
                n => (0..n)
                    .map(|k| start + (stop - start) * k as f64 / (n - 1) as f64)
                    .collect(),
            },
        }
    }
}

/// Load a problem file from disk.
pub fn load(path: &str) -> Result<ProblemFile> {
    if !Path::new(path).exists() {
        anyhow::bail!("File not found: {path}");
    }
    let source =
        fs::read_to_string(path).with_context(|| format!("Failed to read file: {path}"))?;
    parse(&source).with_context(|| format!("Invalid problem file: {path}"))
}

/// Parse a problem file from YAML source.
pub fn parse(source: &str) -> Result<ProblemFile> {
    let file: ProblemFile = serde_yaml_ng::from_str(source)?;
    if file.qubits == 0 || file.qubits > MAX_QUBITS {
        anyhow::bail!("qubits must be between 1 and {MAX_QUBITS}, got {}", file.qubits);
    }
    Ok(file)
}

impl ProblemFile {
    /// Build the solver problem.
    pub fn to_problem(&self) -> Result<Problem> {
        let hamiltonian = pauli_sum(self.qubits, &self.hamiltonian).context("hamiltonian")?;
        let jump_ops = self
            .jump_ops
            .iter()
            .enumerate()
            .map(|(k, terms)| {
                pauli_sum(self.qubits, terms)
                    .map(Operator::constant)
                    .with_context(|| format!("jump operator {k}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let psi0 = product_state(&self.initial_state, self.qubits)?;

        let mut problem = Problem::new(self.equation, hamiltonian, psi0, self.tsave.times())
            .with_jump_ops(jump_ops);
        if let Some(eff) = &self.efficiencies {
            problem = problem.with_efficiencies(eff.clone());
        }
        Ok(problem)
    }
}

fn pauli_sum(n_qubits: u32, terms: &[PauliTermEntry]) -> Result<Array2<Complex64>> {
    let dim = 1usize << n_qubits;
    let mut m = Array2::<Complex64>::zeros((dim, dim));
    for term in terms {
        let pauli = pauli_string(&term.pauli, n_qubits)?;
        m.scaled_add(Complex64::new(term.coeff, term.imag), &pauli.to_dense(n_qubits));
    }
    Ok(m)
}

fn pauli_string(label: &str, n_qubits: u32) -> Result<PauliString> {
    let chars: Vec<char> = label.chars().collect();
    if chars.len() != n_qubits as usize {
        anyhow::bail!("Pauli label '{label}' has {} letters for {n_qubits} qubits", chars.len());
    }
    let ops = chars
        .into_iter()
        .enumerate()
        .map(|(q, ch)| {
            let op = match ch.to_ascii_uppercase() {
                'I' => PauliOp::I,
                'X' => PauliOp::X,
                'Y' => PauliOp::Y,
                'Z' => PauliOp::Z,
                other => anyhow::bail!("Unknown Pauli letter '{other}' in '{label}'"),
            };
            Ok((q as u32, op))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PauliString::from_ops(ops))
}

/// Product ket from a label such as `"+0"`: one of `01+-rl` per qubit.
pub fn product_state(label: &str, n_qubits: u32) -> Result<Array2<Complex64>> {
    let chars: Vec<char> = label.chars().collect();
    if chars.len() != n_qubits as usize {
        anyhow::bail!("State label '{label}' has {} letters for {n_qubits} qubits", chars.len());
    }
    let s = 0.5f64.sqrt();
    let mut psi = vec![Complex64::new(1.0, 0.0)];
    for ch in chars {
        let single = match ch {
            '0' => [Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
            '1' => [Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)],
            '+' => [Complex64::new(s, 0.0), Complex64::new(s, 0.0)],
            '-' => [Complex64::new(s, 0.0), Complex64::new(-s, 0.0)],
            'r' => [Complex64::new(s, 0.0), Complex64::new(0.0, s)],
            'l' => [Complex64::new(s, 0.0), Complex64::new(0.0, -s)],
            other => anyhow::bail!("Unknown basis state '{other}' in '{label}'"),
        };
        psi = psi
            .iter()
            .flat_map(|a| single.iter().map(move |b| a * b))
            .collect();
    }
    let dim = psi.len();
    Ok(Array2::from_shape_vec((dim, 1), psi)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RABI: &str = r#"
equation: schrodinger
qubits: 1
hamiltonian:
  - { pauli: X, coeff: 0.5 }
initial_state: "0"
tsave: { start: 0.0, stop: 1.0, num: 5 }
"#;

    #[test]
    fn minimal_file_uses_defaults() {
        let file = parse(RABI).unwrap();
        assert_eq!(file.equation, EquationKind::Schrodinger);
        assert_eq!(file.method, Method::Dopri5);
        assert_eq!(file.config, SolverConfig::default());
        assert_eq!(file.tsave.times(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let problem = file.to_problem().unwrap();
        assert_eq!(problem.state_shape(), (2, 1));
    }

    #[test]
    fn method_and_config_sections() {
        let source = r#"
equation: lindblad
qubits: 2
hamiltonian:
  - { pauli: ZZ, coeff: 1.0 }
jump_ops:
  - [{ pauli: XI, coeff: 0.5 }, { pauli: YI, coeff: 0.0, imag: 0.5 }]
initial_state: "+1"
tsave: [0.0, 0.5, 2.0]
method: { name: rouchon1, dt: 0.01 }
config: { relative_tolerance: 1.0e-8, strict: true }
"#;
        let file = parse(source).unwrap();
        assert_eq!(file.method, Method::Rouchon1 { dt: 0.01 });
        assert!(file.config.strict);
        assert_eq!(file.config.relative_tolerance, 1e-8);
        let problem = file.to_problem().unwrap();
        assert_eq!(problem.n_jump_ops(), 1);
        assert_eq!(problem.state_shape(), (4, 4));
    }

    #[test]
    fn bad_labels_are_reported() {
        assert!(pauli_string("XQ", 2).is_err());
        assert!(pauli_string("X", 2).is_err());
        assert!(product_state("0x", 2).is_err());
        assert!(product_state("000", 2).is_err());
    }

    #[test]
    fn product_state_ordering() {
        // qubit 0 is the leftmost factor
        let psi = product_state("10", 2).unwrap();
        assert_eq!(psi[[2, 0]], Complex64::new(1.0, 0.0));
        let psi = product_state("+r", 2).unwrap();
        assert!((psi[[1, 0]] - Complex64::new(0.0, 0.5)).norm() < 1e-15);
    }

    #[test]
    fn lowering_operator_from_pauli_terms() {
        // σ₋ = (X + iY) / 2 = |0⟩⟨1|
        let terms = vec![
            PauliTermEntry { pauli: "X".into(), coeff: 0.5, imag: 0.0 },
            PauliTermEntry { pauli: "Y".into(), coeff: 0.0, imag: 0.5 },
        ];
        let m = pauli_sum(1, &terms).unwrap();
        assert!((m[[0, 1]] - Complex64::new(1.0, 0.0)).norm() < 1e-15);
        assert!(m[[1, 0]].norm() < 1e-15);
    }

    #[test]
    fn unknown_fields_and_sizes_are_rejected() {
        assert!(parse(&format!("{RABI}shots: 3\n")).is_err());
        assert!(parse(&RABI.replace("qubits: 1", "qubits: 0")).is_err());
    }
}
