//! CLI command parsing and end-to-end tests.
//!
//! Argument parsing is checked via clap `try_parse_from` on a mirror of the
//! binary's structs; the `solve` command is run through the built binary.

// ============================================================================
// Clap argument parsing (test via try_parse_from on equivalent structs)
// ============================================================================

mod clap_parsing {
    use clap::{Parser, Subcommand};

    // Mirror the CLI struct for testing (since main.rs is a binary)
    #[derive(Parser)]
    #[command(name = "qdyn")]
    struct TestCli {
        #[arg(short, long, action = clap::ArgAction::Count, global = true)]
        verbose: u8,

        #[command(subcommand)]
        command: TestCommands,
    }

    #[derive(Subcommand)]
    enum TestCommands {
        Solve {
            #[arg(short, long)]
            input: String,
            #[arg(short, long)]
            output: Option<String>,
            #[arg(long)]
            strict: bool,
        },
        Version,
    }

    #[test]
    fn test_parse_solve_minimal() {
        let cli = TestCli::try_parse_from(["qdyn", "solve", "-i", "rabi.yaml"]).unwrap();
        match cli.command {
            TestCommands::Solve {
                input,
                output,
                strict,
            } => {
                assert_eq!(input, "rabi.yaml");
                assert!(output.is_none());
                assert!(!strict);
            }
            TestCommands::Version => panic!("Expected Solve command"),
        }
    }

    #[test]
    fn test_parse_solve_with_all_args() {
        let cli = TestCli::try_parse_from([
            "qdyn", "solve", "-i", "in.yaml", "-o", "out.json", "--strict", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            TestCommands::Solve {
                input,
                output,
                strict,
            } => {
                assert_eq!(input, "in.yaml");
                assert_eq!(output.unwrap(), "out.json");
                assert!(strict);
            }
            TestCommands::Version => panic!("Expected Solve command"),
        }
    }

    #[test]
    fn test_parse_solve_missing_input() {
        assert!(TestCli::try_parse_from(["qdyn", "solve"]).is_err());
    }

    #[test]
    fn test_parse_version() {
        let cli = TestCli::try_parse_from(["qdyn", "version"]).unwrap();
        assert!(matches!(cli.command, TestCommands::Version));
    }

    #[test]
    fn test_parse_verbose_vvv() {
        let cli = TestCli::try_parse_from(["qdyn", "-vvv", "version"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn test_no_subcommand() {
        assert!(TestCli::try_parse_from(["qdyn"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(TestCli::try_parse_from(["qdyn", "compile"]).is_err());
    }
}

// ============================================================================
// Binary end-to-end
// ============================================================================

mod binary {
    use std::fs;
    use std::process::Command;

    fn qdyn() -> Command {
        Command::new(env!("CARGO_BIN_EXE_qdyn"))
    }

    const HALF_TURN: &str = r#"
equation: schrodinger
qubits: 1
hamiltonian:
  - { pauli: Z, coeff: 0.5 }
initial_state: "+"
tsave: [0.0, 3.141592653589793]
"#;

    #[test]
    fn test_version_runs() {
        let out = qdyn().arg("version").output().unwrap();
        assert!(out.status.success());
        assert!(String::from_utf8_lossy(&out.stdout).contains("qdyn"));
    }

    #[test]
    fn test_solve_prints_summary_and_exports_json() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("half_turn.yaml");
        let output = dir.path().join("half_turn.json");
        fs::write(&input, HALF_TURN).unwrap();

        let out = qdyn()
            .args(["solve", "-i"])
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("==== Result ===="));
        assert!(stdout.contains("Solver  : Dopri5"));
        assert!(stdout.contains("States  : complex128 (1, 2, 2, 1) | 64 b"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(json["method"], "Dopri5");
        assert_eq!(json["equation"], "schrodinger");
        let pops = &json["populations"][0];
        assert_eq!(pops.as_array().unwrap().len(), 2);
        let p0 = pops[1][0].as_f64().unwrap();
        assert!((p0 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_strict_flag_fails_on_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("blowup.yaml");
        let source = r#"
equation: lindblad
qubits: 1
hamiltonian:
  - { pauli: X, coeff: 40.0 }
jump_ops:
  - [{ pauli: Z, coeff: 30.0 }]
initial_state: "0"
tsave: [0.0, 10.0]
config: { max_steps: 5 }
"#;
        fs::write(&input, source).unwrap();

        let relaxed = qdyn().args(["solve", "-i"]).arg(&input).output().unwrap();
        assert!(relaxed.status.success());
        assert!(String::from_utf8_lossy(&relaxed.stdout).contains("diverged"));

        let strict = qdyn()
            .args(["solve", "--strict", "-i"])
            .arg(&input)
            .output()
            .unwrap();
        assert!(!strict.status.success());
        assert!(String::from_utf8_lossy(&strict.stderr).contains("Error:"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let out = qdyn()
            .args(["solve", "-i", "/nonexistent/qdyn_problem_12345.yaml"])
            .output()
            .unwrap();
        assert!(!out.status.success());
        assert!(String::from_utf8_lossy(&out.stderr).contains("File not found"));
    }

    #[test]
    fn test_invalid_problem_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.yaml");
        fs::write(&input, HALF_TURN.replace("[0.0, 3.141592653589793]", "[1.0, 0.5]")).unwrap();
        let out = qdyn().args(["solve", "-i"]).arg(&input).output().unwrap();
        assert!(!out.status.success());
    }
}
