//! qdyn Command-Line Interface
//!
//! Solves a quantum dynamics problem described in a YAML file.
//!
//! ```text
//! qdyn solve -i rabi.yaml -o rabi.json -v
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{solve, version};

/// qdyn - adaptive time integration for Schrödinger, Lindblad and stochastic master equations
#[derive(Parser)]
#[command(name = "qdyn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve the problem described in a YAML file
    Solve {
        /// Problem file (YAML)
        #[arg(short, long)]
        input: String,

        /// Write saved populations and step statistics as JSON
        #[arg(short, long)]
        output: Option<String>,

        /// Fail on the first diverged trajectory
        #[arg(long)]
        strict: bool,
    },

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Solve {
            input,
            output,
            strict,
        } => solve::execute(&input, output.as_deref(), strict),

        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
