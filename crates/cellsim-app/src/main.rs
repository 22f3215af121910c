use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use cellsim_app::{demo_script, load_config, load_script, run_script, write_report};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "cellsim",
    version,
    about = "Run cell-culture population experiments from JSON scripts"
)]
struct Cli {
    /// JSON configuration file; built-in defaults when omitted.
    #[arg(long, env = "CELLSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Master seed, overriding the configuration.
    #[arg(long, env = "CELLSIM_SEED")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute an experiment script and write a JSON report.
    Run {
        /// Script file containing a command list.
        script: PathBuf,
        /// Report destination; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Include every step record in the report.
        #[arg(long)]
        trajectory: bool,
    },
    /// Run the built-in dose-response demonstration.
    Demo {
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        trajectory: bool,
    },
    /// Print the effective configuration as JSON.
    Config,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let report = match cli.command {
        Command::Config => {
            let pretty = serde_json::to_string_pretty(&config)
                .context("failed to format configuration JSON")?;
            println!("{pretty}");
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run {
            script,
            output,
            trajectory,
        } => {
            let parsed = load_script(&script)?;
            info!(script = %script.display(), "loaded experiment script");
            let report = run_script(parsed, config, cli.seed, trajectory)?;
            write_report(&report, output.as_deref())?;
            report
        }
        Command::Demo { output, trajectory } => {
            let report = run_script(demo_script(), config, cli.seed, trajectory)?;
            write_report(&report, output.as_deref())?;
            report
        }
    };

    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(halted = ?report.halted, "experiment did not complete cleanly");
        Ok(ExitCode::FAILURE)
    }
}
