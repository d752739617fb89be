//! CLI command definitions for the `mdflow` binary.

pub mod run;
pub mod status;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run markdown workflows with checkpointing and resume.
#[derive(Parser)]
#[command(name = "mdflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Run database path (defaults to `mdflow.db` in the data directory).
    #[arg(long, global = true, env = "MDFLOW_DB")]
    pub db: Option<PathBuf>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file.
    Run {
        /// Path to the workflow markdown file.
        file: PathBuf,

        /// Workflow input as key=value (value parsed as JSON when possible).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        input: Vec<String>,

        /// Workflow inputs as a JSON object. `--input` values win on conflict.
        #[arg(long)]
        inputs_json: Option<String>,
    },

    /// Continue an interrupted or failed run from its last checkpoint.
    Resume {
        /// Run UUID.
        run_id: String,

        /// Path to the workflow markdown file the run was started from.
        file: PathBuf,
    },

    /// Show recent runs, or one run's step checkpoints.
    #[command(alias = "ls")]
    Status {
        /// Run UUID (omit to list recent runs).
        run_id: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Parse and validate a workflow file without running it.
    Validate {
        /// Path to the workflow markdown file.
        file: PathBuf,
    },

    /// Delete runs older than the retention window.
    Cleanup {
        /// Retention in days (defaults to `checkpoint_retention_days` from config.toml).
        #[arg(long)]
        days: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_inputs() {
        let cli = Cli::try_parse_from([
            "mdflow",
            "--json",
            "run",
            "flow.md",
            "--input",
            "channel=#ops",
            "-i",
            "count=3",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { file, input, inputs_json } => {
                assert_eq!(file, PathBuf::from("flow.md"));
                assert_eq!(input, vec!["channel=#ops", "count=3"]);
                assert!(inputs_json.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mdflow", "status", "--limit", "5", "-vv", "--db", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(cli.command, Commands::Status { run_id: None, limit: 5 }));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
