//! mdflow command-line entry point.
//!
//! Binary name: `mdflow`
//!
//! Parses CLI arguments, sets up tracing, opens the run database and
//! dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,mdflow_core=debug",
        _ => "trace",
    };
    if let Err(e) = mdflow_observe::tracing_setup::init_tracing(cli.otel, filter) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    mdflow_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Validation never touches the database.
    if let Commands::Validate { file } = &cli.command {
        return cli::validate::validate(file, cli.json);
    }

    let state = AppState::init(cli.db.as_deref()).await?;

    match cli.command {
        Commands::Run {
            file,
            input,
            inputs_json,
        } => {
            let inputs = cli::run::parse_inputs(&input, inputs_json.as_deref())?;
            cli::run::run(&state, &file, inputs, cli.json, cli.quiet).await?;
        }

        Commands::Resume { run_id, file } => {
            cli::run::resume(&state, &run_id, &file, cli.json, cli.quiet).await?;
        }

        Commands::Status { run_id, limit } => match run_id {
            Some(run_id) => cli::status::show_run(&state, &run_id, cli.json).await?,
            None => cli::status::list_runs(&state, limit, cli.json).await?,
        },

        Commands::Cleanup { days } => {
            cli::status::cleanup(&state, days, cli.json).await?;
        }

        Commands::Validate { .. } => unreachable!("handled above"),
    }

    Ok(())
}
