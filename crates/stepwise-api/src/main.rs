//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise=debug",
        _ => "trace",
    };
    stepwise_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Definition { action } => {
            cli::definition::handle_definition_command(action, &state, cli.json).await
        }
        Commands::Instance { action } => {
            cli::instance::handle_instance_command(action, &state, cli.json).await
        }
        Commands::Approval { action } => {
            cli::approval::handle_approval_command(action, &state, cli.json).await
        }
        Commands::Sweep => cli::engine::handle_sweep(&state, cli.json).await,
        Commands::Worker {
            concurrency,
            sweep_interval,
        } => cli::engine::handle_worker(&state, concurrency, sweep_interval).await,
        Commands::Config => cli::engine::handle_config(&state, cli.json),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    stepwise_observe::tracing_setup::shutdown_tracing();
    result
}
