//! CLI command definitions and dispatch for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (e.g., `stepwise definition import`, `stepwise approval approve`).

pub mod approval;
pub mod definition;
pub mod engine;
pub mod instance;
pub mod output;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect business workflows.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
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

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWISE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions (import, list, show).
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Manage workflow instances (start, advance, cancel, show, list).
    #[command(alias = "inst")]
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// Work with approval tasks (list, approve, reject, delegate).
    Approval {
        #[command(subcommand)]
        action: approval::ApprovalCommand,
    },

    /// Run one timeout sweep: expire overdue steps, escalate overdue
    /// approvals, advance due retries.
    Sweep,

    /// Run the worker pool and the periodic sweeper until interrupted.
    Worker {
        /// Override `worker_concurrency` from config.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Override `sweep_interval_secs` from config.
        #[arg(long)]
        sweep_interval: Option<u64>,
    },

    /// Show the effective configuration and data directory.
    Config,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}
