//! Engine-level commands: one-shot sweep, long-running worker, config.

use std::time::Duration;

use anyhow::{Result, anyhow};
use console::style;
use stepwise_core::repository::InstanceRepository;
use stepwise_core::workflow::sweeper::TimeoutSweeper;
use stepwise_core::workflow::worker::WorkerPool;
use stepwise_types::instance::InstanceStatus;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Running instances picked up on worker start.
const STARTUP_BACKLOG_LIMIT: u32 = 10_000;

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

pub async fn handle_sweep(state: &AppState, json: bool) -> Result<()> {
    let sweeper = TimeoutSweeper::new(state.orchestrator.clone());
    let report = sweeper.sweep().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("  {} Sweep finished", style("*").green().bold());
        println!("  Expired steps:        {}", report.expired_steps);
        println!("  Escalated approvals:  {}", report.escalated_approvals);
        println!("  Retried steps:        {}", report.retried_steps);
        println!("  Skipped (locked):     {}", report.skipped_contended);
        if report.errors > 0 {
            println!("  Errors:               {}", style(report.errors).red());
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Run the worker pool and the sweeper until Ctrl+C / SIGTERM.
///
/// Every running instance is enqueued once at startup so work left behind
/// by a previous process resumes.
pub async fn handle_worker(
    state: &AppState,
    concurrency: Option<usize>,
    sweep_interval: Option<u64>,
) -> Result<()> {
    let mut config = state.config.clone();
    if let Some(concurrency) = concurrency {
        config.worker_concurrency = concurrency;
    }
    let interval = sweep_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.sweep_interval());

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(state.orchestrator.clone(), &config);
    let queue = pool.queue();
    let sweeper = TimeoutSweeper::new(state.orchestrator.clone());

    let pool_task = tokio::spawn(pool.run(shutdown.clone()));
    let sweep_shutdown = shutdown.clone();
    let sweep_task = tokio::spawn(async move { sweeper.run(interval, sweep_shutdown).await });

    let backlog = state
        .orchestrator
        .instances()
        .list_instances(Some(InstanceStatus::Running), STARTUP_BACKLOG_LIMIT)
        .await
        .map_err(|e| anyhow!("Failed to list running instances: {e}"))?;
    for instance in &backlog {
        queue.enqueue(instance.id).await?;
    }

    println!(
        "  {} Worker running ({} concurrent, sweep every {}s, {} instances queued)",
        style("⚡").bold(),
        config.worker_concurrency.max(1),
        interval.as_secs(),
        backlog.len()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    shutdown_signal().await;
    println!("\n  Stopping worker...");
    shutdown.cancel();

    if let Err(err) = pool_task.await {
        tracing::error!(error = %err, "worker pool task failed");
    }
    if let Err(err) = sweep_task.await {
        tracing::error!(error = %err, "sweeper task failed");
    }
    println!("  Worker stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

pub fn handle_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "handlers": state.orchestrator.handlers().names(),
            "config": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Data dir:  {}", style(state.data_dir.display()).cyan());
    println!("  Handlers:  {}", state.orchestrator.handlers().names().join(", "));
    println!();
    println!("{}", indented_json(&state.config)?);
    Ok(())
}

/// Pretty JSON indented for the terminal.
fn indented_json(config: &stepwise_types::config::EngineConfig) -> Result<String> {
    let text = serde_json::to_string_pretty(config)?;
    Ok(text.lines().map(|l| format!("  {l}")).collect::<Vec<_>>().join("\n"))
}
