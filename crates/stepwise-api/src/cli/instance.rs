//! CLI workflow instance subcommands.
//!
//! Provides start, advance, cancel, show and list operations. `start` and
//! `advance` drive the instance synchronously until it stops making progress
//! (waiting, retrying, terminal); `--step` advances exactly once instead.

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use stepwise_core::repository::InstanceRepository;
use stepwise_core::workflow::orchestrator::{AdvanceOutcome, CancelOutcome};
use stepwise_types::instance::{EntityRef, InstanceStatus};

use super::output;
use crate::state::AppState;

/// Upper bound on steps driven by one CLI call, so a looping definition
/// cannot spin forever in the foreground.
const MAX_STEPS_PER_RUN: usize = 1_000;

/// Instance management subcommands.
#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Start an instance of the active version of a definition.
    Start {
        /// Definition code.
        code: String,

        /// Entity the instance operates on, as `type:id` (e.g. `order:PO-1001`).
        #[arg(long)]
        entity: String,

        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        #[arg(long, default_value = "")]
        tenant: String,

        /// Only create the instance; leave advancing to a worker.
        #[arg(long)]
        no_run: bool,
    },

    /// Advance an instance until it waits, retries or finishes.
    Advance {
        /// Instance UUID.
        id: String,

        /// Advance exactly one step.
        #[arg(long)]
        step: bool,
    },

    /// Cancel a running instance.
    Cancel {
        /// Instance UUID.
        id: String,
    },

    /// Show an instance with its step history.
    Show {
        /// Instance UUID.
        id: String,
    },

    /// List instances, newest first.
    List {
        /// Filter by status (running, completed, failed, cancelled).
        #[arg(long)]
        status: Option<InstanceStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

/// Handle an instance subcommand.
pub async fn handle_instance_command(
    cmd: InstanceCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        InstanceCommand::Start {
            code,
            entity,
            context,
            tenant,
            no_run,
        } => handle_start(&code, &entity, context.as_deref(), &tenant, no_run, state, json).await,
        InstanceCommand::Advance { id, step } => handle_advance(&id, step, state, json).await,
        InstanceCommand::Cancel { id } => handle_cancel(&id, state, json).await,
        InstanceCommand::Show { id } => handle_show(&id, state, json).await,
        InstanceCommand::List { status, limit } => handle_list(status, limit, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

fn parse_entity(raw: &str) -> Result<EntityRef> {
    match raw.split_once(':') {
        Some((entity_type, entity_id)) if !entity_type.is_empty() && !entity_id.is_empty() => {
            Ok(EntityRef {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            })
        }
        _ => bail!("Entity must look like 'type:id', got '{raw}'"),
    }
}

pub(crate) fn parse_object(raw: Option<&str>, what: &str) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw)
            .with_context(|| format!("Invalid {what} JSON"))?
        {
            Value::Object(map) => Ok(map),
            _ => bail!("{what} must be a JSON object"),
        },
    }
}

// ---------------------------------------------------------------------------
// Outcome rendering
// ---------------------------------------------------------------------------

/// JSON form of an advance outcome.
pub(crate) fn outcome_json(outcome: &AdvanceOutcome) -> Value {
    match outcome {
        AdvanceOutcome::NotRunning(status) => json!({"outcome": "not_running", "status": status}),
        AdvanceOutcome::Advanced { next_step } => json!({"outcome": "advanced", "next_step": next_step}),
        AdvanceOutcome::Completed => json!({"outcome": "completed"}),
        AdvanceOutcome::Failed { error } => json!({"outcome": "failed", "error": error}),
        AdvanceOutcome::Waiting { approval_id } => {
            json!({"outcome": "waiting", "approval_id": approval_id.to_string()})
        }
        AdvanceOutcome::RetryScheduled { attempt, delay } => json!({
            "outcome": "retry_scheduled",
            "attempt": attempt,
            "delay_ms": delay.as_millis() as u64,
        }),
        AdvanceOutcome::NotDue { scheduled_at } => {
            json!({"outcome": "not_due", "scheduled_at": scheduled_at.to_rfc3339()})
        }
        AdvanceOutcome::Cancelled => json!({"outcome": "cancelled"}),
    }
}

/// One styled line describing an advance outcome.
pub(crate) fn outcome_line(outcome: &AdvanceOutcome) -> String {
    match outcome {
        AdvanceOutcome::NotRunning(status) => format!("{} instance is {status}", style("-").dim()),
        AdvanceOutcome::Advanced { next_step } => {
            format!("{} advanced to '{}'", style("→").blue(), style(next_step).cyan())
        }
        AdvanceOutcome::Completed => format!("{} completed", style("✓").green().bold()),
        AdvanceOutcome::Failed { error } => format!("{} failed: {error}", style("✗").red().bold()),
        AdvanceOutcome::Waiting { approval_id } => format!(
            "{} waiting on approval {}",
            style("⏸").yellow(),
            style(approval_id).yellow()
        ),
        AdvanceOutcome::RetryScheduled { attempt, delay } => format!(
            "{} attempt {attempt} scheduled in {}ms",
            style("↻").yellow(),
            delay.as_millis()
        ),
        AdvanceOutcome::NotDue { scheduled_at } => format!(
            "{} next attempt not due until {}",
            style("…").dim(),
            scheduled_at.format("%Y-%m-%d %H:%M:%S")
        ),
        AdvanceOutcome::Cancelled => format!("{} cancelled", style("■").dim()),
    }
}

/// Advance until the outcome is anything but `Advanced`.
pub(crate) async fn run_until_settled(
    state: &AppState,
    instance_id: &Uuid,
) -> Result<Vec<AdvanceOutcome>> {
    let mut outcomes = Vec::new();
    for _ in 0..MAX_STEPS_PER_RUN {
        let outcome = state.orchestrator.advance(instance_id).await?;
        let settled = !matches!(outcome, AdvanceOutcome::Advanced { .. });
        outcomes.push(outcome);
        if settled {
            return Ok(outcomes);
        }
    }
    tracing::warn!(instance_id = %instance_id, steps = MAX_STEPS_PER_RUN, "step limit reached, leaving the rest to a worker");
    Ok(outcomes)
}

fn print_outcomes(instance_id: &Uuid, outcomes: &[AdvanceOutcome], json: bool) -> Result<()> {
    if json {
        let out = json!({
            "instance_id": instance_id.to_string(),
            "outcomes": outcomes.iter().map(outcome_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for outcome in outcomes {
            println!("  {}", outcome_line(outcome));
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(
    code: &str,
    entity: &str,
    context: Option<&str>,
    tenant: &str,
    no_run: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let entity = parse_entity(entity)?;
    let context = parse_object(context, "context")?;

    let instance = state
        .orchestrator
        .start_instance(code, tenant, entity, context)
        .await?;

    if !json {
        println!();
        println!(
            "  {} Started '{}' v{} for {}",
            style("*").green().bold(),
            style(&instance.definition_code).cyan(),
            instance.definition_version,
            instance.entity
        );
        println!("  ID: {}", instance.id);
    }

    let outcomes = if no_run {
        Vec::new()
    } else {
        run_until_settled(state, &instance.id).await?
    };
    print_outcomes(&instance.id, &outcomes, json)
}

// ---------------------------------------------------------------------------
// Advance
// ---------------------------------------------------------------------------

async fn handle_advance(id: &str, single: bool, state: &AppState, json: bool) -> Result<()> {
    let instance_id = parse_id(id, "instance")?;

    let outcomes = if single {
        vec![state.orchestrator.advance(&instance_id).await?]
    } else {
        run_until_settled(state, &instance_id).await?
    };

    if !json {
        println!();
    }
    print_outcomes(&instance_id, &outcomes, json)
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(id: &str, state: &AppState, json: bool) -> Result<()> {
    let instance_id = parse_id(id, "instance")?;
    let outcome = state.orchestrator.cancel(&instance_id).await?;

    let label = match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::CancelRequested => "cancel_requested",
    };
    if json {
        let out = json!({"instance_id": instance_id.to_string(), "outcome": label});
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        match outcome {
            CancelOutcome::Cancelled => {
                println!("  {} Instance {} cancelled", style("■").bold(), instance_id)
            }
            CancelOutcome::CancelRequested => println!(
                "  {} Cancellation requested; the running step will stop at its next boundary",
                style("■").bold()
            ),
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let instance_id = parse_id(id, "instance")?;
    let repo = state.orchestrator.instances();

    let instance = repo
        .load_instance(&instance_id)
        .await
        .map_err(|e| anyhow!("Failed to load instance: {e}"))?
        .with_context(|| format!("Instance '{id}' not found"))?;
    let steps = repo
        .list_steps(&instance_id)
        .await
        .map_err(|e| anyhow!("Failed to list steps: {e}"))?;

    if json {
        let out = json!({ "instance": instance, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} v{}  {}",
        style(&instance.definition_code).cyan().bold(),
        instance.definition_version,
        instance.entity
    );
    println!("  ID:       {}", instance.id);
    println!("  Status:   {}", instance.status);
    println!(
        "  Step:     {}",
        instance.current_step.as_deref().unwrap_or("-")
    );
    println!("  Started:  {}", output::timestamp(Some(instance.started_at)));
    if let Some(error) = &instance.error {
        println!("  Error:    {}", style(error).red());
    }
    println!(
        "  Context:  {}",
        serde_json::to_string(&instance.context).unwrap_or_default()
    );
    println!();

    if steps.is_empty() {
        println!("  No steps executed yet.");
        println!();
        return Ok(());
    }

    let mut table = output::table(&["Step", "Type", "Status", "Attempt", "Started", "Error"]);
    for s in &steps {
        table.add_row(vec![
            Cell::new(&s.step_id),
            Cell::new(s.step_type.to_string()),
            output::step_status(s.status),
            Cell::new(s.attempt),
            Cell::new(output::timestamp(s.started_at)),
            Cell::new(s.error.as_deref().map(|e| output::truncate(e, 40)).unwrap_or_else(|| "-".into())),
        ]);
    }
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    status: Option<InstanceStatus>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let instances = state
        .orchestrator
        .instances()
        .list_instances(status, limit)
        .await
        .map_err(|e| anyhow!("Failed to list instances: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No instances.");
        println!();
        return Ok(());
    }

    let mut table = output::table(&["ID", "Definition", "Entity", "Status", "Step", "Started"]);
    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id.to_string().chars().take(8).collect::<String>()),
            Cell::new(format!("{} v{}", i.definition_code, i.definition_version)),
            Cell::new(i.entity.to_string()),
            output::instance_status(i.status),
            Cell::new(i.current_step.as_deref().unwrap_or("-")),
            Cell::new(output::timestamp(Some(i.started_at))),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn entity_parses_type_and_id() {
        let entity = parse_entity("order:PO-1001").unwrap();
        assert_eq!(entity.entity_type, "order");
        assert_eq!(entity.entity_id, "PO-1001");

        // Only the first colon separates.
        assert_eq!(parse_entity("urn:a:b").unwrap().entity_id, "a:b");
        assert!(parse_entity("order").is_err());
        assert!(parse_entity(":PO-1").is_err());
    }

    #[test]
    fn context_must_be_an_object() {
        assert!(parse_object(None, "context").unwrap().is_empty());
        assert_eq!(parse_object(Some(r#"{"a": 1}"#), "context").unwrap()["a"], 1);
        assert!(parse_object(Some("[1, 2]"), "context").is_err());
        assert!(parse_object(Some("{oops"), "context").is_err());
    }

    #[test]
    fn outcome_json_shapes() {
        let retry = outcome_json(&AdvanceOutcome::RetryScheduled {
            attempt: 2,
            delay: Duration::from_millis(1500),
        });
        assert_eq!(retry["outcome"], "retry_scheduled");
        assert_eq!(retry["delay_ms"], 1500);

        let not_running = outcome_json(&AdvanceOutcome::NotRunning(InstanceStatus::Completed));
        assert_eq!(not_running["status"], "completed");
    }
}
