//! CLI approval subcommands.
//!
//! Decisions go through the orchestrator, which records them under the
//! instance lease and resumes the instance. The CLI then keeps driving the
//! instance until it settles, as `instance advance` does.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use serde_json::{Value, json};

use stepwise_core::repository::ApprovalRepository;
use stepwise_core::workflow::orchestrator::AdvanceOutcome;
use stepwise_types::approval::Decision;

use super::instance::{outcome_json, outcome_line, parse_id, parse_object, run_until_settled};
use super::output;
use crate::state::AppState;

/// Approval subcommands.
#[derive(Subcommand)]
pub enum ApprovalCommand {
    /// List pending approvals, earliest deadline first.
    List {
        /// Only approvals assigned to this identity.
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Approve a pending approval.
    Approve {
        /// Approval UUID.
        id: String,

        /// Identity of the approver.
        #[arg(long)]
        by: String,

        #[arg(long)]
        comment: Option<String>,

        /// JSON object merged into the instance context.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Reject a pending approval.
    Reject {
        /// Approval UUID.
        id: String,

        /// Identity of the approver.
        #[arg(long)]
        by: String,

        /// Reason for the rejection.
        #[arg(long)]
        comment: String,
    },

    /// Hand a pending approval to someone else.
    Delegate {
        /// Approval UUID.
        id: String,

        /// Identity of the new assignee.
        #[arg(long)]
        to: String,
    },
}

/// Handle an approval subcommand.
pub async fn handle_approval_command(
    cmd: ApprovalCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ApprovalCommand::List { assignee } => handle_list(assignee.as_deref(), state, json).await,
        ApprovalCommand::Approve {
            id,
            by,
            comment,
            payload,
        } => {
            let payload = parse_object(payload.as_deref(), "payload")?;
            let mut decision = Decision::approve(by).with_payload(Value::Object(payload));
            decision.comment = comment;
            handle_decision(&id, decision, state, json).await
        }
        ApprovalCommand::Reject { id, by, comment } => {
            handle_decision(&id, Decision::reject(by, comment), state, json).await
        }
        ApprovalCommand::Delegate { id, to } => handle_delegate(&id, &to, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(assignee: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let pending = state
        .orchestrator
        .approvals()
        .repo()
        .list_pending(assignee)
        .await
        .map_err(|e| anyhow!("Failed to list approvals: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!();
        println!("  No pending approvals.");
        println!();
        return Ok(());
    }

    let now = chrono::Utc::now();
    let mut table = output::table(&["ID", "Instance", "Step", "Assignee", "Level", "Status", "Due"]);
    for a in &pending {
        let due = output::timestamp(Some(a.due_at));
        let due = if a.is_overdue(now) {
            Cell::new(due).fg(comfy_table::Color::Red)
        } else {
            Cell::new(due)
        };
        table.add_row(vec![
            Cell::new(a.id),
            Cell::new(a.instance_id.to_string().chars().take(8).collect::<String>()),
            Cell::new(&a.step_id),
            Cell::new(&a.assigned_to),
            Cell::new(a.escalation_level),
            output::approval_status(a.status),
            due,
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Approve / Reject
// ---------------------------------------------------------------------------

async fn handle_decision(id: &str, decision: Decision, state: &AppState, json: bool) -> Result<()> {
    let approval_id = parse_id(id, "approval")?;
    let approval = state
        .orchestrator
        .approvals()
        .repo()
        .get_approval(&approval_id)
        .await
        .map_err(|e| anyhow!("Failed to load approval: {e}"))?;

    let mut outcomes = vec![state.orchestrator.record_decision(&approval_id, &decision).await?];
    if let (Some(approval), Some(AdvanceOutcome::Advanced { .. })) = (&approval, outcomes.last()) {
        outcomes.extend(run_until_settled(state, &approval.instance_id).await?);
    }

    if json {
        let out = json!({
            "approval_id": approval_id.to_string(),
            "decision": decision.status(),
            "outcomes": outcomes.iter().map(outcome_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Recorded '{}' by {}",
            style("*").green().bold(),
            decision.status(),
            style(&decision.decided_by).cyan()
        );
        for outcome in &outcomes {
            println!("  {}", outcome_line(outcome));
        }
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Delegate
// ---------------------------------------------------------------------------

async fn handle_delegate(id: &str, to: &str, state: &AppState, json: bool) -> Result<()> {
    let approval_id = parse_id(id, "approval")?;
    let replacement = state.orchestrator.delegate(&approval_id, to).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&replacement)?);
    } else {
        println!();
        println!(
            "  {} Delegated to {}",
            style("*").green().bold(),
            style(&replacement.assigned_to).cyan()
        );
        println!("  New approval ID: {}", replacement.id);
        println!();
    }

    Ok(())
}
