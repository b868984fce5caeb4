//! CLI workflow definition subcommands.
//!
//! Provides import, list and show operations for versioned definitions.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;

use stepwise_core::repository::DefinitionStore;
use stepwise_core::workflow::definition::{
    DefinitionError, load_definition_file, serialize_definition_yaml,
};

use super::output;
use crate::state::AppState;

/// Definition management subcommands.
#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Validate a YAML definition and activate it as the next version of its code.
    Import {
        /// Path to the definition YAML file.
        file: PathBuf,

        /// Owning tenant (overrides the file's `tenant_id`).
        #[arg(long)]
        tenant: Option<String>,
    },

    /// List stored definitions, newest version first.
    List {
        /// Only definitions of this tenant.
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Print the active version of a definition as YAML.
    Show {
        /// Definition code.
        code: String,

        #[arg(long, default_value = "")]
        tenant: String,
    },
}

/// Handle a definition subcommand.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Import { file, tenant } => handle_import(&file, tenant, state, json).await,
        DefinitionCommand::List { tenant } => handle_list(tenant.as_deref(), state, json).await,
        DefinitionCommand::Show { code, tenant } => handle_show(&code, &tenant, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(
    file: &PathBuf,
    tenant: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let mut def = load_definition_file(file).map_err(|e| match e {
        DefinitionError::ParseError(msg) => anyhow!("Failed to parse definition YAML: {msg}"),
        DefinitionError::ValidationError(msg) => anyhow!("Definition validation failed: {msg}"),
        other => anyhow!("Failed to load definition: {other}"),
    })?;
    if let Some(tenant) = tenant {
        def.tenant_id = tenant;
    }

    let def = state
        .orchestrator
        .definitions()
        .activate(def)
        .await
        .map_err(|e| anyhow!("Failed to store definition: {e}"))?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "code": def.code,
            "version": def.version,
            "tenant": def.tenant_id,
            "steps": def.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Activated '{}' version {}",
            style("*").green().bold(),
            style(&def.code).cyan(),
            def.version
        );
        println!("  ID: {}", def.id);
        println!("  Steps: {}", def.steps.len());
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(tenant: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .orchestrator
        .definitions()
        .list_definitions(tenant)
        .await
        .map_err(|e| anyhow!("Failed to list definitions: {e}"))?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "code": d.code,
                    "name": d.name,
                    "tenant": d.tenant_id,
                    "version": d.version,
                    "status": d.status.to_string(),
                    "steps": d.steps.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No definitions stored.");
        println!(
            "  Import one with: {}",
            style("stepwise definition import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = output::table(&["Code", "Name", "Tenant", "Version", "Status", "Steps"]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.code),
            Cell::new(&d.name),
            Cell::new(if d.tenant_id.is_empty() { "-" } else { d.tenant_id.as_str() }),
            Cell::new(d.version),
            Cell::new(d.status.to_string()),
            Cell::new(d.steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(code: &str, tenant: &str, state: &AppState, json: bool) -> Result<()> {
    let def = state
        .orchestrator
        .definitions()
        .get_active_definition(code, tenant)
        .await
        .map_err(|e| anyhow!("Failed to look up definition: {e}"))?
        .with_context(|| format!("No active definition '{code}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
    } else {
        let yaml = serialize_definition_yaml(&def)?;
        println!("{yaml}");
    }

    Ok(())
}
