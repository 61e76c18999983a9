//! CLI definition subcommands.
//!
//! Provides create, validate, list, show, activate, and deactivate for
//! workflow definitions stored in the local database.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use sagaflow_core::workflow::definition::{load_definition_file, serialize_definition_yaml};
use sagaflow_types::definition::WorkflowDefinition;

use super::parse_uuid;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Create a definition (or a new version) from a YAML or JSON file.
    Create {
        /// Path to the definition file (`.json` is parsed as JSON, anything else as YAML).
        file: PathBuf,

        /// Activate immediately (requires every action to be registered).
        #[arg(long)]
        activate: bool,
    },

    /// Validate a definition file without saving it.
    Validate {
        file: PathBuf,
    },

    /// List the latest version of every definition.
    List,

    /// Show a definition as YAML.
    Show {
        /// Definition UUID.
        id: String,

        /// Specific version (latest when omitted).
        #[arg(long)]
        version: Option<u32>,

        /// List all versions instead of the graph.
        #[arg(long)]
        history: bool,
    },

    /// Activate a definition version so new instances can start.
    Activate {
        id: String,
        #[arg(long)]
        version: Option<u32>,
    },

    /// Deactivate a definition version. Running instances continue.
    Deactivate {
        id: String,
        #[arg(long)]
        version: Option<u32>,
    },
}

/// Handle a definition subcommand.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Create { file, activate } => {
            handle_create(&file, activate, state, json).await
        }
        DefinitionCommand::Validate { file } => handle_validate(&file, state, json),
        DefinitionCommand::List => handle_list(state, json).await,
        DefinitionCommand::Show {
            id,
            version,
            history,
        } => handle_show(&id, version, history, state, json).await,
        DefinitionCommand::Activate { id, version } => {
            handle_set_active(&id, version, true, state, json).await
        }
        DefinitionCommand::Deactivate { id, version } => {
            handle_set_active(&id, version, false, state, json).await
        }
    }
}

fn load_file(file: &PathBuf) -> Result<WorkflowDefinition> {
    load_definition_file(file).map_err(|e| anyhow!("Failed to load {}: {e}", file.display()))
}

// ---------------------------------------------------------------------------
// Create / validate
// ---------------------------------------------------------------------------

async fn handle_create(file: &PathBuf, activate: bool, state: &AppState, json: bool) -> Result<()> {
    let mut def = load_file(file)?;
    if activate {
        def.is_active = true;
    }

    let def = state
        .orchestrator
        .definitions()
        .save(def)
        .await
        .map_err(|e| anyhow!("Failed to save definition: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
    } else {
        println!();
        println!(
            "  {} Saved definition '{}' v{}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version
        );
        println!("  ID:     {}", def.id);
        println!("  Nodes:  {}", def.nodes.len());
        println!(
            "  Active: {}",
            if def.is_active {
                style("yes").green()
            } else {
                style("no").dim()
            }
        );
        println!();
    }
    Ok(())
}

fn handle_validate(file: &PathBuf, state: &AppState, json: bool) -> Result<()> {
    let def = load_file(file)?;
    let registry_check = state.orchestrator.registry().validate_definition(&def);

    if json {
        let out = serde_json::json!({
            "name": def.name,
            "graph_valid": true,
            "actions_valid": registry_check.is_ok(),
            "error": registry_check.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} Graph is valid", style("✓").green());
    match registry_check {
        Ok(()) => println!("  {} All actions registered and configured", style("✓").green()),
        Err(e) => println!("  {} {e}", style("✗").red()),
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

fn definitions_table(defs: &[WorkflowDefinition]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Category").fg(Color::Cyan),
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Active").fg(Color::Cyan),
            Cell::new("Nodes").fg(Color::Cyan),
            Cell::new("Updated").fg(Color::Cyan),
        ]);

    for def in defs {
        let active = if def.is_active {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(def.id),
            Cell::new(&def.name),
            Cell::new(&def.category),
            Cell::new(def.version),
            active,
            Cell::new(def.nodes.len()),
            Cell::new(def.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    table
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .orchestrator
        .definitions()
        .list()
        .await
        .map_err(|e| anyhow!("Failed to list definitions: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }
    if defs.is_empty() {
        println!();
        println!("  No definitions yet. Create one with `sagaflow definition create <file>`.");
        println!();
        return Ok(());
    }

    println!();
    println!("{}", definitions_table(&defs));
    println!();
    Ok(())
}

async fn handle_show(
    id: &str,
    version: Option<u32>,
    history: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_uuid(id, "definition")?;
    let store = state.orchestrator.definitions();

    if history {
        let versions = store
            .versions(&id)
            .await
            .map_err(|e| anyhow!("Failed to load versions: {e}"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&versions)?);
        } else {
            println!();
            println!("{}", definitions_table(&versions));
            println!();
        }
        return Ok(());
    }

    let def = store
        .get(&id, version)
        .await
        .map_err(|e| anyhow!("Failed to load definition: {e}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
    } else {
        print!("{}", serialize_definition_yaml(&def)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Activate / deactivate
// ---------------------------------------------------------------------------

async fn handle_set_active(
    id: &str,
    version: Option<u32>,
    active: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_uuid(id, "definition")?;
    let store = state.orchestrator.definitions();
    let def = if active {
        store.activate(&id, version).await
    } else {
        store.deactivate(&id, version).await
    }
    .map_err(|e| anyhow!("Failed to update definition: {e}"))?;

    if json {
        let out = serde_json::json!({
            "id": def.id,
            "version": def.version,
            "is_active": def.is_active,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} '{}' v{} {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version,
            if active { "activated" } else { "deactivated" }
        );
        println!();
    }
    Ok(())
}
