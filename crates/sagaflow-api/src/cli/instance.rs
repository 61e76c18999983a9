//! CLI instance subcommands.
//!
//! `start` and `retry` run the workflow engine in-process and wait for the
//! instance to settle (or the timeout to pass). With `--no-wait` the work
//! stays queued in durable state and is picked up by the next `serve`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use sagaflow_core::workflow::action::codes;
use sagaflow_core::workflow::query::RetryOutcome;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::StepExecution;

use super::{parse_uuid, status_color};
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Start an instance of a definition's latest active version.
    Start {
        /// Definition UUID.
        definition_id: String,

        /// Initial context as a JSON object.
        #[arg(long, default_value = "{}")]
        context: String,

        /// Return immediately instead of running the engine until settled.
        #[arg(long)]
        no_wait: bool,

        /// Seconds to wait for the instance to settle.
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show an instance and its step history.
    Show {
        id: String,
    },

    /// List instances, newest first.
    List {
        /// Filter by definition UUID.
        #[arg(long)]
        definition: Option<String>,

        /// Filter by status (pending, running, completed, failed, ...).
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List every attempt of every step.
    Steps {
        id: String,
    },

    /// Request a manual retry of a failed step.
    Retry {
        id: String,
        step_id: String,

        #[arg(long)]
        no_wait: bool,

        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Cancel a pending or running instance.
    Cancel {
        id: String,
    },

    /// Compensate a cancelled instance or resume a stranded compensation.
    Compensate {
        id: String,
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
            definition_id,
            context,
            no_wait,
            timeout,
        } => handle_start(&definition_id, &context, no_wait, timeout, state, json).await,
        InstanceCommand::Show { id } => handle_show(&id, state, json).await,
        InstanceCommand::List {
            definition,
            status,
            limit,
        } => handle_list(definition.as_deref(), status.as_deref(), limit, state, json).await,
        InstanceCommand::Steps { id } => handle_steps(&id, state, json).await,
        InstanceCommand::Retry {
            id,
            step_id,
            no_wait,
            timeout,
        } => handle_retry(&id, &step_id, no_wait, timeout, state, json).await,
        InstanceCommand::Cancel { id } => handle_cancel(&id, state, json).await,
        InstanceCommand::Compensate { id } => handle_compensate(&id, state, json).await,
    }
}

async fn load_instance(state: &AppState, id: &uuid::Uuid) -> Result<WorkflowInstance> {
    state
        .query
        .get_instance(id)
        .await?
        .ok_or_else(|| anyhow!("Instance {id} not found"))
}

/// Whether the CLI should stop waiting on this instance. A compensation
/// failure leaves the instance in `compensating` until someone resumes it.
fn is_resting(instance: &WorkflowInstance) -> bool {
    match instance.status {
        InstanceStatus::Pending | InstanceStatus::Running => false,
        InstanceStatus::Compensating => instance
            .error
            .as_ref()
            .is_some_and(|e| e.code == codes::COMPENSATION_FAILED),
        _ => true,
    }
}

/// Recover durable state and start the in-process workers.
async fn start_engine(state: &AppState) -> Result<()> {
    let report = state.engine.start().await?;
    tracing::debug!(?report, "engine recovery finished");
    Ok(())
}

/// Wait until the instance rests or `timeout` passes, then stop the engine.
async fn wait_until_settled(
    state: &AppState,
    id: &uuid::Uuid,
    timeout: Duration,
) -> Result<WorkflowInstance> {
    let waited = tokio::time::timeout(timeout, async {
        loop {
            let instance = load_instance(state, id).await?;
            if is_resting(&instance) {
                return Ok::<_, anyhow::Error>(instance);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    state.engine.shutdown().await;
    match waited {
        Ok(result) => result,
        Err(_) => {
            let instance = load_instance(state, id).await?;
            eprintln!(
                "  {} still {} after {}s; `sagaflow serve` will continue it",
                style("!").yellow().bold(),
                instance.status,
                timeout.as_secs()
            );
            Ok(instance)
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(
    definition_id: &str,
    context: &str,
    no_wait: bool,
    timeout: u64,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let definition_id = parse_uuid(definition_id, "definition")?;
    let context: serde_json::Value =
        serde_json::from_str(context).context("--context must be valid JSON")?;

    if !no_wait {
        start_engine(state).await?;
    }
    let started = state.orchestrator.start(definition_id, context).await;
    let instance = match started {
        Ok(instance) if no_wait => instance,
        Ok(instance) => wait_until_settled(state, &instance.id, Duration::from_secs(timeout)).await?,
        Err(e) => {
            state.engine.shutdown().await;
            return Err(anyhow!("Failed to start instance: {e}"));
        }
    };

    print_instance(state, &instance, json).await
}

// ---------------------------------------------------------------------------
// Show / list / steps
// ---------------------------------------------------------------------------

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid(id, "instance")?;
    let instance = load_instance(state, &id).await?;
    print_instance(state, &instance, json).await
}

async fn print_instance(state: &AppState, instance: &WorkflowInstance, json: bool) -> Result<()> {
    let steps = state.query.list_step_executions(&instance.id).await?;

    if json {
        let out = serde_json::json!({ "instance": instance, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} v{}",
        style(&instance.definition_name).cyan().bold(),
        style("·").dim(),
        instance.definition_version
    );
    println!("  ID:       {}", instance.id);
    println!("  Status:   {}", styled_status(instance.status));
    if let Some(node) = &instance.current_node_id {
        println!("  Node:     {node}");
    }
    println!("  Started:  {}", instance.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = instance.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &instance.error {
        println!("  Error:    {} {}", style(&err.code).red(), err.message);
    }
    println!("  Context:  {}", instance.context);
    if !steps.is_empty() {
        println!();
        println!("{}", steps_table(&steps));
    }
    println!();
    Ok(())
}

fn styled_status(status: InstanceStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        InstanceStatus::Completed => style(label).green(),
        InstanceStatus::Failed => style(label).red(),
        InstanceStatus::Compensating | InstanceStatus::Compensated => style(label).yellow(),
        InstanceStatus::Cancelled => style(label).dim(),
        InstanceStatus::Pending | InstanceStatus::Running => style(label).cyan(),
    }
}

fn steps_table(steps: &[StepExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Action").fg(Color::Cyan),
            Cell::new("Attempt").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Retries").fg(Color::Cyan),
            Cell::new("Duration").fg(Color::Cyan),
            Cell::new("Error").fg(Color::Cyan),
        ]);

    for step in steps {
        let status = step.status.as_str();
        let mut status_label = status.to_string();
        if step.compensation_executed {
            status_label.push_str(" (undone)");
        }
        table.add_row(vec![
            Cell::new(&step.step_id),
            Cell::new(&step.action_key),
            Cell::new(step.attempt_number),
            Cell::new(status_label).fg(status_color(status)),
            Cell::new(format!("{}/{}", step.retry_count, step.max_retries)),
            Cell::new(
                step.duration_ms
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(
                step.error_details
                    .as_ref()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default(),
            ),
        ]);
    }
    table
}

async fn handle_list(
    definition: Option<&str>,
    status: Option<&str>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let filter = InstanceFilter {
        definition_id: definition
            .map(|d| parse_uuid(d, "definition"))
            .transpose()?,
        status: status
            .map(|s| s.parse::<InstanceStatus>().map_err(|e| anyhow!(e)))
            .transpose()?,
        limit: Some(limit),
    };
    let instances = state.query.list_instances(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }
    if instances.is_empty() {
        println!();
        println!("  No instances found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Started").fg(Color::Cyan),
        ]);
    for instance in &instances {
        let status = instance.status.as_str();
        table.add_row(vec![
            Cell::new(instance.id),
            Cell::new(format!(
                "{} v{}",
                instance.definition_name, instance.definition_version
            )),
            Cell::new(status).fg(status_color(status)),
            Cell::new(instance.current_node_id.as_deref().unwrap_or("-")),
            Cell::new(instance.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_steps(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid(id, "instance")?;
    load_instance(state, &id).await?;
    let steps = state.query.list_step_executions(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
    } else if steps.is_empty() {
        println!();
        println!("  No steps executed yet.");
        println!();
    } else {
        println!();
        println!("{}", steps_table(&steps));
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Retry / cancel / compensate
// ---------------------------------------------------------------------------

async fn handle_retry(
    id: &str,
    step_id: &str,
    no_wait: bool,
    timeout: u64,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_uuid(id, "instance")?;
    // Recovery runs before the request so it cannot replace the manual
    // retry with a delayed automatic one.
    if !no_wait {
        start_engine(state).await?;
    }
    let outcome = match state.query.request_retry(id, step_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.engine.shutdown().await;
            return Err(anyhow!("Retry rejected: {e}"));
        }
    };

    match outcome {
        RetryOutcome::AlreadyCompleted { execution } => {
            state.engine.shutdown().await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&RetryOutcome::AlreadyCompleted { execution })?
                );
            } else {
                println!();
                println!(
                    "  {} Step '{}' already completed (attempt {}); nothing to retry.",
                    style("*").green().bold(),
                    step_id,
                    execution.attempt_number
                );
                println!();
            }
            Ok(())
        }
        RetryOutcome::Accepted { request } if no_wait => {
            if json {
                println!("{}", serde_json::to_string_pretty(&request)?);
            } else {
                println!();
                println!(
                    "  {} Retry of '{}' accepted; run `sagaflow serve` to execute it.",
                    style("*").green().bold(),
                    step_id
                );
                println!();
            }
            Ok(())
        }
        RetryOutcome::Accepted { .. } => {
            let instance = wait_until_settled(state, &id, Duration::from_secs(timeout)).await?;
            print_instance(state, &instance, json).await
        }
    }
}

async fn handle_cancel(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid(id, "instance")?;
    let instance = state
        .orchestrator
        .cancel(id)
        .await
        .map_err(|e| anyhow!("Failed to cancel: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        println!();
        println!(
            "  {} Instance {} cancelled. Compensate with `sagaflow instance compensate {}`.",
            style("*").green().bold(),
            instance.id,
            instance.id
        );
        println!();
    }
    Ok(())
}

async fn handle_compensate(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_uuid(id, "instance")?;
    let report = state
        .orchestrator
        .compensate(id)
        .await
        .map_err(|e| anyhow!("Compensation failed: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "  {} Instance {} is {}",
            style("*").green().bold(),
            report.instance_id,
            styled_status(report.final_status)
        );
        if report.compensated_steps.is_empty() {
            println!("  No steps needed compensation.");
        } else {
            println!("  Undone (newest first): {}", report.compensated_steps.join(", "));
        }
        println!();
    }
    Ok(())
}
