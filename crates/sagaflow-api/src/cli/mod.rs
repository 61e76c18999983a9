//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros. Commands are grouped by resource
//! (`sagaflow definition create`, `sagaflow instance retry`).

pub mod action;
pub mod definition;
pub mod instance;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Workflow definitions and saga execution.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
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

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "SAGAFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Author and activate workflow definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Start, inspect, retry, cancel, and compensate instances.
    #[command(alias = "inst")]
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// List registered actions.
    Actions,

    /// Start the REST API server and the workflow engine.
    Serve {
        /// Port to listen on (defaults to `server.port` in config.toml).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to `server.host` in config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse a UUID argument.
pub(crate) fn parse_uuid(raw: &str, kind: &str) -> anyhow::Result<Uuid> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not a valid {kind} id"))
}

/// Colored status label for tables and detail views.
pub(crate) fn status_color(status: &str) -> comfy_table::Color {
    match status {
        "completed" => comfy_table::Color::Green,
        "running" | "pending" => comfy_table::Color::Cyan,
        "failed" => comfy_table::Color::Red,
        "compensating" | "compensated" => comfy_table::Color::Yellow,
        _ => comfy_table::Color::DarkGrey,
    }
}
