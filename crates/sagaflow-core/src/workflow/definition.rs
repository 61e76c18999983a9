//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Converts YAML or JSON documents into the `WorkflowDefinition` model and
//! runs the structural graph checks from [`super::graph`]. Registry checks
//! (known action keys, configuration schemas) live in
//! [`super::action::ActionRegistry::validate_definition`].

use std::path::Path;

use sagaflow_types::definition::WorkflowDefinition;
use thiserror::Error;

use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// An edge or branch references a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// An action node references an action key the registry does not know.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Action configuration does not match the action's schema.
    #[error("invalid configuration for node '{node}': {message}")]
    InvalidConfiguration { node: String, message: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a structurally valid `WorkflowDefinition`.
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a definition file. `.json` files are parsed as JSON, everything
/// else as YAML.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definition_json(&content),
        _ => parse_definition_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition's metadata and graph shape.
///
/// Checks:
/// - Name and category are non-empty
/// - Version is at least 1
/// - The graph compiles (see [`WorkflowGraph::compile`])
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.category.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow category must not be empty".to_string(),
        ));
    }
    if def.version == 0 {
        return Err(WorkflowError::ValidationError(
            "workflow version starts at 1".to_string(),
        ));
    }

    WorkflowGraph::compile(def)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
