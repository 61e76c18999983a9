//! Workflow definition types: the versioned process graph.
//!
//! A `WorkflowDefinition` is a set of typed nodes (`start`, `end`, `action`,
//! `decision`) joined by directed edges. Definitions are authored externally
//! (YAML, JSON, or a graph editor) and become immutable once an instance
//! references them; edits after that point produce a new version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save. Stable across versions.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Monotonic per `id`, starting at 1.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Human-readable workflow name.
    pub name: String,
    /// Business category (e.g. "hr", "finance", "operations").
    #[serde(default = "default_category")]
    pub category: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only active definitions can start new instances.
    #[serde(default)]
    pub is_active: bool,
    /// Graph nodes.
    pub nodes: Vec<Node>,
    /// Directed edges between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_category() -> String {
    "general".to_string()
}

impl WorkflowDefinition {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Iterate over all action nodes with their action payloads.
    pub fn action_nodes(&self) -> impl Iterator<Item = (&Node, &ActionNode)> {
        self.nodes.iter().filter_map(|n| match &n.kind {
            NodeKind::Action(action) => Some((n, action)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
///
/// The node type is flattened into the node itself, so YAML reads as:
/// ```yaml
/// - id: notify-manager
///   name: Notify manager
///   type: action
///   action_key: notify.log
///   configuration:
///     message: "Leave request from {{ employee }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique within a definition. Also used as `StepExecution.step_id`.
    pub id: String,
    /// Display name (falls back to the ID when empty).
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Editor canvas position. Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<NodePosition>,
}

impl Node {
    /// The name to record on step executions.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Node type with type-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point. Exactly one per definition.
    Start,
    /// Terminal node. Reaching it completes the instance.
    End,
    /// Invokes a registered capability.
    Action(ActionNode),
    /// Branches on conditions evaluated against the instance context.
    Decision(DecisionNode),
}

impl NodeKind {
    /// Lowercase type tag, matching the serialized form.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Action(_) => "action",
            NodeKind::Decision(_) => "decision",
        }
    }
}

/// Payload for `action` nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    /// Registry lookup key (e.g. "hr.create_leave_request").
    pub action_key: String,
    /// Action configuration. String values may contain `{{ key }}`
    /// placeholders resolved from the instance context at invocation time.
    #[serde(default = "empty_object")]
    pub configuration: Value,
    /// Overrides the registry's required permission for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,
    /// Maximum number of attempts (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-attempt timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Payload for `decision` nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionNode {
    /// Evaluated in declared order; the first match wins.
    #[serde(default)]
    pub branches: Vec<DecisionBranch>,
    /// Target taken when no branch matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
}

impl DecisionNode {
    /// All targets this decision can route to, in declared order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.branches
            .iter()
            .map(|b| b.target.as_str())
            .chain(self.default_target.as_deref())
    }
}

/// A `(condition, target)` pair on a decision node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionBranch {
    /// JEXL expression evaluated against the instance context.
    pub condition: String,
    /// Node ID to route to when the condition holds.
    pub target: String,
}

/// Editor canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed edge `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
