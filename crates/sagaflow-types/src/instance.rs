//! Workflow instance types and the instance state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::ErrorDetails;

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// Allowed transitions:
///
/// ```text
/// pending ──> running ──> completed
///    │           │
///    │           ├──> failed ──> compensating ──> compensated
///    │           │                    ^
///    └───────────┴──> cancelled ──────┘ (explicit request only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl InstanceStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [InstanceStatus; 7] = [
        InstanceStatus::Pending,
        InstanceStatus::Running,
        InstanceStatus::Completed,
        InstanceStatus::Failed,
        InstanceStatus::Compensating,
        InstanceStatus::Compensated,
        InstanceStatus::Cancelled,
    ];

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Compensating)
                | (Cancelled, Compensating)
                | (Compensating, Compensated)
        )
    }

    /// Whether the orchestrator may still schedule work for the instance.
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Pending | InstanceStatus::Running)
    }

    /// Whether entering this status ends forward execution (sets `completed_at`).
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Compensated
                | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Compensating => "compensating",
            InstanceStatus::Compensated => "compensated",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid instance status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of a pinned definition version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: u32,
    /// Denormalized for listing without a definition lookup.
    pub definition_name: String,
    pub status: InstanceStatus,
    /// Accumulating JSON object written by completed steps.
    pub context: Value,
    /// Node the orchestrator will dispatch next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    /// Instance-level failure (definition error, terminal step failure,
    /// or compensation failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for instance listing.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub definition_id: Option<Uuid>,
    pub status: Option<InstanceStatus>,
    /// Maximum rows to return (`None` = unlimited).
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
