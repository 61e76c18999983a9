//! Engine events published to observers.
//!
//! Every instance status change and step lifecycle transition is emitted as
//! an `EngineEvent` on the broadcast bus. The HTTP layer streams them as
//! Server-Sent Events; tests use them to check transition traces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::InstanceStatus;
use crate::step::RetrySource;

/// Events emitted by the orchestrator, retry subsystem, and compensation
/// coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Instance moved between statuses. `from` is `None` on creation.
    InstanceStatusChanged {
        instance_id: Uuid,
        from: Option<InstanceStatus>,
        to: InstanceStatus,
    },

    /// An attempt started running.
    StepStarted {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    /// An attempt completed successfully.
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },

    /// An attempt failed.
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
        code: String,
        /// Whether a further attempt will be scheduled automatically.
        will_retry: bool,
    },

    /// A retry was enqueued.
    RetryScheduled {
        instance_id: Uuid,
        step_id: String,
        source: RetrySource,
        eligible_at: DateTime<Utc>,
    },

    /// A completed step was compensated.
    StepCompensated {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
    },
}

impl EngineEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::InstanceStatusChanged { instance_id, .. }
            | EngineEvent::StepStarted { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. }
            | EngineEvent::RetryScheduled { instance_id, .. }
            | EngineEvent::StepCompensated { instance_id, .. } => *instance_id,
        }
    }

    /// Short event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::InstanceStatusChanged { .. } => "instance_status_changed",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::RetryScheduled { .. } => "retry_scheduled",
            EngineEvent::StepCompensated { .. } => "step_compensated",
        }
    }
}
