//! Step execution ledger and retry request types.
//!
//! Every attempt at an action node is a separate, append-only
//! `StepExecution` row keyed by `(instance_id, step_id, attempt_number)`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorDetails
// ---------------------------------------------------------------------------

/// Machine-readable error recorded on a failed step or instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    /// Whether the failure may succeed on another attempt.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorDetails {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// One attempt at running an action node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// The node ID this attempt executes.
    pub step_id: String,
    pub step_name: String,
    pub action_key: String,
    /// 1-based, gap-free per `(instance_id, step_id)`.
    pub attempt_number: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Failed attempts of this step up to and including this row.
    pub retry_count: u32,
    /// Maximum number of attempts for this step.
    pub max_retries: u32,
    /// Present only when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    pub compensation_executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
}

impl StepExecution {
    /// A new `running` attempt starting now.
    pub fn begin(
        instance_id: Uuid,
        step_id: &str,
        step_name: &str,
        action_key: &str,
        attempt_number: u32,
        retry_count: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            action_key: action_key.to_string(),
            attempt_number,
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            retry_count,
            max_retries,
            error_details: None,
            compensation_executed: false,
            result_data: None,
        }
    }

    /// Mark the attempt completed with its result.
    pub fn complete(&mut self, result: Value, duration_ms: u64) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.result_data = Some(result);
        self.error_details = None;
    }

    /// Mark the attempt failed. Counts the failure in `retry_count`.
    pub fn fail(&mut self, error: ErrorDetails, duration_ms: u64) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.retry_count = (self.retry_count + 1).min(self.max_retries.max(1));
        self.error_details = Some(error);
    }

    /// Whether another attempt is allowed after this (failed) one.
    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_count < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// RetryRequest
// ---------------------------------------------------------------------------

/// Who asked for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrySource {
    Automatic,
    Manual,
}

/// A queued request to re-attempt a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    pub requested_at: DateTime<Utc>,
    /// Earliest time a worker may pick the request up.
    pub eligible_at: DateTime<Utc>,
    pub source: RetrySource,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
