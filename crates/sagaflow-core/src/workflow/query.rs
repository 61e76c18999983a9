//! Execution query API: read-only projection plus the manual retry trigger.
//!
//! Nothing here executes steps. `request_retry` validates eligibility and
//! enqueues; a worker performs the attempt.

use std::sync::Arc;

use sagaflow_types::error::RepositoryError;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{RetryRequest, StepExecution, StepStatus};
use serde::Serialize;
use uuid::Uuid;

use super::retry::RetryScheduler;
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("step '{step_id}' has no executions on instance {instance_id}")]
    StepNotFound { instance_id: Uuid, step_id: String },

    #[error("step '{step_id}' attempt {attempt} is still in progress")]
    StepInProgress { step_id: String, attempt: u32 },

    #[error("step '{step_id}' has used {retry_count} of {max_retries} attempts")]
    RetryLimitExceeded {
        step_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("instance {instance_id} is {status}; only running instances accept retries")]
    InstanceNotRetryable {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of an accepted retry request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// The request was queued.
    Accepted { request: RetryRequest },
    /// The latest attempt already completed; nothing was queued.
    AlreadyCompleted { execution: StepExecution },
}

/// Read-side facade used by the CLI, the HTTP API, and observers.
pub struct ExecutionQuery<R: WorkflowRepository> {
    repo: Arc<R>,
    scheduler: RetryScheduler,
}

impl<R: WorkflowRepository> ExecutionQuery<R> {
    pub fn new(repo: Arc<R>, scheduler: RetryScheduler) -> Self {
        Self { repo, scheduler }
    }

    pub async fn get_instance(&self, instance_id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        self.repo.get_instance(instance_id).await
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.repo.list_instances(filter).await
    }

    /// All attempts, ordered by step then attempt number. Unknown instances
    /// yield an empty list.
    pub async fn list_step_executions(&self, instance_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        self.repo.list_step_executions(instance_id).await
    }

    /// Validate and enqueue a manual retry. Returns immediately.
    pub async fn request_retry(&self, instance_id: Uuid, step_id: &str) -> Result<RetryOutcome, RetryError> {
        let instance = self
            .repo
            .get_instance(&instance_id)
            .await?
            .ok_or(RetryError::InstanceNotFound(instance_id))?;

        let latest = self
            .repo
            .latest_step_execution(&instance_id, step_id)
            .await?
            .ok_or_else(|| RetryError::StepNotFound {
                instance_id,
                step_id: step_id.to_string(),
            })?;

        match latest.status {
            StepStatus::Completed | StepStatus::Compensated => {
                return Ok(RetryOutcome::AlreadyCompleted { execution: latest });
            }
            StepStatus::Running | StepStatus::Pending => {
                return Err(RetryError::StepInProgress {
                    step_id: step_id.to_string(),
                    attempt: latest.attempt_number,
                });
            }
            StepStatus::Failed => {}
        }

        if latest.retry_count >= latest.max_retries {
            return Err(RetryError::RetryLimitExceeded {
                step_id: step_id.to_string(),
                retry_count: latest.retry_count,
                max_retries: latest.max_retries,
            });
        }
        if instance.status != InstanceStatus::Running {
            return Err(RetryError::InstanceNotRetryable {
                instance_id,
                status: instance.status,
            });
        }

        let request = self.scheduler.enqueue_manual(instance_id, step_id);
        Ok(RetryOutcome::Accepted { request })
    }
}
