//! Compensation coordinator: unwinds completed steps in reverse order.
//!
//! Runs automatically when the orchestrator fails an instance, or on an
//! explicit request for `failed`, `cancelled`, or stranded `compensating`
//! instances. A compensating error is fatal: the instance stays
//! `compensating` with the error recorded, and a later request resumes with
//! the steps not yet compensated.

use std::sync::Arc;

use sagaflow_types::error::RepositoryError;
use sagaflow_types::event::EngineEvent;
use sagaflow_types::instance::{InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{ErrorDetails, StepExecution, StepStatus};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::action::{ActionError, ActionRegistry, CompensationRequest, codes};
use super::state::{StateError, transition};
use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, thiserror::Error)]
pub enum CompensationError {
    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance {id} is {status}; only failed, cancelled, or compensating instances can be compensated")]
    NotCompensable { id: Uuid, status: InstanceStatus },

    #[error("compensation of step '{step_id}' failed: {error}")]
    StepFailed {
        step_id: String,
        #[source]
        error: ActionError,
    },

    #[error("instance {0} changed status during compensation")]
    Conflict(Uuid),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a compensation walk.
#[derive(Debug, Clone, Serialize)]
pub struct CompensationReport {
    pub instance_id: Uuid,
    /// Step IDs compensated by this call, in the order they were undone.
    pub compensated_steps: Vec<String>,
    pub final_status: InstanceStatus,
}

pub struct CompensationCoordinator<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<ActionRegistry>,
    events: EventBus,
}

impl<R: WorkflowRepository> CompensationCoordinator<R> {
    pub fn new(repo: Arc<R>, registry: Arc<ActionRegistry>, events: EventBus) -> Self {
        Self {
            repo,
            registry,
            events,
        }
    }

    /// Completed attempts eligible for compensation, most recently
    /// completed first.
    pub fn candidates(&self, steps: Vec<StepExecution>) -> Vec<StepExecution> {
        let mut candidates: Vec<StepExecution> = steps
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed && !s.compensation_executed)
            .filter(|s| {
                self.registry
                    .get(&s.action_key)
                    .is_some_and(|h| h.supports_compensation())
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        candidates
    }

    /// Compensate every eligible step of an instance.
    pub async fn compensate(&self, instance_id: Uuid) -> Result<CompensationReport, CompensationError> {
        let instance = self
            .repo
            .get_instance(&instance_id)
            .await?
            .ok_or(CompensationError::InstanceNotFound(instance_id))?;

        if !matches!(
            instance.status,
            InstanceStatus::Failed | InstanceStatus::Cancelled | InstanceStatus::Compensating
        ) {
            return Err(CompensationError::NotCompensable {
                id: instance_id,
                status: instance.status,
            });
        }

        let steps = self.repo.list_step_executions(&instance_id).await?;
        let candidates = self.candidates(steps);

        if candidates.is_empty() {
            let final_status = if instance.status == InstanceStatus::Compensating {
                self.finish(instance_id).await?
            } else {
                tracing::info!(
                    instance_id = %instance_id,
                    status = %instance.status,
                    "nothing to compensate"
                );
                instance.status
            };
            return Ok(CompensationReport {
                instance_id,
                compensated_steps: Vec::new(),
                final_status,
            });
        }

        if instance.status != InstanceStatus::Compensating {
            let moved = transition(
                self.repo.as_ref(),
                &self.events,
                instance_id,
                instance.status,
                InstanceStatus::Compensating,
                None,
            )
            .await?;
            if !moved {
                return Err(CompensationError::Conflict(instance_id));
            }
        }

        let configurations = self.node_configurations(&instance).await?;
        let mut compensated_steps = Vec::with_capacity(candidates.len());

        for mut step in candidates {
            let Some(handler) = self.registry.get(&step.action_key) else {
                continue;
            };
            let request = CompensationRequest {
                instance_id,
                step_id: step.step_id.clone(),
                result_data: step.result_data.clone().unwrap_or(Value::Null),
                configuration: configurations
                    .iter()
                    .find(|(id, _)| *id == step.step_id)
                    .map(|(_, c)| c.clone())
                    .unwrap_or(Value::Null),
            };

            if let Err(error) = handler.compensate(&request).await {
                tracing::error!(
                    instance_id = %instance_id,
                    step_id = %step.step_id,
                    error = %error,
                    "compensation failed, instance left compensating"
                );
                let details = ErrorDetails {
                    code: codes::COMPENSATION_FAILED.to_string(),
                    message: format!("compensation of step '{}' failed: {}", step.step_id, error),
                    retryable: false,
                };
                self.repo.set_instance_error(&instance_id, &details).await?;
                return Err(CompensationError::StepFailed {
                    step_id: step.step_id,
                    error,
                });
            }

            step.status = StepStatus::Compensated;
            step.compensation_executed = true;
            self.repo.update_step_execution(&step).await?;
            tracing::info!(
                instance_id = %instance_id,
                step_id = %step.step_id,
                attempt = step.attempt_number,
                "step compensated"
            );
            self.events.publish(EngineEvent::StepCompensated {
                instance_id,
                step_id: step.step_id.clone(),
                attempt: step.attempt_number,
            });
            compensated_steps.push(step.step_id);
        }

        let final_status = self.finish(instance_id).await?;
        Ok(CompensationReport {
            instance_id,
            compensated_steps,
            final_status,
        })
    }

    async fn finish(&self, instance_id: Uuid) -> Result<InstanceStatus, CompensationError> {
        let moved = transition(
            self.repo.as_ref(),
            &self.events,
            instance_id,
            InstanceStatus::Compensating,
            InstanceStatus::Compensated,
            None,
        )
        .await?;
        if !moved {
            return Err(CompensationError::Conflict(instance_id));
        }
        Ok(InstanceStatus::Compensated)
    }

    async fn node_configurations(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<(String, Value)>, RepositoryError> {
        let def = self
            .repo
            .get_definition(&instance.definition_id, Some(instance.definition_version))
            .await?;
        Ok(def
            .map(|d| {
                d.action_nodes()
                    .map(|(node, action)| (node.id.clone(), action.configuration.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
