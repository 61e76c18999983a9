//! Guarded instance status transitions.
//!
//! Every status change goes through [`transition`]: the edge is checked
//! against the instance state machine, applied as a compare-and-set in the
//! repository, and announced on the event bus only when it actually landed.

use sagaflow_types::error::RepositoryError;
use sagaflow_types::event::EngineEvent;
use sagaflow_types::instance::InstanceStatus;
use sagaflow_types::step::ErrorDetails;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Move an instance from `from` to `to`.
///
/// Returns `Ok(false)` when the stored status no longer equals `from` (a
/// concurrent writer won); nothing is written or published in that case.
pub async fn transition<R: WorkflowRepository>(
    repo: &R,
    events: &EventBus,
    instance_id: Uuid,
    from: InstanceStatus,
    to: InstanceStatus,
    error: Option<&ErrorDetails>,
) -> Result<bool, StateError> {
    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition { from, to });
    }

    let moved = repo.transition_instance(&instance_id, from, to, error).await?;
    if moved {
        tracing::info!(
            instance_id = %instance_id,
            from = %from,
            to = %to,
            "instance status changed"
        );
        events.publish(EngineEvent::InstanceStatusChanged {
            instance_id,
            from: Some(from),
            to,
        });
    } else {
        tracing::debug!(
            instance_id = %instance_id,
            expected = %from,
            to = %to,
            "transition lost compare-and-set"
        );
    }
    Ok(moved)
}
