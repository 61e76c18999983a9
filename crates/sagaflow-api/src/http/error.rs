//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use sagaflow_core::workflow::compensation::CompensationError;
use sagaflow_core::workflow::definition::WorkflowError;
use sagaflow_core::workflow::orchestrator::OrchestratorError;
use sagaflow_core::workflow::query::RetryError;
use sagaflow_core::workflow::state::StateError;
use sagaflow_core::workflow::store::StoreError;
use sagaflow_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Orchestrator(OrchestratorError),
    Store(StoreError),
    Retry(RetryError),
    Repository(RepositoryError),
    /// A path resource that does not exist (e.g. an unknown instance ID).
    NotFound(String),
    /// Malformed input.
    Validation(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Orchestrator(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl From<RetryError> for AppError {
    fn from(e: RetryError) -> Self {
        AppError::Retry(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Repository(e)
    }
}

fn definition_error(e: &WorkflowError) -> (StatusCode, &'static str) {
    match e {
        WorkflowError::UnknownAction(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_ACTION"),
        WorkflowError::InvalidConfiguration { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_CONFIGURATION")
        }
        WorkflowError::IoError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        _ => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_DEFINITION"),
    }
}

fn repository_error(e: &RepositoryError) -> (StatusCode, &'static str) {
    match e {
        RepositoryError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        RepositoryError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Orchestrator(e) => match e {
                OrchestratorError::DefinitionNotFound(_) => {
                    (StatusCode::NOT_FOUND, "DEFINITION_NOT_FOUND")
                }
                OrchestratorError::DefinitionInactive { .. } => {
                    (StatusCode::CONFLICT, "DEFINITION_INACTIVE")
                }
                OrchestratorError::InstanceNotFound(_) => {
                    (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND")
                }
                OrchestratorError::StepNotFound { .. } => (StatusCode::NOT_FOUND, "STEP_NOT_FOUND"),
                OrchestratorError::RetryLimitExceeded { .. } => {
                    (StatusCode::CONFLICT, "RETRY_LIMIT_EXCEEDED")
                }
                OrchestratorError::Busy(_) => (StatusCode::CONFLICT, "INSTANCE_BUSY"),
                OrchestratorError::LeaseLost(_) => (StatusCode::CONFLICT, "LEASE_LOST"),
                OrchestratorError::ContextTooLarge { .. } => {
                    (StatusCode::PAYLOAD_TOO_LARGE, "CONTEXT_TOO_LARGE")
                }
                OrchestratorError::Definition(e) => definition_error(e),
                OrchestratorError::State(StateError::InvalidTransition { .. }) => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                OrchestratorError::State(StateError::Repository(e)) => repository_error(e),
                OrchestratorError::Compensation(e) => match e {
                    CompensationError::InstanceNotFound(_) => {
                        (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND")
                    }
                    CompensationError::NotCompensable { .. } => {
                        (StatusCode::CONFLICT, "INSTANCE_NOT_COMPENSABLE")
                    }
                    CompensationError::StepFailed { .. } => {
                        (StatusCode::BAD_GATEWAY, "COMPENSATION_FAILED")
                    }
                    CompensationError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                    CompensationError::State(StateError::InvalidTransition { .. }) => {
                        (StatusCode::CONFLICT, "INVALID_TRANSITION")
                    }
                    CompensationError::State(StateError::Repository(e))
                    | CompensationError::Repository(e) => repository_error(e),
                },
                OrchestratorError::Repository(e) => repository_error(e),
            },
            AppError::Store(e) => match e {
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "DEFINITION_NOT_FOUND"),
                StoreError::Invalid(e) => definition_error(e),
                StoreError::Repository(e) => repository_error(e),
            },
            AppError::Retry(e) => match e {
                RetryError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND"),
                RetryError::StepNotFound { .. } => (StatusCode::NOT_FOUND, "STEP_NOT_FOUND"),
                RetryError::StepInProgress { .. } => (StatusCode::CONFLICT, "STEP_IN_PROGRESS"),
                RetryError::RetryLimitExceeded { .. } => {
                    (StatusCode::CONFLICT, "RETRY_LIMIT_EXCEEDED")
                }
                RetryError::InstanceNotRetryable { .. } => {
                    (StatusCode::CONFLICT, "INSTANCE_NOT_RETRYABLE")
                }
                RetryError::Repository(e) => repository_error(e),
            },
            AppError::Repository(e) => repository_error(e),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Orchestrator(e) => e.to_string(),
            AppError::Store(e) => e.to_string(),
            AppError::Retry(e) => e.to_string(),
            AppError::Repository(e) => e.to_string(),
            AppError::NotFound(msg) | AppError::Validation(msg) => msg.clone(),
        }
    }

    /// Structured fields observers can act on without parsing messages.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Retry(RetryError::RetryLimitExceeded {
                step_id,
                retry_count,
                max_retries,
            })
            | AppError::Orchestrator(OrchestratorError::RetryLimitExceeded {
                step_id,
                retry_count,
                max_retries,
            }) => Some(json!({
                "step_id": step_id,
                "retry_count": retry_count,
                "max_retries": max_retries,
            })),
            AppError::Retry(RetryError::InstanceNotRetryable { status, .. }) => {
                Some(json!({ "status": status }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = ApiResponse::error(code, &message, self.details());
        (status, Json(body)).into_response()
    }
}
