//! Workflow instance handlers: start, inspect, retry, cancel, compensate.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use sagaflow_core::workflow::compensation::CompensationReport;
use sagaflow_core::workflow::query::RetryOutcome;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::StepExecution;

use super::parse_id;
use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartInstanceRequest {
    pub definition_id: uuid::Uuid,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceListQuery {
    pub definition_id: Option<uuid::Uuid>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

async fn find_instance(state: &AppState, id: &uuid::Uuid) -> Result<WorkflowInstance, AppError> {
    state
        .query
        .get_instance(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))
}

/// POST /api/v1/instances - Start an instance of the latest active version.
pub async fn start_instance(
    State(state): State<AppState>,
    Json(body): Json<StartInstanceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowInstance>>), AppError> {
    let start = Instant::now();
    let instance = state
        .orchestrator
        .start(body.definition_id, body.context)
        .await?;
    let id = instance.id;
    let resp = ApiResponse::timed(instance, start)
        .with_link("self", &format!("/api/v1/instances/{id}"))
        .with_link("steps", &format!("/api/v1/instances/{id}/steps"));
    Ok((StatusCode::CREATED, Json(resp)))
}

/// GET /api/v1/instances?definition_id=&status=&limit= - Newest first.
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowInstance>>>, AppError> {
    let start = Instant::now();
    let status = match &query.status {
        Some(s) => Some(s.parse::<InstanceStatus>().map_err(AppError::Validation)?),
        None => None,
    };
    let filter = InstanceFilter {
        definition_id: query.definition_id,
        status,
        limit: query.limit,
    };
    let instances = state.query.list_instances(&filter).await?;
    Ok(Json(
        ApiResponse::timed(instances, start).with_link("self", "/api/v1/instances"),
    ))
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowInstance>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "instance")?;
    let instance = find_instance(&state, &id).await?;
    Ok(Json(
        ApiResponse::timed(instance, start)
            .with_link("self", &format!("/api/v1/instances/{id}"))
            .with_link("steps", &format!("/api/v1/instances/{id}/steps")),
    ))
}

/// GET /api/v1/instances/{id}/steps - Every attempt, by step then attempt.
pub async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<StepExecution>>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "instance")?;
    find_instance(&state, &id).await?;
    let steps = state.query.list_step_executions(&id).await?;
    Ok(Json(ApiResponse::timed(steps, start)))
}

/// POST /api/v1/instances/{id}/steps/{step_id}/retry
///
/// Enqueues a manual retry and returns 202; poll the steps endpoint for the
/// outcome. A step whose latest attempt already completed yields 200 and
/// nothing is queued.
pub async fn retry_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ApiResponse<RetryOutcome>>), AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "instance")?;
    let outcome = state.query.request_retry(id, &step_id).await?;
    let status = match outcome {
        RetryOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        RetryOutcome::AlreadyCompleted { .. } => StatusCode::OK,
    };
    let resp = ApiResponse::timed(outcome, start)
        .with_link("steps", &format!("/api/v1/instances/{id}/steps"));
    Ok((status, Json(resp)))
}

/// POST /api/v1/instances/{id}/cancel
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowInstance>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "instance")?;
    let instance = state.orchestrator.cancel(id).await?;
    Ok(Json(ApiResponse::timed(instance, start)))
}

/// POST /api/v1/instances/{id}/compensate
///
/// Compensates a cancelled instance, or resumes one stranded in
/// `compensating` after a compensation failure.
pub async fn compensate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<CompensationReport>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "instance")?;
    let report = state.orchestrator.compensate(id).await?;
    Ok(Json(ApiResponse::timed(report, start)))
}
