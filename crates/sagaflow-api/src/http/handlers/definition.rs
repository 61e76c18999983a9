//! Workflow definition handlers: authoring, versions, and activation.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use sagaflow_core::workflow::definition::validate_definition;
use sagaflow_core::workflow::store::StoreError;
use sagaflow_types::definition::WorkflowDefinition;

use super::parse_id;
use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// `?version=` selector; latest when absent.
#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    pub version: Option<u32>,
}

/// Compact listing row.
#[derive(Debug, Serialize)]
pub struct DefinitionSummary {
    pub id: uuid::Uuid,
    pub name: String,
    pub category: String,
    pub version: u32,
    pub is_active: bool,
    pub node_count: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&WorkflowDefinition> for DefinitionSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            id: def.id,
            name: def.name.clone(),
            category: def.category.clone(),
            version: def.version,
            is_active: def.is_active,
            node_count: def.nodes.len(),
            updated_at: def.updated_at,
        }
    }
}

fn definition_links(
    resp: ApiResponse<WorkflowDefinition>,
) -> ApiResponse<WorkflowDefinition> {
    let id = resp.data.as_ref().map(|d| d.id.to_string()).unwrap_or_default();
    resp.with_link("self", &format!("/api/v1/definitions/{id}"))
        .with_link("versions", &format!("/api/v1/definitions/{id}/versions"))
}

/// POST /api/v1/definitions - Create a definition (or a new version of one).
pub async fn create_definition(
    State(state): State<AppState>,
    Json(body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let def = state.orchestrator.definitions().save(body).await?;
    Ok(Json(definition_links(ApiResponse::timed(def, start))))
}

/// PUT /api/v1/definitions/{id} - Save changes to an existing definition.
///
/// Overwrites the latest version unless an instance references it, in
/// which case a new version is created.
pub async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "definition")?;
    // 404 rather than silently creating under a caller-chosen id.
    state.orchestrator.definitions().get(&id, None).await?;

    body.id = id;
    let def = state.orchestrator.definitions().save(body).await?;
    Ok(Json(definition_links(ApiResponse::timed(def, start))))
}

/// GET /api/v1/definitions - Latest version of every definition.
pub async fn list_definitions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<DefinitionSummary>>>, AppError> {
    let start = Instant::now();
    let defs = state.orchestrator.definitions().list().await?;
    let rows = defs.iter().map(DefinitionSummary::from).collect();
    Ok(Json(
        ApiResponse::timed(rows, start).with_link("self", "/api/v1/definitions"),
    ))
}

/// GET /api/v1/definitions/{id}?version=N
pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "definition")?;
    let def = state.orchestrator.definitions().get(&id, query.version).await?;
    Ok(Json(definition_links(ApiResponse::timed(def, start))))
}

/// GET /api/v1/definitions/{id}/versions - Version history, oldest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<DefinitionSummary>>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "definition")?;
    let versions = state.orchestrator.definitions().versions(&id).await?;
    let rows = versions.iter().map(DefinitionSummary::from).collect();
    Ok(Json(ApiResponse::timed(rows, start)))
}

/// POST /api/v1/definitions/{id}/activate?version=N
pub async fn activate_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<ApiResponse<DefinitionSummary>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "definition")?;
    let def = state
        .orchestrator
        .definitions()
        .activate(&id, query.version)
        .await?;
    Ok(Json(ApiResponse::timed(DefinitionSummary::from(&def), start)))
}

/// POST /api/v1/definitions/{id}/deactivate?version=N
pub async fn deactivate_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<ApiResponse<DefinitionSummary>>, AppError> {
    let start = Instant::now();
    let id = parse_id(&id, "definition")?;
    let def = state
        .orchestrator
        .definitions()
        .deactivate(&id, query.version)
        .await?;
    Ok(Json(ApiResponse::timed(DefinitionSummary::from(&def), start)))
}

/// POST /api/v1/definitions/validate - Full validation without saving.
pub async fn validate(
    State(state): State<AppState>,
    Json(body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    validate_definition(&body).map_err(StoreError::Invalid)?;
    state
        .orchestrator
        .registry()
        .validate_definition(&body)
        .map_err(StoreError::Invalid)?;
    Ok(Json(ApiResponse::timed(
        serde_json::json!({ "valid": true, "nodes": body.nodes.len() }),
        start,
    )))
}
