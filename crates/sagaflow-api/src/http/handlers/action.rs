//! Action catalog handler.

use std::time::Instant;

use axum::Json;
use axum::extract::State;

use sagaflow_core::workflow::action::ActionDescriptor;

use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/actions - Registered actions, sorted by key.
pub async fn list_actions(State(state): State<AppState>) -> Json<ApiResponse<Vec<ActionDescriptor>>> {
    let start = Instant::now();
    let descriptors = state
        .orchestrator
        .registry()
        .list()
        .into_iter()
        .cloned()
        .collect();
    Json(ApiResponse::timed(descriptors, start).with_link("self", "/api/v1/actions"))
}
