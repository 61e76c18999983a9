//! Axum router configuration with middleware.
//!
//! All API routes are under `/api/v1/`. Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Definitions
        .route(
            "/definitions",
            get(handlers::definition::list_definitions).post(handlers::definition::create_definition),
        )
        .route("/definitions/validate", post(handlers::definition::validate))
        .route(
            "/definitions/{id}",
            get(handlers::definition::get_definition).put(handlers::definition::update_definition),
        )
        .route(
            "/definitions/{id}/versions",
            get(handlers::definition::list_versions),
        )
        .route(
            "/definitions/{id}/activate",
            post(handlers::definition::activate_definition),
        )
        .route(
            "/definitions/{id}/deactivate",
            post(handlers::definition::deactivate_definition),
        )
        // Instances
        .route(
            "/instances",
            get(handlers::instance::list_instances).post(handlers::instance::start_instance),
        )
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route("/instances/{id}/steps", get(handlers::instance::list_steps))
        .route(
            "/instances/{id}/steps/{step_id}/retry",
            post(handlers::instance::retry_step),
        )
        .route(
            "/instances/{id}/cancel",
            post(handlers::instance::cancel_instance),
        )
        .route(
            "/instances/{id}/compensate",
            post(handlers::instance::compensate_instance),
        )
        // Catalog and observers
        .route("/actions", get(handlers::action::list_actions))
        .route("/events", get(handlers::event::stream_events));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness plus whether the worker pool is running.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine_running": state.engine.is_running(),
    }))
}
