// =============================================================================
// REST status endpoint — Axum 0.7
// =============================================================================
//
// Read-only: both endpoints take the shared lock in read mode and never
// block the scheduler. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the status API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .layer(cors)
        .with_state(state)
}

/// Liveness probe.
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Full supervisor snapshot: cycle counters, per-strategy portfolios, and
/// risk state.
async fn status(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.build_snapshot())
}
