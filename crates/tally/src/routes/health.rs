//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store: bool,
    external_sink: Option<String>,
}

/// Readiness check (is the primary store reachable?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if !state.store.ping().await {
        // Return 503 if not ready
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        store: true,
        external_sink: state.export.as_ref().map(|e| e.destination().to_string()),
    }))
}
