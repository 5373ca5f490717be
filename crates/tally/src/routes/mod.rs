//! Ops HTTP routes for Tally.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tally_common::TallyError;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod dataset;
mod health;
mod tasks;

/// Create the ops router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Scheduled tasks
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{name}", get(tasks::task_history))
        .route("/tasks/{name}/run", post(tasks::run_task))

        // Provider dataset
        .route("/dataset", get(dataset::get_dataset))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body for every ops route
pub struct ApiError(TallyError);

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
