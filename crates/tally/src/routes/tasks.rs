//! Scheduled task endpoints: history and manual trigger.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_common::{ScheduledTaskRecord, TaskName};

use super::ApiError;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Serialize)]
pub struct TaskSummary {
    name: TaskName,
    last: Option<ScheduledTaskRecord>,
}

/// Latest record of every task
pub async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let mut summaries = Vec::with_capacity(TaskName::ALL.len());
    for name in TaskName::ALL {
        let last = state.coordinator.history(name, 1).await?.into_iter().next();
        summaries.push(TaskSummary { name, last });
    }
    Ok(Json(summaries))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// Newest-first run history of one task
pub async fn task_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ScheduledTaskRecord>>, ApiError> {
    let task: TaskName = name.parse()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let history = state.coordinator.history(task, limit).await?;
    Ok(Json(history))
}

#[derive(Serialize)]
pub struct RunResponse {
    task: TaskName,
    result: Value,
}

/// Run a task now. 409 when a run is already in progress.
pub async fn run_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let task: TaskName = name.parse()?;
    tracing::info!(task = %task, "Manual run requested");

    let result = crate::tasks::run_task(&state, task).await?;
    Ok(Json(RunResponse { task, result }))
}
