//! Provider dataset endpoint.

use axum::{Json, extract::State};
use serde::Serialize;
use tally_common::CaptchaCategory;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct DatasetResponse {
    loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset_content_id: Option<String>,
    solved: usize,
    unsolved: usize,
}

/// Fingerprints and category counts of the current dataset
pub async fn get_dataset(
    State(state): State<AppState>,
) -> Result<Json<DatasetResponse>, ApiError> {
    let response = match state.datasets.current().await? {
        Some(dataset) => DatasetResponse {
            loaded: true,
            solved: dataset.count(CaptchaCategory::Solved),
            unsolved: dataset.count(CaptchaCategory::Unsolved),
            dataset_id: Some(dataset.dataset_id),
            dataset_content_id: Some(dataset.dataset_content_id),
        },
        None => DatasetResponse {
            loaded: false,
            dataset_id: None,
            dataset_content_id: None,
            solved: 0,
            unsolved: 0,
        },
    };
    Ok(Json(response))
}
