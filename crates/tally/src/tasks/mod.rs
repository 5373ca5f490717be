//! Scheduled tasks.
//!
//! - `coordinator` - single-flight runs, task history, watermark
//! - `export` - unstored commitments to the external sink
//! - `solutions` - majority-vote recalculation of unsolved captchas

mod coordinator;
mod export;
mod solutions;

pub use coordinator::{TaskCoordinator, TaskHandle};
pub use export::{ExportPipeline, ExportSummary};
pub use solutions::{RecalculationSummary, SolutionsTask};

use serde_json::{Value, json};
use tally_common::{TallyError, TaskName};

use crate::state::AppState;

/// Current time in Unix epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run one task to completion and return its result payload
pub async fn run_task(state: &AppState, task: TaskName) -> Result<Value, TallyError> {
    match task {
        TaskName::RecalculateSolutions => {
            let summary = state.solutions.run(None).await?;
            to_json(&summary)
        }
        TaskName::StoreCommitmentsExternal => match &state.export {
            Some(export) => {
                let summary = export.run().await?;
                to_json(&summary)
            }
            None => {
                tracing::info!("External sink not configured, skipping export");
                Ok(json!({ "skipped": true }))
            }
        },
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, TallyError> {
    serde_json::to_value(value).map_err(|e| TallyError::Internal(format!("result encoding: {e}")))
}
