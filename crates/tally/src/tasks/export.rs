//! Export of unstored commitments to the external sink.
//!
//! Ordering within a run: read both families, send one batch, mark exactly the
//! records that were sent, then complete. A failure at any step fails the run
//! and leaves the unsent or unmarked records with `stored = false`, so the
//! next run sends them again.

use std::sync::Arc;

use serde::Serialize;
use tally_common::constants::WATERMARK_ORIGIN;
use tally_common::{TallyError, TaskName};

use super::coordinator::{TaskCoordinator, TaskHandle};
use super::{now_millis, to_json};
use crate::sink::ExternalSink;
use crate::store::CommitmentStore;

/// Result payload of an export run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// Exported commitment ids
    pub commitments: Vec<String>,
    /// Exported PoW challenges
    pub pow_records: Vec<String>,
    /// Records last touched at or before the watermark (resent after an
    /// earlier run failed between delivery and marking)
    pub carried_over: usize,
}

pub struct ExportPipeline {
    coordinator: Arc<TaskCoordinator>,
    store: Arc<dyn CommitmentStore>,
    sink: Arc<dyn ExternalSink>,
}

impl ExportPipeline {
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        store: Arc<dyn CommitmentStore>,
        sink: Arc<dyn ExternalSink>,
    ) -> Self {
        Self {
            coordinator,
            store,
            sink,
        }
    }

    pub fn destination(&self) -> &str {
        self.sink.destination()
    }

    /// Run one export under the `StoreCommitmentsExternal` task lock
    pub async fn run(&self) -> Result<ExportSummary, TallyError> {
        self.coordinator
            .run(TaskName::StoreCommitmentsExternal, |handle| self.export(handle))
            .await
    }

    async fn export(
        &self,
        handle: TaskHandle,
    ) -> Result<(ExportSummary, serde_json::Value), TallyError> {
        let commitments = self.store.get_unstored_commitments().await?;
        let pow_commitments = self.store.get_unstored_pow_commitments().await?;

        let carried_over = commitments
            .iter()
            .map(|c| c.last_updated_timestamp)
            .chain(pow_commitments.iter().map(|p| p.last_updated_timestamp))
            .filter(|updated| *updated <= handle.watermark)
            .count();
        if carried_over > 0 && handle.watermark != WATERMARK_ORIGIN {
            tracing::warn!(
                carried_over,
                watermark = handle.watermark,
                "Unstored records predate the last completed export"
            );
        }

        tracing::debug!(
            commitments = commitments.len(),
            pow_commitments = pow_commitments.len(),
            destination = %self.sink.destination(),
            "Exporting records"
        );

        self.sink.save(&commitments, &pow_commitments).await?;

        let commitment_ids: Vec<String> = commitments.into_iter().map(|c| c.id).collect();
        let challenges: Vec<String> = pow_commitments.into_iter().map(|p| p.challenge).collect();

        let now = now_millis();
        self.store
            .mark_commitments_stored(&commitment_ids, now)
            .await?;
        self.store
            .mark_pow_commitments_stored(&challenges, now)
            .await?;

        tracing::info!(
            commitments = commitment_ids.len(),
            pow_commitments = challenges.len(),
            "Exported records marked stored"
        );

        let summary = ExportSummary {
            commitments: commitment_ids,
            pow_records: challenges,
            carried_over,
        };
        let data = to_json(&summary)?;
        Ok((summary, data))
    }
}
