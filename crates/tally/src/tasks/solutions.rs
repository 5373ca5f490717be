//! Solution recalculation task.
//!
//! Reads the provider dataset and its commitments, runs majority-vote
//! consensus, then flags the counted commitments as resolved and stores the
//! updated dataset, in that order: a run that fails in between leaves the
//! captchas unsolved, so the next run counts and flags them again.
//! `stored` is never written here.

use std::sync::Arc;

use serde::Serialize;
use tally_common::{TallyError, TaskName};

use super::coordinator::{TaskCoordinator, TaskHandle};
use super::{now_millis, to_json};
use crate::config::CaptchaSolutionsConfig;
use crate::consensus::{self, ResolvedCaptcha};
use crate::store::CommitmentStore;

/// Result payload of a recalculation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationSummary {
    pub dataset_id: Option<String>,
    pub dataset_content_id: Option<String>,
    pub resolved: Vec<ResolvedCaptcha>,
    /// Commitments flagged resolved by this run
    pub commitments: usize,
    pub reference_block: Option<u64>,
    /// Ledger registration must be refreshed with the new content id
    pub content_changed: bool,
}

pub struct SolutionsTask {
    coordinator: Arc<TaskCoordinator>,
    store: Arc<dyn CommitmentStore>,
    config: CaptchaSolutionsConfig,
}

impl SolutionsTask {
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        store: Arc<dyn CommitmentStore>,
        config: CaptchaSolutionsConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            config,
        }
    }

    /// Run one recalculation under the `RecalculateSolutions` task lock.
    ///
    /// `reference_block` is the current ledger height when known.
    pub async fn run(
        &self,
        reference_block: Option<u64>,
    ) -> Result<RecalculationSummary, TallyError> {
        self.coordinator
            .run(TaskName::RecalculateSolutions, |handle| {
                self.recalculate(handle, reference_block)
            })
            .await
    }

    async fn recalculate(
        &self,
        _handle: TaskHandle,
        reference_block: Option<u64>,
    ) -> Result<(RecalculationSummary, serde_json::Value), TallyError> {
        let Some(dataset) = self.store.get_dataset().await? else {
            tracing::info!("No dataset loaded, nothing to recalculate");
            let summary = RecalculationSummary::default();
            let data = to_json(&summary)?;
            return Ok((summary, data));
        };

        let commitments = self.store.get_dataset_commitments(&dataset.dataset_id).await?;
        tracing::debug!(
            dataset_id = %dataset.dataset_id,
            commitments = commitments.len(),
            "Recalculating solutions"
        );

        let outcome =
            consensus::recalculate(&dataset, &commitments, &self.config, reference_block);

        if !outcome.resolved.is_empty() {
            self.store
                .mark_commitments_resolved(&outcome.counted_commitments, now_millis())
                .await?;
            self.store.store_dataset(&outcome.dataset).await?;
        }

        if outcome.content_changed {
            tracing::warn!(
                dataset_id = %outcome.dataset.dataset_id,
                dataset_content_id = %outcome.dataset.dataset_content_id,
                resolved = outcome.resolved.len(),
                "Dataset content changed, registration refresh required"
            );
        } else {
            tracing::info!(dataset_id = %dataset.dataset_id, "No captchas resolved");
        }

        let summary = RecalculationSummary {
            dataset_id: Some(outcome.dataset.dataset_id),
            dataset_content_id: Some(outcome.dataset.dataset_content_id),
            commitments: outcome.counted_commitments.len(),
            resolved: outcome.resolved,
            reference_block: outcome.reference_block,
            content_changed: outcome.content_changed,
        };
        let data = to_json(&summary)?;
        Ok((summary, data))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::{CaptchaCount, CaptchaThresholds};
    use crate::dataset::ingest;
    use crate::testing::{FaultyStore, commitment, raw_dataset};
    use tally_common::{CaptchaSolution, Dataset, TaskStatus};

    fn task(store: Arc<FaultyStore>) -> SolutionsTask {
        let coordinator = Arc::new(TaskCoordinator::new(store.clone()));
        let config = CaptchaSolutionsConfig {
            required_number_of_solutions: 2,
            solution_winning_percentage: 60.0,
            captcha_block_recency: 10,
        };
        SolutionsTask::new(coordinator, store, config)
    }

    async fn seed(store: &FaultyStore, answers: &[&str]) -> Dataset {
        let thresholds = CaptchaThresholds {
            solved: CaptchaCount { count: 1 },
            unsolved: CaptchaCount { count: 1 },
        };
        let dataset = ingest(raw_dataset(1, 1), &thresholds).unwrap();
        store.store_dataset(&dataset).await.unwrap();

        let unsolved = dataset.captchas[1].captcha_id.as_str();
        for (i, answer) in answers.iter().enumerate() {
            let items: &[&str] = &[*answer];
            let record = commitment(
                &format!("c{i}"),
                &dataset.dataset_id,
                &[(unsolved, items)],
                7,
            );
            store.store_commitment(&record).await.unwrap();
        }
        dataset
    }

    #[tokio::test]
    async fn test_resolves_and_persists_dataset() {
        let store = Arc::new(FaultyStore::default());
        let before = seed(&store, &["b", "b", "b", "a"]).await;

        let summary = task(store.clone()).run(None).await.unwrap();
        assert_eq!(summary.resolved.len(), 1);
        assert!(summary.content_changed);
        assert_eq!(summary.commitments, 4);
        assert_eq!(summary.reference_block, Some(7));

        let after = store.get_dataset().await.unwrap().unwrap();
        assert_eq!(after.dataset_id, before.dataset_id);
        assert_ne!(after.dataset_content_id, before.dataset_content_id);
        assert_eq!(after.captchas[1].solution, Some(CaptchaSolution::new(["b"])));

        let commitments = store.get_dataset_commitments(&after.dataset_id).await.unwrap();
        assert!(commitments.iter().all(|c| c.resolved && !c.stored));

        let run = store
            .get_last_scheduled_task_status(TaskName::RecalculateSolutions, TaskStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        let data = run.data.unwrap();
        assert_eq!(data["contentChanged"], true);
        assert_eq!(data["datasetContentId"], after.dataset_content_id.as_str());
    }

    #[tokio::test]
    async fn test_ambiguous_answers_leave_dataset_untouched() {
        let store = Arc::new(FaultyStore::default());
        let before = seed(&store, &["a", "a", "b", "b", "c"]).await;

        let summary = task(store.clone()).run(None).await.unwrap();
        assert!(summary.resolved.is_empty());
        assert!(!summary.content_changed);

        assert_eq!(store.get_dataset().await.unwrap(), Some(before.clone()));
        let commitments = store.get_dataset_commitments(&before.dataset_id).await.unwrap();
        assert!(commitments.iter().all(|c| !c.resolved));
    }

    #[tokio::test]
    async fn test_without_dataset_completes_empty() {
        let store = Arc::new(FaultyStore::default());
        let summary = task(store.clone()).run(None).await.unwrap();
        assert_eq!(summary, RecalculationSummary::default());

        let history = store
            .list_scheduled_tasks(TaskName::RecalculateSolutions, 10)
            .await
            .unwrap();
        assert_eq!(history[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_read_failure_fails_run() {
        let store = Arc::new(FaultyStore::default());
        seed(&store, &["a", "a"]).await;
        store.fail_reads.store(true, Ordering::SeqCst);

        let err = task(store.clone()).run(None).await.unwrap_err();
        assert!(matches!(err, TallyError::StoreRead(_)));

        let history = store
            .list_scheduled_tasks(TaskName::RecalculateSolutions, 10)
            .await
            .unwrap();
        assert_eq!(history[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_marking_keeps_captcha_open_for_retry() {
        let store = Arc::new(FaultyStore::default());
        let before = seed(&store, &["b", "b", "b"]).await;
        let task = task(store.clone());

        store.fail_marks.store(true, Ordering::SeqCst);
        let err = task.run(None).await.unwrap_err();
        assert!(matches!(err, TallyError::StoreWrite(_)));
        assert_eq!(store.get_dataset().await.unwrap(), Some(before.clone()));

        store.fail_marks.store(false, Ordering::SeqCst);
        let summary = task.run(None).await.unwrap();
        assert_eq!(summary.resolved.len(), 1);
        assert_eq!(summary.commitments, 3);

        let commitments = store.get_dataset_commitments(&before.dataset_id).await.unwrap();
        assert!(commitments.iter().all(|c| c.resolved));
        let after = store.get_dataset().await.unwrap().unwrap();
        assert_eq!(after.captchas[1].solution, Some(CaptchaSolution::new(["b"])));
    }

    #[tokio::test]
    async fn test_explicit_reference_block_bounds_window() {
        let store = Arc::new(FaultyStore::default());
        seed(&store, &["a", "a", "a"]).await;

        let summary = task(store.clone()).run(Some(100)).await.unwrap();
        assert!(summary.resolved.is_empty());
        assert_eq!(summary.reference_block, Some(100));
    }
}
