//! Scheduled task coordinator.
//!
//! One run per task name at a time. Every run leaves a record in the task
//! history: `(none) -> Running -> {Completed, Failed}`. The watermark handed to
//! a run is the `updated` timestamp of the newest Completed record, so a
//! failed or crashed run never moves it forward.
//!
//! Completed and Failed are final: the store refuses any later transition,
//! so a reaped run that finishes late, or a reaper that loses to a finishing
//! run, never rewrites an outcome.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};
use tally_common::constants::WATERMARK_ORIGIN;
use tally_common::{ScheduledTaskRecord, TallyError, TaskName, TaskStatus};

use super::now_millis;
use crate::store::CommitmentStore;

/// A run that has been started and not yet finished
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Task record id
    pub id: String,
    pub task: TaskName,
    pub started: i64,
    /// `updated` of the last Completed run, or `WATERMARK_ORIGIN`
    pub watermark: i64,
}

pub struct TaskCoordinator {
    store: Arc<dyn CommitmentStore>,
    /// Running records older than this are reaped (milliseconds)
    stale_after_ms: Option<i64>,
}

impl TaskCoordinator {
    pub fn new(store: Arc<dyn CommitmentStore>) -> Self {
        Self {
            store,
            stale_after_ms: None,
        }
    }

    /// Fail Running records older than `secs` when a new run is requested
    pub fn with_stale_after(mut self, secs: Option<u64>) -> Self {
        self.stale_after_ms =
            secs.map(|s| i64::try_from(s.saturating_mul(1000)).unwrap_or(i64::MAX));
        self
    }

    /// Start a run of `task`, or fail with `TaskAlreadyRunning`
    pub async fn begin(&self, task: TaskName) -> Result<TaskHandle, TallyError> {
        // Read before inserting: a run that completes in between only makes
        // this watermark older, never newer.
        let watermark = self
            .store
            .get_last_scheduled_task_status(task, TaskStatus::Completed)
            .await?
            .map(|record| record.updated)
            .unwrap_or(WATERMARK_ORIGIN);

        let now = now_millis();
        let record = ScheduledTaskRecord::running(generate_task_id(), task, now);

        if let Some(holder) = self.store.create_scheduled_task_status(&record).await? {
            if !self.reap_if_stale(task, &holder, now).await? {
                tracing::debug!(task = %task, holder = %holder, "Task already running");
                return Err(TallyError::TaskAlreadyRunning(task));
            }
            if self.store.create_scheduled_task_status(&record).await?.is_some() {
                return Err(TallyError::TaskAlreadyRunning(task));
            }
        }

        tracing::info!(task = %task, id = %record.id, watermark, "Task started");

        Ok(TaskHandle {
            id: record.id,
            task,
            started: now,
            watermark,
        })
    }

    /// Mark the run Completed and persist its result
    pub async fn complete(&self, handle: &TaskHandle, data: Value) -> Result<(), TallyError> {
        let now = now_millis();
        self.store
            .update_scheduled_task_status(&handle.id, TaskStatus::Completed, Some(data), now)
            .await?;

        tracing::info!(
            task = %handle.task,
            id = %handle.id,
            elapsed_ms = now - handle.started,
            "Task completed"
        );
        Ok(())
    }

    /// Mark the run Failed with an error summary
    pub async fn fail(&self, handle: &TaskHandle, error: &TallyError) -> Result<(), TallyError> {
        self.store
            .update_scheduled_task_status(
                &handle.id,
                TaskStatus::Failed,
                Some(json!({ "error": error.to_string() })),
                now_millis(),
            )
            .await?;

        tracing::error!(task = %handle.task, id = %handle.id, error = %error, "Task failed");
        Ok(())
    }

    /// Begin, execute `work`, then record the outcome.
    ///
    /// `work` returns its output plus the JSON stored on the Completed record.
    /// Errors are recorded on the Failed record and then returned.
    pub async fn run<F, Fut, T>(&self, task: TaskName, work: F) -> Result<T, TallyError>
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = Result<(T, Value), TallyError>>,
    {
        let handle = self.begin(task).await?;

        let err = match work(handle.clone()).await {
            Ok((output, data)) => match self.complete(&handle, data).await {
                Ok(()) => return Ok(output),
                Err(err) => err,
            },
            Err(err) => err,
        };

        if let Err(record_err) = self.fail(&handle, &err).await {
            tracing::error!(
                task = %task,
                id = %handle.id,
                error = %record_err,
                "Failed to record task failure"
            );
        }
        Err(err)
    }

    pub async fn history(
        &self,
        task: TaskName,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRecord>, TallyError> {
        self.store.list_scheduled_tasks(task, limit).await
    }

    /// Fail the Running record `holder` if it is past the stale limit.
    /// Returns true if the lock was released, by the reaper or by the holder
    /// finishing first.
    async fn reap_if_stale(
        &self,
        task: TaskName,
        holder: &str,
        now: i64,
    ) -> Result<bool, TallyError> {
        let Some(stale_after_ms) = self.stale_after_ms else {
            return Ok(false);
        };
        let Some(record) = self.store.get_scheduled_task(holder).await? else {
            return Ok(false);
        };
        if record.status != TaskStatus::Running || now - record.started <= stale_after_ms {
            return Ok(false);
        }

        let reaped = self
            .store
            .update_scheduled_task_status(
                holder,
                TaskStatus::Failed,
                Some(json!({ "error": "reaped", "runningForMs": now - record.started })),
                now,
            )
            .await;
        if let Err(TallyError::InvalidTransition { from, .. }) = reaped {
            tracing::debug!(
                task = %task,
                id = %holder,
                status = %from,
                "Stale run finished before reaping"
            );
            return Ok(true);
        }
        reaped?;

        tracing::warn!(
            task = %task,
            id = %holder,
            started = record.started,
            "Reaped stale Running task"
        );
        Ok(true)
    }
}

/// Random URL-safe task record id
fn generate_task_id() -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use rand::Rng;

    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FaultyStore;
    use tokio_test::{assert_err, assert_ok};

    fn coordinator() -> (Arc<MemoryStore>, TaskCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = TaskCoordinator::new(store.clone());
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_second_begin_is_refused_without_new_record() {
        let (store, coordinator) = coordinator();
        let task = TaskName::StoreCommitmentsExternal;

        assert_ok!(coordinator.begin(task).await);
        let err = assert_err!(coordinator.begin(task).await);
        assert!(matches!(err, TallyError::TaskAlreadyRunning(t) if t == task));

        let history = store.list_scheduled_tasks(task, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_distinct_tasks_do_not_block_each_other() {
        let (_, coordinator) = coordinator();
        assert_ok!(coordinator.begin(TaskName::StoreCommitmentsExternal).await);
        assert_ok!(coordinator.begin(TaskName::RecalculateSolutions).await);
    }

    #[tokio::test]
    async fn test_watermark_starts_at_origin_and_follows_completed() {
        let (store, coordinator) = coordinator();
        let task = TaskName::RecalculateSolutions;

        let first = coordinator.begin(task).await.unwrap();
        assert_eq!(first.watermark, WATERMARK_ORIGIN);
        coordinator.complete(&first, json!({ "n": 1 })).await.unwrap();

        let completed = store
            .get_last_scheduled_task_status(task, TaskStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.data, Some(json!({ "n": 1 })));

        let second = coordinator.begin(task).await.unwrap();
        assert_eq!(second.watermark, completed.updated);
    }

    #[tokio::test]
    async fn test_failed_run_does_not_advance_watermark() {
        let (store, coordinator) = coordinator();
        let task = TaskName::StoreCommitmentsExternal;

        let ok = coordinator.begin(task).await.unwrap();
        coordinator.complete(&ok, json!({})).await.unwrap();
        let completed_at = store
            .get_scheduled_task(&ok.id)
            .await
            .unwrap()
            .unwrap()
            .updated;

        let failing = coordinator.begin(task).await.unwrap();
        coordinator
            .fail(&failing, &TallyError::SinkDelivery("offline".into()))
            .await
            .unwrap();

        let failed = store.get_scheduled_task(&failing.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.data,
            Some(json!({ "error": "Sink delivery error: offline" }))
        );

        let next = coordinator.begin(task).await.unwrap();
        assert_eq!(next.watermark, completed_at);
    }

    #[tokio::test]
    async fn test_run_records_failure_and_returns_error() {
        let (store, coordinator) = coordinator();
        let task = TaskName::RecalculateSolutions;

        let result: Result<(), _> = coordinator
            .run(task, |_| async { Err(TallyError::StoreRead("timeout".into())) })
            .await;
        assert!(matches!(result, Err(TallyError::StoreRead(_))));

        let history = store.list_scheduled_tasks(task, 10).await.unwrap();
        assert_eq!(history[0].status, TaskStatus::Failed);

        // Lock released: the next run may start
        let output = coordinator
            .run(task, |handle| async move { Ok((handle.watermark, json!({}))) })
            .await
            .unwrap();
        assert_eq!(output, WATERMARK_ORIGIN);
    }

    #[tokio::test]
    async fn test_stuck_run_blocks_without_reaper() {
        let (store, coordinator) = coordinator();
        let task = TaskName::StoreCommitmentsExternal;
        let stuck = ScheduledTaskRecord::running("stuck".into(), task, 1);
        store.create_scheduled_task_status(&stuck).await.unwrap();

        let err = assert_err!(coordinator.begin(task).await);
        assert!(matches!(err, TallyError::TaskAlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_reaper_fails_stale_run_and_proceeds() {
        let (store, coordinator) = coordinator();
        let coordinator = coordinator.with_stale_after(Some(60));
        let task = TaskName::StoreCommitmentsExternal;
        let stuck = ScheduledTaskRecord::running("stuck".into(), task, 1);
        store.create_scheduled_task_status(&stuck).await.unwrap();

        let handle = assert_ok!(coordinator.begin(task).await);
        assert_ne!(handle.id, "stuck");

        let reaped = store.get_scheduled_task("stuck").await.unwrap().unwrap();
        assert_eq!(reaped.status, TaskStatus::Failed);
        assert_eq!(reaped.data.unwrap()["error"], "reaped");
    }

    #[tokio::test]
    async fn test_reaper_loses_race_to_finishing_run() {
        let store = Arc::new(FaultyStore::default());
        let coordinator = TaskCoordinator::new(store.clone()).with_stale_after(Some(60));
        let task = TaskName::StoreCommitmentsExternal;
        let slow = ScheduledTaskRecord::running("slow".into(), task, 1);
        store.create_scheduled_task_status(&slow).await.unwrap();
        *store.finish_after_read.lock().unwrap() = Some("slow".into());

        let handle = assert_ok!(coordinator.begin(task).await);
        assert_eq!(handle.watermark, WATERMARK_ORIGIN);

        let slow = store.get_scheduled_task("slow").await.unwrap().unwrap();
        assert_eq!(slow.status, TaskStatus::Completed);
        assert!(slow.data.is_none());

        let last = store
            .get_last_scheduled_task_status(task, TaskStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, "slow");

        coordinator.complete(&handle, json!({})).await.unwrap();
        let next = coordinator.begin(task).await.unwrap();
        assert!(next.watermark >= slow.updated);
    }

    #[tokio::test]
    async fn test_outcome_cannot_be_rewritten() {
        let (store, coordinator) = coordinator();
        let task = TaskName::RecalculateSolutions;

        let handle = coordinator.begin(task).await.unwrap();
        coordinator.complete(&handle, json!({ "n": 1 })).await.unwrap();
        let err = assert_err!(
            coordinator
                .fail(&handle, &TallyError::StoreRead("late".into()))
                .await
        );
        assert!(matches!(err, TallyError::InvalidTransition { .. }));

        let last = store
            .get_last_scheduled_task_status(task, TaskStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, handle.id);
        assert_eq!(last.data, Some(json!({ "n": 1 })));

        let next = coordinator.begin(task).await.unwrap();
        assert_eq!(next.watermark, last.updated);
    }

    #[tokio::test]
    async fn test_huge_stale_limit_never_reaps() {
        let (store, coordinator) = coordinator();
        let coordinator = coordinator.with_stale_after(Some(u64::MAX));
        let task = TaskName::StoreCommitmentsExternal;
        let stuck = ScheduledTaskRecord::running("stuck".into(), task, 1);
        store.create_scheduled_task_status(&stuck).await.unwrap();

        assert_err!(coordinator.begin(task).await);
        let stuck = store.get_scheduled_task("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_reaper_leaves_fresh_run_alone() {
        let (_, coordinator) = coordinator();
        let coordinator = coordinator.with_stale_after(Some(3600));
        let task = TaskName::RecalculateSolutions;

        assert_ok!(coordinator.begin(task).await);
        assert_err!(coordinator.begin(task).await);
    }
}
