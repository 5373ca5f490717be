//! In-memory commitment store.
//!
//! All state sits behind one mutex, so the Running-record check and insert in
//! `create_scheduled_task_status` are a single critical section.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tally_common::{
    CommitmentRecord, Dataset, PoWCommitmentRecord, ScheduledTaskRecord, TallyError, TaskName,
    TaskStatus,
};
use tokio::sync::Mutex;

use super::CommitmentStore;

#[derive(Default)]
struct Inner {
    commitments: BTreeMap<String, CommitmentRecord>,
    pow: BTreeMap<String, PoWCommitmentRecord>,
    /// Task records in creation order
    tasks: Vec<ScheduledTaskRecord>,
    running: HashMap<TaskName, String>,
    dataset: Option<Dataset>,
}

impl Inner {
    fn task_mut(&mut self, id: &str) -> Option<&mut ScheduledTaskRecord> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }
}

/// Single-process store for development and tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitmentStore for MemoryStore {
    async fn store_commitment(&self, commitment: &CommitmentRecord) -> Result<(), TallyError> {
        let mut inner = self.inner.lock().await;
        let mut record = commitment.clone();
        if let Some(existing) = inner.commitments.get(&commitment.id) {
            record.stored |= existing.stored;
            record.resolved |= existing.resolved;
            record.last_updated_timestamp = record
                .last_updated_timestamp
                .max(existing.last_updated_timestamp);
        }
        inner.commitments.insert(record.id.clone(), record);
        Ok(())
    }

    async fn store_pow_commitment(&self, record: &PoWCommitmentRecord) -> Result<(), TallyError> {
        record.parse_challenge()?;
        let mut inner = self.inner.lock().await;
        let mut record = record.clone();
        if let Some(existing) = inner.pow.get(&record.challenge) {
            record.stored |= existing.stored;
            record.last_updated_timestamp = record
                .last_updated_timestamp
                .max(existing.last_updated_timestamp);
        }
        inner.pow.insert(record.challenge.clone(), record);
        Ok(())
    }

    async fn get_unstored_commitments(&self) -> Result<Vec<CommitmentRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .commitments
            .values()
            .filter(|c| !c.stored)
            .cloned()
            .collect())
    }

    async fn get_unstored_pow_commitments(&self) -> Result<Vec<PoWCommitmentRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner.pow.values().filter(|p| !p.stored).cloned().collect())
    }

    async fn mark_commitments_stored(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(commitment) = inner.commitments.get_mut(id) {
                commitment.stored = true;
                commitment.last_updated_timestamp = commitment.last_updated_timestamp.max(now);
            }
        }
        Ok(())
    }

    async fn mark_pow_commitments_stored(
        &self,
        challenges: &[String],
        now: i64,
    ) -> Result<(), TallyError> {
        let mut inner = self.inner.lock().await;
        for challenge in challenges {
            if let Some(record) = inner.pow.get_mut(challenge) {
                record.stored = true;
                record.last_updated_timestamp = record.last_updated_timestamp.max(now);
            }
        }
        Ok(())
    }

    async fn get_dataset_commitments(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<CommitmentRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .commitments
            .values()
            .filter(|c| c.dataset_id == dataset_id)
            .cloned()
            .collect())
    }

    async fn mark_commitments_resolved(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(commitment) = inner.commitments.get_mut(id) {
                commitment.resolved = true;
                commitment.last_updated_timestamp = commitment.last_updated_timestamp.max(now);
            }
        }
        Ok(())
    }

    async fn create_scheduled_task_status(
        &self,
        record: &ScheduledTaskRecord,
    ) -> Result<Option<String>, TallyError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.running.get(&record.task_name) {
            return Ok(Some(existing.clone()));
        }

        inner.running.insert(record.task_name, record.id.clone());
        inner.tasks.push(record.clone());
        Ok(None)
    }

    async fn update_scheduled_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        data: Option<serde_json::Value>,
        now: i64,
    ) -> Result<(), TallyError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .task_mut(id)
            .ok_or_else(|| TallyError::StoreWrite(format!("unknown task record {id}")))?;

        if task.status.is_terminal() {
            return Err(TallyError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: status,
            });
        }

        task.status = status;
        task.updated = now;
        if data.is_some() {
            task.data = data;
        }
        let task_name = task.task_name;

        if status != TaskStatus::Running
            && inner.running.get(&task_name).is_some_and(|held| held == id)
        {
            inner.running.remove(&task_name);
        }
        Ok(())
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.iter().find(|task| task.id == id).cloned())
    }

    async fn get_last_scheduled_task_status(
        &self,
        task: TaskName,
        status: TaskStatus,
    ) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .iter()
            .filter(|record| record.task_name == task && record.status == status)
            .max_by_key(|record| record.updated)
            .cloned())
    }

    async fn list_scheduled_tasks(
        &self,
        task: TaskName,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRecord>, TallyError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .iter()
            .rev()
            .filter(|record| record.task_name == task)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn store_dataset(&self, dataset: &Dataset) -> Result<(), TallyError> {
        self.inner.lock().await.dataset = Some(dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self) -> Result<Option<Dataset>, TallyError> {
        Ok(self.inner.lock().await.dataset.clone())
    }
}
