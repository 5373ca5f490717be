//! Test doubles and fixtures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tally_common::{
    CaptchaAnswer, CaptchaItem, CaptchaSolution, CommitmentRecord, CommitmentStatus, Dataset,
    PoWChallenge, PoWCommitmentRecord, RawCaptcha, RawDataset, ScheduledTaskRecord, TallyError,
    TaskName, TaskStatus,
};

use crate::sink::ExternalSink;
use crate::store::{CommitmentStore, MemoryStore};

pub type Batch = (Vec<CommitmentRecord>, Vec<PoWCommitmentRecord>);

/// Sink that keeps every batch it accepts
#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Batch>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    /// Written to the store while a save is in flight
    pub inject: Mutex<Option<(Arc<dyn CommitmentStore>, CommitmentRecord)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSink for RecordingSink {
    fn destination(&self) -> &str {
        "memory://recording"
    }

    async fn save(
        &self,
        commitments: &[CommitmentRecord],
        pow_commitments: &[PoWCommitmentRecord],
    ) -> Result<(), TallyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let inject = self.inject.lock().unwrap().take();
        if let Some((store, commitment)) = inject {
            store.store_commitment(&commitment).await?;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(TallyError::SinkDelivery("sink offline".into()));
        }
        self.batches
            .lock()
            .unwrap()
            .push((commitments.to_vec(), pow_commitments.to_vec()));
        Ok(())
    }
}

/// Memory store with switchable read and mark failures
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_reads: AtomicBool,
    pub fail_marks: AtomicBool,
    /// Task record completed right after its next read returns
    pub finish_after_read: Mutex<Option<String>>,
}

impl FaultyStore {
    fn check(&self, flag: &AtomicBool, err: fn(String) -> TallyError) -> Result<(), TallyError> {
        if flag.load(Ordering::SeqCst) {
            return Err(err("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CommitmentStore for FaultyStore {
    async fn store_commitment(&self, commitment: &CommitmentRecord) -> Result<(), TallyError> {
        self.inner.store_commitment(commitment).await
    }

    async fn store_pow_commitment(&self, record: &PoWCommitmentRecord) -> Result<(), TallyError> {
        self.inner.store_pow_commitment(record).await
    }

    async fn get_unstored_commitments(&self) -> Result<Vec<CommitmentRecord>, TallyError> {
        self.check(&self.fail_reads, TallyError::StoreRead)?;
        self.inner.get_unstored_commitments().await
    }

    async fn get_unstored_pow_commitments(&self) -> Result<Vec<PoWCommitmentRecord>, TallyError> {
        self.check(&self.fail_reads, TallyError::StoreRead)?;
        self.inner.get_unstored_pow_commitments().await
    }

    async fn mark_commitments_stored(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        self.check(&self.fail_marks, TallyError::StoreWrite)?;
        self.inner.mark_commitments_stored(ids, now).await
    }

    async fn mark_pow_commitments_stored(
        &self,
        challenges: &[String],
        now: i64,
    ) -> Result<(), TallyError> {
        self.check(&self.fail_marks, TallyError::StoreWrite)?;
        self.inner.mark_pow_commitments_stored(challenges, now).await
    }

    async fn get_dataset_commitments(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<CommitmentRecord>, TallyError> {
        self.check(&self.fail_reads, TallyError::StoreRead)?;
        self.inner.get_dataset_commitments(dataset_id).await
    }

    async fn mark_commitments_resolved(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        self.check(&self.fail_marks, TallyError::StoreWrite)?;
        self.inner.mark_commitments_resolved(ids, now).await
    }

    async fn create_scheduled_task_status(
        &self,
        record: &ScheduledTaskRecord,
    ) -> Result<Option<String>, TallyError> {
        self.inner.create_scheduled_task_status(record).await
    }

    async fn update_scheduled_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        data: Option<serde_json::Value>,
        now: i64,
    ) -> Result<(), TallyError> {
        self.inner
            .update_scheduled_task_status(id, status, data, now)
            .await
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        let record = self.inner.get_scheduled_task(id).await?;

        let finish = {
            let mut pending = self.finish_after_read.lock().unwrap();
            if pending.as_deref() == Some(id) { pending.take() } else { None }
        };
        if let Some(id) = finish {
            self.inner
                .update_scheduled_task_status(&id, TaskStatus::Completed, None, 2)
                .await?;
        }
        Ok(record)
    }

    async fn get_last_scheduled_task_status(
        &self,
        task: TaskName,
        status: TaskStatus,
    ) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        self.inner.get_last_scheduled_task_status(task, status).await
    }

    async fn list_scheduled_tasks(
        &self,
        task: TaskName,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRecord>, TallyError> {
        self.inner.list_scheduled_tasks(task, limit).await
    }

    async fn store_dataset(&self, dataset: &Dataset) -> Result<(), TallyError> {
        self.inner.store_dataset(dataset).await
    }

    async fn get_dataset(&self) -> Result<Option<Dataset>, TallyError> {
        self.check(&self.fail_reads, TallyError::StoreRead)?;
        self.inner.get_dataset().await
    }
}

/// Approved commitment answering `answers` as (captcha id, selected items)
pub fn commitment(
    id: &str,
    dataset_id: &str,
    answers: &[(&str, &[&str])],
    block: u64,
) -> CommitmentRecord {
    CommitmentRecord {
        id: id.to_string(),
        user: format!("user-{id}"),
        dapp: "dapp".to_string(),
        dataset_id: dataset_id.to_string(),
        captchas: answers
            .iter()
            .map(|(captcha_id, items)| CaptchaAnswer {
                captcha_id: captcha_id.to_string(),
                solution: CaptchaSolution::new(items.iter().copied()),
            })
            .collect(),
        status: CommitmentStatus::Approved,
        resolved: false,
        requested_at_block: block,
        last_updated_timestamp: 1,
        stored: false,
    }
}

pub fn pow(timestamp: i64, user: &str) -> PoWCommitmentRecord {
    let challenge = PoWChallenge {
        timestamp,
        user: user.to_string(),
        dapp: "dapp".to_string(),
    };
    PoWCommitmentRecord::new(&challenge, 4, timestamp)
}

/// Dataset with `solved` solved and `unsolved` unsolved captchas of four items each
pub fn raw_dataset(solved: usize, unsolved: usize) -> RawDataset {
    let captcha = |i: usize, solution: Option<Vec<String>>| RawCaptcha {
        target: format!("target-{i}"),
        items: ["a", "b", "c", "d"]
            .iter()
            .map(|id| CaptchaItem {
                id: id.to_string(),
                data: format!("https://img.example/{i}/{id}.png"),
            })
            .collect(),
        salt: format!("salt-{i}"),
        solution,
    };

    let solved_captchas =
        (0..solved).map(|i| captcha(i, Some(vec!["a".to_string(), "c".to_string()])));
    let unsolved_captchas = (solved..solved + unsolved).map(|i| captcha(i, None));

    RawDataset {
        format: Default::default(),
        captchas: solved_captchas.chain(unsolved_captchas).collect(),
    }
}
