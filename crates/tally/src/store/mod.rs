//! Commitment store adapter.
//!
//! The [`CommitmentStore`] trait is the narrow interface the tasks use to reach
//! the primary record store. It covers two commitment families (human-solved
//! and proof-of-work), the scheduled task history and the provider dataset.
//!
//! Two backends implement it:
//! - [`RedisStore`] - production store, atomic writes through Lua scripts
//! - [`MemoryStore`] - single-process store for development and tests
//!
//! # Single-flight
//!
//! [`CommitmentStore::create_scheduled_task_status`] must insert the Running
//! record only when no Running record exists for that task, as one atomic
//! operation. Everything the coordinator guarantees rests on it.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use tally_common::{
    CommitmentRecord, Dataset, PoWCommitmentRecord, ScheduledTaskRecord, TallyError, TaskName,
    TaskStatus,
};

#[async_trait]
pub trait CommitmentStore: Send + Sync {
    /// Backend reachable
    async fn ping(&self) -> bool {
        true
    }

    /// Insert or replace a human-solved commitment
    async fn store_commitment(&self, commitment: &CommitmentRecord) -> Result<(), TallyError>;

    /// Insert or replace a PoW commitment. The challenge must parse as
    /// `{timestamp}___{user}___{dapp}`.
    async fn store_pow_commitment(&self, record: &PoWCommitmentRecord) -> Result<(), TallyError>;

    /// Commitments with `stored == false`
    async fn get_unstored_commitments(&self) -> Result<Vec<CommitmentRecord>, TallyError>;

    /// PoW commitments with `stored == false`
    async fn get_unstored_pow_commitments(&self) -> Result<Vec<PoWCommitmentRecord>, TallyError>;

    /// Set `stored = true` on the given commitments. Unknown ids are ignored.
    async fn mark_commitments_stored(&self, ids: &[String], now: i64) -> Result<(), TallyError>;

    /// Set `stored = true` on the given PoW commitments. Unknown challenges are ignored.
    async fn mark_pow_commitments_stored(
        &self,
        challenges: &[String],
        now: i64,
    ) -> Result<(), TallyError>;

    /// All commitments made against a dataset
    async fn get_dataset_commitments(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<CommitmentRecord>, TallyError>;

    /// Set `resolved = true` on the given commitments. Never touches `stored`.
    async fn mark_commitments_resolved(&self, ids: &[String], now: i64) -> Result<(), TallyError>;

    /// Atomically insert `record` (status Running) unless its task already has
    /// a Running record.
    ///
    /// Returns `None` when inserted, or the id of the Running record that
    /// blocked the insert.
    async fn create_scheduled_task_status(
        &self,
        record: &ScheduledTaskRecord,
    ) -> Result<Option<String>, TallyError>;

    /// Transition a Running task record. Leaving Running releases the task
    /// lock if this record holds it.
    ///
    /// Completed and Failed records are final: updating one fails with
    /// `InvalidTransition` and writes nothing. The check and the write are one
    /// atomic step.
    async fn update_scheduled_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        data: Option<serde_json::Value>,
        now: i64,
    ) -> Result<(), TallyError>;

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTaskRecord>, TallyError>;

    /// Most recent record of `task` in `status`
    async fn get_last_scheduled_task_status(
        &self,
        task: TaskName,
        status: TaskStatus,
    ) -> Result<Option<ScheduledTaskRecord>, TallyError>;

    /// Newest-first run history of `task`
    async fn list_scheduled_tasks(
        &self,
        task: TaskName,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRecord>, TallyError>;

    /// Replace the provider dataset
    async fn store_dataset(&self, dataset: &Dataset) -> Result<(), TallyError>;

    async fn get_dataset(&self) -> Result<Option<Dataset>, TallyError>;
}
