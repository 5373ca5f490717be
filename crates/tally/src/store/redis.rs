//! Redis-backed commitment store.
//!
//! Layout (see `tally_common::constants::redis_keys`):
//! - `commitment:{id}` hash: `record` (JSON), `stored`, `resolved`, `last_updated`
//! - `pow:{challenge}` hash: same fields
//! - `task:{id}` JSON string, `task:history:{name}` sorted set by start time,
//!   `task:running:{name}` id of the Running record, `task:last:{name}:{status}`
//!   id of the newest record in that status
//!
//! Mutable flags live in their own hash fields so the Lua scripts never have
//! to decode record JSON. Index sets `tally:commitments:unstored`,
//! `tally:pow:unstored` and `dataset:commitments:{id}` are kept in step by the
//! same scripts.
//!
//! Every key is placed under an optional prefix (`with_prefix`), so several
//! deployments or test runs can share one Redis.

use std::collections::HashMap;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tally_common::constants::redis_keys;
use tally_common::{
    CommitmentRecord, Dataset, PoWCommitmentRecord, ScheduledTaskRecord, TallyError, TaskName,
    TaskStatus,
};

use super::CommitmentStore;

/// Upsert a commitment hash. `stored` and `resolved` never revert to 0 and
/// `last_updated` never moves backwards.
///
/// KEYS[1] = record hash, KEYS[2] = unstored index, KEYS[3] = dataset index
/// (absent for PoW records).
/// ARGV[1] = index member, ARGV[2] = record JSON, ARGV[3] = stored,
/// ARGV[4] = resolved, ARGV[5] = last updated.
const LUA_UPSERT_RECORD: &str = r#"
local stored = ARGV[3]
if redis.call('HGET', KEYS[1], 'stored') == '1' then
    stored = '1'
end
local resolved = ARGV[4]
if redis.call('HGET', KEYS[1], 'resolved') == '1' then
    resolved = '1'
end
local last = tonumber(ARGV[5])
local current = tonumber(redis.call('HGET', KEYS[1], 'last_updated') or '0')
if current > last then
    last = current
end
redis.call('HSET', KEYS[1], 'record', ARGV[2], 'stored', stored, 'resolved', resolved,
    'last_updated', string.format('%d', last))
if stored == '1' then
    redis.call('SREM', KEYS[2], ARGV[1])
else
    redis.call('SADD', KEYS[2], ARGV[1])
end
if #KEYS >= 3 then
    redis.call('SADD', KEYS[3], ARGV[1])
end
return 1
"#;

/// Insert a Running task record unless one is already held.
///
/// KEYS[1] = running key, KEYS[2] = task key, KEYS[3] = history sorted set.
/// ARGV[1] = task id, ARGV[2] = record JSON, ARGV[3] = start score.
/// Returns: nil when inserted, otherwise the holder's id.
const LUA_BEGIN_TASK: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder then
    return holder
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[1])
return false
"#;

/// Write a task transition, releasing the lock when leaving Running. Only a
/// Running record may change.
///
/// KEYS[1] = task key, KEYS[2] = running key, KEYS[3] = last-by-status key.
/// ARGV[1] = task id, ARGV[2] = record JSON, ARGV[3] = status.
/// Returns: nil if the record does not exist, otherwise its status before the
/// call (anything but 'Running' means nothing was written).
const LUA_UPDATE_TASK: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return false
end
local status = cjson.decode(current)['status']
if status ~= 'Running' then
    return status
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] ~= 'Running' then
    if redis.call('GET', KEYS[2]) == ARGV[1] then
        redis.call('DEL', KEYS[2])
    end
    redis.call('SET', KEYS[3], ARGV[1])
end
return status
"#;

/// Set a flag on existing record hashes, dropping them from an index set when
/// one is given.
///
/// KEYS[1..n] = record hashes, KEYS[n + 1] = optional index set of records
/// lacking the flag.
/// ARGV[1] = flag field, ARGV[2] = now, ARGV[3] = n, ARGV[4..] = index members
/// matching KEYS[1..n].
const LUA_MARK_FLAG: &str = r#"
local now = tonumber(ARGV[2])
local count = tonumber(ARGV[3])
local index = KEYS[count + 1]
for i = 1, count do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        redis.call('HSET', KEYS[i], ARGV[1], '1')
        local current = tonumber(redis.call('HGET', KEYS[i], 'last_updated') or '0')
        if now > current then
            redis.call('HSET', KEYS[i], 'last_updated', ARGV[2])
        end
        if index then
            redis.call('SREM', index, ARGV[i + 3])
        end
    end
end
return 1
"#;

fn read_err(err: RedisError) -> TallyError {
    TallyError::StoreRead(err.to_string())
}

fn write_err(err: RedisError) -> TallyError {
    TallyError::StoreWrite(err.to_string())
}

fn commitment_key(id: &str) -> String {
    format!("{}{}", redis_keys::COMMITMENT_PREFIX, id)
}

fn pow_key(challenge: &str) -> String {
    format!("{}{}", redis_keys::POW_PREFIX, challenge)
}

fn task_key(id: &str) -> String {
    format!("{}{}", redis_keys::TASK_PREFIX, id)
}

fn running_key(task: TaskName) -> String {
    format!("{}{}", redis_keys::TASK_RUNNING_PREFIX, task)
}

fn history_key(task: TaskName) -> String {
    format!("{}{}", redis_keys::TASK_HISTORY_PREFIX, task)
}

fn last_key(task: TaskName, status: TaskStatus) -> String {
    format!("{}{}:{}", redis_keys::TASK_LAST_PREFIX, task, status.as_str())
}

fn dataset_commitments_key(dataset_id: &str) -> String {
    format!("{}{}", redis_keys::DATASET_COMMITMENTS_PREFIX, dataset_id)
}

/// Record hash with its mutable flags split out of the JSON body
struct FlaggedRecord<T> {
    record: T,
    stored: bool,
    resolved: bool,
    last_updated: i64,
}

fn parse_flagged<T: DeserializeOwned>(
    fields: HashMap<String, String>,
) -> Result<Option<FlaggedRecord<T>>, TallyError> {
    let Some(body) = fields.get("record") else {
        return Ok(None);
    };
    let record = serde_json::from_str(body)
        .map_err(|e| TallyError::StoreRead(format!("corrupt record: {e}")))?;
    let flag = |name: &str| fields.get(name).is_some_and(|v| v == "1");

    Ok(Some(FlaggedRecord {
        record,
        stored: flag("stored"),
        resolved: flag("resolved"),
        last_updated: fields
            .get("last_updated")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
    }))
}

fn into_commitment(flagged: FlaggedRecord<CommitmentRecord>) -> CommitmentRecord {
    CommitmentRecord {
        stored: flagged.stored,
        resolved: flagged.resolved,
        last_updated_timestamp: flagged.last_updated,
        ..flagged.record
    }
}

fn into_pow(flagged: FlaggedRecord<PoWCommitmentRecord>) -> PoWCommitmentRecord {
    PoWCommitmentRecord {
        stored: flagged.stored,
        last_updated_timestamp: flagged.last_updated,
        ..flagged.record
    }
}

fn bool_flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Redis commitment store
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    /// Prepended to every key, empty or ending in `:`
    prefix: String,
}

impl RedisStore {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(url: &str) -> Result<Self, TallyError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| TallyError::Config(format!("invalid Redis URL {url}: {e}")))?;
        let redis = ConnectionManager::new(client).await.map_err(read_err)?;
        Ok(Self {
            redis,
            prefix: String::new(),
        })
    }

    /// Place every key under `{prefix}:`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() {
            prefix
        } else {
            format!("{prefix}:")
        };
        self
    }

    fn scoped(&self, key: impl AsRef<str>) -> String {
        format!("{}{}", self.prefix, key.as_ref())
    }

    async fn load_hashes<T: DeserializeOwned>(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<FlaggedRecord<T>>, TallyError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let mut conn = self.redis.clone();
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(read_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(flagged) = parse_flagged(row)? {
                records.push(flagged);
            }
        }
        Ok(records)
    }

    async fn mark_flag(
        &self,
        index_key: Option<&str>,
        record_keys: Vec<String>,
        members: &[String],
        flag: &str,
        now: i64,
    ) -> Result<(), TallyError> {
        if record_keys.is_empty() {
            return Ok(());
        }

        let script = Script::new(LUA_MARK_FLAG);
        let mut invocation = script.prepare_invoke();
        for key in &record_keys {
            invocation.key(key);
        }
        if let Some(index_key) = index_key {
            invocation.key(self.scoped(index_key));
        }
        invocation.arg(flag).arg(now).arg(record_keys.len());
        for member in members {
            invocation.arg(member);
        }

        let _: i64 = invocation
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Write `record` if the stored copy is still Running
    async fn set_task(&self, record: &ScheduledTaskRecord) -> Result<(), TallyError> {
        let body = serde_json::to_string(record)
            .map_err(|e| TallyError::Internal(format!("task record encoding: {e}")))?;

        let script = Script::new(LUA_UPDATE_TASK);
        let previous: Option<String> = script
            .key(self.scoped(task_key(&record.id)))
            .key(self.scoped(running_key(record.task_name)))
            .key(self.scoped(last_key(record.task_name, record.status)))
            .arg(&record.id)
            .arg(body)
            .arg(record.status.as_str())
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(write_err)?;

        let Some(previous) = previous else {
            return Err(TallyError::StoreWrite(format!("unknown task record {}", record.id)));
        };
        let from: TaskStatus = previous.parse()?;
        if from.is_terminal() {
            return Err(TallyError::InvalidTransition {
                id: record.id.clone(),
                from,
                to: record.status,
            });
        }
        Ok(())
    }

    async fn get_tasks(&self, ids: &[String]) -> Result<Vec<ScheduledTaskRecord>, TallyError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.scoped(task_key(id))).collect();
        let mut conn = self.redis.clone();
        let bodies: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(read_err)?;

        bodies
            .into_iter()
            .flatten()
            .map(|body| {
                serde_json::from_str(&body)
                    .map_err(|e| TallyError::StoreRead(format!("corrupt task record: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl CommitmentStore for RedisStore {
    async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        let result: Result<String, _> = ::redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    async fn store_commitment(&self, commitment: &CommitmentRecord) -> Result<(), TallyError> {
        let body = serde_json::to_string(commitment)
            .map_err(|e| TallyError::Internal(format!("commitment encoding: {e}")))?;

        let script = Script::new(LUA_UPSERT_RECORD);
        let _: i64 = script
            .key(self.scoped(commitment_key(&commitment.id)))
            .key(self.scoped(redis_keys::UNSTORED_COMMITMENTS))
            .key(self.scoped(dataset_commitments_key(&commitment.dataset_id)))
            .arg(&commitment.id)
            .arg(body)
            .arg(bool_flag(commitment.stored))
            .arg(bool_flag(commitment.resolved))
            .arg(commitment.last_updated_timestamp)
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn store_pow_commitment(&self, record: &PoWCommitmentRecord) -> Result<(), TallyError> {
        record.parse_challenge()?;
        let body = serde_json::to_string(record)
            .map_err(|e| TallyError::Internal(format!("PoW commitment encoding: {e}")))?;

        let script = Script::new(LUA_UPSERT_RECORD);
        let _: i64 = script
            .key(self.scoped(pow_key(&record.challenge)))
            .key(self.scoped(redis_keys::UNSTORED_POW))
            .arg(&record.challenge)
            .arg(body)
            .arg(bool_flag(record.stored))
            .arg("0")
            .arg(record.last_updated_timestamp)
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn get_unstored_commitments(&self) -> Result<Vec<CommitmentRecord>, TallyError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(self.scoped(redis_keys::UNSTORED_COMMITMENTS))
            .await
            .map_err(read_err)?;

        let keys = ids.iter().map(|id| self.scoped(commitment_key(id))).collect();
        Ok(self
            .load_hashes(keys)
            .await?
            .into_iter()
            .map(into_commitment)
            .filter(|c| !c.stored)
            .collect())
    }

    async fn get_unstored_pow_commitments(&self) -> Result<Vec<PoWCommitmentRecord>, TallyError> {
        let mut conn = self.redis.clone();
        let challenges: Vec<String> = conn
            .smembers(self.scoped(redis_keys::UNSTORED_POW))
            .await
            .map_err(read_err)?;

        let keys = challenges.iter().map(|c| self.scoped(pow_key(c))).collect();
        Ok(self
            .load_hashes(keys)
            .await?
            .into_iter()
            .map(into_pow)
            .filter(|p| !p.stored)
            .collect())
    }

    async fn mark_commitments_stored(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        let keys = ids.iter().map(|id| self.scoped(commitment_key(id))).collect();
        self.mark_flag(Some(redis_keys::UNSTORED_COMMITMENTS), keys, ids, "stored", now)
            .await
    }

    async fn mark_pow_commitments_stored(
        &self,
        challenges: &[String],
        now: i64,
    ) -> Result<(), TallyError> {
        let keys = challenges.iter().map(|c| self.scoped(pow_key(c))).collect();
        self.mark_flag(Some(redis_keys::UNSTORED_POW), keys, challenges, "stored", now)
            .await
    }

    async fn get_dataset_commitments(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<CommitmentRecord>, TallyError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(self.scoped(dataset_commitments_key(dataset_id)))
            .await
            .map_err(read_err)?;

        let keys = ids.iter().map(|id| self.scoped(commitment_key(id))).collect();
        Ok(self
            .load_hashes(keys)
            .await?
            .into_iter()
            .map(into_commitment)
            .collect())
    }

    async fn mark_commitments_resolved(&self, ids: &[String], now: i64) -> Result<(), TallyError> {
        let keys = ids.iter().map(|id| self.scoped(commitment_key(id))).collect();
        self.mark_flag(None, keys, ids, "resolved", now)
            .await
    }

    async fn create_scheduled_task_status(
        &self,
        record: &ScheduledTaskRecord,
    ) -> Result<Option<String>, TallyError> {
        let body = serde_json::to_string(record)
            .map_err(|e| TallyError::Internal(format!("task record encoding: {e}")))?;

        let script = Script::new(LUA_BEGIN_TASK);
        script
            .key(self.scoped(running_key(record.task_name)))
            .key(self.scoped(task_key(&record.id)))
            .key(self.scoped(history_key(record.task_name)))
            .arg(&record.id)
            .arg(body)
            .arg(record.started)
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(write_err)
    }

    async fn update_scheduled_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        data: Option<serde_json::Value>,
        now: i64,
    ) -> Result<(), TallyError> {
        let mut record = self
            .get_scheduled_task(id)
            .await?
            .ok_or_else(|| TallyError::StoreWrite(format!("unknown task record {id}")))?;

        record.status = status;
        record.updated = now;
        if data.is_some() {
            record.data = data;
        }
        self.set_task(&record).await
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        Ok(self.get_tasks(&[id.to_string()]).await?.pop())
    }

    async fn get_last_scheduled_task_status(
        &self,
        task: TaskName,
        status: TaskStatus,
    ) -> Result<Option<ScheduledTaskRecord>, TallyError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn
            .get(self.scoped(last_key(task, status)))
            .await
            .map_err(read_err)?;

        match id {
            Some(id) => Ok(self
                .get_scheduled_task(&id)
                .await?
                .filter(|record| record.status == status)),
            None => Ok(None),
        }
    }

    async fn list_scheduled_tasks(
        &self,
        task: TaskName,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskRecord>, TallyError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrevrange(self.scoped(history_key(task)), 0, limit as isize - 1)
            .await
            .map_err(read_err)?;
        self.get_tasks(&ids).await
    }

    async fn store_dataset(&self, dataset: &Dataset) -> Result<(), TallyError> {
        let body = serde_json::to_string(dataset)
            .map_err(|e| TallyError::Internal(format!("dataset encoding: {e}")))?;
        let mut conn = self.redis.clone();
        let _: () = conn
            .set(self.scoped(redis_keys::DATASET), body)
            .await
            .map_err(write_err)?;

        tracing::info!(
            dataset_id = %dataset.dataset_id,
            dataset_content_id = %dataset.dataset_content_id,
            "Dataset stored"
        );
        Ok(())
    }

    async fn get_dataset(&self) -> Result<Option<Dataset>, TallyError> {
        let mut conn = self.redis.clone();
        let body: Option<String> = conn.get(self.scoped(redis_keys::DATASET)).await.map_err(read_err)?;

        body.map(|b| {
            serde_json::from_str(&b)
                .map_err(|e| TallyError::StoreRead(format!("corrupt dataset: {e}")))
        })
        .transpose()
    }
}
