//! Redis sink: each record lands under its own key, so re-sending a batch
//! overwrites rather than duplicates.

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use tally_common::constants::redis_keys;
use tally_common::{CommitmentRecord, PoWCommitmentRecord, TallyError};

use super::ExternalSink;

pub struct RedisSink {
    uri: String,
    redis: ConnectionManager,
}

impl RedisSink {
    pub async fn connect(uri: &str) -> Result<Self, TallyError> {
        let client = ::redis::Client::open(uri)
            .map_err(|e| TallyError::Config(format!("invalid sink URI: {e}")))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| TallyError::SinkDelivery(format!("connect failed: {e}")))?;

        Ok(Self {
            uri: uri.to_string(),
            redis,
        })
    }
}

fn encode<T: serde::Serialize>(record: &T) -> Result<String, TallyError> {
    serde_json::to_string(record).map_err(|e| TallyError::Internal(format!("export encoding: {e}")))
}

#[async_trait]
impl ExternalSink for RedisSink {
    fn destination(&self) -> &str {
        &self.uri
    }

    async fn save(
        &self,
        commitments: &[CommitmentRecord],
        pow_commitments: &[PoWCommitmentRecord],
    ) -> Result<(), TallyError> {
        if commitments.is_empty() && pow_commitments.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for commitment in commitments {
            let key = format!("{}{}", redis_keys::EXPORT_COMMITMENT_PREFIX, commitment.id);
            pipe.set(key, encode(commitment)?).ignore();
        }
        for record in pow_commitments {
            let key = format!("{}{}", redis_keys::EXPORT_POW_PREFIX, record.challenge);
            pipe.set(key, encode(record)?).ignore();
        }

        let mut conn = self.redis.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| TallyError::SinkDelivery(e.to_string()))?;

        tracing::info!(
            commitments = commitments.len(),
            pow_commitments = pow_commitments.len(),
            "Saved records to external sink"
        );
        Ok(())
    }
}
