//! External sink for exported commitments.
//!
//! A sink receives one batch per export run. Delivery is all-or-nothing from
//! the pipeline's point of view, and a sink must accept the same batch twice
//! (upsert by record id).

mod redis;

pub use self::redis::RedisSink;

use async_trait::async_trait;
use tally_common::{CommitmentRecord, PoWCommitmentRecord, TallyError};

#[async_trait]
pub trait ExternalSink: Send + Sync {
    /// Destination URI, for logs and task results
    fn destination(&self) -> &str;

    /// Persist both record families in one batch
    async fn save(
        &self,
        commitments: &[CommitmentRecord],
        pow_commitments: &[PoWCommitmentRecord],
    ) -> Result<(), TallyError>;
}

/// Open the sink addressed by `uri`
pub async fn connect(uri: &str) -> Result<Box<dyn ExternalSink>, TallyError> {
    match uri.split_once("://").map(|(scheme, _)| scheme) {
        Some("redis") | Some("rediss") => Ok(Box::new(RedisSink::connect(uri).await?)),
        _ => Err(TallyError::Config(format!("unsupported sink URI: {uri}"))),
    }
}
