//! Checkpoints: the persisted polling cursor of each tracked log stream.
//!
//! A checkpoint stores the last block whose logs were fully applied for one
//! `(chain, stream)` pair. It lives in the same store as the idempotency keys
//! so a restart resumes exactly where the last applied batch ended.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A persisted checkpoint for one log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: u64,
    /// Stream identifier, `"<address>:<EventName>"`.
    pub stream_id: String,
    /// Last block whose logs were applied.
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn now(chain_id: u64, stream_id: impl Into<String>, block_number: u64) -> Self {
        Self {
            chain_id,
            stream_id: stream_id.into(),
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(
        &self,
        chain_id: u64,
        stream_id: &str,
    ) -> Result<Option<Checkpoint>, SyncError>;

    /// Save (upsert) a checkpoint.
    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError>;

    /// All checkpoints for a chain, ordered by stream id.
    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, SyncError>;
}
