//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

/// Configuration for the index loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Numeric chain id (part of every idempotency key).
    pub chain_id: u64,
    /// First block to index when a stream has no checkpoint.
    pub start_block: u64,
    /// Maximum number of blocks per `eth_getLogs` range.
    pub batch_size: u64,
    /// Number of blocks to stay behind head. `0` = follow the tip.
    pub confirmation_depth: u64,
    /// Sleep between polling cycles (milliseconds).
    pub poll_interval_ms: u64,
    /// Deadline for the fetch phase of one cycle (milliseconds).
    pub cycle_deadline_ms: u64,
    /// Decimals of the donation token, for display-unit funding totals.
    pub token_decimals: u8,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            start_block: 0,
            batch_size: 1000,
            confirmation_depth: 0,
            poll_interval_ms: 2000,
            cycle_deadline_ms: 30_000,
            token_decimals: 18,
        }
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Re-applying events left in the observed state.
    Recovering,
    /// Polling the chain.
    Live,
    /// Shutdown requested; finishing the current cycle.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recovering => write!(f, "recovering"),
            Self::Live => write!(f, "live"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
