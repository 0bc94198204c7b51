//! Error types for the reconciliation pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while indexing, reconciling or orchestrating.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The ledger could not be reached (transport failure, timeout, RPC error).
    #[error("Network error: {0}")]
    Network(String),

    /// A log or payload did not match the expected ABI.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No matching record exists (off-chain project or on-chain project).
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Project {project_id} is already registered (certificate #{token_id})")]
    AlreadyRegistered { project_id: Uuid, token_id: u64 },

    #[error("Invalid status for {operation}: {reason}")]
    InvalidStatus {
        operation: &'static str,
        reason: String,
    },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// A conditional write lost a race. Re-fetch and retry the whole operation.
    #[error("Conflict on project {project_id}: expected {expected}, found {actual}")]
    Conflict {
        project_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored records contradict each other (e.g. a funding total that
    /// overflows). The event stays pending until an operator intervenes.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Conflict { .. } | Self::Storage(_)
        )
    }

    /// Returns `true` for precondition failures the caller must act on
    /// (the 4xx family). These are never retried automatically.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::AlreadyRegistered { .. }
                | Self::InvalidStatus { .. }
                | Self::Unauthorized(_)
        )
    }
}
