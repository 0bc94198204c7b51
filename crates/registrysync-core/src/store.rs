//! Storage traits for the relational side of the pipeline.
//!
//! Each table family gets its own trait so components can depend on exactly
//! what they touch. [`Store`] bundles them for backends that implement all.

use async_trait::async_trait;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::error::SyncError;
use crate::types::{
    ApplyState, ChainEvent, EventKey, Funding, FundingAggregate, Project, ProjectStatus, Rating,
    RatingAggregate,
};

/// Append-only log of observed chain events with their application marker.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// `None` when the key has never been observed.
    async fn event_state(&self, key: &EventKey) -> Result<Option<ApplyState>, SyncError>;

    /// Record an event as `observed`. Returns `false` if the key already exists.
    async fn insert_observed(&self, event: &ChainEvent) -> Result<bool, SyncError>;

    async fn mark_applied(&self, key: &EventKey) -> Result<(), SyncError>;

    /// Events still in the `observed` state, in block/log order.
    async fn pending_events(&self, chain_id: u64) -> Result<Vec<ChainEvent>, SyncError>;

    /// Highest block recorded for one `(address, event)` stream.
    async fn max_event_block(
        &self,
        chain_id: u64,
        address: &str,
        event_name: &str,
    ) -> Result<Option<u64>, SyncError>;

    async fn event_count(&self, chain_id: u64) -> Result<u64, SyncError>;
}

/// Off-chain project records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn insert_project(&self, project: &Project) -> Result<(), SyncError>;

    async fn project(&self, id: Uuid) -> Result<Option<Project>, SyncError>;

    async fn project_by_on_chain_id(&self, on_chain_id: u64) -> Result<Option<Project>, SyncError>;

    /// The most recently created project owned by `owner` that is bindable
    /// (Submitted or Approved) and has no on-chain id yet.
    async fn bind_candidate(&self, owner: &str) -> Result<Option<Project>, SyncError>;

    /// Set `on_chain_project_id` if the project is still unbound and no other
    /// project holds `on_chain_id`. Returns `false` when the guard fails.
    async fn bind_on_chain_id(
        &self,
        id: Uuid,
        on_chain_id: u64,
        metadata_uri: Option<&str>,
    ) -> Result<bool, SyncError>;

    /// Conditional status write: succeeds only if the current status is `expected`.
    ///
    /// A backward move (see [`ProjectStatus::can_advance_to`]) is an
    /// [`SyncError::InvalidStatus`] and writes nothing.
    async fn update_status(
        &self,
        id: Uuid,
        expected: ProjectStatus,
        next: ProjectStatus,
    ) -> Result<bool, SyncError>;

    /// Record the certificate. Returns `false` if a different certificate is
    /// already recorded; recording the same one again is a successful no-op.
    async fn set_certificate(
        &self,
        id: Uuid,
        token_id: u64,
        contract: &str,
    ) -> Result<bool, SyncError>;
}

/// Raw ratings and their derived summary.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Upsert keyed by `(project, rater)`. A stored rating is replaced only by
    /// one at a later `(block, log_index)`. Returns `true` if a row changed.
    async fn upsert_rating(&self, rating: &Rating) -> Result<bool, SyncError>;

    async fn ratings_for(&self, on_chain_id: u64) -> Result<Vec<Rating>, SyncError>;

    async fn upsert_rating_aggregate(&self, aggregate: &RatingAggregate) -> Result<(), SyncError>;

    async fn rating_aggregate(&self, on_chain_id: u64)
        -> Result<Option<RatingAggregate>, SyncError>;
}

/// Append-only funding log and its derived summary.
#[async_trait]
pub trait FundingStore: Send + Sync {
    /// Insert keyed by `(tx_hash, log_index)`. Returns `false` on a duplicate.
    async fn insert_funding(&self, funding: &Funding) -> Result<bool, SyncError>;

    async fn fundings_for(&self, on_chain_id: u64) -> Result<Vec<Funding>, SyncError>;

    async fn upsert_funding_aggregate(&self, aggregate: &FundingAggregate)
        -> Result<(), SyncError>;

    async fn funding_aggregate(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<FundingAggregate>, SyncError>;
}

/// Rejects status writes that are not forward moves.
pub fn check_transition(expected: ProjectStatus, next: ProjectStatus) -> Result<(), SyncError> {
    if expected.can_advance_to(next) {
        Ok(())
    } else {
        Err(SyncError::InvalidStatus {
            operation: "update_status",
            reason: format!("{expected} cannot move to {next}"),
        })
    }
}

/// Everything the indexer and the orchestrator need from one backend.
pub trait Store:
    EventStore + ProjectStore + RatingStore + FundingStore + CheckpointStore
{
}

impl<T> Store for T where
    T: EventStore + ProjectStore + RatingStore + FundingStore + CheckpointStore
{
}
