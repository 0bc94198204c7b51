//! In-memory store.
//!
//! Implements every store trait with the same guards as the SQLite backend.
//! Useful for tests and short-lived runs that don't need persistence.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::SyncError;
use crate::store::{check_transition, EventStore, FundingStore, ProjectStore, RatingStore};
use crate::types::{
    normalize_address, ApplyState, ChainEvent, EventKey, Funding, FundingAggregate, Project,
    ProjectStatus, Rating, RatingAggregate,
};

#[derive(Default)]
struct State {
    events: HashMap<EventKey, (ChainEvent, ApplyState)>,
    /// Insertion order doubles as the creation tie-breaker.
    projects: Vec<Project>,
    ratings: HashMap<(u64, String), Rating>,
    rating_aggregates: HashMap<u64, RatingAggregate>,
    fundings: Vec<Funding>,
    funding_aggregates: HashMap<u64, FundingAggregate>,
    checkpoints: HashMap<(u64, String), Checkpoint>,
}

/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn event_state(&self, key: &EventKey) -> Result<Option<ApplyState>, SyncError> {
        Ok(self.lock()?.events.get(key).map(|(_, s)| *s))
    }

    async fn insert_observed(&self, event: &ChainEvent) -> Result<bool, SyncError> {
        let mut state = self.lock()?;
        let key = event.key();
        if state.events.contains_key(&key) {
            return Ok(false);
        }
        state
            .events
            .insert(key, (event.clone(), ApplyState::Observed));
        Ok(true)
    }

    async fn mark_applied(&self, key: &EventKey) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        match state.events.get_mut(key) {
            Some((_, s)) => {
                *s = ApplyState::Applied;
                Ok(())
            }
            None => Err(SyncError::NotFound(format!("event {key}"))),
        }
    }

    async fn pending_events(&self, chain_id: u64) -> Result<Vec<ChainEvent>, SyncError> {
        let state = self.lock()?;
        let mut pending: Vec<ChainEvent> = state
            .events
            .values()
            .filter(|(e, s)| e.chain_id == chain_id && *s == ApplyState::Observed)
            .map(|(e, _)| e.clone())
            .collect();
        pending.sort_by_key(|e| (e.block_number, e.log_index, e.tx_hash.clone()));
        Ok(pending)
    }

    async fn max_event_block(
        &self,
        chain_id: u64,
        address: &str,
        event_name: &str,
    ) -> Result<Option<u64>, SyncError> {
        let address = normalize_address(address);
        Ok(self
            .lock()?
            .events
            .values()
            .filter(|(e, _)| {
                e.chain_id == chain_id && e.address == address && e.event_name == event_name
            })
            .map(|(e, _)| e.block_number)
            .max())
    }

    async fn event_count(&self, chain_id: u64) -> Result<u64, SyncError> {
        Ok(self
            .lock()?
            .events
            .values()
            .filter(|(e, _)| e.chain_id == chain_id)
            .count() as u64)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        if state.projects.iter().any(|p| p.id == project.id) {
            return Err(SyncError::Storage(format!(
                "project {} already exists",
                project.id
            )));
        }
        state.projects.push(project.clone());
        Ok(())
    }

    async fn project(&self, id: Uuid) -> Result<Option<Project>, SyncError> {
        Ok(self.lock()?.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn project_by_on_chain_id(&self, on_chain_id: u64) -> Result<Option<Project>, SyncError> {
        Ok(self
            .lock()?
            .projects
            .iter()
            .find(|p| p.on_chain_project_id == Some(on_chain_id))
            .cloned())
    }

    async fn bind_candidate(&self, owner: &str) -> Result<Option<Project>, SyncError> {
        let owner = normalize_address(owner);
        Ok(self
            .lock()?
            .projects
            .iter()
            .filter(|p| {
                p.owner == owner && p.status.is_bindable() && p.on_chain_project_id.is_none()
            })
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn bind_on_chain_id(
        &self,
        id: Uuid,
        on_chain_id: u64,
        metadata_uri: Option<&str>,
    ) -> Result<bool, SyncError> {
        let mut state = self.lock()?;
        if state
            .projects
            .iter()
            .any(|p| p.on_chain_project_id == Some(on_chain_id))
        {
            return Ok(false);
        }
        match state
            .projects
            .iter_mut()
            .find(|p| p.id == id && p.on_chain_project_id.is_none())
        {
            Some(p) => {
                p.on_chain_project_id = Some(on_chain_id);
                if let Some(uri) = metadata_uri {
                    p.metadata_uri = Some(uri.to_string());
                }
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: ProjectStatus,
        next: ProjectStatus,
    ) -> Result<bool, SyncError> {
        check_transition(expected, next)?;
        let mut state = self.lock()?;
        match state
            .projects
            .iter_mut()
            .find(|p| p.id == id && p.status == expected)
        {
            Some(p) => {
                p.status = next;
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_certificate(
        &self,
        id: Uuid,
        token_id: u64,
        contract: &str,
    ) -> Result<bool, SyncError> {
        let contract = normalize_address(contract);
        let mut state = self.lock()?;
        let project = state
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("project {id}")))?;
        match project.certificate_token_id {
            Some(existing) => Ok(existing == token_id),
            None => {
                project.certificate_token_id = Some(token_id);
                project.certificate_contract = Some(contract);
                project.updated_at = Utc::now();
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl RatingStore for MemoryStore {
    async fn upsert_rating(&self, rating: &Rating) -> Result<bool, SyncError> {
        let mut state = self.lock()?;
        let key = (rating.on_chain_project_id, normalize_address(&rating.rater));
        if let Some(existing) = state.ratings.get(&key) {
            if (existing.block_number, existing.log_index) >= (rating.block_number, rating.log_index)
            {
                return Ok(false);
            }
        }
        let mut stored = rating.clone();
        stored.rater = key.1.clone();
        state.ratings.insert(key, stored);
        Ok(true)
    }

    async fn ratings_for(&self, on_chain_id: u64) -> Result<Vec<Rating>, SyncError> {
        let state = self.lock()?;
        let mut rows: Vec<Rating> = state
            .ratings
            .values()
            .filter(|r| r.on_chain_project_id == on_chain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.rater.cmp(&b.rater));
        Ok(rows)
    }

    async fn upsert_rating_aggregate(&self, aggregate: &RatingAggregate) -> Result<(), SyncError> {
        self.lock()?
            .rating_aggregates
            .insert(aggregate.on_chain_project_id, aggregate.clone());
        Ok(())
    }

    async fn rating_aggregate(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<RatingAggregate>, SyncError> {
        Ok(self.lock()?.rating_aggregates.get(&on_chain_id).cloned())
    }
}

#[async_trait]
impl FundingStore for MemoryStore {
    async fn insert_funding(&self, funding: &Funding) -> Result<bool, SyncError> {
        let mut state = self.lock()?;
        if state
            .fundings
            .iter()
            .any(|f| f.tx_hash == funding.tx_hash && f.log_index == funding.log_index)
        {
            return Ok(false);
        }
        state.fundings.push(funding.clone());
        Ok(true)
    }

    async fn fundings_for(&self, on_chain_id: u64) -> Result<Vec<Funding>, SyncError> {
        Ok(self
            .lock()?
            .fundings
            .iter()
            .filter(|f| f.on_chain_project_id == on_chain_id)
            .cloned()
            .collect())
    }

    async fn upsert_funding_aggregate(
        &self,
        aggregate: &FundingAggregate,
    ) -> Result<(), SyncError> {
        self.lock()?
            .funding_aggregates
            .insert(aggregate.on_chain_project_id, aggregate.clone());
        Ok(())
    }

    async fn funding_aggregate(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<FundingAggregate>, SyncError> {
        Ok(self.lock()?.funding_aggregates.get(&on_chain_id).cloned())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(
        &self,
        chain_id: u64,
        stream_id: &str,
    ) -> Result<Option<Checkpoint>, SyncError> {
        Ok(self
            .lock()?
            .checkpoints
            .get(&(chain_id, stream_id.to_string()))
            .cloned())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        self.lock()?.checkpoints.insert(
            (checkpoint.chain_id, checkpoint.stream_id.clone()),
            checkpoint,
        );
        Ok(())
    }

    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, SyncError> {
        let state = self.lock()?;
        let mut rows: Vec<Checkpoint> = state
            .checkpoints
            .values()
            .filter(|c| c.chain_id == chain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        Ok(rows)
    }
}
