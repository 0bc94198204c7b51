//! Two-phase event projection: `observed → applied`.
//!
//! An event row is written as `observed` before its effect runs and flipped to
//! `applied` afterwards. A crash in between leaves an `observed` row that
//! [`Projector::recover_pending`] re-applies; every effect is idempotent, so
//! re-application is safe.

use std::sync::Arc;

use crate::error::SyncError;
use crate::handler::HandlerRegistry;
use crate::store::EventStore;
use crate::types::{ApplyState, ChainEvent};

/// What [`Projector::ingest`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First observation; effect applied.
    Applied,
    /// Already applied earlier; nothing done.
    Duplicate,
    /// Observed earlier but never applied; effect applied now.
    Resumed,
}

pub struct Projector<S> {
    store: Arc<S>,
    handlers: Arc<HandlerRegistry>,
}

impl<S> Clone for Projector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<S: EventStore> Projector<S> {
    pub fn new(store: Arc<S>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { store, handlers }
    }

    /// Record and apply one event.
    ///
    /// On error the row stays `observed` and the caller must not move its
    /// cursor past this event.
    pub async fn ingest(&self, event: &ChainEvent) -> Result<IngestOutcome, SyncError> {
        let key = event.key();
        let resumed = match self.store.event_state(&key).await? {
            Some(ApplyState::Applied) => return Ok(IngestOutcome::Duplicate),
            Some(ApplyState::Observed) => true,
            None => {
                if self.store.insert_observed(event).await? {
                    false
                } else {
                    // Inserted concurrently; re-read the marker.
                    match self.store.event_state(&key).await? {
                        Some(ApplyState::Applied) => return Ok(IngestOutcome::Duplicate),
                        _ => true,
                    }
                }
            }
        };

        self.apply(event).await?;
        Ok(if resumed {
            IngestOutcome::Resumed
        } else {
            IngestOutcome::Applied
        })
    }

    /// Re-apply every `observed` event of `chain_id` in block/log order.
    ///
    /// Stops at the first failure so later events never overtake an earlier
    /// one they may depend on.
    pub async fn recover_pending(&self, chain_id: u64) -> Result<usize, SyncError> {
        let pending = self.store.pending_events(chain_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(chain_id, pending = pending.len(), "Recovering observed events");

        for (applied, event) in pending.iter().enumerate() {
            if let Err(e) = self.apply(event).await {
                tracing::warn!(
                    key = %event.key(),
                    event = %event.event_name,
                    applied,
                    error = %e,
                    "Recovery stopped"
                );
                return Err(e);
            }
        }
        Ok(pending.len())
    }

    async fn apply(&self, event: &ChainEvent) -> Result<(), SyncError> {
        match self.handlers.dispatch(event).await {
            Ok(()) => {}
            // Redelivery cannot fix a malformed payload.
            Err(SyncError::Decode(reason)) => {
                tracing::warn!(
                    key = %event.key(),
                    event = %event.event_name,
                    %reason,
                    "Undecodable event skipped"
                );
            }
            Err(e) => return Err(e),
        }
        self.store.mark_applied(&event.key()).await
    }
}
