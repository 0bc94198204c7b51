//! Event handler trait, the built-in registry handlers and the dispatch table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::AggregateEngine;
use crate::error::SyncError;
use crate::events::{EventKind, RegistryEvent};
use crate::reconciler::Reconciler;
use crate::store::{FundingStore, ProjectStore, RatingStore};
use crate::types::{ChainEvent, Funding, Rating};

/// Applies the effect of one registry event.
///
/// Implementations must be idempotent: the same event may be dispatched
/// again by the recovery pass after a crash.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RegistryEvent, raw: &ChainEvent) -> Result<(), SyncError>;

    /// The event kind this handler processes.
    fn kind(&self) -> EventKind;
}

/// Registry of event handlers, keyed by event kind.
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The dispatch table for the registry contract:
    ///
    /// | event | effect |
    /// |---|---|
    /// | `ProjectCreated` | [`Reconciler::bind_project`] |
    /// | `ProjectApproved` | [`Reconciler::mark_approved_on_chain`] |
    /// | `ApprovalMinted` | [`Reconciler::record_certificate`] |
    /// | `Rated` | upsert rating, [`AggregateEngine::recompute_ratings`] |
    /// | `Funded` | insert funding, [`AggregateEngine::recompute_funding`] |
    pub fn standard<S>(store: Arc<S>, token_decimals: u8) -> Self
    where
        S: ProjectStore + RatingStore + FundingStore + 'static,
    {
        let reconciler = Reconciler::new(Arc::clone(&store));
        let engine = AggregateEngine::new(Arc::clone(&store), token_decimals);

        let mut registry = Self::new();
        registry.on_event(Arc::new(ProjectCreatedHandler(reconciler.clone())));
        registry.on_event(Arc::new(ProjectApprovedHandler(reconciler.clone())));
        registry.on_event(Arc::new(ApprovalMintedHandler(reconciler)));
        registry.on_event(Arc::new(RatedHandler {
            store: Arc::clone(&store),
            engine: engine.clone(),
        }));
        registry.on_event(Arc::new(FundedHandler { store, engine }));
        registry
    }

    /// Register an event handler for its kind.
    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(handler.kind()).or_default().push(handler);
    }

    /// Parse `raw` into a typed event and run every matching handler.
    ///
    /// A payload that does not parse yields [`SyncError::Decode`].
    pub async fn dispatch(&self, raw: &ChainEvent) -> Result<(), SyncError> {
        let event = RegistryEvent::from_chain_event(raw)?;
        if let Some(handlers) = self.handlers.get(&event.kind()) {
            for handler in handlers {
                handler.handle(&event, raw).await?;
            }
        }
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in handlers ────────────────────────────────────────────────────────

struct ProjectCreatedHandler<S>(Reconciler<S>);

#[async_trait]
impl<S: ProjectStore + 'static> EventHandler for ProjectCreatedHandler<S> {
    async fn handle(&self, event: &RegistryEvent, _raw: &ChainEvent) -> Result<(), SyncError> {
        if let RegistryEvent::ProjectCreated {
            project_id,
            owner,
            metadata_uri,
        } = event
        {
            self.0.bind_project(*project_id, owner, metadata_uri).await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::ProjectCreated
    }
}

struct ProjectApprovedHandler<S>(Reconciler<S>);

#[async_trait]
impl<S: ProjectStore + 'static> EventHandler for ProjectApprovedHandler<S> {
    async fn handle(&self, event: &RegistryEvent, _raw: &ChainEvent) -> Result<(), SyncError> {
        self.0.mark_approved_on_chain(event.project_id()).await?;
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::ProjectApproved
    }
}

struct ApprovalMintedHandler<S>(Reconciler<S>);

#[async_trait]
impl<S: ProjectStore + 'static> EventHandler for ApprovalMintedHandler<S> {
    async fn handle(&self, event: &RegistryEvent, raw: &ChainEvent) -> Result<(), SyncError> {
        if let RegistryEvent::ApprovalMinted {
            project_id,
            token_id,
            ..
        } = event
        {
            // The emitting contract is the certificate contract.
            self.0
                .record_certificate(*project_id, *token_id, &raw.address)
                .await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::ApprovalMinted
    }
}

struct RatedHandler<S> {
    store: Arc<S>,
    engine: AggregateEngine<S>,
}

#[async_trait]
impl<S: RatingStore + FundingStore + 'static> EventHandler for RatedHandler<S> {
    async fn handle(&self, event: &RegistryEvent, raw: &ChainEvent) -> Result<(), SyncError> {
        if let RegistryEvent::Rated {
            project_id,
            rater,
            stars,
        } = event
        {
            let rating = Rating {
                on_chain_project_id: *project_id,
                rater: rater.clone(),
                stars: *stars,
                block_number: raw.block_number,
                log_index: raw.log_index,
            };
            if !self.store.upsert_rating(&rating).await? {
                tracing::debug!(
                    project = project_id,
                    rater = %rater,
                    "Rating not newer than stored value"
                );
            }
            self.engine.recompute_ratings(*project_id).await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::Rated
    }
}

struct FundedHandler<S> {
    store: Arc<S>,
    engine: AggregateEngine<S>,
}

#[async_trait]
impl<S: RatingStore + FundingStore + 'static> EventHandler for FundedHandler<S> {
    async fn handle(&self, event: &RegistryEvent, raw: &ChainEvent) -> Result<(), SyncError> {
        if let RegistryEvent::Funded {
            project_id,
            funder,
            amount,
        } = event
        {
            let funding = Funding {
                on_chain_project_id: *project_id,
                funder: funder.clone(),
                amount: *amount,
                tx_hash: raw.tx_hash.clone(),
                log_index: raw.log_index,
                block_number: raw.block_number,
            };
            self.store.insert_funding(&funding).await?;
            self.engine.recompute_funding(*project_id).await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::Funded
    }
}
