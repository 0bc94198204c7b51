//! registrysync-core: keeps an off-chain project database consistent with an
//! on-chain registry.
//!
//! # Architecture
//!
//! ```text
//! IndexLoop (registrysync-evm)
//!     └── Projector          (observed → applied, recovery pass)
//!             └── HandlerRegistry
//!                     ├── Reconciler       (bind, approve, certificate)
//!                     └── AggregateEngine  (ratings, funding)
//!
//! RegistrationOrchestrator   (submit → approve → mint, driven by callers)
//!
//! Store traits: EventStore, ProjectStore, RatingStore, FundingStore, CheckpointStore
//!     └── MemoryStore here, SqliteStorage in registrysync-storage
//! ```

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod error;
pub mod events;
pub mod handler;
pub mod indexer;
pub mod memory;
pub mod orchestrator;
pub mod projector;
pub mod reconciler;
pub mod store;
pub mod types;

pub use aggregate::AggregateEngine;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::SyncConfig;
pub use cursor::Cursor;
pub use error::SyncError;
pub use events::{EventKind, RegistryEvent};
pub use handler::{EventHandler, HandlerRegistry};
pub use indexer::{IndexerConfig, IndexerState};
pub use memory::MemoryStore;
pub use orchestrator::{
    Actor, DonationPlan, ProjectStateReader, RegistrationOrchestrator, RegistrationStep,
    RepairReport, StepKind, StepReport, TxEncoder,
};
pub use projector::{IngestOutcome, Projector};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use store::{EventStore, FundingStore, ProjectStore, RatingStore, Store};
pub use types::{
    ApplyState, ChainEvent, EventKey, Funding, FundingAggregate, OnChainProject, OnChainStatus,
    Project, ProjectStatus, Rating, RatingAggregate, TxDescriptor,
};
