//! Fluent builder for the registry index loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use registrysync_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain_id(11155111)
//!     .from_block(5_200_000)
//!     .confirmation_depth(2)
//!     .batch_size(500)
//!     .registry("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .build_config();
//! ```

use std::sync::Arc;

use registrysync_core::config::SyncConfig;
use registrysync_core::error::SyncError;
use registrysync_core::handler::HandlerRegistry;
use registrysync_core::indexer::IndexerConfig;
use registrysync_core::store::Store;

use crate::index_loop::IndexLoop;
use crate::ledger::LedgerClient;
use crate::stream::LogStream;

/// Fluent builder for `IndexerConfig` and the [`IndexLoop`] around it.
#[derive(Debug, Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    registry: Option<String>,
    certificate: Option<String>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from a loaded [`SyncConfig`].
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            config: config.indexer.clone(),
            registry: Some(config.registry_address.clone()),
            certificate: Some(config.certificate_address().to_string()),
        }
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// First block to index for streams without a checkpoint.
    pub fn from_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set confirmation depth (blocks behind head before processing).
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the number of blocks per `eth_getLogs` range.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn cycle_deadline_ms(mut self, ms: u64) -> Self {
        self.config.cycle_deadline_ms = ms;
        self
    }

    pub fn token_decimals(mut self, decimals: u8) -> Self {
        self.config.token_decimals = decimals;
        self
    }

    /// Registry contract emitting project, rating and funding events.
    pub fn registry(mut self, address: impl Into<String>) -> Self {
        self.registry = Some(address.into());
        self
    }

    /// Certificate contract emitting `ApprovalMinted`. Defaults to the registry.
    pub fn certificate(mut self, address: impl Into<String>) -> Self {
        self.certificate = Some(address.into());
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build an index loop over every tracked stream with the standard
    /// handlers.
    pub fn build<L, S>(self, ledger: Arc<L>, store: Arc<S>) -> Result<IndexLoop<L, S>, SyncError>
    where
        L: LedgerClient + 'static,
        S: Store + 'static,
    {
        let registry = self
            .registry
            .ok_or_else(|| SyncError::Config("registry address is required".into()))?;
        if self.config.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        let certificate = self.certificate.unwrap_or_else(|| registry.clone());
        let streams = LogStream::standard(&registry, &certificate);
        let handlers = HandlerRegistry::standard(Arc::clone(&store), self.config.token_decimals);
        Ok(IndexLoop::new(self.config, ledger, store, handlers, streams))
    }
}
