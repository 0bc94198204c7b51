//! registrysync-storage: persistent store backends for RegistrySync.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//! - `MemoryStore` (re-exported from core): no persistence, for tests

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use registrysync_core::memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
