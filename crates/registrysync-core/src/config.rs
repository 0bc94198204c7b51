//! Process configuration, loaded from `REGISTRYSYNC_*` environment variables.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::indexer::IndexerConfig;
use crate::types::normalize_address;

/// Prefix of every environment variable read by [`SyncConfig::from_env`].
pub const ENV_PREFIX: &str = "REGISTRYSYNC_";

/// Top-level configuration for the indexer and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// JSON-RPC endpoint, e.g. `"https://sepolia.base.org"`.
    pub rpc_url: String,
    /// Per-call RPC timeout (milliseconds).
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Registry contract (lowercase `0x…`).
    pub registry_address: String,
    /// Certificate contract; the registry itself when `None`.
    #[serde(default)]
    pub certificate_address: Option<String>,
    /// ERC-20 donation token.
    #[serde(default)]
    pub token_address: Option<String>,
    /// SQLite path or URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub indexer: IndexerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_database_url() -> String {
    "registrysync.db".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl SyncConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup. `lookup` receives the full variable
    /// name including [`ENV_PREFIX`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| SyncError::Config(format!("{ENV_PREFIX}{name} is required")))
        };

        let defaults = IndexerConfig::default();
        let indexer = IndexerConfig {
            chain_id: parse(&required("CHAIN_ID")?, "CHAIN_ID")?,
            start_block: parse_or(get("START_BLOCK"), "START_BLOCK", defaults.start_block)?,
            batch_size: parse_or(get("BATCH_SIZE"), "BATCH_SIZE", defaults.batch_size)?,
            confirmation_depth: parse_or(
                get("CONFIRMATION_DEPTH"),
                "CONFIRMATION_DEPTH",
                defaults.confirmation_depth,
            )?,
            poll_interval_ms: parse_or(
                get("POLL_INTERVAL_MS"),
                "POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            cycle_deadline_ms: parse_or(
                get("CYCLE_DEADLINE_MS"),
                "CYCLE_DEADLINE_MS",
                defaults.cycle_deadline_ms,
            )?,
            token_decimals: parse_or(
                get("TOKEN_DECIMALS"),
                "TOKEN_DECIMALS",
                defaults.token_decimals,
            )?,
        };
        if indexer.batch_size == 0 {
            return Err(SyncError::Config(format!(
                "{ENV_PREFIX}BATCH_SIZE must be greater than zero"
            )));
        }

        Ok(Self {
            rpc_url: required("RPC_URL")?,
            rpc_timeout_ms: parse_or(get("RPC_TIMEOUT_MS"), "RPC_TIMEOUT_MS", default_rpc_timeout_ms())?,
            registry_address: normalize_address(&required("REGISTRY_ADDRESS")?),
            certificate_address: get("CERTIFICATE_ADDRESS").map(|a| normalize_address(&a)),
            token_address: get("TOKEN_ADDRESS").map(|a| normalize_address(&a)),
            database_url: get("DATABASE_URL").unwrap_or_else(default_database_url),
            indexer,
            log_level: get("LOG_LEVEL").unwrap_or_else(default_log_level),
            log_json: parse_or(get("LOG_JSON"), "LOG_JSON", false)?,
        })
    }

    /// The contract that emits `ApprovalMinted`.
    pub fn certificate_address(&self) -> &str {
        self.certificate_address
            .as_deref()
            .unwrap_or(&self.registry_address)
    }
}

fn parse<T: FromStr>(raw: &str, name: &str) -> Result<T, SyncError> {
    raw.parse()
        .map_err(|_| SyncError::Config(format!("{ENV_PREFIX}{name} has an invalid value: {raw}")))
}

fn parse_or<T: FromStr>(raw: Option<String>, name: &str, default: T) -> Result<T, SyncError> {
    match raw {
        Some(v) => parse(&v, name),
        None => Ok(default),
    }
}
