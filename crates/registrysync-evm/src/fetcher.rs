//! Raw `eth_getLogs` / `eth_getBlockByNumber` payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use registrysync_core::error::SyncError;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, SyncError> {
        parse_hex_u64(&self.block_number)
            .ok_or_else(|| SyncError::Decode(format!("bad blockNumber '{}'", self.block_number)))
    }

    pub fn log_index_u32(&self) -> Result<u32, SyncError> {
        parse_hex_u64(&self.log_index)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| SyncError::Decode(format!("bad logIndex '{}'", self.log_index)))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Hex quantity encoding for JSON-RPC params.
pub fn to_hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

/// The `timestamp` of an `eth_getBlockByNumber` response.
pub fn block_timestamp_from_json(v: &Value) -> Option<i64> {
    parse_hex_u64(v["timestamp"].as_str()?).and_then(|t| i64::try_from(t).ok())
}
