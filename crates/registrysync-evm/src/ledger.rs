//! Ledger client: read-only gateway to the chain.
//!
//! No caching, no retries. Every call is bounded by the configured timeout
//! and failures surface as [`SyncError::Network`] for the caller to retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use registrysync_core::error::SyncError;
use registrysync_core::orchestrator::ProjectStateReader;
use registrysync_core::types::{normalize_address, OnChainProject, OnChainStatus};

use crate::abi::{self, uint};
use crate::fetcher::{block_timestamp_from_json, parse_hex_u64, to_hex_quantity, RawLog};
use crate::rpc::{RpcTransport, TransportError};

const GET_PROJECT: &str = "getProject(uint256)";
const GET_PROJECT_OUTPUT: [&str; 6] = [
    "address", "uint8", "uint256", "uint256", "uint256", "uint256",
];
const AVERAGE_RATING: &str = "averageRating(uint256)";
const ALLOWANCE: &str = "allowance(address,address)";

/// Read access to the chain.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn current_height(&self) -> Result<u64, SyncError>;

    /// Logs of `address` whose `topics[0]` is `topic0`, in `[from, to]`.
    async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, SyncError>;

    /// Unix timestamp of block `number`.
    async fn block_timestamp(&self, number: u64) -> Result<i64, SyncError>;

    /// Registry `getProject`; `None` when the project does not exist.
    async fn read_project_state(&self, on_chain_id: u64)
        -> Result<Option<OnChainProject>, SyncError>;

    /// ERC-20 allowance of the donation token.
    async fn allowance(&self, owner: &str, spender: &str) -> Result<u128, SyncError>;

    /// Registry `averageRating`, unscaled.
    async fn average_rating(&self, on_chain_id: u64) -> Result<f64, SyncError>;
}

/// [`LedgerClient`] over any JSON-RPC transport.
pub struct EvmLedger<T> {
    transport: T,
    registry: String,
    token: Option<String>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl<T: RpcTransport> EvmLedger<T> {
    pub fn new(transport: T, registry: &str, token: Option<&str>, timeout: Duration) -> Self {
        Self {
            transport,
            registry: normalize_address(registry),
            token: token.map(normalize_address),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn rpc<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.timeout, self.transport.call(id, method, params)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    method,
                    url = %self.transport.url(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                Err(TransportError::Timeout {
                    ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn eth_call(&self, to: &str, calldata: Vec<u8>) -> Result<String, TransportError> {
        self.rpc(
            "eth_call",
            vec![
                json!({ "to": to, "data": format!("0x{}", hex::encode(calldata)) }),
                json!("latest"),
            ],
        )
        .await
    }
}

#[async_trait]
impl<T: RpcTransport> LedgerClient for EvmLedger<T> {
    async fn current_height(&self) -> Result<u64, SyncError> {
        let hex: String = self.rpc("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&hex).ok_or_else(|| SyncError::Decode(format!("bad block number '{hex}'")))
    }

    async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, SyncError> {
        let filter = json!({
            "address": address,
            "topics": [topic0],
            "fromBlock": to_hex_quantity(from),
            "toBlock": to_hex_quantity(to),
        });
        Ok(self.rpc("eth_getLogs", vec![filter]).await?)
    }

    async fn block_timestamp(&self, number: u64) -> Result<i64, SyncError> {
        let block: Value = self
            .rpc(
                "eth_getBlockByNumber",
                vec![json!(to_hex_quantity(number)), json!(false)],
            )
            .await?;
        if block.is_null() {
            return Err(SyncError::NotFound(format!("block {number}")));
        }
        block_timestamp_from_json(&block)
            .ok_or_else(|| SyncError::Decode(format!("block {number} has no timestamp")))
    }

    async fn read_project_state(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<OnChainProject>, SyncError> {
        let calldata = abi::encode_call(GET_PROJECT, vec![uint(on_chain_id)]);
        let output = match self.eth_call(&self.registry, calldata).await {
            Ok(output) => output,
            // Registries revert on unknown ids.
            Err(TransportError::Rpc(e)) if e.message.contains("revert") => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let values = abi::decode_output(&GET_PROJECT_OUTPUT, &output)?;
        let [owner, status, rating_count, rating_sum, total_donated, certificate] =
            values.as_slice()
        else {
            return Err(SyncError::Decode(format!(
                "getProject returned {} values",
                values.len()
            )));
        };

        let owner = abi::as_address(owner)?;
        if owner == abi::format_address(&alloy_primitives::Address::ZERO) {
            return Ok(None);
        }
        let raw_status = abi::as_u64(status)?;
        let status = u8::try_from(raw_status)
            .ok()
            .and_then(OnChainStatus::from_u8)
            .ok_or_else(|| SyncError::Decode(format!("unknown on-chain status {raw_status}")))?;
        let certificate = abi::as_u64(certificate)?;

        Ok(Some(OnChainProject {
            on_chain_project_id: on_chain_id,
            owner,
            status,
            rating_count: abi::as_u64(rating_count)?,
            rating_sum: abi::as_u64(rating_sum)?,
            total_donated: abi::as_u128(total_donated)?,
            certificate_token_id: (certificate != 0).then_some(certificate),
        }))
    }

    async fn allowance(&self, owner: &str, spender: &str) -> Result<u128, SyncError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SyncError::Config("donation token address is not configured".into()))?;
        let calldata = abi::encode_call(
            ALLOWANCE,
            vec![
                alloy_dyn_abi::DynSolValue::Address(abi::parse_address(owner)?),
                alloy_dyn_abi::DynSolValue::Address(abi::parse_address(spender)?),
            ],
        );
        let output = self.eth_call(token, calldata).await?;
        let values = abi::decode_output(&["uint256"], &output)?;
        values
            .first()
            .ok_or_else(|| SyncError::Decode("allowance returned nothing".into()))
            .and_then(abi::as_u128)
    }

    async fn average_rating(&self, on_chain_id: u64) -> Result<f64, SyncError> {
        let calldata = abi::encode_call(AVERAGE_RATING, vec![uint(on_chain_id)]);
        let output = self.eth_call(&self.registry, calldata).await?;
        let values = abi::decode_output(&["uint256"], &output)?;
        let scaled = values
            .first()
            .ok_or_else(|| SyncError::Decode("averageRating returned nothing".into()))
            .and_then(abi::as_u64)?;
        Ok(scaled as f64 / 100.0)
    }
}

#[async_trait]
impl<T: RpcTransport> ProjectStateReader for EvmLedger<T> {
    async fn read_project_state(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<OnChainProject>, SyncError> {
        LedgerClient::read_project_state(self, on_chain_id).await
    }

    async fn allowance(&self, owner: &str, spender: &str) -> Result<u128, SyncError> {
        LedgerClient::allowance(self, owner, spender).await
    }
}
