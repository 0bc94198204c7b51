//! Unsigned transaction descriptors for the registry and donation token.

use alloy_dyn_abi::DynSolValue;

use registrysync_core::error::SyncError;
use registrysync_core::orchestrator::TxEncoder;
use registrysync_core::types::{normalize_address, TxDescriptor};

use crate::abi::{encode_call, parse_address, uint};

const SUBMIT_PROJECT: &str = "submitProject(string)";
const APPROVE_PROJECT: &str = "approveProject(uint256)";
const MINT_APPROVAL: &str = "mintApproval(uint256)";
const FUND: &str = "fund(uint256,uint256)";
const ERC20_APPROVE: &str = "approve(address,uint256)";

/// ABI-encodes registry and ERC-20 calls into [`TxDescriptor`]s.
#[derive(Debug, Clone)]
pub struct EvmTxEncoder {
    registry: String,
    token: Option<String>,
    chain_id: u64,
}

impl EvmTxEncoder {
    pub fn new(registry: &str, token: Option<&str>, chain_id: u64) -> Self {
        Self {
            registry: normalize_address(registry),
            token: token.map(normalize_address),
            chain_id,
        }
    }

    fn descriptor(&self, to: &str, calldata: Vec<u8>) -> TxDescriptor {
        TxDescriptor {
            to: to.to_string(),
            data: format!("0x{}", hex::encode(calldata)),
            chain_id: self.chain_id,
        }
    }

    fn registry_call(&self, signature: &str, args: Vec<DynSolValue>) -> TxDescriptor {
        self.descriptor(&self.registry, encode_call(signature, args))
    }
}

impl TxEncoder for EvmTxEncoder {
    fn submit_project(&self, metadata_uri: &str) -> Result<TxDescriptor, SyncError> {
        Ok(self.registry_call(
            SUBMIT_PROJECT,
            vec![DynSolValue::String(metadata_uri.to_string())],
        ))
    }

    fn approve_project(&self, on_chain_id: u64) -> Result<TxDescriptor, SyncError> {
        Ok(self.registry_call(APPROVE_PROJECT, vec![uint(on_chain_id)]))
    }

    fn mint_certificate(&self, on_chain_id: u64) -> Result<TxDescriptor, SyncError> {
        Ok(self.registry_call(MINT_APPROVAL, vec![uint(on_chain_id)]))
    }

    fn approve_token(&self, spender: &str, amount: u128) -> Result<TxDescriptor, SyncError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SyncError::Config("no donation token configured".into()))?;
        let args = vec![DynSolValue::Address(parse_address(spender)?), uint(amount)];
        Ok(self.descriptor(token, encode_call(ERC20_APPROVE, args)))
    }

    fn donate(&self, on_chain_id: u64, amount: u128) -> Result<TxDescriptor, SyncError> {
        Ok(self.registry_call(FUND, vec![uint(on_chain_id), uint(amount)]))
    }

    fn registry_address(&self) -> &str {
        &self.registry
    }
}
