//! Registry ABI: event schemas, log decoding and call encoding.
//!
//! The fingerprint of an event is the keccak256 hash of its canonical
//! signature, e.g.:
//!   keccak256("Rated(uint256,address,uint8)") → topics[0]
//!
//! Indexed value-type parameters are decoded from `topics[1..]`; the rest are
//! ABI-decoded from `data` as a parameter tuple.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, U256};
use serde_json::{Map, Value};
use tiny_keccak::{Hasher, Keccak};

use registrysync_core::error::SyncError;
use registrysync_core::events::EventKind;

/// One event parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDef {
    pub name: &'static str,
    pub ty: &'static str,
    pub indexed: bool,
}

const fn indexed(name: &'static str, ty: &'static str) -> ParamDef {
    ParamDef {
        name,
        ty,
        indexed: true,
    }
}

const fn data(name: &'static str, ty: &'static str) -> ParamDef {
    ParamDef {
        name,
        ty,
        indexed: false,
    }
}

/// ABI description of one tracked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSchema {
    pub kind: EventKind,
    pub params: &'static [ParamDef],
}

const PROJECT_CREATED: &[ParamDef] = &[
    indexed("projectId", "uint256"),
    indexed("owner", "address"),
    data("metadataUri", "string"),
];
const PROJECT_APPROVED: &[ParamDef] = &[indexed("projectId", "uint256")];
const APPROVAL_MINTED: &[ParamDef] = &[
    indexed("projectId", "uint256"),
    indexed("tokenId", "uint256"),
    indexed("to", "address"),
];
const RATED: &[ParamDef] = &[
    indexed("projectId", "uint256"),
    indexed("rater", "address"),
    data("stars", "uint8"),
];
const FUNDED: &[ParamDef] = &[
    indexed("projectId", "uint256"),
    indexed("funder", "address"),
    data("amount", "uint256"),
];

impl EventSchema {
    pub fn for_kind(kind: EventKind) -> Self {
        let params = match kind {
            EventKind::ProjectCreated => PROJECT_CREATED,
            EventKind::ProjectApproved => PROJECT_APPROVED,
            EventKind::ApprovalMinted => APPROVAL_MINTED,
            EventKind::Rated => RATED,
            EventKind::Funded => FUNDED,
        };
        Self { kind, params }
    }

    /// Canonical signature, e.g. `"Funded(uint256,address,uint256)"`.
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.params.iter().map(|p| p.ty).collect();
        format!("{}({})", self.kind.name(), types.join(","))
    }

    /// `topics[0]` of logs of this event (lowercase `0x…`).
    pub fn topic0(&self) -> String {
        format!("0x{}", hex::encode(keccak256(self.signature().as_bytes())))
    }

    /// Decode a raw log into a JSON payload keyed by parameter name.
    ///
    /// Unsigned integers become decimal strings, addresses lowercase hex.
    pub fn decode_log(&self, topics: &[String], data: &str) -> Result<Value, SyncError> {
        let expected_topics = 1 + self.params.iter().filter(|p| p.indexed).count();
        if topics.len() != expected_topics {
            return Err(SyncError::Decode(format!(
                "{}: expected {expected_topics} topics, got {}",
                self.kind,
                topics.len()
            )));
        }
        if !topics[0].eq_ignore_ascii_case(&self.topic0()) {
            return Err(SyncError::Decode(format!(
                "{}: topic0 mismatch ({})",
                self.kind, topics[0]
            )));
        }

        let mut payload = Map::new();
        let mut topic_iter = topics[1..].iter();
        let mut data_params = Vec::new();
        for param in self.params {
            if !param.indexed {
                data_params.push(param);
                continue;
            }
            let topic = topic_iter
                .next()
                .ok_or_else(|| SyncError::Decode(format!("missing topic for {}", param.name)))?;
            let bytes = decode_hex(topic)?;
            let value = parse_type(param.ty)?
                .abi_decode(&bytes)
                .map_err(|e| SyncError::Decode(format!("topic '{}': {e}", param.name)))?;
            payload.insert(param.name.to_string(), to_json(value)?);
        }

        if !data_params.is_empty() {
            let types = data_params
                .iter()
                .map(|p| parse_type(p.ty))
                .collect::<Result<Vec<_>, _>>()?;
            let decoded = DynSolType::Tuple(types)
                .abi_decode_params(&decode_hex(data)?)
                .map_err(|e| SyncError::Decode(format!("{} data: {e}", self.kind)))?;
            let values = match decoded {
                DynSolValue::Tuple(values) => values,
                other => vec![other],
            };
            for (param, value) in data_params.iter().zip(values) {
                payload.insert(param.name.to_string(), to_json(value)?);
            }
        }

        Ok(Value::Object(payload))
    }
}

/// keccak256 of `bytes`.
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(bytes);
    hasher.finalize(&mut output);
    output
}

/// 4-byte function selector of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// `selector ++ abi_encode_params(args)`.
pub fn encode_call(signature: &str, args: Vec<DynSolValue>) -> Vec<u8> {
    let mut calldata = selector(signature).to_vec();
    calldata.extend_from_slice(&DynSolValue::Tuple(args).abi_encode_params());
    calldata
}

/// Decode `eth_call` return data against the given output types.
pub fn decode_output(types: &[&str], data: &str) -> Result<Vec<DynSolValue>, SyncError> {
    let types = types
        .iter()
        .map(|t| parse_type(t))
        .collect::<Result<Vec<_>, _>>()?;
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(&decode_hex(data)?)
        .map_err(|e| SyncError::Decode(format!("call output: {e}")))?;
    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

/// Parse a `0x`-prefixed 20-byte address.
pub fn parse_address(address: &str) -> Result<Address, SyncError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|e| SyncError::Decode(format!("invalid address '{address}': {e}")))
}

/// Lowercase `0x` hex form of an address.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

pub fn uint(value: impl Into<u128>) -> DynSolValue {
    DynSolValue::Uint(U256::from(value.into()), 256)
}

pub fn as_u64(value: &DynSolValue) -> Result<u64, SyncError> {
    match value {
        DynSolValue::Uint(u, _) => {
            u64::try_from(*u).map_err(|_| SyncError::Decode(format!("{u} does not fit u64")))
        }
        other => Err(SyncError::Decode(format!("expected uint, got {other:?}"))),
    }
}

pub fn as_u128(value: &DynSolValue) -> Result<u128, SyncError> {
    match value {
        DynSolValue::Uint(u, _) => {
            u128::try_from(*u).map_err(|_| SyncError::Decode(format!("{u} does not fit u128")))
        }
        other => Err(SyncError::Decode(format!("expected uint, got {other:?}"))),
    }
}

pub fn as_address(value: &DynSolValue) -> Result<String, SyncError> {
    match value {
        DynSolValue::Address(a) => Ok(format_address(a)),
        other => Err(SyncError::Decode(format!("expected address, got {other:?}"))),
    }
}

fn parse_type(ty: &str) -> Result<DynSolType, SyncError> {
    DynSolType::parse(ty).map_err(|e| SyncError::Decode(format!("type '{ty}': {e}")))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, SyncError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| SyncError::Decode(format!("invalid hex: {e}")))
}

fn to_json(value: DynSolValue) -> Result<Value, SyncError> {
    Ok(match value {
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Address(a) => Value::String(format_address(&a)),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::FixedBytes(b, size) => {
            Value::String(format!("0x{}", hex::encode(&b[..size])))
        }
        other => {
            return Err(SyncError::Decode(format!(
                "unsupported ABI value {other:?}"
            )))
        }
    })
}
