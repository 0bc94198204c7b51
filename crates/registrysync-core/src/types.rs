//! Shared types for the reconciliation pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowercase an EVM address so string comparisons are case-insensitive.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

// ─── ProjectStatus ────────────────────────────────────────────────────────────

/// Off-chain review status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Statuses eligible for binding to an on-chain project id.
    pub fn is_bindable(&self) -> bool {
        matches!(self, Self::Submitted | Self::Approved)
    }

    /// Returns `true` if `next` is a forward move from `self`.
    ///
    /// Approved is terminal. On-chain approval may force any other status to
    /// Approved; the review workflow may resubmit a rejected project.
    pub fn can_advance_to(&self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (*self, next) {
            (Approved, _) => false,
            (Draft, Submitted) => true,
            (Submitted, Rejected) => true,
            (Rejected, Submitted) => true,
            (Draft | Submitted | Rejected, Approved) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown project status '{other}'")),
        }
    }
}

// ─── OnChainStatus ────────────────────────────────────────────────────────────

/// Project status as stored by the registry contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnChainStatus {
    None = 0,
    Pending = 1,
    Approved = 2,
    Rejected = 3,
}

impl OnChainStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Pending),
            2 => Some(Self::Approved),
            3 => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for OnChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

// ─── Project ──────────────────────────────────────────────────────────────────

/// The off-chain curation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Internal id, assigned at creation and never changed.
    pub id: Uuid,
    /// Owner wallet (lowercase `0x…`).
    pub owner: String,
    pub status: ProjectStatus,
    /// Registry-assigned id. Set once, never reassigned.
    pub on_chain_project_id: Option<u64>,
    pub certificate_token_id: Option<u64>,
    pub certificate_contract: Option<String>,
    pub metadata_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// A fresh, unbound project.
    pub fn new(owner: &str, status: ProjectStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: normalize_address(owner),
            status,
            on_chain_project_id: None,
            certificate_token_id: None,
            certificate_contract: None,
            metadata_uri: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata_uri(mut self, uri: impl Into<String>) -> Self {
        self.metadata_uri = Some(uri.into());
        self
    }

    pub fn is_owned_by(&self, wallet: &str) -> bool {
        self.owner.eq_ignore_ascii_case(wallet.trim())
    }
}

// ─── ChainEvent ───────────────────────────────────────────────────────────────

/// The idempotency key of one blockchain log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: u64,
    pub tx_hash: String,
    pub log_index: u32,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

/// Application marker of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    /// Recorded, effect not yet (or not successfully) applied.
    Observed,
    /// Effect applied.
    Applied,
}

impl ApplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Applied => "applied",
        }
    }
}

impl FromStr for ApplyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(Self::Observed),
            "applied" => Ok(Self::Applied),
            other => Err(format!("unknown apply state '{other}'")),
        }
    }
}

/// Immutable record of one observed contract log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain_id: u64,
    /// Transaction hash (lowercase `0x…`).
    pub tx_hash: String,
    pub log_index: u32,
    /// Contract that emitted the log (lowercase `0x…`).
    pub address: String,
    /// Event name, e.g. `"ProjectCreated"`.
    pub event_name: String,
    pub on_chain_project_id: Option<u64>,
    /// Decoded arguments keyed by ABI parameter name.
    pub payload: serde_json::Value,
    pub block_number: u64,
    /// Unix timestamp of the block (seconds).
    pub block_timestamp: i64,
}

impl ChainEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }
}

// ─── Ratings & funding ────────────────────────────────────────────────────────

/// One rater's latest star value for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    pub on_chain_project_id: u64,
    pub rater: String,
    pub stars: u8,
    /// Log position of the rating; a rating only replaces an older one.
    pub block_number: u64,
    pub log_index: u32,
}

/// Derived rating summary, one row per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingAggregate {
    pub on_chain_project_id: u64,
    pub average: f64,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only donation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    pub on_chain_project_id: u64,
    pub funder: String,
    /// Amount in token base units.
    pub amount: u128,
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
}

/// Derived funding summary, one row per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingAggregate {
    pub on_chain_project_id: u64,
    /// Exact cumulative total in base units.
    pub total_base_units: u128,
    /// Cumulative total in display units.
    pub total: f64,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

// ─── Ledger reads & transactions ──────────────────────────────────────────────

/// Point-in-time view of a project as the registry contract reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainProject {
    pub on_chain_project_id: u64,
    pub owner: String,
    pub status: OnChainStatus,
    pub rating_count: u64,
    pub rating_sum: u64,
    pub total_donated: u128,
    pub certificate_token_id: Option<u64>,
}

impl OnChainProject {
    pub fn average_rating(&self) -> f64 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.rating_count as f64
        }
    }
}

/// An unsigned transaction for a client-side signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDescriptor {
    pub to: String,
    /// ABI-encoded calldata (`0x…`).
    pub data: String,
    pub chain_id: u64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
