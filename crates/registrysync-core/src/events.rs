//! Typed registry events parsed from a [`ChainEvent`] payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::types::{normalize_address, ChainEvent};

/// The registry event types the indexer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    ProjectCreated,
    ProjectApproved,
    ApprovalMinted,
    Rated,
    Funded,
}

impl EventKind {
    /// All kinds, in dependency order (binding first).
    pub const ALL: [EventKind; 5] = [
        EventKind::ProjectCreated,
        EventKind::ProjectApproved,
        EventKind::ApprovalMinted,
        EventKind::Rated,
        EventKind::Funded,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "ProjectCreated",
            Self::ProjectApproved => "ProjectApproved",
            Self::ApprovalMinted => "ApprovalMinted",
            Self::Rated => "Rated",
            Self::Funded => "Funded",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registry event with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ProjectCreated {
        project_id: u64,
        owner: String,
        metadata_uri: String,
    },
    ProjectApproved {
        project_id: u64,
    },
    ApprovalMinted {
        project_id: u64,
        token_id: u64,
        to: String,
    },
    Rated {
        project_id: u64,
        rater: String,
        stars: u8,
    },
    Funded {
        project_id: u64,
        funder: String,
        amount: u128,
    },
}

impl RegistryEvent {
    /// Parse the decoded payload of a recorded event.
    pub fn from_chain_event(event: &ChainEvent) -> Result<Self, SyncError> {
        let kind = EventKind::from_name(&event.event_name).ok_or_else(|| {
            SyncError::Decode(format!("untracked event '{}'", event.event_name))
        })?;
        let p = &event.payload;

        let parsed = match kind {
            EventKind::ProjectCreated => Self::ProjectCreated {
                project_id: uint_field(p, "projectId")?,
                owner: address_field(p, "owner")?,
                metadata_uri: str_field(p, "metadataUri")?.to_string(),
            },
            EventKind::ProjectApproved => Self::ProjectApproved {
                project_id: uint_field(p, "projectId")?,
            },
            EventKind::ApprovalMinted => Self::ApprovalMinted {
                project_id: uint_field(p, "projectId")?,
                token_id: uint_field(p, "tokenId")?,
                to: address_field(p, "to")?,
            },
            EventKind::Rated => {
                let stars: u8 = uint_field(p, "stars")?;
                if !(1..=5).contains(&stars) {
                    return Err(SyncError::Decode(format!("stars out of range: {stars}")));
                }
                Self::Rated {
                    project_id: uint_field(p, "projectId")?,
                    rater: address_field(p, "rater")?,
                    stars,
                }
            }
            EventKind::Funded => Self::Funded {
                project_id: uint_field(p, "projectId")?,
                funder: address_field(p, "funder")?,
                amount: uint_field(p, "amount")?,
            },
        };
        Ok(parsed)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProjectCreated { .. } => EventKind::ProjectCreated,
            Self::ProjectApproved { .. } => EventKind::ProjectApproved,
            Self::ApprovalMinted { .. } => EventKind::ApprovalMinted,
            Self::Rated { .. } => EventKind::Rated,
            Self::Funded { .. } => EventKind::Funded,
        }
    }

    /// The on-chain project id every registry event carries.
    pub fn project_id(&self) -> u64 {
        match self {
            Self::ProjectCreated { project_id, .. }
            | Self::ProjectApproved { project_id }
            | Self::ApprovalMinted { project_id, .. }
            | Self::Rated { project_id, .. }
            | Self::Funded { project_id, .. } => *project_id,
        }
    }
}

fn str_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str, SyncError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Decode(format!("missing string field '{name}'")))
}

fn address_field(payload: &Value, name: &str) -> Result<String, SyncError> {
    str_field(payload, name).map(normalize_address)
}

/// Unsigned integers arrive as decimal strings; plain JSON numbers are accepted too.
fn uint_field<T: FromStr>(payload: &Value, name: &str) -> Result<T, SyncError> {
    let raw = match payload.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(SyncError::Decode(format!("missing integer field '{name}'"))),
    };
    raw.parse()
        .map_err(|_| SyncError::Decode(format!("field '{name}' out of range: {raw}")))
}
