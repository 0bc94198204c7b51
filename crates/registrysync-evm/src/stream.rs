//! Tracked log streams: one `(contract, event)` pair each.

use registrysync_core::events::EventKind;
use registrysync_core::types::normalize_address;

use crate::abi::EventSchema;

/// One `(address, event)` pair polled by the index loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStream {
    /// Checkpoint key, `"<address>:<EventName>"`.
    pub id: String,
    pub address: String,
    pub schema: EventSchema,
    pub topic0: String,
}

impl LogStream {
    pub fn new(address: &str, kind: EventKind) -> Self {
        let address = normalize_address(address);
        let schema = EventSchema::for_kind(kind);
        Self {
            id: format!("{address}:{}", kind.name()),
            topic0: schema.topic0(),
            address,
            schema,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.schema.kind
    }

    /// Every tracked stream. `ApprovalMinted` comes from the certificate
    /// contract, which may be the registry itself.
    pub fn standard(registry: &str, certificate: &str) -> Vec<Self> {
        EventKind::ALL
            .into_iter()
            .map(|kind| match kind {
                EventKind::ApprovalMinted => Self::new(certificate, kind),
                _ => Self::new(registry, kind),
            })
            .collect()
    }
}
