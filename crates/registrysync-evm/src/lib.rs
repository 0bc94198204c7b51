//! registrysync-evm: JSON-RPC ledger client, registry ABI, index loop and
//! transaction encoder.

pub mod abi;
pub mod builder;
pub mod fetcher;
pub mod index_loop;
pub mod ledger;
pub mod rpc;
pub mod stream;
pub mod tx;

pub use abi::EventSchema;
pub use builder::IndexerBuilder;
pub use fetcher::RawLog;
pub use index_loop::{CycleReport, IndexLoop};
pub use ledger::{EvmLedger, LedgerClient};
pub use rpc::{HttpTransport, RpcTransport, TransportError};
pub use stream::LogStream;
pub use tx::EvmTxEncoder;
