//! cairn-overlay — the per-sub-protocol overlay engine.
//!
//! Each configured sub-protocol owns one routing table, one radius-bounded
//! content store, the lookup state machines, and the neighborhood gossip
//! pipeline. The transport and bulk-transfer channels are consumed through
//! traits; the daemon (or a test harness) supplies them.

pub mod events;
pub mod gossip;
pub mod history;
pub mod lookup;
pub mod protocol;
pub mod state;
pub mod store;
pub mod table;

pub use events::{EventBus, OverlayEvent, SubscriptionId};
pub use protocol::{
    ContentOutcome, ContentReader, OverlayConfig, OverlayError, OverlayProtocol, SubProtocol,
    Transport, TransferChannel, TransferError, TransportError, VerifyError,
};
pub use store::{MemoryBackend, RadiusStore, SqliteBackend, StorageBackend};
pub use table::RoutingTable;
