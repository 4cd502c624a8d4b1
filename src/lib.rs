//! Signed gossip channel, end-to-end encrypted overlay, and chunked
//! file-transfer engine, all built on top of a pluggable graph-store
//! abstraction (a gossip-replicated keyed map).
//!
//! Three layers, each usable on its own:
//! - [`channel`]: identity, presence, signed packets, request/response.
//! - [`overlay`]: automatic per-peer ECDH encryption on top of a channel.
//! - [`transfer`]: chunked file transfer with sweep-based recovery.

pub mod base58check;
pub mod channel;
pub mod crypto;
pub mod envelope;
pub mod graph_store;
pub mod identity;
pub mod overlay;
pub mod seen;
pub mod test_support;
pub mod transfer;

pub use channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, PeerInfo};
pub use graph_store::{Entry, GraphStore, InMemoryGraphStore};
pub use identity::{Identity, IdentityError};
pub use overlay::{EncryptedOverlay, OverlayConfig, OverlayError, OverlayEvent, OverlayPeer};
pub use transfer::{
    generate_code, TransferConfig, TransferEngine, TransferError, TransferEvent, TransferMetadata,
};
