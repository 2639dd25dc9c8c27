//! # codraft — Real-time collaborative document sync core
//!
//! CRDT-backed synchronization for rich-text documents: local and remote
//! edits merge conflict-free, presence rides alongside, snapshots persist
//! on a timer, and a streaming applier feeds generated markup into the
//! shared document block by block.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Envelope (JSON)   ┌──────────────┐
//! │ CollabSession│ ◄────────────────► │ Broadcast    │
//! │  (per user)  │   pub/sub frames   │ channel      │
//! └──────┬───────┘                    └──────────────┘
//!        │                              local relay │
//!   ┌────┴─────────────┐                or WebSocket│
//!   ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ DocumentStore│  │ Awareness    │  │ Persistence  │
//! │ (Yrs doc)    │  │ (presence)   │  │ (snapshots)  │
//! └──────▲───────┘  └──────────────┘  └──────┬───────┘
//!        │                                   ▼
//! ┌──────┴───────┐                    ┌──────────────┐
//! │ Streaming    │                    │ RocksDB /    │
//! │ applier (AI) │                    │ MemoryStore  │
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — wire payload codec with legacy-shape compatibility
//! - [`protocol`] — JSON envelope carried on the broadcast channel
//! - [`document`] — CRDT document store with origin-tagged updates
//! - [`awareness`] — ephemeral presence with staleness eviction
//! - [`channel`] — broadcast channel abstraction (in-process, WebSocket)
//! - [`transport`] — sync adapter binding stores to a channel
//! - [`persistence`] — timer-driven full-snapshot durability
//! - [`storage`] — RocksDB snapshot backend
//! - [`applier`] — streaming markup-to-document applier
//! - [`session`] — caller-owned session tying it all together

pub mod applier;
pub mod awareness;
pub mod channel;
pub mod codec;
pub mod document;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use applier::{ApplierConfig, ApplierStats, DocNode, NodeConverter, StreamParseError,
    StreamingApplier, TextConverter};
pub use awareness::{AwarenessStore, PeerRecord, PresenceDelta, PresenceState, PresenceStatus,
    UserInfo};
pub use channel::local::{LocalChannel, LocalRelay, RelayStats};
pub use channel::ws::{WsChannel, WsConfig};
pub use channel::{BroadcastChannel, ChannelError, ChannelStatus, Frame};
pub use codec::{CodecError, WireValue};
pub use document::{DocumentStore, Origin, Subscription, Update};
pub use persistence::{MemoryStore, PersistedSnapshot, PersistenceError, PersistenceManager,
    SnapshotStore};
pub use protocol::{Envelope, EventKind};
pub use session::{CollabSession, SessionConfig};
pub use storage::{RocksStore, StoreConfig};
pub use transport::{SyncStatus, SyncTransport, TransportConfig};
