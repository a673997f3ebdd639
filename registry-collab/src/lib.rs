//! # registry-collab: Real-time collaborative text editing
//!
//! Several sites edit one shared text buffer concurrently. Each site applies
//! its own edits immediately, publishes them, and integrates edits from other
//! sites by transforming them against the concurrent operations it has
//! already applied.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   CollabMessage    ┌────────────────┐
//! │ CollabSession  │ ◄────────────────► │ CollabSession  │
//! │ (site A)       │   via Transport    │ (site B)       │
//! └───────┬────────┘                    └───────┬────────┘
//!         │                                     │
//!         ▼                                     ▼
//! ┌────────────────┐                    ┌────────────────┐
//! │ DocumentState  │                    │ DocumentState  │
//! │ + Transformer  │                    │ + Transformer  │
//! └────────────────┘                    └────────────────┘
//!         │      locks / versions               │
//!         └──────────► KeyValueStore ◄──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert / delete / replace records and the UI edit shape
//! - [`document`]: Text buffer with append-only applied log
//! - [`transform`]: Operational transformation against a recent window
//! - [`session`]: Per-site coordinator: edits, presence, locks, versions
//! - [`protocol`]: Wire messages (bincode, JSON for the UI)
//! - [`transport`]: Transport trait and the in-process [`LocalHub`]
//! - [`relay`]: WebSocket relay server and client transport
//! - [`storage`]: Key-value store trait, in-memory and RocksDB stores
//! - [`presence`]: Remote cursors and selections
//! - [`events`]: Subscribe / unsubscribe listener registries
//! - [`broadcast`]: Per-channel fan-out
//! - [`clock`]: Unix-millis time and per-site timestamps

pub mod broadcast;
pub mod clock;
pub mod document;
pub mod events;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transform;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ChannelRegistry};
pub use clock::SiteClock;
pub use document::DocumentState;
pub use events::{
    ChangeOrigin, CursorChange, DocumentChange, ListenerRegistry, SelectionChange, Subscription,
};
pub use operation::{LocalEdit, OpKind, Operation, OperationError};
pub use presence::{CursorColor, PresenceMap, RemoteCursor, RemoteSelection};
pub use protocol::{CollabMessage, MessageType, ProtocolError, RelayFrame};
pub use relay::{ConnectionState, RelayConfig, RelayServer, RelayStats, WsTransport};
pub use session::{
    CollabSession, SessionConfig, SessionError, SessionState, SessionStats, VersionSnapshot,
};
pub use storage::{
    lock_key, version_key, KeyValueStore, MemoryStore, RocksStore, StoreConfig, StoreError,
};
pub use transform::{Transformer, WindowPolicy};
pub use transport::{document_channel, LocalHub, MessageStream, Transport, TransportError};
