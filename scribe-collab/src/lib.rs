//! # scribe-collab — Real-time collaboration server for block documents
//!
//! Keeps one authoritative CRDT replica per document, relays edits and
//! presence between the WebSocket clients editing it, and mirrors it to a
//! durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   y-protocols frames   ┌───────────────────┐
//! │ Editor      │ ◄────────────────────► │ ConnectionHandler │
//! │ (yjs/yrs)   │     WebSocket /doc     └─────────┬─────────┘
//! └─────────────┘                                  │
//!                                                  ▼
//!                                         ┌─────────────────┐
//!                                         │ DocumentRoom    │
//!                                         │  ├ Replicated   │──► PersistenceBridge ──► SnapshotStore
//!                                         │  │ Document     │     (debounced)
//!                                         │  ├ Awareness    │
//!                                         │  └ Broadcast    │──► other connections
//!                                         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (sync steps, awareness)
//! - [`presence`] — Awareness updates and the per-document presence table
//! - [`document`] — Block model and the replicated document
//! - [`broadcast`] — Fan-out with origin filtering and lag detection
//! - [`storage`] — Snapshot store trait, in-memory and RocksDB stores
//! - [`persistence`] — Debounced load/save bridge
//! - [`registry`] — Single-flight document rooms, attach/detach, eviction
//! - [`connection`] — Per-socket state machine
//! - [`server`] — WebSocket listener and configuration

pub mod broadcast;
pub mod connection;
pub mod document;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use connection::{ConnectionHandler, ConnectionState};
pub use document::{
    Block, BlockKind, ConnectionId, DocUpdate, DocumentError, DocumentId, ReplicatedDocument,
    BLOCKS_ROOT,
};
pub use persistence::{PersistenceBridge, PersistenceStats, SharedDocument, DEFAULT_QUIET_PERIOD};
pub use presence::{
    AwarenessChange, AwarenessEntry, AwarenessError, AwarenessTracker, AwarenessUpdate, ClientId,
    ClientUpdate, PresenceState,
};
pub use protocol::{Message, MessageType, ProtocolError, SyncMessage};
pub use registry::{DocumentRegistry, DocumentRoom};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, MemoryStore, PersistedSnapshot, RocksStore, SnapshotStore, StoreConfig,
    StoreError, StoredBlock,
};
