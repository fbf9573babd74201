//! Durable store boundary for collaborative documents.
//!
//! ```text
//! ┌───────────────────┐   load / save    ┌──────────────────────────────┐
//! │ PersistenceBridge │ ───────────────► │ dyn SnapshotStore            │
//! │ (debounced)       │  spawn_blocking  │  ├── MemoryStore (in-process) │
//! └───────────────────┘                  │  └── RocksStore  (RocksDB)    │
//!                                        └──────────────────────────────┘
//! ```
//!
//! The store is a key-value mirror of the live document. A snapshot carries
//! the exact CRDT state (authoritative on reload) and a readable block
//! projection for consumers that do not speak the sync protocol.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

use crate::document::{Block, DocumentId};

/// A block as kept by the store.
///
/// Stores may attach their own record identifier (`_id`); it never becomes
/// part of the replicated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(flatten)]
    pub block: Block,
}

impl StoredBlock {
    /// Drop store-internal fields.
    pub fn sanitize(self) -> Block {
        self.block
    }
}

impl From<Block> for StoredBlock {
    fn from(block: Block) -> Self {
        Self { store_id: None, block }
    }
}

/// Durable representation of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    /// Read projection, in document order.
    pub blocks: Vec<StoredBlock>,
    /// Exact v1 encoding of the CRDT root; absent for legacy documents.
    pub crdt_state: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl PersistedSnapshot {
    /// Snapshot of live state, stamped now.
    pub fn new(blocks: Vec<Block>, crdt_state: Vec<u8>) -> Self {
        Self {
            blocks: blocks.into_iter().map(StoredBlock::from).collect(),
            crdt_state: Some(crdt_state),
            updated_at: now_millis(),
        }
    }

    /// Block-only record, as written by tools that predate CRDT state.
    pub fn legacy(blocks: Vec<StoredBlock>) -> Self {
        Self {
            blocks,
            crdt_state: None,
            updated_at: now_millis(),
        }
    }

    /// Blocks with store-internal fields removed.
    pub fn sanitized_blocks(&self) -> Vec<Block> {
        self.blocks.iter().cloned().map(StoredBlock::sanitize).collect()
    }
}

/// Key-addressed document store.
///
/// Calls are blocking; the bridge runs them on the blocking thread pool.
pub trait SnapshotStore: Send + Sync + 'static {
    /// `Ok(None)` when nothing is stored for `doc_id`.
    fn load(&self, doc_id: &DocumentId) -> Result<Option<PersistedSnapshot>, StoreError>;

    fn save(&self, doc_id: &DocumentId, snapshot: &PersistedSnapshot) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
