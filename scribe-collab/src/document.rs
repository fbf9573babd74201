//! Replicated block document: the authoritative in-memory CRDT root.
//!
//! ```text
//! remote update ──► apply()  ──┐
//!                              ├─► one yrs transaction ─► DocUpdate { delta, origin }
//! server edit   ──► mutate() ──┘                                │
//!                                                 ┌─────────────┴─────────────┐
//!                                                 ▼                           ▼
//!                                          fan-out to peers          debounced save
//! ```
//!
//! Content is a single yrs array named `"blocks"` holding one map-shaped
//! record per [`Block`]. Every change goes through exactly one transaction,
//! so subscribers always see one coherent delta per change. Convergence is
//! the CRDT's job; this type only frames it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Doc, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::protocol::SyncMessage;

/// Root array name shared with editor clients.
pub const BLOCKS_ROOT: &str = "blocks";

/// v1 encoding of an update that carries no structs and no deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Opaque document identifier, also the connection routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a request target such as `/doc1?token=…`.
    ///
    /// The leading slash and any query string are dropped; an empty path
    /// maps to `"default"`.
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or_default();
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            Self::new("default")
        } else {
            Self::new(name)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one live connection; used as the origin of its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Blocks
// ───────────────────────────────────────────────────────────────────

/// Block type, serialized with the editor's names.
///
/// Unknown names deserialize as [`BlockKind::Paragraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    #[default]
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletList,
    NumberedList,
    Quote,
    CodeBlock,
}

impl BlockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading1 => "heading1",
            BlockKind::Heading2 => "heading2",
            BlockKind::Heading3 => "heading3",
            BlockKind::BulletList => "bulletList",
            BlockKind::NumberedList => "numberedList",
            BlockKind::Quote => "quote",
            BlockKind::CodeBlock => "codeBlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paragraph" => Some(BlockKind::Paragraph),
            "heading1" => Some(BlockKind::Heading1),
            "heading2" => Some(BlockKind::Heading2),
            "heading3" => Some(BlockKind::Heading3),
            "bulletList" => Some(BlockKind::BulletList),
            "numberedList" => Some(BlockKind::NumberedList),
            "quote" => Some(BlockKind::Quote),
            "codeBlock" => Some(BlockKind::CodeBlock),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for BlockKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(BlockKind::parse(&name).unwrap_or_else(|| {
            log::debug!("Unknown block type {name:?}, reading as paragraph");
            BlockKind::Paragraph
        }))
    }
}

/// One content block, the durable projection of a CRDT record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: BlockKind,
    #[serde(default)]
    pub content: String,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
        }
    }

    pub fn paragraph(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, BlockKind::Paragraph, content)
    }

    /// CRDT record for this block: a plain map with `id`, `type`, `content`.
    pub fn to_any(&self) -> Any {
        let mut map = HashMap::with_capacity(3);
        map.insert("id".to_string(), Any::String(self.id.as_str().into()));
        map.insert("type".to_string(), Any::String(self.kind.as_str().into()));
        map.insert("content".to_string(), Any::String(self.content.as_str().into()));
        Any::Map(Arc::new(map))
    }

    /// Read a block back from a CRDT record.
    ///
    /// Only `id`, `type` and `content` are kept; anything else a client
    /// stored on the record is dropped. Records without a string `id` yield
    /// `None`. Unknown types fall back to paragraph.
    pub fn from_any(any: &Any) -> Option<Self> {
        let Any::Map(map) = any else {
            return None;
        };
        let id = match map.get("id") {
            Some(Any::String(id)) => id.to_string(),
            _ => return None,
        };
        let kind = match map.get("type") {
            Some(Any::String(kind)) => BlockKind::parse(kind).unwrap_or_else(|| {
                log::debug!("Unknown block type {kind:?} on block {id}, reading as paragraph");
                BlockKind::Paragraph
            }),
            _ => BlockKind::Paragraph,
        };
        let content = match map.get("content") {
            Some(Any::String(content)) => content.to_string(),
            _ => String::new(),
        };
        Some(Self { id, kind, content })
    }
}

// ───────────────────────────────────────────────────────────────────
// Replicated document
// ───────────────────────────────────────────────────────────────────

/// One committed change: the transaction's delta and who caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    /// v1-encoded update produced by exactly one transaction.
    pub update: Vec<u8>,
    /// Connection whose input produced the change; `None` for server edits.
    pub origin: Option<ConnectionId>,
}

/// Document errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// CRDT root for one document plus its update subscribers.
pub struct ReplicatedDocument {
    doc: Doc,
    blocks: ArrayRef,
    subscribers: Vec<mpsc::UnboundedSender<DocUpdate>>,
}

impl ReplicatedDocument {
    /// Empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let blocks = doc.get_or_insert_array(BLOCKS_ROOT);
        Self {
            doc,
            blocks,
            subscribers: Vec::new(),
        }
    }

    /// Document restored from an exact binary state.
    pub fn from_state(state: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new();
        document.apply(state, None)?;
        Ok(document)
    }

    /// Document seeded from a plain block list, in order.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        let mut document = Self::new();
        document.mutate(None, |txn, array| {
            for block in blocks {
                array.push_back(txn, block.to_any());
            }
        });
        document
    }

    /// Receive every future committed change.
    ///
    /// The channel is unbounded so the mutation path never waits on a
    /// subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DocUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Apply a remote v1 update. Returns `true` if the document changed.
    pub fn apply(&mut self, update: &[u8], origin: Option<ConnectionId>) -> Result<bool, DocumentError> {
        let update = Update::decode_v1(update)?;
        let delta = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
            txn.encode_update_v1()
        };
        Ok(self.emit(delta, origin))
    }

    /// Run `body` inside one transaction over the blocks array.
    pub fn mutate<F, R>(&mut self, origin: Option<ConnectionId>, body: F) -> R
    where
        F: FnOnce(&mut TransactionMut, &ArrayRef) -> R,
    {
        let (result, delta) = {
            let mut txn = self.doc.transact_mut();
            let result = body(&mut txn, &self.blocks);
            (result, txn.encode_update_v1())
        };
        self.emit(delta, origin);
        result
    }

    /// Append a block.
    pub fn push_block(&mut self, block: &Block, origin: Option<ConnectionId>) {
        self.mutate(origin, |txn, array| {
            array.push_back(txn, block.to_any());
        });
    }

    /// Insert a block at `index`, clamped to the current length.
    pub fn insert_block(&mut self, index: u32, block: &Block, origin: Option<ConnectionId>) {
        self.mutate(origin, |txn, array| {
            let index = index.min(array.len(&*txn));
            array.insert(txn, index, block.to_any());
        });
    }

    /// Remove the block with the given id. Returns `false` if absent.
    pub fn remove_block(&mut self, block_id: &str, origin: Option<ConnectionId>) -> bool {
        self.mutate(origin, |txn, array| {
            let position = array
                .iter(&*txn)
                .position(|out| matches!(&out, Out::Any(any) if Block::from_any(any).is_some_and(|b| b.id == block_id)));
            match position {
                Some(index) => {
                    array.remove(txn, index as u32);
                    true
                }
                None => false,
            }
        })
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Exact binary encoding of the whole document.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Process one inbound sync step; returns the reply, if any.
    pub fn handle_sync(
        &mut self,
        message: &SyncMessage,
        origin: Option<ConnectionId>,
    ) -> Result<Option<SyncMessage>, DocumentError> {
        match message {
            SyncMessage::Step1(state_vector) => {
                let diff = self.encode_diff(state_vector)?;
                Ok(Some(SyncMessage::Step2(diff)))
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                self.apply(update, origin)?;
                Ok(None)
            }
        }
    }

    /// Block projection, in document order.
    pub fn blocks(&self) -> Vec<Block> {
        let txn = self.doc.transact();
        self.blocks
            .iter(&txn)
            .filter_map(|out| match out {
                Out::Any(any) => Block::from_any(&any),
                other => Block::from_any(&other.to_json(&txn)),
            })
            .collect()
    }

    pub fn block_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.blocks.len(&txn)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn emit(&mut self, delta: Vec<u8>, origin: Option<ConnectionId>) -> bool {
        if delta.as_slice() == EMPTY_UPDATE {
            return false;
        }
        let event = DocUpdate { update: delta, origin };
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        true
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}
