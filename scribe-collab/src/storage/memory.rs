//! In-process snapshot store.
//!
//! Used when the server runs without a data directory, and by tests that
//! need to observe how often the bridge touches the store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{PersistedSnapshot, SnapshotStore, StoreError};
use crate::document::DocumentId;

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocumentId, PersistedSnapshot>>,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a save.
    pub fn insert(&self, doc_id: impl Into<DocumentId>, snapshot: PersistedSnapshot) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(doc_id.into(), snapshot);
        }
    }

    /// Current record for `doc_id`, without counting a load.
    pub fn get(&self, doc_id: &DocumentId) -> Option<PersistedSnapshot> {
        self.docs.read().ok()?.get(doc_id).cloned()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Option<PersistedSnapshot>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let docs = self
            .docs
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(docs.get(doc_id).cloned())
    }

    fn save(&self, doc_id: &DocumentId, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut docs = self
            .docs
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        docs.insert(doc_id.clone(), snapshot.clone());
        Ok(())
    }
}
