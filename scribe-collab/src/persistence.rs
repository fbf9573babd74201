//! Bridge between live documents and the durable store.
//!
//! ```text
//!   DocUpdate ──► schedule_save(doc) ──► [quiet period timer, re-armed per update]
//!                                                   │ expires
//!                                                   ▼
//!                                        save job (one in flight per doc)
//!                                                   │ spawn_blocking
//!                                                   ▼
//!                                           SnapshotStore::save
//! ```
//!
//! Loads and saves never run on the editing path: the store is called on the
//! blocking pool, and a save reads the document state when it runs, so a
//! burst of updates collapses into one write of the latest state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::document::{DocumentId, ReplicatedDocument};
use crate::storage::{PersistedSnapshot, SnapshotStore, StoreError};

/// Default quiet period before a save.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(2);

/// Shared handle to a live document.
pub type SharedDocument = Arc<Mutex<ReplicatedDocument>>;

/// Counters exposed through server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub loads: u64,
    pub load_failures: u64,
    pub saves: u64,
    pub failed_saves: u64,
}

#[derive(Default)]
struct AtomicPersistenceStats {
    loads: AtomicU64,
    load_failures: AtomicU64,
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

/// The armed timer for one document.
struct PendingSave {
    timer: JoinHandle<()>,
    generation: u64,
}

struct Inner {
    store: Arc<dyn SnapshotStore>,
    quiet_period: Duration,
    pending: Mutex<HashMap<DocumentId, PendingSave>>,
    /// Held for the duration of a save; serializes saves per document.
    in_flight: std::sync::Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
    stats: AtomicPersistenceStats,
}

/// Debounced load/save coordinator. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceBridge {
    inner: Arc<Inner>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn SnapshotStore>, quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                quiet_period,
                pending: Mutex::new(HashMap::new()),
                in_flight: std::sync::Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                stats: AtomicPersistenceStats::default(),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    /// Build the initial document for `doc_id`.
    ///
    /// Never fails: store errors and corrupt state are logged and yield an
    /// empty document.
    pub async fn load(&self, doc_id: &DocumentId) -> ReplicatedDocument {
        let store = self.inner.store.clone();
        let id = doc_id.clone();
        let result = tokio::task::spawn_blocking(move || store.load(&id)).await;
        self.inner.stats.loads.fetch_add(1, Ordering::Relaxed);

        let snapshot = match result {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                self.inner.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to load document {doc_id}, starting empty: {e}");
                None
            }
            Err(e) => {
                self.inner.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Load task for document {doc_id} failed, starting empty: {e}");
                None
            }
        };

        restore(doc_id, snapshot)
    }

    /// Arm (or re-arm) the save timer for `doc_id`.
    pub async fn schedule_save(&self, doc_id: &DocumentId, doc: SharedDocument) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.inner.pending.lock().await;

        if let Some(previous) = pending.remove(doc_id) {
            previous.timer.abort();
        }

        let inner = self.inner.clone();
        let id = doc_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.quiet_period).await;
            {
                let mut pending = inner.pending.lock().await;
                match pending.get(&id) {
                    Some(current) if current.generation == generation => {
                        pending.remove(&id);
                    }
                    _ => return,
                }
            }
            // Detached so that a later re-arm cannot abort a running save.
            tokio::spawn(async move {
                let _ = inner.save(&id, &doc).await;
            });
        });

        pending.insert(doc_id.clone(), PendingSave { timer, generation });
    }

    /// Whether a save timer is armed for `doc_id`.
    pub async fn has_pending(&self, doc_id: &DocumentId) -> bool {
        self.inner.pending.lock().await.contains_key(doc_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Save now if a timer is armed, otherwise wait out any running save.
    ///
    /// Returns `true` if this call wrote to the store.
    pub async fn flush(&self, doc_id: &DocumentId, doc: &SharedDocument) -> bool {
        let armed = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(doc_id).map(|p| p.timer.abort()).is_some()
        };

        if armed {
            self.inner.save(doc_id, doc).await.is_ok()
        } else {
            let lock = self.inner.in_flight_lock(doc_id);
            let _guard = lock.lock().await;
            false
        }
    }

    /// Cancel any armed timer and save immediately.
    pub async fn save_now(&self, doc_id: &DocumentId, doc: &SharedDocument) -> Result<(), StoreError> {
        if let Some(previous) = self.inner.pending.lock().await.remove(doc_id) {
            previous.timer.abort();
        }
        self.inner.save(doc_id, doc).await
    }

    /// Drop per-document bookkeeping for an evicted document.
    pub fn forget(&self, doc_id: &DocumentId) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(doc_id);
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        let stats = &self.inner.stats;
        PersistenceStats {
            loads: stats.loads.load(Ordering::Relaxed),
            load_failures: stats.load_failures.load(Ordering::Relaxed),
            saves: stats.saves.load(Ordering::Relaxed),
            failed_saves: stats.failed_saves.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn in_flight_lock(&self, doc_id: &DocumentId) -> Arc<Mutex<()>> {
        match self.in_flight.lock() {
            Ok(mut map) => map.entry(doc_id.clone()).or_default().clone(),
            // Poisoned: fall back to an unshared lock rather than skip saving.
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    async fn save(&self, doc_id: &DocumentId, doc: &SharedDocument) -> Result<(), StoreError> {
        let lock = self.in_flight_lock(doc_id);
        let _guard = lock.lock().await;

        let snapshot = {
            let doc = doc.lock().await;
            PersistedSnapshot::new(doc.blocks(), doc.encode_full_state())
        };
        let block_count = snapshot.blocks.len();

        let store = self.store.clone();
        let id = doc_id.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&id, &snapshot))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("save task failed: {e}"))));

        match &result {
            Ok(()) => {
                self.stats.saves.fetch_add(1, Ordering::Relaxed);
                log::info!("Saved document {doc_id} ({block_count} blocks)");
            }
            Err(e) => {
                self.stats.failed_saves.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save document {doc_id}: {e}");
            }
        }
        result
    }
}

/// Initial document from what the store returned.
fn restore(doc_id: &DocumentId, snapshot: Option<PersistedSnapshot>) -> ReplicatedDocument {
    let Some(snapshot) = snapshot else {
        log::info!("Document {doc_id} not found in store, starting empty");
        return ReplicatedDocument::new();
    };

    if let Some(state) = &snapshot.crdt_state {
        return match ReplicatedDocument::from_state(state) {
            Ok(doc) => {
                log::info!("Loaded document {doc_id} from CRDT state ({} bytes)", state.len());
                doc
            }
            Err(e) => {
                log::error!("Corrupt CRDT state for document {doc_id}, starting empty: {e}");
                ReplicatedDocument::new()
            }
        };
    }

    if snapshot.blocks.is_empty() {
        return ReplicatedDocument::new();
    }

    let blocks = snapshot.sanitized_blocks();
    log::info!("Loaded document {doc_id} from {} stored blocks", blocks.len());
    ReplicatedDocument::from_blocks(&blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, BlockKind};
    use crate::storage::{MemoryStore, StoredBlock};

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn load(&self, _: &DocumentId) -> Result<Option<PersistedSnapshot>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn save(&self, _: &DocumentId, _: &PersistedSnapshot) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn bridge(store: Arc<dyn SnapshotStore>, millis: u64) -> PersistenceBridge {
        PersistenceBridge::new(store, Duration::from_millis(millis))
    }

    fn shared(doc: ReplicatedDocument) -> SharedDocument {
        Arc::new(Mutex::new(doc))
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let doc = bridge(store.clone(), 10).load(&"new".into()).await;
        assert_eq!(doc.block_count(), 0);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_load_prefers_crdt_state() {
        let store = Arc::new(MemoryStore::new());
        let live = ReplicatedDocument::from_blocks(&[Block::paragraph("from-state", "x")]);
        store.insert(
            "doc",
            PersistedSnapshot {
                blocks: vec![Block::paragraph("from-blocks", "y").into()],
                crdt_state: Some(live.encode_full_state()),
                updated_at: 1,
            },
        );

        let doc = bridge(store, 10).load(&"doc".into()).await;
        assert_eq!(doc.blocks(), vec![Block::paragraph("from-state", "x")]);
    }

    #[tokio::test]
    async fn test_load_legacy_blocks_strips_store_ids() {
        let store = Arc::new(MemoryStore::new());
        let stored: Vec<StoredBlock> = serde_json::from_str(
            r#"[{"_id":"1","id":"h","type":"heading1","content":"T"},
                {"_id":"2","id":"p","type":"paragraph","content":"body"}]"#,
        )
        .unwrap();
        store.insert("legacy", PersistedSnapshot::legacy(stored));

        let doc = bridge(store, 10).load(&"legacy".into()).await;
        assert_eq!(
            doc.blocks(),
            vec![
                Block::new("h", BlockKind::Heading1, "T"),
                Block::paragraph("p", "body"),
            ]
        );
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "bad",
            PersistedSnapshot {
                blocks: vec![Block::paragraph("ignored", "")].into_iter().map(Into::into).collect(),
                crdt_state: Some(vec![0xFF, 0xFF, 0xFF]),
                updated_at: 1,
            },
        );
        let doc = bridge(store, 10).load(&"bad".into()).await;
        assert_eq!(doc.block_count(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_starts_empty() {
        let bridge = bridge(Arc::new(FailingStore), 10);
        let doc = bridge.load(&"x".into()).await;
        assert_eq!(doc.block_count(), 0);
        assert_eq!(bridge.stats().load_failures, 1);
    }

    #[tokio::test]
    async fn test_burst_collapses_to_one_save_of_latest_state() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(store.clone(), 80);
        let id = DocumentId::from("doc");
        let doc = shared(ReplicatedDocument::new());

        for i in 0..5 {
            doc.lock().await.push_block(&Block::paragraph(format!("b{i}"), "x"), None);
            bridge.schedule_save(&id, doc.clone()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(bridge.has_pending(&id).await);
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.save_count(), 1);
        assert!(!bridge.has_pending(&id).await);

        let saved = store.get(&id).unwrap();
        assert_eq!(saved.blocks.len(), 5);
        let reloaded = ReplicatedDocument::from_state(saved.crdt_state.as_ref().unwrap()).unwrap();
        assert_eq!(reloaded.blocks(), doc.lock().await.blocks());
    }

    #[tokio::test]
    async fn test_flush_saves_pending_immediately() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(store.clone(), 60_000);
        let id = DocumentId::from("doc");
        let doc = shared(ReplicatedDocument::from_blocks(&[Block::paragraph("a", "1")]));

        assert!(!bridge.flush(&id, &doc).await);
        assert_eq!(store.save_count(), 0);

        bridge.schedule_save(&id, doc.clone()).await;
        assert!(bridge.flush(&id, &doc).await);
        assert_eq!(store.save_count(), 1);
        assert!(!bridge.has_pending(&id).await);
    }

    #[tokio::test]
    async fn test_failed_save_is_counted_not_retried() {
        let bridge = bridge(Arc::new(FailingStore), 20);
        let id = DocumentId::from("doc");
        let doc = shared(ReplicatedDocument::new());

        bridge.schedule_save(&id, doc.clone()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = bridge.stats();
        assert_eq!(stats.failed_saves, 1);
        assert_eq!(stats.saves, 0);
        assert!(!bridge.has_pending(&id).await);
    }

    #[tokio::test]
    async fn test_save_now_cancels_timer() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(store.clone(), 50);
        let id = DocumentId::from("doc");
        let doc = shared(ReplicatedDocument::new());

        bridge.schedule_save(&id, doc.clone()).await;
        bridge.save_now(&id, &doc).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count(), 1);
    }
}
