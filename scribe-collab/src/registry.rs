//! Document registry: one live room per document id.
//!
//! ```text
//! DocumentRegistry
//!   └── doc_id ──► OnceCell<Arc<DocumentRoom>> + connection count
//!                       │
//!                       ├── ReplicatedDocument (Mutex)  ── DocUpdate ──┐
//!                       ├── AwarenessTracker   (Mutex)                 │ update pump
//!                       └── BroadcastGroup  ◄──────── Outbound ────────┤
//!                                                                      └──► PersistenceBridge
//! ```
//!
//! Creation is single-flight: concurrent first requests for the same id share
//! one cell, so exactly one load runs and every caller receives the same room.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, OnceCell};

use crate::broadcast::{BroadcastGroup, Outbound};
use crate::document::{Block, ConnectionId, DocUpdate, DocumentError, DocumentId};
use crate::persistence::{PersistenceBridge, SharedDocument};
use crate::presence::{AwarenessChange, AwarenessEntry, AwarenessError, AwarenessTracker, AwarenessUpdate, ClientId};
use crate::protocol::{Message, SyncMessage};
use yrs::{ArrayRef, TransactionMut};

/// Everything shared by the connections on one document.
pub struct DocumentRoom {
    id: DocumentId,
    doc: SharedDocument,
    awareness: Mutex<AwarenessTracker>,
    broadcast: BroadcastGroup,
}

impl DocumentRoom {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Process a sync step from `origin`; returns the reply to send back.
    pub async fn handle_sync(
        &self,
        message: &SyncMessage,
        origin: ConnectionId,
    ) -> Result<Option<SyncMessage>, DocumentError> {
        self.doc.lock().await.handle_sync(message, Some(origin))
    }

    /// Edit the document on the server side.
    ///
    /// The change is broadcast to every connection and scheduled for saving
    /// like any client edit.
    pub async fn mutate<F, R>(&self, body: F) -> R
    where
        F: FnOnce(&mut TransactionMut, &ArrayRef) -> R,
    {
        self.doc.lock().await.mutate(None, body)
    }

    pub async fn push_block(&self, block: &Block) {
        self.doc.lock().await.push_block(block, None);
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.doc.lock().await.blocks()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.state_vector()
    }

    pub async fn full_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_full_state()
    }

    /// Merge an awareness payload from `origin` and relay what changed.
    pub async fn apply_awareness(
        &self,
        payload: &[u8],
        origin: ConnectionId,
    ) -> Result<AwarenessChange, AwarenessError> {
        let update = AwarenessUpdate::decode(payload)?;
        let mut tracker = self.awareness.lock().await;
        let change = tracker.apply_update(&update);
        if !change.is_empty() {
            self.relay_awareness(&tracker, &change, Some(origin));
        }
        Ok(change)
    }

    /// Tombstone the given clients and tell the remaining peers.
    pub async fn remove_presence(&self, client_ids: &[ClientId], origin: Option<ConnectionId>) -> AwarenessChange {
        let mut tracker = self.awareness.lock().await;
        let change = tracker.remove_clients(client_ids.iter().copied());
        if !change.is_empty() {
            self.relay_awareness(&tracker, &change, origin);
        }
        change
    }

    /// Encoded awareness table for a joining connection, if anyone is present.
    pub async fn awareness_snapshot(&self) -> Option<Vec<u8>> {
        let tracker = self.awareness.lock().await;
        if tracker.is_empty() {
            None
        } else {
            Some(tracker.full_update().encode())
        }
    }

    pub async fn presence(&self) -> Vec<AwarenessEntry> {
        self.awareness.lock().await.entries()
    }

    fn relay_awareness(&self, tracker: &AwarenessTracker, change: &AwarenessChange, origin: Option<ConnectionId>) {
        let update = tracker.encode_clients(&change.changed_clients());
        self.broadcast.broadcast(origin, &Message::awareness(update.encode()));
    }
}

/// Forward committed updates to peers and the save timer.
///
/// Runs until the room's document is dropped, which closes the channel.
fn spawn_update_pump(room: Weak<DocumentRoom>, mut updates: mpsc::UnboundedReceiver<DocUpdate>, bridge: PersistenceBridge) {
    tokio::spawn(async move {
        while let Some(event) = updates.recv().await {
            let Some(room) = room.upgrade() else {
                break;
            };
            log::trace!("Update of {} bytes on {}", event.update.len(), room.id);
            let frame = Message::update(event.update).encode();
            room.broadcast.broadcast_raw(Outbound::new(event.origin, frame));
            bridge.schedule_save(&room.id, room.doc.clone()).await;
        }
    });
}

struct RegistryEntry {
    cell: Arc<OnceCell<Arc<DocumentRoom>>>,
    connections: usize,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            connections: 0,
        }
    }

    fn holds(&self, room: &Arc<DocumentRoom>) -> bool {
        self.cell.get().is_some_and(|r| Arc::ptr_eq(r, room))
    }
}

/// Owner of every live document room.
pub struct DocumentRegistry {
    entries: Mutex<HashMap<DocumentId, RegistryEntry>>,
    bridge: PersistenceBridge,
    broadcast_capacity: usize,
    evict_idle: bool,
}

impl DocumentRegistry {
    pub fn new(bridge: PersistenceBridge, broadcast_capacity: usize, evict_idle: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            bridge,
            broadcast_capacity,
            evict_idle,
        }
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    /// The room for `doc_id`, loading it on first use.
    pub async fn get_or_create(&self, doc_id: &DocumentId) -> Arc<DocumentRoom> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(doc_id.clone())
                .or_insert_with(RegistryEntry::new)
                .cell
                .clone()
        };
        cell.get_or_init(|| self.create_room(doc_id)).await.clone()
    }

    /// Already loaded room, without creating one.
    pub async fn get(&self, doc_id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        let entries = self.entries.lock().await;
        entries.get(doc_id).and_then(|e| e.cell.get().cloned())
    }

    async fn create_room(&self, doc_id: &DocumentId) -> Arc<DocumentRoom> {
        let mut doc = self.bridge.load(doc_id).await;
        // Subscribe after seeding so the load itself is not re-saved.
        let updates = doc.subscribe();

        let room = Arc::new(DocumentRoom {
            id: doc_id.clone(),
            doc: Arc::new(Mutex::new(doc)),
            awareness: Mutex::new(AwarenessTracker::new()),
            broadcast: BroadcastGroup::new(self.broadcast_capacity),
        });
        spawn_update_pump(Arc::downgrade(&room), updates, self.bridge.clone());

        log::info!("Opened document {doc_id}");
        room
    }

    /// Attach a connection; returns the room and the connection's feed.
    pub async fn attach(
        &self,
        doc_id: &DocumentId,
        conn: ConnectionId,
    ) -> (Arc<DocumentRoom>, broadcast::Receiver<Outbound>) {
        loop {
            let room = self.get_or_create(doc_id).await;
            {
                let mut entries = self.entries.lock().await;
                match entries.get_mut(doc_id) {
                    Some(entry) if entry.holds(&room) => entry.connections += 1,
                    // Evicted between creation and attach; take the new one.
                    _ => continue,
                }
            }
            let rx = room.broadcast.add_peer(conn).await;
            log::debug!("Connection {conn} attached to {doc_id}");
            return (room, rx);
        }
    }

    /// Detach a connection, evicting the room if it became idle.
    pub async fn detach(&self, room: &Arc<DocumentRoom>, conn: ConnectionId) {
        room.broadcast.remove_peer(&conn).await;

        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&room.id) else {
                return;
            };
            if !entry.holds(room) {
                return;
            }
            entry.connections = entry.connections.saturating_sub(1);
            log::debug!("Connection {conn} detached from {} ({} left)", room.id, entry.connections);
            if entry.connections > 0 || !self.evict_idle {
                return;
            }
        }

        self.bridge.flush(&room.id, &room.doc).await;

        let mut entries = self.entries.lock().await;
        let still_idle = match entries.get(&room.id) {
            Some(entry) => entry.holds(room) && entry.connections == 0,
            None => false,
        };
        if still_idle && !self.bridge.has_pending(&room.id).await {
            entries.remove(&room.id);
            self.bridge.forget(&room.id);
            log::info!("Evicted idle document {}", room.id);
        }
    }

    pub async fn connection_count(&self, doc_id: &DocumentId) -> usize {
        self.entries
            .lock()
            .await
            .get(doc_id)
            .map_or(0, |e| e.connections)
    }

    /// Number of loaded documents.
    pub async fn document_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.cell.initialized())
            .count()
    }

    /// Flush every pending save. Returns how many documents were written.
    pub async fn shutdown(&self) -> usize {
        let rooms: Vec<Arc<DocumentRoom>> = {
            let entries = self.entries.lock().await;
            entries.values().filter_map(|e| e.cell.get().cloned()).collect()
        };

        let mut flushed = 0;
        for room in rooms {
            if self.bridge.flush(&room.id, &room.doc).await {
                flushed += 1;
            }
        }
        log::info!("Flushed {flushed} documents on shutdown");
        flushed
    }
}
