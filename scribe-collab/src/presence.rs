//! Presence protocol: who is connected and which block they are focused on.
//!
//! Presence is ephemeral. It lives only in the per-document
//! [`AwarenessTracker`] and is never written to the durable store.
//!
//! ## Wire format
//!
//! The payload of an AWARENESS frame is a y-protocols awareness update:
//!
//! ```text
//! varuint count
//! repeat count × ┌───────────┬─────────┬──────────────────────────────┐
//!                │ client_id │ clock   │ state                        │
//!                │ varuint   │ varuint │ varstring (JSON or "null")   │
//!                └───────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! A `null` state is a tombstone: the client left. Clocks are per client and
//! monotonically increasing; a higher clock always wins, and an equal clock
//! only wins when it removes a live entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Awareness client identifier (the Yjs `clientID` of the sender).
pub type ClientId = u64;

// ───────────────────────────────────────────────────────────────────
// Presence record
// ───────────────────────────────────────────────────────────────────

/// The presence record a client publishes.
///
/// Unknown JSON fields are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// CSS color string, e.g. `"#e91e63"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Block currently focused by the user, `null` when none.
    pub focused_block_id: Option<String>,
}

impl PresenceState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            color: Some(color.into()),
            focused_block_id: None,
        }
    }

    pub fn with_focus(mut self, block_id: impl Into<String>) -> Self {
        self.focused_block_id = Some(block_id.into());
        self
    }
}

/// A live presence entry as seen by readers of the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub state: PresenceState,
}

// ───────────────────────────────────────────────────────────────────
// Wire update
// ───────────────────────────────────────────────────────────────────

/// One client's slot inside an [`AwarenessUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUpdate {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` is a tombstone.
    pub state: Option<PresenceState>,
}

/// Decoded awareness payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub clients: Vec<ClientUpdate>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.clients.len() as u64);
        for client in &self.clients {
            buf.write_var(client.client_id);
            buf.write_var(client.clock);
            let json = match &client.state {
                Some(state) => serde_json::to_string(state).unwrap_or_else(|_| "null".into()),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let mut cursor = Cursor::new(bytes);
        let count: u64 = cursor.read_var()?;
        let mut clients = Vec::new();
        for _ in 0..count {
            let client_id: ClientId = cursor.read_var()?;
            let clock: u64 = cursor.read_var()?;
            let json = cursor.read_string()?;
            let state = match serde_json::from_str::<Option<PresenceState>>(json) {
                Ok(state) => state,
                Err(e) => return Err(AwarenessError::InvalidState { client_id, reason: e.to_string() }),
            };
            clients.push(ClientUpdate { client_id, clock, state });
        }
        Ok(Self { clients })
    }
}

/// Awareness decode errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AwarenessError {
    #[error("malformed awareness update: {0}")]
    Malformed(String),
    #[error("invalid presence state for client {client_id}: {reason}")]
    InvalidState { client_id: ClientId, reason: String },
}

impl From<yrs::encoding::read::Error> for AwarenessError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        AwarenessError::Malformed(e.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Which client entries an operation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, in added → updated → removed order.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct ClientMeta {
    clock: u64,
    state: Option<PresenceState>,
}

/// Per-document presence table.
///
/// Clock metadata survives removal so that stale, delayed updates for a
/// departed client cannot resurrect it.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    clients: HashMap<ClientId, ClientMeta>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a remote update using clock ordering.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for incoming in &update.clients {
            // First sight of a client is accepted at any clock.
            let (newer, removes_live, had_state) = match self.clients.get(&incoming.client_id) {
                Some(meta) => (
                    meta.clock < incoming.clock,
                    meta.clock == incoming.clock && incoming.state.is_none() && meta.state.is_some(),
                    meta.state.is_some(),
                ),
                None => (true, false, false),
            };
            if !newer && !removes_live {
                continue;
            }

            match (&incoming.state, had_state) {
                (Some(_), false) => change.added.push(incoming.client_id),
                (Some(_), true) => change.updated.push(incoming.client_id),
                (None, true) => change.removed.push(incoming.client_id),
                (None, false) => {}
            }

            self.clients.insert(
                incoming.client_id,
                ClientMeta {
                    clock: incoming.clock,
                    state: incoming.state.clone(),
                },
            );
        }

        change
    }

    /// Set a client's presence on the server side, bumping its clock.
    pub fn set_state(&mut self, client_id: ClientId, state: PresenceState) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let clock = match self.clients.get(&client_id) {
            Some(meta) => {
                if meta.state.is_some() {
                    change.updated.push(client_id);
                } else {
                    change.added.push(client_id);
                }
                meta.clock.saturating_add(1)
            }
            None => {
                change.added.push(client_id);
                1
            }
        };
        self.clients.insert(client_id, ClientMeta { clock, state: Some(state) });
        change
    }

    /// Tombstone the given clients. Unknown or already removed ids are skipped.
    pub fn remove_clients<I>(&mut self, ids: I) -> AwarenessChange
    where
        I: IntoIterator<Item = ClientId>,
    {
        let mut change = AwarenessChange::default();
        for id in ids {
            if let Some(meta) = self.clients.get_mut(&id) {
                if meta.state.take().is_some() {
                    // At the ceiling the clock stays put; an equal-clock
                    // null still removes a live entry on peers.
                    meta.clock = meta.clock.saturating_add(1);
                    change.removed.push(id);
                }
            }
        }
        change
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PresenceState> {
        self.clients.get(&client_id).and_then(|m| m.state.as_ref())
    }

    /// Live entries, sorted by client id.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .filter_map(|(id, meta)| {
                meta.state.as_ref().map(|state| AwarenessEntry {
                    client_id: *id,
                    state: state.clone(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        entries
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.clients.values().filter(|m| m.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the current slot of each listed client (tombstones included).
    pub fn encode_clients(&self, ids: &[ClientId]) -> AwarenessUpdate {
        let clients = ids
            .iter()
            .filter_map(|id| {
                self.clients.get(id).map(|meta| ClientUpdate {
                    client_id: *id,
                    clock: meta.clock,
                    state: meta.state.clone(),
                })
            })
            .collect();
        AwarenessUpdate { clients }
    }

    /// Every live entry, for a joining connection.
    pub fn full_update(&self) -> AwarenessUpdate {
        let ids: Vec<ClientId> = self.entries().iter().map(|e| e.client_id).collect();
        self.encode_clients(&ids)
    }
}
