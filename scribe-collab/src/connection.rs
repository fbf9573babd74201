//! Per-socket lifecycle.
//!
//! ```text
//! CONNECTING ──attach──► SYNCING ──step1 (+ awareness)──► ACTIVE ──close/error──► CLOSED
//! ```
//!
//! While ACTIVE the handler multiplexes two sources: frames from its own
//! socket, and frames other connections produced on the same document. Its
//! own frames come back through the same channel and are skipped.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Outbound;
use crate::document::{ConnectionId, DocumentId};
use crate::presence::ClientId;
use crate::protocol::Message;
use crate::registry::{DocumentRegistry, DocumentRoom};
use crate::server::ServerCounters;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Syncing,
    Active,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives one WebSocket bound to one document.
pub struct ConnectionHandler {
    id: ConnectionId,
    doc_id: DocumentId,
    registry: Arc<DocumentRegistry>,
    counters: Arc<ServerCounters>,
    state: ConnectionState,
    /// Awareness clients this connection introduced; removed on close.
    client_ids: HashSet<ClientId>,
}

impl ConnectionHandler {
    pub(crate) fn new(doc_id: DocumentId, registry: Arc<DocumentRegistry>, counters: Arc<ServerCounters>) -> Self {
        Self {
            id: ConnectionId::new(),
            doc_id,
            registry,
            counters,
            state: ConnectionState::Connecting,
            client_ids: HashSet::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until the socket closes, then clean up.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.counters.connection_opened();
        let (room, feed) = self.registry.attach(&self.doc_id, self.id).await;
        log::info!("Connection {} joined {}", self.id, self.doc_id);

        if let Err(e) = self.serve(&room, ws, feed).await {
            log::warn!("Connection {} on {} failed: {e}", self.id, self.doc_id);
        }

        self.set_state(ConnectionState::Closed);
        self.cleanup(&room).await;
        self.counters.connection_closed();
        log::info!("Connection {} left {}", self.id, self.doc_id);
    }

    async fn serve<S>(
        &mut self,
        room: &Arc<DocumentRoom>,
        ws: WebSocketStream<S>,
        mut feed: broadcast::Receiver<Outbound>,
    ) -> Result<(), tungstenite::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        self.set_state(ConnectionState::Syncing);
        let step1 = Message::sync_step1(room.state_vector().await);
        ws_sender.send(WsMessage::Binary(step1.encode().into())).await?;
        if let Some(snapshot) = room.awareness_snapshot().await {
            ws_sender
                .send(WsMessage::Binary(Message::awareness(snapshot).encode().into()))
                .await?;
        }
        self.set_state(ConnectionState::Active);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(data))) => {
                            if let Some(reply) = self.handle_frame(room, &data).await {
                                ws_sender.send(WsMessage::Binary(reply.encode().into())).await?;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(other)) => {
                            log::debug!("Ignoring non-binary frame from {}: {other:?}", self.id);
                        }
                        Some(Err(e)) => return Err(e),
                    }
                }

                outbound = feed.recv() => {
                    match outbound {
                        Ok(outbound) => {
                            if outbound.is_echo_for(self.id) {
                                continue;
                            }
                            ws_sender.send(WsMessage::Binary(outbound.frame.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Connection {} lagged by {skipped} frames, resending full state", self.id);
                            room.broadcast().record_dropped(skipped);
                            let resync = Message::sync_step2(room.full_state().await);
                            ws_sender.send(WsMessage::Binary(resync.encode().into())).await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Dispatch one inbound frame; returns the reply, if any.
    async fn handle_frame(&mut self, room: &DocumentRoom, data: &[u8]) -> Option<Message> {
        self.counters.frame_received(data.len());

        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping frame from {} on {}: {e}", self.id, self.doc_id);
                return None;
            }
        };

        match message {
            Message::Sync(sync) => match room.handle_sync(&sync, self.id).await {
                Ok(reply) => reply.map(Message::Sync),
                Err(e) => {
                    log::warn!("Rejected sync frame from {} on {}: {e}", self.id, self.doc_id);
                    None
                }
            },
            Message::Awareness(payload) => {
                match room.apply_awareness(&payload, self.id).await {
                    Ok(change) => {
                        self.client_ids.extend(change.added.iter().chain(&change.updated).copied());
                    }
                    Err(e) => {
                        log::warn!("Rejected awareness frame from {} on {}: {e}", self.id, self.doc_id);
                    }
                }
                None
            }
        }
    }

    async fn cleanup(&mut self, room: &Arc<DocumentRoom>) {
        let client_ids: Vec<ClientId> = self.client_ids.drain().collect();
        if !client_ids.is_empty() {
            let change = room.remove_presence(&client_ids, Some(self.id)).await;
            log::debug!("Removed {} presence entries for {}", change.removed.len(), self.id);
        }
        self.registry.detach(room, self.id).await;
    }

    fn set_state(&mut self, next: ConnectionState) {
        log::trace!("Connection {}: {} -> {next}", self.id, self.state);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, ReplicatedDocument};
    use crate::persistence::PersistenceBridge;
    use crate::protocol::SyncMessage;
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn next_message(client: &mut WebSocketStream<DuplexStream>) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .expect("websocket error");
            if let WsMessage::Binary(data) = frame {
                return Message::decode(&data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_peer_is_resynced_with_full_state() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let registry = Arc::new(DocumentRegistry::new(bridge, 2, false));
        let counters = Arc::new(ServerCounters::default());
        let doc_id = DocumentId::from("slow");

        // A tiny pipe stalls the handler on its first relayed frame.
        let (server_io, client_io) = tokio::io::duplex(64);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let handler = ConnectionHandler::new(doc_id.clone(), registry.clone(), counters);
        tokio::spawn(handler.run(server_ws));

        assert!(matches!(next_message(&mut client).await, Message::Sync(SyncMessage::Step1(_))));

        let room = registry.get(&doc_id).await.unwrap();
        for i in 0..20 {
            room.push_block(&Block::paragraph(format!("b{i}"), "x".repeat(64))).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = loop {
            if let Message::Sync(SyncMessage::Step2(state)) = next_message(&mut client).await {
                break state;
            }
        };
        let replica = ReplicatedDocument::from_state(&state).unwrap();
        assert_eq!(replica.blocks(), room.blocks().await);
        assert_eq!(replica.block_count(), 20);
        assert!(room.broadcast().stats().await.messages_dropped > 0);
    }
}
