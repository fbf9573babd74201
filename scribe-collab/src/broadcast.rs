//! Fan-out of encoded frames to every connection on a document.
//!
//! Uses a tokio broadcast channel so a send is O(1) and never waits on a
//! receiver. Each frame carries its origin; receivers skip their own frames,
//! which is how the no-echo rule is enforced. A receiver that falls more than
//! `capacity` frames behind gets `Lagged` and must resynchronize.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use crate::document::ConnectionId;
use crate::protocol::Message;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A pre-encoded frame and the connection that caused it.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// `None` for server-originated frames, delivered to everyone.
    pub origin: Option<ConnectionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Outbound {
    pub fn new(origin: Option<ConnectionId>, frame: Vec<u8>) -> Self {
        Self {
            origin,
            frame: Arc::new(frame),
        }
    }

    /// Whether `peer` produced this frame and must not receive it.
    pub fn is_echo_for(&self, peer: ConnectionId) -> bool {
        self.origin == Some(peer)
    }
}

/// Broadcast group for one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,

    /// Connections currently attached to the document
    peers: RwLock<HashSet<ConnectionId>>,

    /// Frames buffered per receiver before it lags
    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Attach a connection; returns its receiver.
    pub async fn add_peer(&self, peer: ConnectionId) -> broadcast::Receiver<Outbound> {
        let mut peers = self.peers.write().await;
        peers.insert(peer);
        self.sender.subscribe()
    }

    /// Detach a connection. Returns `false` if it was not attached.
    pub async fn remove_peer(&self, peer: &ConnectionId) -> bool {
        self.peers.write().await.remove(peer)
    }

    /// Encode and send `message` to every receiver; returns receiver count.
    pub fn broadcast(&self, origin: Option<ConnectionId>, message: &Message) -> usize {
        self.broadcast_raw(Outbound::new(origin, message.encode()))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, outbound: Outbound) -> usize {
        // No receivers is not an error: the document may be idle.
        let count = self.sender.send(outbound).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer: &ConnectionId) -> bool {
        self.peers.read().await.contains(peer)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = ConnectionId::new();

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert!(!group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();

        let mut rx_alice = group.add_peer(alice).await;
        let mut rx_bob = group.add_peer(bob).await;

        let count = group.broadcast(Some(alice), &Message::update(vec![0, 0]));
        assert_eq!(count, 2);

        // Filtering is the receiver's job.
        let at_alice = rx_alice.recv().await.unwrap();
        let at_bob = rx_bob.recv().await.unwrap();
        assert!(at_alice.is_echo_for(alice));
        assert!(!at_bob.is_echo_for(bob));
        assert_eq!(*at_bob.frame, Message::update(vec![0, 0]).encode());
    }

    #[tokio::test]
    async fn test_server_frames_reach_everyone() {
        let outbound = Outbound::new(None, vec![1, 0]);
        assert!(!outbound.is_echo_for(ConnectionId::new()));
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(None, &Message::awareness(vec![0])), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags_without_blocking_sender() {
        let group = BroadcastGroup::new(2);
        let mut slow = group.add_peer(ConnectionId::new()).await;

        for i in 0..5u8 {
            group.broadcast_raw(Outbound::new(None, vec![i]));
        }

        match slow.try_recv() {
            Err(TryRecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("Expected lag, got {other:?}"),
        }
        // The newest frames are still delivered after the lag.
        assert_eq!(*slow.recv().await.unwrap().frame, vec![3]);
        assert!(!matches!(slow.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(ConnectionId::new()).await;

        group.broadcast(None, &Message::update(vec![0, 0]));
        group.broadcast(None, &Message::update(vec![0, 0]));
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }
}
