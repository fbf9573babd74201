//! Presence lifecycle across real connections.

mod common;

use common::*;
use scribe_collab::{AwarenessUpdate, ClientUpdate, MemoryStore, Message, PresenceState, SyncMessage};
use std::sync::Arc;
use tokio::time::Duration;

fn announce(client_id: u64, clock: u64, state: Option<PresenceState>) -> Message {
    Message::awareness(
        AwarenessUpdate {
            clients: vec![ClientUpdate { client_id, clock, state }],
        }
        .encode(),
    )
}

async fn recv_awareness(ws: &mut Client) -> AwarenessUpdate {
    loop {
        if let Message::Awareness(payload) = recv(ws).await {
            return AwarenessUpdate::decode(&payload).unwrap();
        }
    }
}

#[tokio::test]
async fn test_presence_visible_to_peers_and_removed_on_disconnect() {
    let (server, url) = start_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await;

    let mut alice = connect(&format!("{url}/doc1")).await;
    let mut bob = connect(&format!("{url}/doc1")).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    let alice_state = PresenceState::new("Alice", "#e91e63");
    send(&mut alice, &announce(100, 1, Some(alice_state.clone()))).await;

    let seen = recv_awareness(&mut bob).await;
    assert_eq!(seen.clients.len(), 1);
    assert_eq!(seen.clients[0].client_id, 100);
    assert_eq!(seen.clients[0].state, Some(alice_state));

    // Focus change is relayed as an update.
    let focused = PresenceState::new("Alice", "#e91e63").with_focus("b1");
    send(&mut alice, &announce(100, 2, Some(focused.clone()))).await;
    assert_eq!(recv_awareness(&mut bob).await.clients[0].state, Some(focused));

    // Abrupt close: the server tombstones Alice on her behalf.
    drop(alice);
    let gone = recv_awareness(&mut bob).await;
    assert_eq!(gone.clients[0].client_id, 100);
    assert_eq!(gone.clients[0].state, None);
    assert!(gone.clients[0].clock > 2);

    let room = server.registry().get(&"doc1".into()).await.unwrap();
    assert!(room.presence().await.is_empty());
}

#[tokio::test]
async fn test_joiner_receives_existing_presence() {
    let (server, url) = start_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await;

    let mut alice = connect(&format!("{url}/doc1")).await;
    recv(&mut alice).await;
    send(&mut alice, &announce(7, 1, Some(PresenceState::new("Alice", "#111111")))).await;

    let registry = server.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move {
            match registry.get(&"doc1".into()).await {
                Some(room) => room.presence().await.len() == 1,
                None => false,
            }
        }
    })
    .await;

    let mut bob = connect(&format!("{url}/doc1")).await;
    assert!(matches!(recv(&mut bob).await, Message::Sync(SyncMessage::Step1(_))));
    let snapshot = recv_awareness(&mut bob).await;
    assert_eq!(snapshot.clients.len(), 1);
    assert_eq!(snapshot.clients[0].state.as_ref().and_then(|s| s.name.as_deref()), Some("Alice"));

    // Bob's own announcement reaches Alice but not Bob.
    send(&mut bob, &announce(8, 1, Some(PresenceState::new("Bob", "#222222")))).await;
    assert_eq!(recv_awareness(&mut alice).await.clients[0].client_id, 8);
    assert!(!receives_within(&mut bob, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_stale_presence_is_not_relayed() {
    let (_server, url) = start_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await;
    let mut alice = connect(&format!("{url}/doc")).await;
    let mut bob = connect(&format!("{url}/doc")).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    send(&mut alice, &announce(1, 5, Some(PresenceState::new("new", "#1")))).await;
    recv_awareness(&mut bob).await;

    send(&mut alice, &announce(1, 4, Some(PresenceState::new("old", "#2")))).await;
    assert!(!receives_within(&mut bob, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_client_announced_leave_is_relayed_once() {
    let (_server, url) = start_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await;
    let mut alice = connect(&format!("{url}/doc")).await;
    let mut bob = connect(&format!("{url}/doc")).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    send(&mut alice, &announce(3, 1, Some(PresenceState::new("A", "#3")))).await;
    recv_awareness(&mut bob).await;

    // Clean leave announced by the client itself.
    send(&mut alice, &announce(3, 2, None)).await;
    assert_eq!(recv_awareness(&mut bob).await.clients[0].state, None);

    // Closing afterwards has nothing left to remove.
    alice.close(None).await.unwrap();
    assert!(!receives_within(&mut bob, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_disconnect_at_max_clock_cleans_up() {
    let (server, url) = start_server(Arc::new(MemoryStore::new()), Duration::from_secs(60)).await;
    let mut alice = connect(&format!("{url}/edge")).await;
    let mut bob = connect(&format!("{url}/edge")).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    send(&mut alice, &announce(42, u64::MAX, Some(PresenceState::new("Max", "#fff")))).await;
    recv_awareness(&mut bob).await;

    drop(alice);
    let gone = recv_awareness(&mut bob).await;
    assert_eq!(gone.clients[0].client_id, 42);
    assert_eq!(gone.clients[0].state, None);

    let registry = server.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.connection_count(&"edge".into()).await == 1 }
    })
    .await;

    drop(bob);
    eventually(|| {
        let registry = registry.clone();
        async move { registry.document_count().await == 0 }
    })
    .await;
    let server = server.clone();
    eventually(|| {
        let server = server.clone();
        async move { server.stats().await.active_connections == 0 }
    })
    .await;
}
