//! Helpers shared by the integration tests: a real server on a free port
//! and raw WebSocket clients speaking the wire protocol.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use scribe_collab::{Block, Message, ServerConfig, SnapshotStore, SyncServer, BLOCKS_ROOT};
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{Array, Doc, Out, Transact};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server over `store` on a free port; returns it and its base URL.
pub async fn start_server(store: Arc<dyn SnapshotStore>, save_debounce: Duration) -> (Arc<SyncServer>, String) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        save_debounce,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config, store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

pub async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn send(ws: &mut Client, message: &Message) {
    ws.send(WsMessage::Binary(message.encode().into())).await.unwrap();
}

pub async fn send_raw(ws: &mut Client, bytes: Vec<u8>) {
    ws.send(WsMessage::Binary(bytes.into())).await.unwrap();
}

/// Next protocol frame, failing after two seconds.
pub async fn recv(ws: &mut Client) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMessage::Binary(data) = frame {
            return Message::decode(&data).unwrap();
        }
    }
}

/// Whether a protocol frame arrives within `wait`.
pub async fn receives_within(ws: &mut Client, wait: Duration) -> bool {
    loop {
        match timeout(wait, ws.next()).await {
            Err(_) => return false,
            Ok(Some(Ok(WsMessage::Binary(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return false,
        }
    }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// Append `block` on a client replica; returns the transaction's update.
pub fn client_push(doc: &Doc, block: &Block) -> Vec<u8> {
    let array = doc.get_or_insert_array(BLOCKS_ROOT);
    let mut txn = doc.transact_mut();
    array.push_back(&mut txn, block.to_any());
    txn.encode_update_v1()
}

pub fn client_apply(doc: &Doc, update: &[u8]) {
    use yrs::updates::decoder::Decode;
    let update = yrs::Update::decode_v1(update).unwrap();
    doc.transact_mut().apply_update(update).unwrap();
}

/// Blocks as a client replica sees them.
pub fn client_blocks(doc: &Doc) -> Vec<Block> {
    let array = doc.get_or_insert_array(BLOCKS_ROOT);
    let txn = doc.transact();
    array
        .iter(&txn)
        .filter_map(|out| match out {
            Out::Any(any) => Block::from_any(&any),
            _ => None,
        })
        .collect()
}

/// Raw records on a client replica, including any extra fields.
pub fn client_records(doc: &Doc) -> Vec<yrs::Any> {
    let array = doc.get_or_insert_array(BLOCKS_ROOT);
    let txn = doc.transact();
    array
        .iter(&txn)
        .filter_map(|out| match out {
            Out::Any(any) => Some(any),
            _ => None,
        })
        .collect()
}

pub fn client_state_vector(doc: &Doc) -> Vec<u8> {
    use yrs::updates::encoder::Encode;
    use yrs::ReadTxn;
    doc.transact().state_vector().encode_v1()
}
