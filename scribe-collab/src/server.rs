//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host/doc1 ──┐
//!                  ├── ConnectionHandler ──► DocumentRegistry ──► DocumentRoom (doc1)
//! ws://host/doc1 ──┘                              │                   │
//!                                                 │                   ├── ReplicatedDocument
//! ws://host/notes ── ConnectionHandler ──────────►│                   ├── AwarenessTracker
//!                                                 │                   └── BroadcastGroup
//!                                                 ▼
//!                                        PersistenceBridge ──► SnapshotStore
//!                                                               ├── MemoryStore
//!                                                               └── RocksStore
//! ```
//!
//! The request path names the document: `/doc1?token=…` joins `doc1`, an
//! empty path joins `default`. Authentication is the job of whatever sits in
//! front of this server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::connection::ConnectionHandler;
use crate::document::DocumentId;
use crate::persistence::{PersistenceBridge, DEFAULT_QUIET_PERIOD};
use crate::registry::DocumentRegistry;
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Quiet period before a document is saved
    pub save_debounce: Duration,
    /// Drop documents from memory once their last connection leaves
    pub evict_idle: bool,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            broadcast_capacity: 256,
            save_debounce: DEFAULT_QUIET_PERIOD,
            evict_idle: true,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `lookup`.
    ///
    /// Invalid values are logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.bind_addr = format!("0.0.0.0:{port}"),
                Err(_) => log::warn!("Ignoring invalid PORT {port:?}"),
            }
        }

        if let Some(dir) = lookup("SCRIBE_DATA_DIR").filter(|d| !d.is_empty()) {
            config.storage_path = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup("SCRIBE_SAVE_DEBOUNCE_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.save_debounce = Duration::from_millis(ms),
                Err(_) => log::warn!("Ignoring invalid SCRIBE_SAVE_DEBOUNCE_MS {raw:?}"),
            }
        }

        if let Some(raw) = lookup("SCRIBE_BROADCAST_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
                _ => log::warn!("Ignoring invalid SCRIBE_BROADCAST_CAPACITY {raw:?}"),
            }
        }

        if let Some(raw) = lookup("SCRIBE_EVICT_IDLE") {
            match parse_flag(&raw) {
                Some(flag) => config.evict_idle = flag,
                None => log::warn!("Ignoring invalid SCRIBE_EVICT_IDLE {raw:?}"),
            }
        }

        config
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
    pub documents_loaded: u64,
    pub saves: u64,
    pub failed_saves: u64,
}

/// Lock-free counters updated by connection handlers.
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

impl ServerCounters {
    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self, bytes: usize) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    counters: Arc<ServerCounters>,
}

impl SyncServer {
    /// Create a server over an existing store.
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let bridge = PersistenceBridge::new(store, config.save_debounce);
        let registry = Arc::new(DocumentRegistry::new(
            bridge,
            config.broadcast_capacity,
            config.evict_idle,
        ));
        Self {
            config,
            registry,
            counters: Arc::new(ServerCounters::default()),
        }
    }

    /// Default configuration over an in-memory store.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Open the store named by `config.storage_path`, or use memory.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path.clone()))?),
            None => {
                log::warn!("No data directory configured, documents are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store))
    }

    /// Persistent server at `path`.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        Self::open(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live documents, for server-side edits.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        counters: Arc<ServerCounters>,
    ) -> Result<(), ServerError> {
        let mut target = String::from("/");
        let capture_target = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(path) = req.uri().path_and_query() {
                target = path.as_str().to_string();
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_target).await?;

        let doc_id = DocumentId::from_path(&target);
        log::info!("WebSocket connection from {addr} for document {doc_id}");

        ConnectionHandler::new(doc_id, registry, counters)
            .run(ws_stream)
            .await;
        Ok(())
    }

    /// Flush every pending save. Call before exiting.
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }

    pub async fn stats(&self) -> ServerStats {
        let persistence = self.registry.bridge().stats();
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_documents: self.registry.document_count().await,
            documents_loaded: persistence.loads,
            saves: persistence.saves,
            failed_saves: persistence.failed_saves,
        }
    }
}
