//! Scribe sync server: collaborative block documents over WebSocket.
//!
//! Configuration comes from the environment (`SCRIBE_BIND_ADDR` or `PORT`,
//! `SCRIBE_DATA_DIR`, `SCRIBE_SAVE_DEBOUNCE_MS`, `SCRIBE_BROADCAST_CAPACITY`,
//! `SCRIBE_EVICT_IDLE`); logging through `RUST_LOG`, `info` by default.

use log::{error, info};
use std::process::ExitCode;

use scribe_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting Scribe sync server on {}...", config.bind_addr);

    let server = match SyncServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let status = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            ExitCode::SUCCESS
        }
    };

    let flushed = server.shutdown().await;
    let stats = server.stats().await;
    info!(
        "Stopped after {} connections, {} saves ({} failed, {flushed} on shutdown)",
        stats.total_connections, stats.saves, stats.failed_saves
    );
    status
}
