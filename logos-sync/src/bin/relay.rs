//! Standalone relay.
//!
//! Environment:
//! - `LOGOS_SYNC_BIND` — listen address (default `127.0.0.1:9090`)
//! - `LOGOS_SYNC_STORAGE` — RocksDB directory; unset disables relay storage
//! - `RUST_LOG` — log filter, e.g. `logos_sync=debug`

use std::path::PathBuf;

use log::{error, info};
use logos_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(bind_addr) = std::env::var("LOGOS_SYNC_BIND") {
        config.bind_addr = bind_addr;
    }
    config.storage_path = std::env::var_os("LOGOS_SYNC_STORAGE").map(PathBuf::from);

    info!("Starting Logos sync relay...");

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open relay storage: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
