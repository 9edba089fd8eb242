//! Standalone Arxis sync server.
//!
//! Binds the WebSocket listener and serves project rooms until killed.
//! Configuration comes from `ARXIS_*` environment variables; see
//! [`ServerConfig::from_env`].
//!
//! ```text
//! ARXIS_BIND_ADDR=0.0.0.0:3000 ARXIS_HISTORY_LIMIT=4096 \
//!     RUST_LOG=info cargo run --bin arxis-sync-server
//! ```

use log::info;

use arxis_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Arxis sync server...");

    let server = SyncServer::new(config);
    server.run().await
}
