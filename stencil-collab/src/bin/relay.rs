//! Standalone relay server.
//!
//! `STENCIL_RELAY_ADDR` overrides the bind address and
//! `STENCIL_BROADCAST_CAPACITY` the per-session buffer. Log output follows
//! `RUST_LOG`.

use log::{error, info, warn};
use stencil_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("STENCIL_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(raw) = std::env::var("STENCIL_BROADCAST_CAPACITY") {
        match raw.parse::<usize>() {
            Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
            _ => warn!("Ignoring invalid STENCIL_BROADCAST_CAPACITY={raw}"),
        }
    }

    info!("Starting stencil relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
