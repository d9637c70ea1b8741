mod server;
mod ws;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use scrawl_core::{
    bootstrap::load_config, directory::SessionDirectory, logging, MemoryDirectory, RedisDirectory,
};
use scrawl_relay::{ClusterFabric, ConnectionRegistry, RedisFanout, RoomFabric, RoomHub};

use server::{AppState, ScrawlServer};

/// Generate a unique node ID for this relay instance
fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Random suffix keeps replicas on the same host distinct
    format!("{host}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Scrawl relay starting...");
    info!("WebSocket address: {}", config.ws_address());

    // 3. Initialize the session directory
    let directory: Arc<dyn SessionDirectory> = if config.redis.url.is_empty() {
        info!("Redis not configured, using in-memory session directory (single instance)");
        Arc::new(MemoryDirectory::new())
    } else {
        let directory = RedisDirectory::connect(
            &config.redis.url,
            &config.redis.key_prefix,
            Duration::from_secs(config.redis.connect_timeout_seconds),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect session directory: {e}"))?;
        info!("Session directory connected to Redis");
        Arc::new(directory)
    };

    // 4. Initialize the local hub and connection registry
    let hub = Arc::new(RoomHub::new());
    let registry = ConnectionRegistry::new();
    info!("Room hub and connection registry initialized");

    // 5. Pick the fabric: the hub alone for a single instance, the hub plus
    //    the Redis fan-out bridge when replicas share a directory
    let fabric: Arc<dyn RoomFabric> = if config.redis.url.is_empty() {
        hub.clone()
    } else {
        let node_id = generate_node_id();
        info!(node_id = %node_id, "Starting Redis fan-out bridge");
        let fanout = Arc::new(RedisFanout::new(
            &config.redis.url,
            hub.clone(),
            node_id,
            &config.redis.key_prefix,
        )?);
        let publish_tx = fanout.start();
        Arc::new(ClusterFabric::new(hub.clone(), publish_tx))
    };

    // 6. Start the server
    let state = AppState {
        directory,
        hub,
        fabric,
        registry,
        relay: config.relay.clone(),
    };
    let server = ScrawlServer::new(config, state);
    server.start().await
}
