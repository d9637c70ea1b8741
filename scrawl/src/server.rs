//! Server lifecycle management

use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use scrawl_core::config::RelayConfig;
use scrawl_core::directory::SessionDirectory;
use scrawl_core::Config;
use scrawl_relay::{ConnectionRegistry, RoomFabric, RoomHub};

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn SessionDirectory>,
    pub hub: Arc<RoomHub>,
    pub fabric: Arc<dyn RoomFabric>,
    pub registry: ConnectionRegistry,
    pub relay: RelayConfig,
}

/// Scrawl server - owns the listener and the router
pub struct ScrawlServer {
    config: Config,
    state: AppState,
}

impl ScrawlServer {
    pub const fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start serving and wait for the shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let app = router(self.state);

        let addr = self.config.ws_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("WebSocket relay listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(crate::ws::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "subscribed_rooms": state.hub.room_count(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
