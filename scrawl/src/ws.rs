//! WebSocket endpoint
//!
//! Each accepted socket gets an identity, a bounded outbound queue drained
//! by a writer task, and a [`SessionHandler`] driven strictly sequentially
//! by the read loop. Binary frames are decoded as UTF-8 text before JSON
//! parsing.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use scrawl_core::models::UserId;
use scrawl_relay::{ServerEnvelope, SessionHandler};

use crate::server::AppState;

/// Upgrade handler: assigns the connection's identity for the whole session
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let user_id = UserId::new();

    ws.max_message_size(state.relay.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    info!(
        user_id = %user_id.as_str(),
        "WebSocket connection established"
    );

    let (tx, mut rx) = mpsc::channel::<ServerEnvelope>(state.relay.outbound_buffer);

    let mut handler = SessionHandler::new(
        user_id.clone(),
        state.directory.clone(),
        state.fabric.clone(),
        state.registry.clone(),
        tx,
    );

    // Greet with the assigned identity before anything else is delivered
    state.registry.send(
        handler.conn_id(),
        ServerEnvelope::Connected {
            user_id: user_id.clone(),
        },
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: drain the outbound queue onto the socket. A write
    // failure ends this connection only.
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize outbound envelope");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    // Read loop: messages on one connection are processed strictly
    // sequentially
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handler.handle_text(text.as_str()).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handler.handle_text(text).await,
                Err(_) => {
                    state.registry.send(
                        handler.conn_id(),
                        ServerEnvelope::Error {
                            message: "Invalid message".to_string(),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            // Ping/Pong are answered by axum
            Ok(_) => {}
            Err(e) => {
                warn!(
                    user_id = %user_id.as_str(),
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        }
    }

    handler.on_disconnect().await;

    info!(
        user_id = %user_id.as_str(),
        "WebSocket connection closed"
    );
}
