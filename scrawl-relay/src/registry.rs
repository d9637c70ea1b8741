use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scrawl_core::models::UserId;

use crate::envelope::ServerEnvelope;

/// Handle for a client connection
pub type ConnId = String;

/// A live connection's identity and outbound queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: UserId,
    pub sender: mpsc::Sender<ServerEnvelope>,
}

/// Process-local table of live connections and their transport handles
///
/// Sends are best-effort: a closed or saturated handle is logged and
/// swallowed, never surfaced as an error to the caller.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnId, ConnectionHandle>>,

    /// Metrics
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn register(&self, conn_id: ConnId, handle: ConnectionHandle) {
        let user_id = handle.user_id.clone();
        self.connections.insert(conn_id.clone(), handle);
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %conn_id,
            user_id = %user_id.as_str(),
            active_connections = self.connections.len(),
            "Connection registered"
        );
    }

    /// Unregister a connection
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, handle)) = self.connections.remove(conn_id) {
            info!(
                connection_id = %conn_id,
                user_id = %handle.user_id.as_str(),
                active_connections = self.connections.len(),
                "Connection unregistered"
            );
        }
    }

    /// Send an envelope to one connection, best-effort
    pub fn send(&self, conn_id: &str, envelope: ServerEnvelope) {
        let Some(handle) = self.connections.get(conn_id) else {
            debug!(
                connection_id = %conn_id,
                message_type = envelope.message_type(),
                "Dropping envelope for unknown connection"
            );
            return;
        };

        match handle.sender.try_send(envelope) {
            Ok(()) => {
                self.total_messages.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                debug!(
                    connection_id = %conn_id,
                    message_type = envelope.message_type(),
                    "Outbound queue full, dropping envelope"
                );
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                warn!(
                    connection_id = %conn_id,
                    message_type = envelope.message_type(),
                    "Outbound queue closed, connection is going away"
                );
            }
        }
    }

    /// Look up a connection handle
    #[must_use]
    pub fn get(&self, conn_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(conn_id).map(|h| h.clone())
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Total connections ever registered
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Total envelopes sent through the registry
    #[must_use]
    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }
}
