use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scrawl_core::models::{RoomId, UserId};

use crate::envelope::ServerEnvelope;
use crate::registry::ConnId;

/// Room pub/sub fabric: per-room topics with at-most-once fan-out
///
/// The single-process [`RoomHub`] and the Redis-bridged
/// [`ClusterFabric`](crate::fanout::ClusterFabric) are interchangeable
/// implementations of this contract.
pub trait RoomFabric: Send + Sync {
    /// Subscribe a connection's outbound queue to a room topic
    fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        conn_id: ConnId,
        sender: mpsc::Sender<ServerEnvelope>,
    );

    /// Unsubscribe a connection from its current room topic
    fn unsubscribe(&self, conn_id: &str);

    /// Publish an envelope to every current subscriber of a room topic,
    /// excluding `exclude` if given. Returns the number of local queues
    /// reached.
    fn publish(&self, room_id: &RoomId, envelope: &ServerEnvelope, exclude: Option<&str>)
        -> usize;
}

/// Subscriber information
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub conn_id: ConnId,
    pub user_id: UserId,
    pub sender: mpsc::Sender<ServerEnvelope>,
}

/// In-memory room pub/sub fabric: routes published envelopes to every
/// connection currently subscribed to a room topic.
///
/// Delivery is at-most-once per subscriber per publish. Envelopes go into
/// each subscriber's bounded outbound queue with `try_send`: a full queue
/// drops the envelope for that subscriber only, without blocking the
/// publisher; a closed queue marks the subscriber for cleanup. A publish
/// racing an unsubscribe may or may not reach the unsubscribing connection.
#[derive(Clone, Default)]
pub struct RoomHub {
    /// Map of room_id -> subscribers
    rooms: Arc<DashMap<RoomId, Vec<Subscriber>>>,

    /// Map of conn_id -> room_id for cleanup
    connections: Arc<DashMap<ConnId, RoomId>>,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscribers on a room topic
    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Number of room topics with at least one subscriber
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl RoomFabric for RoomHub {
    fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        conn_id: ConnId,
        sender: mpsc::Sender<ServerEnvelope>,
    ) {
        let subscriber = Subscriber {
            conn_id: conn_id.clone(),
            user_id: user_id.clone(),
            sender,
        };

        self.rooms
            .entry(room_id.clone())
            .or_default()
            .push(subscriber);
        self.connections.insert(conn_id.clone(), room_id.clone());

        info!(
            room_id = %room_id.as_str(),
            user_id = %user_id.as_str(),
            connection_id = %conn_id,
            "Connection subscribed to room"
        );
    }

    fn unsubscribe(&self, conn_id: &str) {
        if let Some((_, room_id)) = self.connections.remove(conn_id) {
            if let Some(mut subscribers) = self.rooms.get_mut(&room_id) {
                subscribers.retain(|sub| sub.conn_id != conn_id);

                if subscribers.is_empty() {
                    drop(subscribers); // Drop the RefMut before removing
                    self.rooms.remove(&room_id);
                    debug!(room_id = %room_id.as_str(), "Room topic has no more subscribers, removed");
                }
            }

            debug!(
                room_id = %room_id.as_str(),
                connection_id = %conn_id,
                "Connection unsubscribed from room"
            );
        }
    }

    fn publish(
        &self,
        room_id: &RoomId,
        envelope: &ServerEnvelope,
        exclude: Option<&str>,
    ) -> usize {
        let mut sent_count = 0;
        let mut closed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(room_id) {
            for subscriber in subscribers.iter() {
                if exclude.is_some_and(|ex| ex == subscriber.conn_id) {
                    continue;
                }

                match subscriber.sender.try_send(envelope.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow subscriber: drop for this subscriber only,
                        // never block the publisher
                        debug!(
                            room_id = %room_id.as_str(),
                            connection_id = %subscriber.conn_id,
                            message_type = envelope.message_type(),
                            "Subscriber queue full, dropping envelope"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(
                            room_id = %room_id.as_str(),
                            connection_id = %subscriber.conn_id,
                            "Subscriber queue closed, marking for cleanup"
                        );
                        closed_connections.push(subscriber.conn_id.clone());
                    }
                }
            }
        }

        for conn_id in closed_connections {
            self.unsubscribe(&conn_id);
        }

        sent_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(hub: &RoomHub, room: &RoomId, conn: &str) -> mpsc::Receiver<ServerEnvelope> {
        let (tx, rx) = mpsc::channel(16);
        hub.subscribe(room.clone(), UserId::new(), conn.to_string(), tx);
        rx
    }

    fn user_left(user: &str) -> ServerEnvelope {
        ServerEnvelope::UserLeft {
            user_id: UserId::from_string(user.to_string()),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let hub = RoomHub::new();
        let room = RoomId::new();

        let mut rx = subscribe(&hub, &room, "conn1");
        assert_eq!(hub.subscriber_count(&room), 1);

        let sent = hub.publish(&room, &user_left("u1"), None);
        assert_eq!(sent, 1);

        let received = rx.recv().await.expect("delivered");
        assert_eq!(received.message_type(), "user_left");
    }

    #[tokio::test]
    async fn test_publish_excludes_origin() {
        let hub = RoomHub::new();
        let room = RoomId::new();

        let mut rx1 = subscribe(&hub, &room, "conn1");
        let mut rx2 = subscribe(&hub, &room, "conn2");

        let sent = hub.publish(&room, &user_left("u1"), Some("conn1"));
        assert_eq!(sent, 1);

        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_room() {
        let hub = RoomHub::new();
        let room = RoomId::new();

        let _rx = subscribe(&hub, &room, "conn1");
        assert_eq!(hub.room_count(), 1);

        hub.unsubscribe("conn1");
        assert_eq!(hub.subscriber_count(&room), 0);
        assert_eq!(hub.room_count(), 0);

        // Publishing into a room with no subscribers reaches nobody
        assert_eq!(hub.publish(&room, &user_left("u1"), None), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_drops_only_for_that_subscriber() {
        let hub = RoomHub::new();
        let room = RoomId::new();

        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        hub.subscribe(room.clone(), UserId::new(), "slow".to_string(), tx_slow);
        let mut rx_fast = subscribe(&hub, &room, "fast");

        // Fill the slow subscriber's queue
        assert_eq!(hub.publish(&room, &user_left("u1"), None), 2);
        // Second publish drops for the slow subscriber, still reaches the fast one
        assert_eq!(hub.publish(&room, &user_left("u2"), None), 1);

        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.try_recv().is_err());

        assert!(rx_fast.recv().await.is_some());
        assert!(rx_fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_swept() {
        let hub = RoomHub::new();
        let room = RoomId::new();

        let rx = subscribe(&hub, &room, "conn1");
        drop(rx);

        assert_eq!(hub.publish(&room, &user_left("u1"), None), 0);
        assert_eq!(hub.subscriber_count(&room), 0);
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_single_origin_fifo_order() {
        let hub = RoomHub::new();
        let room = RoomId::new();
        let mut rx = subscribe(&hub, &room, "conn1");

        for i in 0..5 {
            hub.publish(&room, &user_left(&format!("u{i}")), None);
        }

        for i in 0..5 {
            let ServerEnvelope::UserLeft { user_id } = rx.recv().await.expect("delivered") else {
                panic!("expected user_left");
            };
            assert_eq!(user_id.as_str(), format!("u{i}"));
        }
    }
}
