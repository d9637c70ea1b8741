//! Redis fan-out bridge for multi-instance deployments
//!
//! Each relay instance publishes room envelopes to a Redis channel and
//! subscribes to every room channel, forwarding envelopes published by
//! other instances into the local [`RoomHub`]. Envelopes ride in a frame
//! carrying the origin `node_id` so an instance ignores its own publishes
//! (they were already delivered locally).
//!
//! Channel naming: `{prefix}room:{room_id}`.

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scrawl_core::models::{RoomId, UserId};

use crate::envelope::ServerEnvelope;
use crate::hub::{RoomFabric, RoomHub};
use crate::registry::ConnId;

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Request to fan an envelope out to the other relay instances
pub struct PublishRequest {
    pub room_id: RoomId,
    pub envelope: ServerEnvelope,
}

/// Fabric for multi-instance deployments: the local hub plus the Redis
/// fan-out bridge, behind the same contract as the hub alone
///
/// Local subscribers are reached synchronously through the hub; the
/// envelope is also enqueued for the other instances, where it reaches
/// their local subscribers with no exclusion (the origin connection does
/// not live there).
pub struct ClusterFabric {
    hub: Arc<RoomHub>,
    publish_tx: mpsc::Sender<PublishRequest>,
}

impl ClusterFabric {
    #[must_use]
    pub const fn new(hub: Arc<RoomHub>, publish_tx: mpsc::Sender<PublishRequest>) -> Self {
        Self { hub, publish_tx }
    }
}

impl RoomFabric for ClusterFabric {
    fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        conn_id: ConnId,
        sender: mpsc::Sender<ServerEnvelope>,
    ) {
        self.hub.subscribe(room_id, user_id, conn_id, sender);
    }

    fn unsubscribe(&self, conn_id: &str) {
        self.hub.unsubscribe(conn_id);
    }

    fn publish(
        &self,
        room_id: &RoomId,
        envelope: &ServerEnvelope,
        exclude: Option<&str>,
    ) -> usize {
        let delivered = self.hub.publish(room_id, envelope, exclude);

        if self
            .publish_tx
            .try_send(PublishRequest {
                room_id: room_id.clone(),
                envelope: envelope.clone(),
            })
            .is_err()
        {
            warn!(
                room_id = %room_id.as_str(),
                message_type = envelope.message_type(),
                "Fan-out queue full or closed, dropping cross-instance publish"
            );
        }

        delivered
    }
}

/// Frame published to Redis
/// Includes `node_id` to avoid echo (each node ignores its own frames)
#[derive(Debug, Serialize, Deserialize)]
struct FanoutFrame {
    node_id: String,
    envelope: ServerEnvelope,
}

/// Describes how the subscriber loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// Connection was established and messages were being processed, but the
    /// stream ended (Redis disconnected). Backoff should be reset since the
    /// connection was healthy before it dropped.
    Disconnected,
    /// Failed to connect or subscribe to Redis. Backoff should continue
    /// increasing to avoid hammering an unavailable server.
    ConnectFailed(anyhow::Error),
}

pub struct RedisFanout {
    redis_client: RedisClient,
    hub: Arc<RoomHub>,
    node_id: String,
    channel_prefix: String,
    cancel_token: CancellationToken,
}

impl RedisFanout {
    /// Capacity for the publish channel. Envelopes are dropped with a warning
    /// when full (e.g., during a prolonged Redis outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    pub fn new(
        redis_url: &str,
        hub: Arc<RoomHub>,
        node_id: String,
        channel_prefix: &str,
    ) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            redis_client,
            hub,
            node_id,
            channel_prefix: channel_prefix.to_string(),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut down the fan-out bridge (cancels subscriber and publisher tasks)
    pub fn shutdown(&self) {
        info!("Shutting down Redis fan-out bridge");
        self.cancel_token.cancel();
    }

    /// Start the bridge: spawns the publisher and subscriber tasks and
    /// returns the sender used to enqueue outbound publishes
    pub fn start(self: Arc<Self>) -> mpsc::Sender<PublishRequest> {
        let (publish_tx, mut publish_rx) =
            mpsc::channel::<PublishRequest>(Self::PUBLISH_CHANNEL_CAPACITY);

        let publish_client = self.redis_client.clone();
        let node_id = self.node_id.clone();
        let channel_prefix = self.channel_prefix.clone();
        let cancel_publisher = self.cancel_token.clone();

        // Publisher task with reconnection logic
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            // Buffer for retrying a failed publish after reconnection
            let mut retry_request: Option<PublishRequest> = None;

            loop {
                if cancel_publisher.is_cancelled() {
                    info!("Redis fan-out publisher task cancelled");
                    return;
                }

                let mut conn = match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    publish_client.get_multiplexed_async_connection(),
                )
                .await
                {
                    Ok(Ok(conn)) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        conn
                    }
                    Ok(Err(e)) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Failed to get Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                    Err(_) => {
                        error!(
                            backoff_secs = backoff_secs,
                            "Timed out getting Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                };

                info!("Redis fan-out publisher (re)connected");

                // Retry the previously failed publish request if any
                if let Some(req) = retry_request.take() {
                    if let Err(e) =
                        Self::publish_frame(&mut conn, &node_id, &channel_prefix, &req).await
                    {
                        warn!(
                            error = %e,
                            message_type = req.envelope.message_type(),
                            "Retry publish failed, will retry after next reconnect"
                        );
                        retry_request = Some(req);
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                }

                // Process requests until connection breaks or cancelled
                loop {
                    let req = tokio::select! {
                        _ = cancel_publisher.cancelled() => {
                            info!("Redis fan-out publisher task cancelled");
                            return;
                        }
                        req = publish_rx.recv() => req,
                    };
                    let Some(req) = req else {
                        warn!("Redis fan-out publish channel closed, exiting");
                        return;
                    };

                    if let Err(e) =
                        Self::publish_frame(&mut conn, &node_id, &channel_prefix, &req).await
                    {
                        error!(
                            error = %e,
                            message_type = req.envelope.message_type(),
                            "Failed to publish envelope, saving for retry after reconnect"
                        );
                        retry_request = Some(req);
                        break;
                    }
                }

                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        // Subscriber task with exponential backoff on reconnection
        let self_clone = self;
        let cancel_subscriber = self_clone.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel_subscriber.is_cancelled() {
                    info!("Redis fan-out subscriber task cancelled");
                    return;
                }

                match self_clone.run_subscriber().await {
                    SubscriberExit::Disconnected => {
                        // Connection was healthy before it dropped.
                        // Reset backoff since the server was reachable.
                        error!(
                            "Redis fan-out subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Redis fan-out subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    _ = cancel_subscriber.cancelled() => {
                        info!("Redis fan-out subscriber task cancelled during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        publish_tx
    }

    /// Run the subscriber until the Redis connection drops
    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        let pattern = format!("{}room:*", self.channel_prefix);
        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.psubscribe(&pattern),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context(format!("Failed to subscribe to {pattern}")),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out subscribing to {pattern}"
                ));
            }
        }

        info!(pattern = %pattern, "Redis fan-out subscriber connected");

        let room_channel_prefix = format!("{}room:", self.channel_prefix);
        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };

            let frame = match serde_json::from_str::<FanoutFrame>(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        error = %e,
                        channel = %channel,
                        "Failed to deserialize fan-out frame"
                    );
                    continue;
                }
            };

            // Ignore frames from this node (already delivered locally)
            if frame.node_id == self.node_id {
                continue;
            }

            let Some(room_id_str) = channel.strip_prefix(&room_channel_prefix) else {
                warn!(channel = %channel, "Invalid channel format");
                continue;
            };
            let room_id = RoomId::from_string(room_id_str.to_string());

            // The origin connection lives on another node, so no local
            // exclusion applies
            let delivered = self.hub.publish(&room_id, &frame.envelope, None);
            debug!(
                room_id = %room_id.as_str(),
                message_type = frame.envelope.message_type(),
                local_subscribers = delivered,
                "Forwarded remote envelope to local subscribers"
            );
        }

        // Stream returned None -- the Redis connection was lost
        SubscriberExit::Disconnected
    }

    /// Publish one frame to the room channel
    async fn publish_frame(
        conn: &mut redis::aio::MultiplexedConnection,
        node_id: &str,
        channel_prefix: &str,
        req: &PublishRequest,
    ) -> Result<usize> {
        let channel = format!("{}room:{}", channel_prefix, req.room_id.as_str());

        let frame = FanoutFrame {
            node_id: node_id.to_string(),
            envelope: req.envelope.clone(),
        };
        let payload = serde_json::to_string(&frame).context("Failed to serialize fan-out frame")?;

        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&channel, &payload),
        )
        .await
        .context("Timed out publishing to Redis")?
        .context("Failed to publish to Redis")?;

        Ok(subscribers)
    }
}
