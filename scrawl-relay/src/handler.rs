//! Per-connection protocol handler
//!
//! One handler per connection, driven strictly sequentially by the
//! transport's read loop; different connections run concurrently. The
//! handler owns the connection's room state and coordinates the Session
//! Directory, the room fabric, and the registry.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use scrawl_core::directory::SessionDirectory;
use scrawl_core::models::{RoomId, UserId};
use scrawl_core::Error;

use crate::envelope::{ClientEnvelope, ServerEnvelope, StrokeSegment};
use crate::hub::RoomFabric;
use crate::registry::{ConnId, ConnectionHandle, ConnectionRegistry};

pub struct SessionHandler {
    conn_id: ConnId,
    user_id: UserId,
    room: Option<RoomId>,
    directory: Arc<dyn SessionDirectory>,
    fabric: Arc<dyn RoomFabric>,
    registry: ConnectionRegistry,
    sender: mpsc::Sender<ServerEnvelope>,
}

impl SessionHandler {
    /// Create the handler and register the connection. `sender` is the
    /// connection's bounded outbound queue; the transport drains the other
    /// end.
    pub fn new(
        user_id: UserId,
        directory: Arc<dyn SessionDirectory>,
        fabric: Arc<dyn RoomFabric>,
        registry: ConnectionRegistry,
        sender: mpsc::Sender<ServerEnvelope>,
    ) -> Self {
        let conn_id = format!("{}_{}", user_id.as_str(), nanoid::nanoid!(8));

        registry.register(
            conn_id.clone(),
            ConnectionHandle {
                user_id: user_id.clone(),
                sender: sender.clone(),
            },
        );

        Self {
            conn_id,
            user_id,
            room: None,
            directory,
            fabric,
            registry,
            sender,
        }
    }

    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn current_room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// Parse and handle one raw text frame
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => {
                warn!(
                    connection_id = %self.conn_id,
                    error = %e,
                    "Malformed message"
                );
                self.reply(ServerEnvelope::Error {
                    message: "Invalid message".to_string(),
                });
            }
        }
    }

    /// Handle one parsed envelope
    pub async fn handle(&mut self, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::CreateRoom => self.handle_create_room().await,
            ClientEnvelope::JoinRoom { room_id } => self.handle_join_room(room_id).await,
            ClientEnvelope::LeaveRoom => self.handle_leave_room().await,
            ClientEnvelope::Draw { payload } => self.handle_draw(payload),
            ClientEnvelope::Broadcast { payload } => self.handle_broadcast(payload),
            ClientEnvelope::GetRoomUsers { room_id } => self.handle_get_room_users(room_id).await,
        }
    }

    /// Apply leave effects for a closing transport: same as `leave_room`
    /// with the last-known identity/room, but no reply is sent. Idempotent.
    pub async fn on_disconnect(&mut self) {
        if let Err(e) = self.leave_current_room().await {
            // Transport is gone; nothing to reply to
            error!(
                connection_id = %self.conn_id,
                user_id = %self.user_id.as_str(),
                error = %e,
                "Failed to leave room on disconnect"
            );
        }
        self.registry.unregister(&self.conn_id);
    }

    async fn handle_create_room(&mut self) {
        let result: scrawl_core::Result<()> = async {
            self.leave_current_room().await?;

            let room = self.directory.create_room(&self.user_id).await?;
            self.fabric.subscribe(
                room.clone(),
                self.user_id.clone(),
                self.conn_id.clone(),
                self.sender.clone(),
            );
            self.room = Some(room.clone());

            info!(
                connection_id = %self.conn_id,
                user_id = %self.user_id.as_str(),
                room_id = %room.as_str(),
                "Room created"
            );

            self.reply(ServerEnvelope::RoomCreated {
                room_id: room,
                user_id: self.user_id.clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.reply_error(&e);
        }
    }

    async fn handle_join_room(&mut self, target: RoomId) {
        let result: scrawl_core::Result<()> = async {
            self.leave_current_room().await?;

            if self.directory.join_room(&target, &self.user_id).await? {
                self.fabric.subscribe(
                    target.clone(),
                    self.user_id.clone(),
                    self.conn_id.clone(),
                    self.sender.clone(),
                );
                self.room = Some(target.clone());

                info!(
                    connection_id = %self.conn_id,
                    user_id = %self.user_id.as_str(),
                    room_id = %target.as_str(),
                    "Room joined"
                );

                self.reply(ServerEnvelope::RoomJoined {
                    room_id: target.clone(),
                    user_id: self.user_id.clone(),
                });
                self.publish(
                    &target,
                    ServerEnvelope::UserJoined {
                        user_id: self.user_id.clone(),
                    },
                    Some(self.conn_id.as_str()),
                );
            } else {
                // A failed join does not restore the room the implicit
                // leave just left; the connection stays roomless.
                self.reply(ServerEnvelope::Error {
                    message: "Room not found".to_string(),
                });
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.reply_error(&e);
        }
    }

    async fn handle_leave_room(&mut self) {
        // Not in a room: silent no-op
        if self.room.is_none() {
            return;
        }

        match self.leave_current_room().await {
            Ok(()) => {
                self.reply(ServerEnvelope::RoomLeft {
                    user_id: self.user_id.clone(),
                });
            }
            Err(e) => self.reply_error(&e),
        }
    }

    fn handle_draw(&mut self, payload: StrokeSegment) {
        let Some(room) = self.room.clone() else {
            self.reply(ServerEnvelope::Error {
                message: "Not in a room".to_string(),
            });
            return;
        };

        // Fire-and-forget relay to every other subscriber
        self.publish(
            &room,
            ServerEnvelope::Draw {
                user_id: self.user_id.clone(),
                payload,
            },
            Some(self.conn_id.as_str()),
        );
    }

    fn handle_broadcast(&mut self, payload: serde_json::Value) {
        let Some(room) = self.room.clone() else {
            self.reply(ServerEnvelope::Error {
                message: "Not in a room".to_string(),
            });
            return;
        };

        // Unlike draw, the sender receives its own broadcast
        self.publish(
            &room,
            ServerEnvelope::Broadcast {
                user_id: self.user_id.clone(),
                room_id: room.clone(),
                payload,
            },
            None,
        );
    }

    async fn handle_get_room_users(&mut self, room_id: RoomId) {
        // Deliberately no membership check on the caller; any connection may
        // query any room id. A missing room yields an empty list, not an
        // error.
        match self.directory.room_users(&room_id).await {
            Ok(users) => self.reply(ServerEnvelope::RoomUsers { room_id, users }),
            Err(e) => self.reply_error(&e),
        }
    }

    /// Leave the current room, if any: hub unsubscribe, directory removal,
    /// `user_left` to the former room excluding self. No-op when roomless.
    async fn leave_current_room(&mut self) -> scrawl_core::Result<()> {
        let Some(room) = self.room.take() else {
            return Ok(());
        };

        self.fabric.unsubscribe(&self.conn_id);
        self.directory.leave_room(&self.user_id).await?;

        self.publish(
            &room,
            ServerEnvelope::UserLeft {
                user_id: self.user_id.clone(),
            },
            Some(self.conn_id.as_str()),
        );

        info!(
            connection_id = %self.conn_id,
            user_id = %self.user_id.as_str(),
            room_id = %room.as_str(),
            "Room left"
        );

        Ok(())
    }

    fn publish(&self, room: &RoomId, envelope: ServerEnvelope, exclude: Option<&str>) {
        self.fabric.publish(room, &envelope, exclude);
    }

    fn reply(&self, envelope: ServerEnvelope) {
        self.registry.send(&self.conn_id, envelope);
    }

    fn reply_error(&self, err: &Error) {
        error!(
            connection_id = %self.conn_id,
            user_id = %self.user_id.as_str(),
            error = %err,
            "Request failed"
        );

        let message = match err {
            Error::StoreUnavailable(_) => "Service temporarily unavailable",
            _ => "Internal error",
        };
        self.reply(ServerEnvelope::Error {
            message: message.to_string(),
        });
    }
}
