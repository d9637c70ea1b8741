//! Wire envelopes exchanged with clients
//!
//! Envelopes are UTF-8 JSON objects tagged by a `type` field; tag values are
//! snake_case, payload fields camelCase. Binary WebSocket frames are decoded
//! as UTF-8 text before parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use scrawl_core::models::{RoomId, UserId};

/// A 2D canvas coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One stroke segment, relayed verbatim between subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeSegment {
    pub from: Point,
    pub to: Point,
    pub color: String,
    pub size: f64,
}

/// Messages accepted from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    CreateRoom,

    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    LeaveRoom,

    Draw { payload: StrokeSegment },

    /// Opaque payload fanned out to every subscriber, sender included
    Broadcast { payload: Value },

    #[serde(rename_all = "camelCase")]
    GetRoomUsers { room_id: RoomId },
}

impl ClientEnvelope {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::CreateRoom => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::Draw { .. } => "draw",
            Self::Broadcast { .. } => "broadcast",
            Self::GetRoomUsers { .. } => "get_room_users",
        }
    }
}

/// Messages emitted to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    Connected { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: RoomId, user_id: UserId },

    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: RoomId, user_id: UserId },

    #[serde(rename_all = "camelCase")]
    RoomLeft { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    RoomUsers { room_id: RoomId, users: Vec<UserId> },

    #[serde(rename_all = "camelCase")]
    Draw {
        user_id: UserId,
        payload: StrokeSegment,
    },

    #[serde(rename_all = "camelCase")]
    Broadcast {
        user_id: UserId,
        room_id: RoomId,
        payload: Value,
    },

    Error { message: String },
}

impl ServerEnvelope {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RoomCreated { .. } => "room_created",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::RoomUsers { .. } => "room_users",
            Self::Draw { .. } => "draw",
            Self::Broadcast { .. } => "broadcast",
            Self::Error { .. } => "error",
        }
    }
}
