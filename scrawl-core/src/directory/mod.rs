//! Session Directory: the shared, cross-process record of room membership.
//!
//! Keys follow the `{prefix}room:{roomId}:users` set / `{prefix}user:{userId}:room`
//! reverse-pointer scheme. Every operation is atomic per affected room/user
//! pair: the member set and the reverse pointer are never observable in an
//! inconsistent state, even under concurrent calls from multiple relay
//! instances.

mod memory;
mod redis;

pub use self::memory::MemoryDirectory;
pub use self::redis::RedisDirectory;

use async_trait::async_trait;

use crate::models::{RoomId, UserId};
use crate::Result;

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Create a new room with `user` as its first member and point the
    /// user's reverse pointer at it, as one atomic unit.
    async fn create_room(&self, user: &UserId) -> Result<RoomId>;

    /// Add `user` to `room` if the room exists. The existence check and the
    /// membership write are one atomic unit: a room deleted in between makes
    /// the join return `false`, never a partial write. Returns `false` (not
    /// an error) when the room is absent.
    async fn join_room(&self, room: &RoomId, user: &UserId) -> Result<bool>;

    /// Remove `user` from its current room, deleting the room entry in the
    /// same step when the member set drops to zero. No-op when the user has
    /// no current room. Returns the room that was left, if any.
    async fn leave_room(&self, user: &UserId) -> Result<Option<RoomId>>;

    /// Current member set of `room`. Empty both for a room that never
    /// existed and for one whose last member just left; callers must not
    /// distinguish the two.
    async fn room_users(&self, room: &RoomId) -> Result<Vec<UserId>>;
}
