use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::SessionDirectory;
use crate::models::{RoomId, UserId};
use crate::Result;

/// In-process Session Directory for single-instance deployments and tests
///
/// A single mutex guards both tables, so every operation observes and
/// mutates the member set and the reverse pointer as one atomic unit --
/// the same contract the Redis adapter provides with Lua scripts.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, HashSet<UserId>>,
    current_room: HashMap<UserId, RoomId>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rooms (for health reporting)
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn create_room(&self, user: &UserId) -> Result<RoomId> {
        let room = RoomId::new();
        let mut state = self.state.lock();

        state
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
        state.current_room.insert(user.clone(), room.clone());

        Ok(room)
    }

    async fn join_room(&self, room: &RoomId, user: &UserId) -> Result<bool> {
        let mut state = self.state.lock();

        if !state.rooms.contains_key(room) {
            return Ok(false);
        }

        state
            .rooms
            .get_mut(room)
            .expect("checked above under the same lock")
            .insert(user.clone());
        state.current_room.insert(user.clone(), room.clone());

        Ok(true)
    }

    async fn leave_room(&self, user: &UserId) -> Result<Option<RoomId>> {
        let mut state = self.state.lock();

        let Some(room) = state.current_room.remove(user) else {
            return Ok(None);
        };

        if let Some(members) = state.rooms.get_mut(&room) {
            members.remove(user);
            if members.is_empty() {
                state.rooms.remove(&room);
            }
        }

        Ok(Some(room))
    }

    async fn room_users(&self, room: &RoomId) -> Result<Vec<UserId>> {
        let state = self.state.lock();

        Ok(state
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_room_sets_membership_and_pointer() {
        let dir = MemoryDirectory::new();
        let user = UserId::new();

        let room = dir.create_room(&user).await.expect("create");
        let users = dir.room_users(&room).await.expect("users");
        assert_eq!(users, vec![user.clone()]);
        assert_eq!(dir.room_count(), 1);
    }

    #[tokio::test]
    async fn test_join_missing_room_returns_false() {
        let dir = MemoryDirectory::new();
        let user = UserId::new();

        let joined = dir.join_room(&RoomId::new(), &user).await.expect("join");
        assert!(!joined);
        assert_eq!(dir.leave_room(&user).await.expect("leave"), None);
    }

    #[tokio::test]
    async fn test_last_leave_deletes_room() {
        let dir = MemoryDirectory::new();
        let u1 = UserId::new();
        let u2 = UserId::new();

        let room = dir.create_room(&u1).await.expect("create");
        assert!(dir.join_room(&room, &u2).await.expect("join"));

        assert_eq!(dir.leave_room(&u1).await.expect("leave"), Some(room.clone()));
        assert_eq!(dir.room_users(&room).await.expect("users"), vec![u2.clone()]);

        assert_eq!(dir.leave_room(&u2).await.expect("leave"), Some(room.clone()));
        assert_eq!(dir.room_count(), 0);

        // Deleted room behaves exactly like one that never existed
        assert!(!dir.join_room(&room, &u1).await.expect("rejoin"));
        assert!(dir.room_users(&room).await.expect("users").is_empty());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let dir = MemoryDirectory::new();
        let user = UserId::new();

        let room = dir.create_room(&user).await.expect("create");
        assert_eq!(dir.leave_room(&user).await.expect("leave"), Some(room));
        assert_eq!(dir.leave_room(&user).await.expect("leave again"), None);
    }

    #[tokio::test]
    async fn test_at_most_one_room_per_user() {
        let dir = MemoryDirectory::new();
        let user = UserId::new();
        let other = UserId::new();

        let first = dir.create_room(&user).await.expect("create");
        // Keep the first room alive while the user moves on
        assert!(dir.join_room(&first, &other).await.expect("join"));

        // Callers leave before re-entering; the directory tracks one room
        assert_eq!(dir.leave_room(&user).await.expect("leave"), Some(first.clone()));
        let second = dir.create_room(&user).await.expect("create second");

        assert!(!dir
            .room_users(&first)
            .await
            .expect("users")
            .contains(&user));
        assert_eq!(dir.room_users(&second).await.expect("users"), vec![user]);
    }
}
