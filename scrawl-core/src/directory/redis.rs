use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use super::SessionDirectory;
use crate::models::{RoomId, UserId};
use crate::{Error, Result};

/// Timeout for directory operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Session Directory backed by Redis
///
/// Membership transitions use Lua scripts so the existence check, the set
/// write, and the reverse pointer stay one atomic unit regardless of which
/// relay instance issues the call.
#[derive(Clone)]
pub struct RedisDirectory {
    redis: RedisConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisDirectory {
    /// Connect to Redis and return a ready directory
    pub async fn connect(url: &str, key_prefix: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::StoreUnavailable(format!("invalid Redis URL: {e}")))?;

        let op_timeout = Duration::from_secs(REDIS_TIMEOUT_SECS);
        let redis = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::StoreUnavailable("timed out connecting to Redis".to_string()))?
            .map_err(Error::from)?;

        Ok(Self {
            redis,
            key_prefix: key_prefix.to_string(),
            op_timeout,
        })
    }

    /// Build a directory from an existing connection handle (tests, shared pools)
    #[must_use]
    pub fn new(redis: RedisConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
            op_timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
        }
    }

    fn room_key(&self, room: &RoomId) -> String {
        format!("{}room:{}:users", self.key_prefix, room.as_str())
    }

    fn user_key(&self, user: &UserId) -> String {
        format!("{}user:{}:room", self.key_prefix, user.as_str())
    }

    /// Bound a Redis call so a stalled store surfaces as `StoreUnavailable`
    /// instead of wedging the calling connection's message loop
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::StoreUnavailable(
                "timed out talking to Redis".to_string(),
            )),
        }
    }
}

#[async_trait]
impl SessionDirectory for RedisDirectory {
    async fn create_room(&self, user: &UserId) -> Result<RoomId> {
        let room = RoomId::new();
        let mut conn = self.redis.clone();

        // SADD + SET as one MULTI/EXEC unit
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(self.room_key(&room), user.as_str())
            .ignore()
            .set(self.user_key(user), room.as_str())
            .ignore();

        let _: () = self.bounded(pipe.query_async(&mut conn)).await?;

        tracing::debug!(
            room_id = %room.as_str(),
            user_id = %user.as_str(),
            "Room created in directory"
        );

        Ok(room)
    }

    async fn join_room(&self, room: &RoomId, user: &UserId) -> Result<bool> {
        // The existence check and the membership write must be one unit: a
        // room whose last member leaves between the two must fail the join,
        // not resurrect the room.
        let script = Script::new(
            r#"
            if redis.call("EXISTS", KEYS[1]) == 1 then
                redis.call("SADD", KEYS[1], ARGV[1])
                redis.call("SET", KEYS[2], ARGV[2])
                return 1
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let joined: i32 = self
            .bounded(
                script
                    .key(self.room_key(room))
                    .key(self.user_key(user))
                    .arg(user.as_str())
                    .arg(room.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        if joined == 1 {
            tracing::debug!(
                room_id = %room.as_str(),
                user_id = %user.as_str(),
                "User joined room in directory"
            );
        }

        Ok(joined == 1)
    }

    async fn leave_room(&self, user: &UserId) -> Result<Option<RoomId>> {
        let mut conn = self.redis.clone();

        let current: Option<String> = self
            .bounded(
                redis::cmd("GET")
                    .arg(self.user_key(user))
                    .query_async(&mut conn),
            )
            .await?;

        let Some(room_str) = current else {
            return Ok(None);
        };
        let room = RoomId::from_string(room_str);

        // Guarded on the reverse pointer still naming this room, so a
        // concurrent leave/join pair cannot remove the user from a room it
        // re-entered in the meantime. Empty rooms are deleted in the same
        // script invocation.
        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[2]) ~= ARGV[2] then
                return 0
            end
            redis.call("SREM", KEYS[1], ARGV[1])
            redis.call("DEL", KEYS[2])
            if redis.call("SCARD", KEYS[1]) == 0 then
                redis.call("DEL", KEYS[1])
            end
            return 1
            "#,
        );

        let removed: i32 = self
            .bounded(
                script
                    .key(self.room_key(&room))
                    .key(self.user_key(user))
                    .arg(user.as_str())
                    .arg(room.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        if removed == 1 {
            tracing::debug!(
                room_id = %room.as_str(),
                user_id = %user.as_str(),
                "User left room in directory"
            );
            Ok(Some(room))
        } else {
            Ok(None)
        }
    }

    async fn room_users(&self, room: &RoomId) -> Result<Vec<UserId>> {
        let mut conn = self.redis.clone();

        let members: Vec<String> = self
            .bounded(
                redis::cmd("SMEMBERS")
                    .arg(self.room_key(room))
                    .query_async(&mut conn),
            )
            .await?;

        Ok(members.into_iter().map(UserId::from_string).collect())
    }
}
