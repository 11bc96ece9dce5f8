//! Redis implementation of CoordinationStore
//!
//! Production backend shared by every worker process:
//! - Locks are plain keys written with `SET NX PX`
//! - Holder-checked renew/release and window admission run as Lua scripts,
//!   so each is a single atomic step on the server

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::{debug, instrument};

use super::store::{CoordinationStore, StoreError, WindowDecision};

const EXPIRE_IF_VALUE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_VALUE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const WINDOW_ADMIT_LUA: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
if redis.call('ZCARD', KEYS[1]) < capacity then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    redis.call('PEXPIRE', KEYS[1], window)
    return {1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {0, tonumber(oldest[2])}
"#;

/// Redis implementation of CoordinationStore
///
/// Uses a [`ConnectionManager`], which reconnects transparently and is cheap
/// to clone per command.
///
/// # Example
///
/// ```ignore
/// use jobguard_durable::RedisCoordinationStore;
///
/// let store = RedisCoordinationStore::connect("redis://localhost:6379").await?;
/// ```
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: ConnectionManager,
    key_prefix: String,
    expire_if_value: Script,
    delete_if_value: Script,
    window_admit: Script,
}

impl RedisCoordinationStore {
    /// Connect to Redis at the given URL (e.g. "redis://localhost:6379")
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: String::new(),
            expire_if_value: Script::new(EXPIRE_IF_VALUE_LUA),
            delete_if_value: Script::new(DELETE_IF_VALUE_LUA),
            window_admit: Script::new(WINDOW_ADMIT_LUA),
        }
    }

    /// Prefix every key (useful when several environments share one Redis)
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn command_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(command_error)
    }

    #[instrument(skip(self, value))]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        debug!(key, created = reply.is_some(), "SET NX PX");
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(updated == 1)
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .expire_if_value
            .key(self.key(key))
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(updated == 1)
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_if_value
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(removed == 1)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(self.key(key))
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn sorted_remove_up_to(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.key(key))
            .arg("-inf")
            .arg(max_score)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn sorted_count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(self.key(key))
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn sorted_oldest(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.key(key))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(entries
            .into_iter()
            .next()
            .map(|(member, score)| (member, score as i64)))
    }

    #[instrument(skip(self, member))]
    async fn window_admit(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window: Duration,
        capacity: u32,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .window_admit
            .key(self.key(key))
            .arg(now_ms)
            .arg(ttl_millis(window))
            .arg(capacity)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        match reply.as_slice() {
            [1, _] => Ok(WindowDecision::Admitted),
            [0, oldest_ms] => Ok(WindowDecision::Rejected {
                oldest_ms: *oldest_ms,
            }),
            other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}
