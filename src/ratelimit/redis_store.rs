//! Redis-backed fixed-window counters for multi-instance deployments.
//!
//! Each key is a hash `{count, limit, window_ms}` whose TTL is the remainder of its
//! window, so Redis expiry is the window reset. The connection is opened
//! lazily: an unreachable server at startup is just a failing backend that
//! the health monitor keeps probing.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{BackendError, BackendResult, CounterBackend};
use super::counter::WindowRecord;
use crate::error::{Result, TurnstileError};

/// Default prefix for every key this backend writes.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])

local count = redis.call("HINCRBY", key, "count", 1)
redis.call("HSET", key, "limit", limit, "window_ms", window_ms)

if count == 1 then
    redis.call("PEXPIRE", key, window_ms)
end

local ttl = redis.call("PTTL", key)
if ttl < 0 then
    redis.call("PEXPIRE", key, window_ms)
    ttl = window_ms
end

return {count, ttl}
"#;

const SCAN_BATCH: usize = 500;

/// Counter backend talking to a Redis server.
pub struct RedisBackend {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    prefix: String,
    script: redis::Script,
}

impl RedisBackend {
    /// Validate `url` and prepare a lazily connected backend.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("invalid backend url: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            prefix: prefix.into(),
            script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> BackendResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(prefix = %self.prefix, "Connected to redis counter backend");
                Ok::<_, BackendError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn record(key: &str, count: u64, ttl_ms: i64, window_ms: u64, limit: u64, now: u64) -> WindowRecord {
        let remaining_ms = u64::try_from(ttl_ms).unwrap_or(0).min(window_ms);
        WindowRecord {
            key: key.to_string(),
            count,
            window_start: now.saturating_sub(window_ms - remaining_ms),
            window_ms,
            limit,
        }
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now: u64,
    ) -> BackendResult<WindowRecord> {
        let mut conn = self.connection().await?;

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(self.redis_key(key))
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, count, ttl_ms, "Incremented redis counter");
        Ok(Self::record(key, count, ttl_ms, window_ms, limit, now))
    }

    async fn get(&self, key: &str, now: u64) -> BackendResult<Option<WindowRecord>> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);

        let (count, limit, window_ms): (Option<u64>, Option<u64>, Option<u64>) =
            redis::cmd("HMGET")
                .arg(&redis_key)
                .arg("count")
                .arg("limit")
                .arg("window_ms")
                .query_async(&mut conn)
                .await?;
        let ttl_ms: i64 = redis::cmd("PTTL").arg(&redis_key).query_async(&mut conn).await?;

        match (count, limit, window_ms) {
            (Some(count), Some(limit), Some(window_ms)) if ttl_ms != -2 => Ok(Some(Self::record(
                key, count, ttl_ms, window_ms, limit, now,
            ))),
            _ => Ok(None),
        }
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset_all(&self) -> BackendResult<()> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let _: () = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn key_count(&self) -> BackendResult<usize> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut total = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            total += keys.len();
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = RedisBackend::new("not a url", DEFAULT_KEY_PREFIX).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_keys_are_prefixed() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379", "app:").unwrap();
        assert_eq!(backend.redis_key("api|ip=::1"), "app:api|ip=::1");
        assert_eq!(backend.name(), "redis");
    }

    #[test]
    fn test_record_from_ttl() {
        let record = RedisBackend::record("k", 3, 45_000, 60_000, 5, 100_000);

        assert_eq!(record.count, 3);
        assert_eq!(record.window_start, 85_000);
        assert_eq!(record.reset_at(), 145_000);
    }

    #[test]
    fn test_record_clamps_odd_ttl() {
        // Missing TTL is treated as a window that has just ended.
        let record = RedisBackend::record("k", 1, -1, 1_000, 5, 10_000);
        assert_eq!(record.window_start, 9_000);

        let record = RedisBackend::record("k", 1, 5_000, 1_000, 5, 10_000);
        assert_eq!(record.window_start, 10_000);
    }
}
