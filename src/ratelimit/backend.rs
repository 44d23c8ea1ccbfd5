//! Counter backend trait for abstracting the in-process and external stores.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::counter::WindowRecord;

/// Errors raised by an external counter backend.
///
/// These never reach callers of the limiter; they drive failover instead.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A store of fixed-window counters.
///
/// Both the sharded in-process store and the external adapter implement this,
/// so the limiter never branches on which concrete store it talks to.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Short name reported in stats and logs.
    fn name(&self) -> &'static str;

    /// Atomically record one hit for `key` and return the post-increment record.
    ///
    /// Starts a fresh window when none exists or the previous one elapsed.
    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now: u64,
    ) -> BackendResult<WindowRecord>;

    /// Read a record without extending or mutating it.
    async fn get(&self, key: &str, now: u64) -> BackendResult<Option<WindowRecord>>;

    /// Forget one key.
    async fn reset(&self, key: &str) -> BackendResult<()>;

    /// Forget every key owned by this backend.
    async fn reset_all(&self) -> BackendResult<()>;

    /// Number of keys currently held.
    async fn key_count(&self) -> BackendResult<usize>;
}
