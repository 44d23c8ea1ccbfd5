//! Window records and the decisions derived from them.

use serde::Serialize;

use crate::error::{Result, TurnstileError};

/// State of one counted key within its current fixed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowRecord {
    /// Composite key this record counts
    pub key: String,
    /// Attempts recorded in the current window, admitted or not
    pub count: u64,
    /// When the current window began (epoch millis)
    pub window_start: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Limit most recently applied to this key
    pub limit: u64,
}

impl WindowRecord {
    /// Start a fresh window at `now` holding a single hit.
    pub fn fresh(key: &str, window_ms: u64, limit: u64, now: u64) -> Self {
        Self {
            key: key.to_string(),
            count: 1,
            window_start: now,
            window_ms,
            limit,
        }
    }

    /// When the current window ends.
    pub fn reset_at(&self) -> u64 {
        self.window_start.saturating_add(self.window_ms)
    }

    /// Whether the window has fully elapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms
    }

    /// Whether the record is past its window plus one grace window.
    pub fn is_evictable(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms.saturating_mul(2)
    }

    /// Count as seen by a reader at `now`: zero once the window elapsed.
    pub fn live_count(&self, now: u64) -> u64 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }
}

/// Which store produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The in-process sharded store
    Local,
    /// The configured external backend
    External,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Policy name or route tag the check ran under
    pub scope: String,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// End of the current window (epoch millis)
    pub reset_at: u64,
    /// Zero when allowed
    pub retry_after_ms: u64,
    pub backend: BackendKind,
}

impl Decision {
    /// Derive a decision from the post-increment record.
    pub fn from_record(
        scope: &str,
        record: &WindowRecord,
        limit: u64,
        now: u64,
        backend: BackendKind,
    ) -> Self {
        let allowed = record.count <= limit;
        let reset_at = record.reset_at();

        Self {
            scope: scope.to_string(),
            allowed,
            limit,
            remaining: limit.saturating_sub(record.count),
            reset_at,
            retry_after_ms: if allowed {
                0
            } else {
                reset_at.saturating_sub(now)
            },
            backend,
        }
    }

    /// Human-readable rejection reason, `None` when allowed.
    pub fn reason(&self) -> Option<String> {
        if self.allowed {
            None
        } else {
            Some(format!("rate limit exceeded for {}", self.scope))
        }
    }

    /// Turn a rejection into a `RateLimited` error so call sites can use `?`.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(TurnstileError::RateLimited {
                scope: self.scope,
                retry_after_ms: self.retry_after_ms,
                remaining: self.remaining,
            })
        }
    }
}

/// Read-only view of a key returned by `get_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub count: u64,
    pub remaining: u64,
    pub reset_at: u64,
}

impl WindowInfo {
    pub fn from_record(record: &WindowRecord, now: u64) -> Self {
        let count = record.live_count(now);
        Self {
            count,
            remaining: record.limit.saturating_sub(count),
            reset_at: record.reset_at(),
        }
    }
}
