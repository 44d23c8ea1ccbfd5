//! Backend health monitoring and guarded external calls.
//!
//! The monitor starts `Healthy`. After `failure_threshold` consecutive
//! failures it turns `Degraded`, and callers are routed to the in-process
//! store. While degraded, one call per cooldown interval is let through as a
//! probe; a successful probe restores `Healthy`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{BackendError, BackendResult, CounterBackend};
use crate::error::{Result, TurnstileError};

/// Reachability of the external backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
}

/// Thresholds for the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Consecutive failures before switching to `Degraded`
    pub failure_threshold: u32,
    /// Time between probes while `Degraded`
    pub cooldown: Duration,
    /// Upper bound on a single backend call
    pub timeout: Duration,
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(TurnstileError::Config(
                "backend failure_threshold must be greater than zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TurnstileError::Config(
                "backend timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(5),
            timeout: Duration::from_millis(50),
        }
    }
}

/// Where the next call should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Backend is healthy; call it
    Primary,
    /// Backend is degraded but the cooldown elapsed; try it once
    Probe,
    /// Backend is degraded; use the local store
    Fallback,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<u64>,
    pub degraded_since: Option<u64>,
}

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    consecutive_failures: u32,
    last_failure_at: Option<u64>,
    degraded_since: Option<u64>,
    last_probe_at: u64,
}

/// Tracks whether one external backend is currently reachable.
#[derive(Debug)]
pub struct BackendHealth {
    inner: Mutex<HealthInner>,
    config: HealthConfig,
}

impl BackendHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                last_failure_at: None,
                degraded_since: None,
                last_probe_at: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        self.inner.lock().state
    }

    /// Decide where a call at `now` goes, claiming the probe slot if due.
    pub fn route(&self, now: u64) -> Route {
        let mut inner = self.inner.lock();
        match inner.state {
            HealthState::Healthy => Route::Primary,
            HealthState::Degraded => {
                let cooldown_ms = self.config.cooldown.as_millis() as u64;
                if now.saturating_sub(inner.last_probe_at) >= cooldown_ms {
                    inner.last_probe_at = now;
                    Route::Probe
                } else {
                    Route::Fallback
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Returns the state the monitor was in if this success ended a failure
    /// streak, `None` if there was no streak to end.
    pub fn record_success(&self) -> Option<HealthState> {
        let mut inner = self.inner.lock();
        if inner.consecutive_failures == 0 && inner.state == HealthState::Healthy {
            return None;
        }

        let previous = inner.state;
        inner.consecutive_failures = 0;
        inner.state = HealthState::Healthy;
        inner.degraded_since = None;
        Some(previous)
    }

    /// Record a failed call. Returns `true` if this switched to `Degraded`.
    pub fn record_failure(&self, now: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);

        if inner.state == HealthState::Healthy
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = HealthState::Degraded;
            inner.degraded_since = Some(now);
            inner.last_probe_at = now;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            degraded_since: inner.degraded_since,
        }
    }
}

/// Result of a guarded backend call.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The backend answered
    Served(T),
    /// The backend answered after earlier calls fell back to the local store
    Recovered(T),
    /// The backend was skipped or failed; use the local store
    Fallback,
}

/// An external backend wrapped by its health monitor.
pub struct MonitoredBackend {
    backend: Arc<dyn CounterBackend>,
    health: BackendHealth,
    failovers: AtomicU64,
}

impl MonitoredBackend {
    pub fn new(backend: Arc<dyn CounterBackend>, config: HealthConfig) -> Self {
        Self {
            backend,
            health: BackendHealth::new(config),
            failovers: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &dyn CounterBackend {
        self.backend.as_ref()
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    /// Increments that ended up on the local store.
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether reads may go to the backend without claiming a probe.
    pub fn is_routable(&self) -> bool {
        self.health.state() == HealthState::Healthy
    }

    /// Run `call` against the backend if routing allows, bounded by the timeout.
    ///
    /// `call` is only polled when the backend is routable, so building it is
    /// free when the result is `Fallback`.
    pub async fn guard<T, F>(&self, op: &'static str, now: u64, call: F) -> Guarded<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let route = self.health.route(now);
        if route == Route::Fallback {
            return Guarded::Fallback;
        }

        let timeout = self.health.config().timeout;
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };

        match result {
            Ok(value) => match self.health.record_success() {
                None => Guarded::Served(value),
                Some(HealthState::Degraded) => {
                    info!(backend = self.name(), op, "External backend recovered");
                    Guarded::Recovered(value)
                }
                Some(HealthState::Healthy) => {
                    debug!(backend = self.name(), op, "External backend answered after failures");
                    Guarded::Recovered(value)
                }
            },
            Err(error) => {
                let degraded = self.health.record_failure(now);
                if degraded {
                    warn!(
                        backend = self.name(),
                        op,
                        error = %error,
                        "External backend degraded, using local store"
                    );
                } else {
                    debug!(
                        backend = self.name(),
                        op,
                        probe = route == Route::Probe,
                        error = %error,
                        "External backend call failed"
                    );
                }
                Guarded::Fallback
            }
        }
    }
}
