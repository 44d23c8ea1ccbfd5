//! The rate limiter facade.
//!
//! Every check resolves a policy, composes a key, and increments a fixed
//! window counter. When an external backend is configured it is tried first;
//! any failure there falls over to the in-process store so a limit is still
//! enforced, just counted locally.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::backend::CounterBackend;
use super::clock::{Clock, SystemClock};
use super::counter::{BackendKind, Decision, WindowInfo, WindowRecord};
use super::health::{Guarded, HealthConfig, HealthState, MonitoredBackend};
use super::key::{self, Fragment, Identity};
use super::rules::{validate_limits, PolicyTable};
use super::store::{LocalStore, DEFAULT_SHARD_COUNT};
use super::sweeper::{self, SweeperHandle, DEFAULT_SWEEP_FLOOR};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Default number of entries reported in `top_offenders`.
const DEFAULT_TOP_OFFENDERS: usize = 10;

/// A key and its current count, as reported in stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offender {
    pub key: String,
    pub count: u64,
}

/// Operational snapshot of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Keys held by the authoritative store: the external backend while it
    /// answers, the in-process store otherwise
    pub total_keys: usize,
    /// Records held by the in-process store
    pub local_keys: usize,
    /// Name of the authoritative backend
    pub backend: &'static str,
    pub backend_state: HealthState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_since: Option<u64>,
    /// Increments counted locally because the external backend was skipped or failed
    pub failovers: u64,
    /// Busiest live keys in the in-process store only; the external backend
    /// is not scanned
    pub top_offenders: Vec<Offender>,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    shard_count: usize,
    external: Option<(Arc<dyn CounterBackend>, HealthConfig)>,
    top_offenders: usize,
    sweep_floor: Duration,
}

impl RateLimiterBuilder {
    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Use `backend` as the authoritative store, guarded by a health monitor.
    pub fn external(mut self, backend: Arc<dyn CounterBackend>, health: HealthConfig) -> Self {
        self.external = Some((backend, health));
        self
    }

    pub fn top_offenders(mut self, n: usize) -> Self {
        self.top_offenders = n;
        self
    }

    pub fn sweep_floor(mut self, floor: Duration) -> Self {
        self.sweep_floor = floor;
        self
    }

    pub fn build(self) -> Result<RateLimiter> {
        let external = match self.external {
            Some((backend, health)) => {
                health.validate()?;
                info!(
                    backend = backend.name(),
                    failure_threshold = health.failure_threshold,
                    timeout_ms = health.timeout.as_millis() as u64,
                    "External counter backend configured"
                );
                Some(MonitoredBackend::new(backend, health))
            }
            None => None,
        };

        Ok(RateLimiter {
            policies: self.policies,
            local: Arc::new(LocalStore::new(self.shard_count)),
            external,
            clock: self.clock,
            top_offenders: self.top_offenders,
            sweep_floor: self.sweep_floor,
        })
    }
}

/// The rate limiter other subsystems call.
///
/// Thread-safe; share it behind an `Arc`.
pub struct RateLimiter {
    policies: PolicyTable,
    local: Arc<LocalStore>,
    external: Option<MonitoredBackend>,
    clock: Arc<dyn Clock>,
    top_offenders: usize,
    sweep_floor: Duration,
}

impl RateLimiter {
    /// A local-only limiter with the built-in policy table.
    pub fn new() -> Self {
        Self {
            policies: PolicyTable::builtin(),
            local: Arc::new(LocalStore::new(DEFAULT_SHARD_COUNT)),
            external: None,
            clock: Arc::new(SystemClock),
            top_offenders: DEFAULT_TOP_OFFENDERS,
            sweep_floor: DEFAULT_SWEEP_FLOOR,
        }
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder {
            policies: PolicyTable::builtin(),
            clock: Arc::new(SystemClock),
            shard_count: DEFAULT_SHARD_COUNT,
            external: None,
            top_offenders: DEFAULT_TOP_OFFENDERS,
            sweep_floor: DEFAULT_SWEEP_FLOOR,
        }
    }

    /// Build a limiter from loaded configuration.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .policies(config.policy_table()?)
            .shard_count(config.store.shard_count)
            .top_offenders(config.store.top_offenders)
            .sweep_floor(Duration::from_millis(config.store.sweep_floor_ms));

        if let Some(url) = config.backend.url.as_deref() {
            let backend = external_backend(url, &config.backend.key_prefix)?;
            builder = builder.external(backend, config.backend.health());
        }

        builder.build()
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// The in-process store, also used while the external backend is degraded.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Check `key` against an explicit limit. Every other check reduces to this.
    pub async fn check(&self, key: &str, limit: u64, window_ms: u64) -> Result<Decision> {
        self.check_scoped(key, key, limit, window_ms).await
    }

    /// Check `identity` against a named policy from the table.
    ///
    /// Keys on the user id when present, otherwise on the IP.
    pub async fn check_typed(&self, policy: &str, identity: &Identity) -> Result<Decision> {
        let policy = self.policies.get(policy)?;
        let key = key::compose(&policy.name, &[identity.primary_fragment()]);
        self.check_scoped(&policy.name, &key, policy.limit, policy.window_ms)
            .await
    }

    /// Check a request path against the policy routed to it.
    pub async fn check_endpoint(&self, endpoint: &str, identity: &Identity) -> Result<Decision> {
        let policy = self.policies.for_endpoint(endpoint)?;
        let key = key::compose(
            &policy.name,
            &[Fragment::Route(endpoint), identity.primary_fragment()],
        );
        self.check_scoped(&policy.name, &key, policy.limit, policy.window_ms)
            .await
    }

    /// Ad-hoc per-IP limit for call sites not covered by the table.
    pub async fn check_ip(
        &self,
        route_tag: &str,
        ip: Option<&str>,
        limit: u64,
        window_ms: u64,
    ) -> Result<Decision> {
        let key = key::compose(route_tag, &[Fragment::Ip(ip)]);
        self.check_scoped(route_tag, &key, limit, window_ms).await
    }

    /// Ad-hoc per-user limit.
    pub async fn check_user(
        &self,
        route_tag: &str,
        user_id: &str,
        limit: u64,
        window_ms: u64,
    ) -> Result<Decision> {
        let key = key::compose(route_tag, &[Fragment::User(Some(user_id))]);
        self.check_scoped(route_tag, &key, limit, window_ms).await
    }

    /// Ad-hoc limit on the user and IP pair.
    pub async fn check_user_ip(
        &self,
        route_tag: &str,
        user_id: &str,
        ip: Option<&str>,
        limit: u64,
        window_ms: u64,
    ) -> Result<Decision> {
        let key = key::compose(
            route_tag,
            &[Fragment::User(Some(user_id)), Fragment::Ip(ip)],
        );
        self.check_scoped(route_tag, &key, limit, window_ms).await
    }

    async fn check_scoped(
        &self,
        scope: &str,
        key: &str,
        limit: u64,
        window_ms: u64,
    ) -> Result<Decision> {
        if key.is_empty() {
            return Err(TurnstileError::Config("rate limit key must not be empty".into()));
        }
        validate_limits(scope, limit, window_ms)?;

        let now = self.clock.now_millis();
        trace!(key = %key, limit, window_ms, "Checking rate limit");

        let (record, backend) = self.increment(key, window_ms, limit, now).await;
        let decision = Decision::from_record(scope, &record, limit, now, backend);

        if !decision.allowed {
            debug!(
                key = %key,
                count = record.count,
                limit,
                retry_after_ms = decision.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now: u64,
    ) -> (WindowRecord, BackendKind) {
        if let Some(external) = &self.external {
            let call = external.backend().increment(key, window_ms, limit, now);
            match external.guard("increment", now, call).await {
                Guarded::Served(record) => return (record, BackendKind::External),
                Guarded::Recovered(record) => {
                    self.discard_outage_counts();
                    return (record, BackendKind::External);
                }
                Guarded::Fallback => external.record_failover(),
            }
        }

        (
            self.local.increment(key, window_ms, limit, now),
            BackendKind::Local,
        )
    }

    fn discard_outage_counts(&self) {
        let discarded = self.local.len();
        self.local.reset_all();
        info!(discarded, "Discarded counts accumulated while degraded");
    }

    /// Read-only view of a key, `None` if nothing is recorded.
    pub async fn get_info(&self, key: &str) -> Option<WindowInfo> {
        let now = self.clock.now_millis();

        if let Some(external) = &self.external {
            let call = external.backend().get(key, now);
            match external.guard("get", now, call).await {
                Guarded::Served(record) => {
                    return record.map(|r| WindowInfo::from_record(&r, now));
                }
                Guarded::Recovered(record) => {
                    self.discard_outage_counts();
                    return record.map(|r| WindowInfo::from_record(&r, now));
                }
                Guarded::Fallback => {}
            }
        }

        self.local
            .get(key)
            .map(|record| WindowInfo::from_record(&record, now))
    }

    /// Forget one key in every store.
    pub async fn reset(&self, key: &str) {
        self.local.reset(key);

        if let Some(external) = &self.external {
            let now = self.clock.now_millis();
            let call = external.backend().reset(key);
            if let Guarded::Fallback = external.guard("reset", now, call).await {
                warn!(key = %key, "Could not reset key on external backend");
            }
        }
    }

    /// Forget every key in every store. Test and incident tooling only.
    pub async fn reset_all(&self) {
        self.local.reset_all();

        if let Some(external) = &self.external {
            let now = self.clock.now_millis();
            let call = external.backend().reset_all();
            if let Guarded::Fallback = external.guard("reset_all", now, call).await {
                warn!("Could not reset external backend");
            }
        }
    }

    /// Operational snapshot for monitoring endpoints.
    ///
    /// Asks the external backend for its key count only while it is healthy,
    /// so a stats call never claims a recovery probe.
    pub async fn stats(&self) -> LimiterStats {
        let now = self.clock.now_millis();
        let local_keys = self.local.len();
        let top_offenders = self
            .local
            .top_keys(self.top_offenders, now)
            .into_iter()
            .map(|(key, count)| Offender { key, count })
            .collect();

        let Some(external) = &self.external else {
            return LimiterStats {
                total_keys: local_keys,
                local_keys,
                backend: "memory",
                backend_state: HealthState::Healthy,
                consecutive_failures: 0,
                last_failure_at: None,
                degraded_since: None,
                failovers: 0,
                top_offenders,
            };
        };

        let mut total_keys = local_keys;
        if external.is_routable() {
            let call = external.backend().key_count();
            match external.guard("key_count", now, call).await {
                Guarded::Served(count) => total_keys = count,
                Guarded::Recovered(count) => {
                    self.discard_outage_counts();
                    total_keys = count;
                }
                Guarded::Fallback => {}
            }
        }

        let health = external.health().snapshot();
        LimiterStats {
            total_keys,
            local_keys,
            backend: external.name(),
            backend_state: health.state,
            consecutive_failures: health.consecutive_failures,
            last_failure_at: health.last_failure_at,
            degraded_since: health.degraded_since,
            failovers: external.failovers(),
            top_offenders,
        }
    }

    /// Interval the background sweeper runs at.
    pub fn sweep_interval(&self) -> Duration {
        sweeper::sweep_interval(self.policies.min_window_ms(), self.sweep_floor)
    }

    /// Start evicting expired local records in the background.
    pub fn start_sweeper(&self) -> SweeperHandle {
        sweeper::spawn(self.local.clone(), self.clock.clone(), self.sweep_interval())
    }

    /// Run one eviction pass now, returning the number of records removed.
    pub fn sweep_now(&self) -> usize {
        self.local.sweep(self.clock.now_millis())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "redis")]
fn external_backend(url: &str, prefix: &str) -> Result<Arc<dyn CounterBackend>> {
    let backend = super::redis_store::RedisBackend::new(url, prefix)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
fn external_backend(_url: &str, _prefix: &str) -> Result<Arc<dyn CounterBackend>> {
    Err(TurnstileError::Config(
        "an external backend url is configured but the `redis` feature is disabled".into(),
    ))
}
