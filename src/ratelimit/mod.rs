//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod health;
mod key;
mod limiter;
#[cfg(feature = "redis")]
mod redis_store;
mod rules;
mod store;
mod sweeper;

pub use backend::{BackendError, BackendResult, CounterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{BackendKind, Decision, WindowInfo, WindowRecord};
pub use health::{
    BackendHealth, Guarded, HealthConfig, HealthSnapshot, HealthState, MonitoredBackend, Route,
};
pub use key::{compose, normalize_ip, Fragment, Identity, UNKNOWN};
pub use limiter::{LimiterStats, Offender, RateLimiter, RateLimiterBuilder};
#[cfg(feature = "redis")]
pub use redis_store::{RedisBackend, DEFAULT_KEY_PREFIX};
pub use rules::{
    builtin_policies, builtin_routes, validate_limits, Policy, PolicyFile, PolicySpec,
    PolicyTable, DEFAULT_ROUTE_POLICY,
};
pub use store::{LocalStore, DEFAULT_SHARD_COUNT};
pub use sweeper::{sweep_interval, SweeperHandle, DEFAULT_SWEEP_FLOOR};
