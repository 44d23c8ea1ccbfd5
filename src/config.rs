//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{builtin_policies, builtin_routes, HealthConfig, PolicySpec, PolicyTable};

/// Prefix for environment overrides, e.g. `TURNSTILE__BACKEND__URL`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for a Turnstile limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// In-process store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// External counter backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Policy name to `{limit, window_ms}`
    #[serde(default = "builtin_policies")]
    pub policies: BTreeMap<String, PolicySpec>,

    /// Endpoint path to policy name
    #[serde(default = "builtin_routes")]
    pub routes: BTreeMap<String, String>,

    /// Policy for endpoints without a route
    #[serde(default)]
    pub default_route_policy: Option<String>,
}

/// Sections that environment variables may override.
#[derive(Debug, Serialize, Deserialize)]
struct Overridable {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    backend: BackendConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            backend: BackendConfig::default(),
            policies: builtin_policies(),
            routes: builtin_routes(),
            default_route_policy: None,
        }
    }
}

/// In-process store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of independently locked shards
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Minimum interval between eviction sweeps
    #[serde(default = "default_sweep_floor_ms")]
    pub sweep_floor_ms: u64,

    /// How many keys `stats` reports as top offenders
    #[serde(default = "default_top_offenders")]
    pub top_offenders: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            sweep_floor_ms: default_sweep_floor_ms(),
            top_offenders: default_top_offenders(),
        }
    }
}

fn default_shard_count() -> usize {
    32
}

fn default_sweep_floor_ms() -> u64 {
    10_000
}

fn default_top_offenders() -> usize {
    10
}

/// External counter backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Connection string; absent means local-only
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written to the backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before failing over
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Milliseconds between recovery probes while degraded
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    5_000
}

impl BackendConfig {
    /// Health monitor thresholds derived from this configuration.
    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load an optional YAML file, then apply `TURNSTILE__*` environment overrides.
    ///
    /// Overrides reach the `store` and `backend` sections only. Policy and route
    /// names are case-sensitive, and the layered source lowercases map keys, so
    /// those tables always come from the file as written.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut loaded = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let base = Overridable {
            store: loaded.store.clone(),
            backend: loaded.backend.clone(),
        };
        let overrides: Overridable = config::Config::builder()
            .add_source(config::Config::try_from(&base)?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        loaded.store = overrides.store;
        loaded.backend = overrides.backend;
        Ok(loaded)
    }

    /// Validated policy table built from `policies` and `routes`.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::new(
            self.policies.clone(),
            self.routes.clone(),
            self.default_route_policy.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();

        assert_eq!(config.store.shard_count, 32);
        assert_eq!(config.store.sweep_floor_ms, 10_000);
        assert!(config.backend.url.is_none());
        assert_eq!(config.backend.timeout_ms, 50);
        assert_eq!(config.policies["api"], PolicySpec { limit: 100, window_ms: 60_000 });
        assert_eq!(config.routes["/api/upload"], "upload");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  shard_count: 64
backend:
  url: redis://127.0.0.1:6379
  failure_threshold: 5
  cooldown_ms: 1000
policies:
  api:
    limit: 50
    window_ms: 1000
routes: {}
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.shard_count, 64);
        assert_eq!(config.store.top_offenders, 10);
        assert_eq!(config.backend.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.backend.key_prefix, "turnstile:");

        let health = config.backend.health();
        assert_eq!(health.failure_threshold, 5);
        assert_eq!(health.cooldown, Duration::from_millis(1000));
        assert_eq!(health.timeout, Duration::from_millis(50));

        let table = config.policy_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("api").unwrap().limit, 50);
    }

    #[test]
    fn test_policy_table_validation_surfaces() {
        let yaml = r#"
policies:
  api:
    limit: 0
    window_ms: 1000
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert!(config.policy_table().unwrap_err().is_configuration());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = TurnstileConfig::from_yaml("store: [").unwrap_err();
        assert!(err.is_configuration());
    }

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let file = format!("turnstile-{}-{}.yaml", std::process::id(), name);
        let path = std::env::temp_dir().join(file);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_without_file() {
        let config = TurnstileConfig::load(None).unwrap();
        assert!(config.policies.contains_key("auth"));
        assert!(config.policies.contains_key("createRoom"));
    }

    #[test]
    fn test_load_file_keeps_policy_name_case() {
        let path = write_temp(
            "camel",
            r#"
store:
  shard_count: 8
policies:
  api:
    limit: 100
    window_ms: 60000
  createRoom:
    limit: 5
    window_ms: 60000
routes:
  /api/rooms: createRoom
"#,
        );

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.store.shard_count, 8);
        assert!(config.policies.contains_key("createRoom"));
        assert!(!config.policies.contains_key("createroom"));

        let table = config.policy_table().unwrap();
        assert_eq!(table.for_endpoint("/api/rooms").unwrap().name, "createRoom");
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let path = write_temp(
            "env",
            r#"
backend:
  key_prefix: "file:"
policies:
  passwordReset:
    limit: 3
    window_ms: 3600000
routes: {}
default_route_policy: passwordReset
"#,
        );
        std::env::set_var("TURNSTILE__BACKEND__URL", "redis://10.1.2.3:6379");
        std::env::set_var("TURNSTILE__BACKEND__FAILURE_THRESHOLD", "7");

        let config = TurnstileConfig::load(Some(&path));
        std::env::remove_var("TURNSTILE__BACKEND__URL");
        std::env::remove_var("TURNSTILE__BACKEND__FAILURE_THRESHOLD");
        std::fs::remove_file(&path).ok();
        let config = config.unwrap();

        assert_eq!(config.backend.url.as_deref(), Some("redis://10.1.2.3:6379"));
        assert_eq!(config.backend.failure_threshold, 7);
        assert_eq!(config.backend.key_prefix, "file:");
        assert_eq!(config.backend.timeout_ms, 50);
        assert!(config.policies.contains_key("passwordReset"));
        assert!(config.policy_table().is_ok());
    }
}
