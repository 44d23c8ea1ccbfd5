//! Policy table and endpoint routing.
//!
//! Policies are loaded once at startup and never mutated. Looking up a name
//! that is not in the table is a configuration error, never an implicit
//! default.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TurnstileError};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Policy used by `check_endpoint` when a path has no explicit route.
pub const DEFAULT_ROUTE_POLICY: &str = "api";

/// A named limit applied to a class of actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    /// Maximum admitted hits per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Policy {
    /// Create a validated policy.
    pub fn new(name: impl Into<String>, limit: u64, window_ms: u64) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TurnstileError::Config("policy name must not be empty".into()));
        }
        validate_limits(&name, limit, window_ms)?;
        Ok(Self {
            name,
            limit,
            window_ms,
        })
    }
}

/// Reject non-positive limits and windows.
pub fn validate_limits(scope: &str, limit: u64, window_ms: u64) -> Result<()> {
    if limit == 0 {
        return Err(TurnstileError::Config(format!(
            "limit for '{}' must be greater than zero",
            scope
        )));
    }
    if window_ms == 0 {
        return Err(TurnstileError::Config(format!(
            "window_ms for '{}' must be greater than zero",
            scope
        )));
    }
    Ok(())
}

/// The `{limit, window_ms}` pair as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub limit: u64,
    pub window_ms: u64,
}

/// Built-in policy presets.
pub fn builtin_policies() -> BTreeMap<String, PolicySpec> {
    [
        ("api", 100, MINUTE_MS),
        ("auth", 5, 15 * MINUTE_MS),
        ("signup", 3, HOUR_MS),
        ("passwordReset", 3, HOUR_MS),
        ("search", 30, MINUTE_MS),
        ("upload", 10, MINUTE_MS),
        ("createRoom", 5, MINUTE_MS),
        ("messageCreate", 50, MINUTE_MS),
        ("reportCreate", 3, MINUTE_MS),
        ("profileUpdate", 10, MINUTE_MS),
        ("cspReport", 100, MINUTE_MS),
        ("failedAuth", 10, 15 * MINUTE_MS),
        ("global", 1000, MINUTE_MS),
        ("emergency", 10, MINUTE_MS),
    ]
    .into_iter()
    .map(|(name, limit, window_ms)| (name.to_string(), PolicySpec { limit, window_ms }))
    .collect()
}

/// Built-in endpoint → policy routes.
pub fn builtin_routes() -> BTreeMap<String, String> {
    [
        ("/api/auth/login", "auth"),
        ("/api/auth/signup", "signup"),
        ("/api/rooms", "createRoom"),
        ("/api/messages", "messageCreate"),
        ("/api/reports", "reportCreate"),
        ("/api/upload", "upload"),
        ("/api/search", "search"),
    ]
    .into_iter()
    .map(|(path, policy)| (path.to_string(), policy.to_string()))
    .collect()
}

/// Document shape of a standalone policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySpec>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub default_route_policy: Option<String>,
}

/// Immutable map from policy name to policy, plus endpoint routes.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, Policy>,
    routes: HashMap<String, String>,
    default_route_policy: String,
}

impl PolicyTable {
    /// Build a table, validating every policy and every route target.
    pub fn new(
        policies: impl IntoIterator<Item = (String, PolicySpec)>,
        routes: impl IntoIterator<Item = (String, String)>,
        default_route_policy: Option<String>,
    ) -> Result<Self> {
        let mut table = HashMap::new();
        for (name, spec) in policies {
            let policy = Policy::new(name.clone(), spec.limit, spec.window_ms)?;
            table.insert(name, policy);
        }

        let default_route_policy =
            default_route_policy.unwrap_or_else(|| DEFAULT_ROUTE_POLICY.to_string());

        let routes: HashMap<String, String> = routes.into_iter().collect();
        for (path, policy) in &routes {
            if !table.contains_key(policy) {
                return Err(TurnstileError::Config(format!(
                    "route '{}' refers to unknown policy '{}'",
                    path, policy
                )));
            }
        }
        // An empty table is allowed for ad-hoc checks only.
        if !table.is_empty() && !table.contains_key(&default_route_policy) {
            return Err(TurnstileError::Config(format!(
                "default route policy '{}' is not defined",
                default_route_policy
            )));
        }

        Ok(Self {
            policies: table,
            routes,
            default_route_policy,
        })
    }

    /// The built-in presets and routes.
    pub fn builtin() -> Self {
        Self {
            policies: builtin_policies()
                .into_iter()
                .map(|(name, spec)| {
                    let policy = Policy {
                        name: name.clone(),
                        limit: spec.limit,
                        window_ms: spec.window_ms,
                    };
                    (name, policy)
                })
                .collect(),
            routes: builtin_routes().into_iter().collect(),
            default_route_policy: DEFAULT_ROUTE_POLICY.to_string(),
        }
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy table: {}", e)))?;
        Self::new(file.policies, file.routes, file.default_route_policy)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Result<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| TurnstileError::UnknownPolicy(name.to_string()))
    }

    /// Policy applied to an endpoint path.
    pub fn for_endpoint(&self, endpoint: &str) -> Result<&Policy> {
        let name = self
            .routes
            .get(endpoint)
            .unwrap_or(&self.default_route_policy);
        self.get(name)
    }

    /// Shortest configured window, used to pace eviction sweeps.
    pub fn min_window_ms(&self) -> Option<u64> {
        self.policies.values().map(|p| p.window_ms).min()
    }

    /// All policies, sorted by name.
    pub fn policies(&self) -> Vec<&Policy> {
        let mut all: Vec<&Policy> = self.policies.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_presets() {
        let table = PolicyTable::builtin();

        let api = table.get("api").unwrap();
        assert_eq!((api.limit, api.window_ms), (100, 60_000));

        let auth = table.get("auth").unwrap();
        assert_eq!((auth.limit, auth.window_ms), (5, 900_000));

        let upload = table.get("upload").unwrap();
        assert_eq!((upload.limit, upload.window_ms), (10, 60_000));

        let room = table.get("createRoom").unwrap();
        assert_eq!((room.limit, room.window_ms), (5, 60_000));

        let profile = table.get("profileUpdate").unwrap();
        assert_eq!((profile.limit, profile.window_ms), (10, 60_000));
    }

    #[test]
    fn test_unknown_policy_is_error() {
        let table = PolicyTable::builtin();
        let err = table.get("nonexistent-policy").unwrap_err();

        assert!(matches!(err, TurnstileError::UnknownPolicy(ref n) if n == "nonexistent-policy"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_parse_yaml_table() {
        let yaml = r#"
policies:
  api:
    limit: 20
    window_ms: 1000
  login:
    limit: 3
    window_ms: 60000
routes:
  /login: login
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.for_endpoint("/login").unwrap().name, "login");
        assert_eq!(table.for_endpoint("/anything").unwrap().name, "api");
        assert_eq!(table.min_window_ms(), Some(1000));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
policies:
  api:
    limit: 0
    window_ms: 1000
"#;
        let err = PolicyTable::from_yaml(yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(Policy::new("api", 1, 0).is_err());
        assert!(Policy::new("", 1, 1).is_err());
        assert!(Policy::new("api", 1, 1).is_ok());
    }

    #[test]
    fn test_route_to_unknown_policy_rejected() {
        let yaml = r#"
policies:
  api:
    limit: 1
    window_ms: 1000
routes:
  /upload: uplaod
"#;
        let err = PolicyTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(ref m) if m.contains("uplaod")));
    }

    #[test]
    fn test_builtin_routes() {
        let table = PolicyTable::builtin();
        assert_eq!(table.for_endpoint("/api/auth/login").unwrap().name, "auth");
        assert_eq!(table.for_endpoint("/api/rooms").unwrap().name, "createRoom");
        assert_eq!(table.for_endpoint("/api/unlisted").unwrap().name, "api");
    }

    #[test]
    fn test_policies_sorted() {
        let table = PolicyTable::builtin();
        let names: Vec<&str> = table.policies().iter().map(|p| p.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(table.min_window_ms(), Some(60_000));
    }
}
