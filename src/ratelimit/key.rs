//! Composite key construction and caller identity.
//!
//! A key is the scope (policy name or route tag) followed by tagged identity
//! fragments, e.g. `api|ip=203.0.113.7` or `block-action|user=42|ip=::1`.
//! Fragments are normalized first, and missing identities collapse to the
//! shared `unknown` bucket so unidentified callers are limited together.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Value used for any identity fragment that could not be resolved.
pub const UNKNOWN: &str = "unknown";

const DELIMITER: char = '|';

/// One identity fragment of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment<'a> {
    /// Client IP, canonicalized
    Ip(Option<&'a str>),
    /// Authenticated user id
    User(Option<&'a str>),
    /// Route or endpoint tag
    Route(&'a str),
}

impl Fragment<'_> {
    fn tag(&self) -> &'static str {
        match self {
            Fragment::Ip(_) => "ip",
            Fragment::User(_) => "user",
            Fragment::Route(_) => "route",
        }
    }

    fn normalized(&self) -> String {
        match self {
            Fragment::Ip(ip) => normalize_ip(*ip),
            Fragment::User(user) => normalize_plain(*user),
            Fragment::Route(value) => normalize_plain(Some(*value)),
        }
    }
}

/// Build the counter key for `scope` and `fragments`.
pub fn compose(scope: &str, fragments: &[Fragment<'_>]) -> String {
    let mut key = escape(normalize_plain(Some(scope)).as_str());
    for fragment in fragments {
        key.push(DELIMITER);
        key.push_str(fragment.tag());
        key.push('=');
        key.push_str(&escape(&fragment.normalized()));
    }
    key
}

/// Canonical form of a client IP string.
///
/// Accepts forwarded lists (first entry wins), bracketed or port-suffixed
/// addresses, and folds IPv4-mapped IPv6 onto IPv4.
pub fn normalize_ip(raw: Option<&str>) -> String {
    let candidate = raw
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .unwrap_or_default();

    if candidate.is_empty() || candidate.eq_ignore_ascii_case(UNKNOWN) {
        return UNKNOWN.to_string();
    }

    let parsed = candidate
        .parse::<IpAddr>()
        .ok()
        .or_else(|| candidate.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
        .or_else(|| {
            candidate
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .ok()
        });

    match parsed {
        Some(ip) => ip.to_canonical().to_string(),
        None => candidate.to_ascii_lowercase(),
    }
}

fn normalize_plain(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

/// Who is making a request, as far as the caller could tell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub ip: Option<String>,
    pub user_id: Option<String>,
}

impl Identity {
    /// Identity with neither an IP nor a user.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_id: None,
        }
    }

    pub fn from_user(user_id: impl Into<String>) -> Self {
        Self {
            ip: None,
            user_id: Some(user_id.into()),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The fragment a policy check keys on: the user when known, else the IP.
    pub fn primary_fragment(&self) -> Fragment<'_> {
        match self.user_id.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => Fragment::User(Some(user)),
            _ => Fragment::Ip(self.ip.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_ip_key() {
        let key = compose("api", &[Fragment::Ip(Some("203.0.113.7"))]);
        assert_eq!(key, "api|ip=203.0.113.7");
    }

    #[test]
    fn test_compose_multiple_fragments() {
        let key = compose(
            "block-action",
            &[Fragment::User(Some(" 42 ")), Fragment::Ip(Some("10.0.0.1"))],
        );
        assert_eq!(key, "block-action|user=42|ip=10.0.0.1");
    }

    #[test]
    fn test_missing_identity_is_unknown() {
        assert_eq!(compose("api", &[Fragment::Ip(None)]), "api|ip=unknown");
        assert_eq!(compose("api", &[Fragment::Ip(Some("  "))]), "api|ip=unknown");
        assert_eq!(compose("api", &[Fragment::User(Some(""))]), "api|user=unknown");
    }

    #[test]
    fn test_ipv6_canonical_forms_match() {
        assert_eq!(normalize_ip(Some("::1")), "::1");
        assert_eq!(normalize_ip(Some("0:0:0:0:0:0:0:1")), "::1");
        assert_eq!(normalize_ip(Some("[::1]:8080")), "::1");
        assert_eq!(normalize_ip(Some("[::1]")), "::1");
        assert_eq!(normalize_ip(Some("2001:DB8::0001")), "2001:db8::1");
    }

    #[test]
    fn test_ip_variants_fold() {
        assert_eq!(normalize_ip(Some("::ffff:192.0.2.1")), "192.0.2.1");
        assert_eq!(normalize_ip(Some("192.0.2.1:443")), "192.0.2.1");
        assert_eq!(normalize_ip(Some("198.51.100.2, 10.0.0.1")), "198.51.100.2");
        assert_eq!(normalize_ip(Some("Not-An-IP")), "not-an-ip");
    }

    #[test]
    fn test_tags_prevent_cross_fragment_collisions() {
        let as_ip = compose("api", &[Fragment::Ip(Some("1.2.3.4"))]);
        let as_user = compose("api", &[Fragment::User(Some("1.2.3.4"))]);
        assert_ne!(as_ip, as_user);
    }

    #[test]
    fn test_delimiters_are_escaped() {
        let sneaky = compose("api", &[Fragment::User(Some("a|ip=1.2.3.4"))]);
        let honest = compose(
            "api",
            &[Fragment::User(Some("a")), Fragment::Ip(Some("1.2.3.4"))],
        );
        assert_eq!(sneaky, "api|user=a%7Cip%3D1.2.3.4");
        assert_ne!(sneaky, honest);
    }

    #[test]
    fn test_identity_primary_fragment() {
        let anon = Identity::anonymous();
        assert_eq!(anon.primary_fragment(), Fragment::Ip(None));

        let ip = Identity::from_ip("10.0.0.1");
        assert_eq!(ip.primary_fragment(), Fragment::Ip(Some("10.0.0.1")));

        let user = Identity::from_ip("10.0.0.1").with_user("u-1");
        assert_eq!(user.primary_fragment(), Fragment::User(Some("u-1")));
    }
}
