//! Rate limit rules configuration and matching.
//!
//! Endpoints are grouped into classes, each carrying its own threshold for
//! anonymous and authenticated callers. Rules load from YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::identity::ClientIdentity;
use super::window::TimeWindow;
use crate::error::{BulwarkError, Result};

/// A complete set of endpoint policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Endpoint classes, matched by their endpoint patterns
    #[serde(default)]
    pub policies: Vec<EndpointPolicy>,
    /// Policy for endpoints no class claims
    #[serde(default = "default_policy")]
    pub default: EndpointPolicy,
}

/// A class of endpoints sharing one threshold pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Name of the class, used in logs
    pub name: String,
    /// Exact paths, or prefixes ending in `*`
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Limit for callers keyed by network address
    pub anonymous: RateLimitRule,
    /// Limit for callers keyed by API identity; falls back to `anonymous`
    #[serde(default)]
    pub authenticated: Option<RateLimitRule>,
}

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeWindow,
}

impl RateLimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeWindow) -> Self {
        Self {
            requests_per_unit,
            unit,
        }
    }
}

fn default_policy() -> EndpointPolicy {
    EndpointPolicy {
        name: "api".to_string(),
        endpoints: Vec::new(),
        anonymous: RateLimitRule::new(60, TimeWindow::Minute),
        authenticated: Some(RateLimitRule::new(600, TimeWindow::Minute)),
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policies: vec![
                EndpointPolicy {
                    name: "auth".to_string(),
                    endpoints: vec!["/login".to_string(), "/auth/*".to_string()],
                    anonymous: RateLimitRule::new(5, TimeWindow::Minute),
                    authenticated: Some(RateLimitRule::new(20, TimeWindow::Minute)),
                },
                EndpointPolicy {
                    name: "probes".to_string(),
                    endpoints: vec!["/health".to_string(), "/metrics".to_string()],
                    anonymous: RateLimitRule::new(100, TimeWindow::Minute),
                    authenticated: None,
                },
            ],
            default: default_policy(),
        }
    }
}

impl EndpointPolicy {
    /// The rule that applies to `client`.
    pub fn rule_for(&self, client: &ClientIdentity) -> RateLimitRule {
        match (client.is_authenticated(), self.authenticated) {
            (true, Some(rule)) => rule,
            _ => self.anonymous,
        }
    }

    /// Length of the most specific pattern matching `endpoint`, if any.
    fn match_specificity(&self, endpoint: &str) -> Option<usize> {
        self.endpoints
            .iter()
            .filter_map(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) if endpoint.starts_with(prefix) => Some(prefix.len()),
                // Exact matches outrank any prefix of the same length
                None if pattern == endpoint => Some(pattern.len() + 1),
                _ => None,
            })
            .max()
    }
}

impl RateLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Find the policy for an endpoint.
    ///
    /// The most specific matching pattern wins; on a tie the policy listed
    /// first is used. Unclaimed endpoints get the default policy.
    pub fn find_policy(&self, endpoint: &str) -> &EndpointPolicy {
        let mut best: Option<(usize, &EndpointPolicy)> = None;
        for policy in &self.policies {
            if let Some(score) = policy.match_specificity(endpoint) {
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, policy));
                }
            }
        }
        best.map(|(_, p)| p).unwrap_or(&self.default)
    }

    /// The longest window any rule uses.
    pub fn longest_window(&self) -> std::time::Duration {
        self.policies
            .iter()
            .chain(std::iter::once(&self.default))
            .flat_map(|p| std::iter::once(p.anonymous).chain(p.authenticated))
            .map(|rule| rule.unit.duration())
            .max()
            .unwrap_or_default()
    }

    /// The rule that applies to `client` calling `endpoint`.
    pub fn find_rule(&self, client: &ClientIdentity, endpoint: &str) -> RateLimitRule {
        self.find_policy(endpoint).rule_for(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classes() {
        let config = RateLimitConfig::default();
        let anon = ClientIdentity::address("10.0.0.1");
        let key = ClientIdentity::api_key("tenant");

        assert_eq!(config.find_policy("/login").name, "auth");
        assert_eq!(config.find_policy("/auth/refresh").name, "auth");
        assert_eq!(config.find_policy("/health").name, "probes");
        assert_eq!(config.find_policy("/products/42").name, "api");

        assert_eq!(config.find_rule(&anon, "/login").requests_per_unit, 5);
        assert_eq!(config.find_rule(&anon, "/orders").requests_per_unit, 60);
        assert_eq!(config.find_rule(&key, "/orders").requests_per_unit, 600);
    }

    #[test]
    fn test_authenticated_falls_back_to_anonymous() {
        let config = RateLimitConfig::default();
        let key = ClientIdentity::api_key("tenant");
        assert_eq!(config.find_rule(&key, "/health").requests_per_unit, 100);
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
policies:
  - name: auth
    endpoints: ["/login"]
    anonymous:
      requests_per_unit: 3
      unit: minute
default:
  name: api
  anonymous:
    requests_per_unit: 1000
    unit: hour
  authenticated:
    requests_per_unit: 5000
    unit: hour
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policies.len(), 1);

        let rule = config.find_rule(&ClientIdentity::address("a"), "/login");
        assert_eq!(rule, RateLimitRule::new(3, TimeWindow::Minute));

        let rule = config.find_rule(&ClientIdentity::api_key("a"), "/orders");
        assert_eq!(rule, RateLimitRule::new(5000, TimeWindow::Hour));
    }

    #[test]
    fn test_missing_default_uses_builtin() {
        let yaml = r#"
policies: []
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.find_policy("/anything").name, "api");
    }

    #[test]
    fn test_most_specific_match_wins() {
        let yaml = r#"
policies:
  - name: admin
    endpoints: ["/admin/*"]
    anonymous: { requests_per_unit: 10, unit: minute }
  - name: admin-reports
    endpoints: ["/admin/reports/*"]
    anonymous: { requests_per_unit: 2, unit: minute }
  - name: admin-login
    endpoints: ["/admin/login"]
    anonymous: { requests_per_unit: 1, unit: minute }
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.find_policy("/admin/users").name, "admin");
        assert_eq!(config.find_policy("/admin/reports/daily").name, "admin-reports");
        assert_eq!(config.find_policy("/admin/login").name, "admin-login");
    }

    #[test]
    fn test_longest_window() {
        let config = RateLimitConfig::default();
        assert_eq!(config.longest_window(), TimeWindow::Minute.duration());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = RateLimitConfig::from_yaml("policies: [").unwrap_err();
        assert!(matches!(err, BulwarkError::Config(_)));
    }
}
