//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{ClientIdentity, RateLimitConfig};

/// Prefix for environment overrides, e.g. `BULWARK__SERVER__GRPC_ADDR`.
const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Brute-force detection configuration
    #[serde(default)]
    pub brute_force: BruteForceConfig,

    /// Retention sweeps
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// How `Decide` behaves when the counter or ban store is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request and log the failure
    #[default]
    Open,
    /// Refuse the request with a generic internal error
    Closed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a rate limit rules file; overrides `rules` when set
    pub config_path: Option<String>,

    /// Upper bound on a single store operation, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Behaviour when the store is failing
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Inline endpoint policies
    #[serde(default)]
    pub rules: RateLimitConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            store_timeout_ms: default_store_timeout(),
            failure_mode: FailureMode::default(),
            rules: RateLimitConfig::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout() -> u64 {
    250
}

/// Brute-force detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceConfig {
    /// Failures at which a client shows up in reports
    #[serde(default = "default_report_threshold")]
    pub report_threshold: u32,

    /// Failures at which a client is banned
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,

    /// Trailing window for counting failures, in seconds
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,

    /// Length of an automatic ban, in seconds
    // TODO: escalate the block duration for repeat offenders once the
    // policy for progressive bans is settled.
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Client keys that are never banned automatically
    #[serde(default)]
    pub exempt_clients: Vec<String>,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            report_threshold: default_report_threshold(),
            ban_threshold: default_ban_threshold(),
            lookback_secs: default_lookback(),
            block_duration_secs: default_block_duration(),
            exempt_clients: Vec::new(),
        }
    }
}

impl BruteForceConfig {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_secs as i64)
    }

    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.block_duration_secs as i64)
    }

    pub fn is_exempt(&self, client: &ClientIdentity) -> bool {
        let key = client.to_string_key();
        self.exempt_clients.iter().any(|c| c == &key)
    }
}

fn default_report_threshold() -> u32 {
    3
}

fn default_ban_threshold() -> u32 {
    5
}

fn default_lookback() -> u64 {
    24 * 3600
}

fn default_block_duration() -> u64 {
    3600
}

/// Retention sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Age after which window counters are purged, in seconds
    #[serde(default = "default_counter_horizon")]
    pub counter_horizon_secs: u64,

    /// Age after which ledger rows and ended bans are purged, in seconds
    #[serde(default = "default_audit_horizon")]
    pub audit_horizon_secs: u64,

    /// Endpoints whose counters are kept until the audit horizon
    #[serde(default = "default_exempt_endpoints")]
    pub exempt_endpoints: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            counter_horizon_secs: default_counter_horizon(),
            audit_horizon_secs: default_audit_horizon(),
            exempt_endpoints: default_exempt_endpoints(),
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn counter_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.counter_horizon_secs as i64)
    }

    pub fn audit_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.audit_horizon_secs as i64)
    }
}

fn default_sweep_interval() -> u64 {
    6 * 3600
}

fn default_counter_horizon() -> u64 {
    3600
}

fn default_audit_horizon() -> u64 {
    90 * 24 * 3600
}

fn default_exempt_endpoints() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

impl BulwarkConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered with environment
    /// overrides (`BULWARK__SECTION__KEY`).
    ///
    /// When `rate_limiting.config_path` is set the rules are read from that
    /// file instead of the inline `rules` section.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let mut loaded: BulwarkConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))?;

        if let Some(rules_path) = &loaded.rate_limiting.config_path {
            loaded.rate_limiting.rules = RateLimitConfig::from_file(rules_path)?;
        }

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let bf = &self.brute_force;
        if bf.ban_threshold == 0 {
            return Err(BulwarkError::Config(
                "brute_force.ban_threshold must be at least 1".to_string(),
            ));
        }
        if bf.block_duration_secs == 0 {
            return Err(BulwarkError::Config(
                "brute_force.block_duration_secs must be positive".to_string(),
            ));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(BulwarkError::Config(
                "retention.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.retention.audit_horizon_secs < self.retention.counter_horizon_secs {
            return Err(BulwarkError::Config(
                "retention.audit_horizon_secs must not be shorter than counter_horizon_secs"
                    .to_string(),
            ));
        }
        // Counters still inside an open window must survive the sweep
        let longest = self.rate_limiting.rules.longest_window().as_secs();
        if self.retention.counter_horizon_secs < longest {
            return Err(BulwarkError::Config(format!(
                "retention.counter_horizon_secs must cover the longest rate limit window ({}s)",
                longest
            )));
        }
        if self.rate_limiting.store_timeout_ms == 0 {
            return Err(BulwarkError::Config(
                "rate_limiting.store_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BulwarkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.brute_force.ban_threshold, 5);
        assert_eq!(config.rate_limiting.failure_mode, FailureMode::Open);
        assert_eq!(config.retention.exempt_endpoints, vec!["/health", "/metrics"]);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
server:
  grpc_addr: "0.0.0.0:9000"
rate_limiting:
  failure_mode: closed
brute_force:
  ban_threshold: 3
  exempt_clients: ["10.0.0.1"]
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.rate_limiting.failure_mode, FailureMode::Closed);
        assert_eq!(config.rate_limiting.store_timeout_ms, 250);
        assert_eq!(config.brute_force.ban_threshold, 3);
        assert_eq!(config.brute_force.report_threshold, 3);
        assert!(config
            .brute_force
            .is_exempt(&ClientIdentity::address("10.0.0.1")));
        assert!(!config
            .brute_force
            .is_exempt(&ClientIdentity::api_key("10.0.0.1")));
        assert_eq!(config.retention.audit_horizon_secs, 90 * 24 * 3600);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = BulwarkConfig::default();
        config.brute_force.ban_threshold = 0;
        assert!(matches!(config.validate(), Err(BulwarkError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_horizons() {
        let mut config = BulwarkConfig::default();
        config.retention.audit_horizon_secs = 60;
        assert!(matches!(config.validate(), Err(BulwarkError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_horizon_shorter_than_window() {
        let mut config = BulwarkConfig::default();
        config.rate_limiting.rules = RateLimitConfig::from_yaml(
            r#"
policies: []
default:
  name: api
  anonymous: { requests_per_unit: 10000, unit: day }
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(BulwarkError::Config(_))));

        config.retention.counter_horizon_secs = 86400;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = BulwarkConfig::load(None).unwrap();
        assert_eq!(config.server.grpc_addr, default_grpc_addr());
    }
}
