//! Rate decision engine.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

use super::counter::{CounterKey, WindowCounterStore};
use super::decision::Decision;
use super::identity::ClientIdentity;
use super::rules::RateLimitConfig;
use crate::ban::BanRegistry;
use crate::error::Result;

/// Decides whether a request may proceed.
///
/// Banned clients are refused before any counter is touched. Everyone else
/// consumes one unit of the window budget for the endpoint's class, whether
/// or not the request ends up allowed.
pub struct RateDecisionEngine {
    /// Window counters shared by every instance that needs consistent counts.
    counters: Arc<dyn WindowCounterStore>,
    /// Ban registry consulted before counting.
    bans: Arc<BanRegistry>,
    /// Endpoint policies.
    config: RwLock<RateLimitConfig>,
}

impl RateDecisionEngine {
    /// Create a new engine with configuration.
    pub fn with_config(
        counters: Arc<dyn WindowCounterStore>,
        bans: Arc<BanRegistry>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            counters,
            bans,
            config: RwLock::new(config),
        }
    }

    /// Update the endpoint policies.
    pub fn set_config(&self, config: RateLimitConfig) {
        let mut cfg = self.config.write();
        *cfg = config;
    }

    /// Get the current configuration.
    pub fn config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }

    /// Decide on one request from `client` to `endpoint` at `now`.
    ///
    /// Each call that reaches the counter increments it exactly once, so
    /// callers must not call this speculatively.
    pub async fn decide(
        &self,
        client: &ClientIdentity,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        if let Some(ban) = self.bans.is_active(client, now).await? {
            debug!(
                client = %client,
                endpoint = %endpoint,
                ban_id = %ban.id,
                "Request from banned client"
            );
            return Ok(Decision::blocked(&ban, now));
        }

        let rule = self.config.read().find_rule(client, endpoint);
        let window_start = rule.unit.floor(now);
        let key = CounterKey::new(client, endpoint, window_start);

        trace!(key = %key, limit = rule.requests_per_unit, "Checking rate limit");

        let count = self.counters.increment_and_get(&key, now).await?;

        if count > rule.requests_per_unit {
            let retry_after = (rule.unit.end(window_start) - now)
                .to_std()
                .unwrap_or_default();
            debug!(
                key = %key,
                count = count,
                limit = rule.requests_per_unit,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            return Ok(Decision::rate_limited(retry_after));
        }

        Ok(Decision::Allow {
            remaining: rule.requests_per_unit - count,
        })
    }

    /// Current count for the window containing `now`, without consuming quota.
    pub async fn current_count(
        &self,
        client: &ClientIdentity,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let rule = self.config.read().find_rule(client, endpoint);
        let key = CounterKey::new(client, endpoint, rule.unit.floor(now));
        Ok(self.counters.get(&key).await?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::{BanEntry, MemoryBanStore};
    use crate::ratelimit::counter::MemoryCounterStore;
    use crate::ratelimit::decision::{Denial, DenyReason, RetryAfter};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, m, s).unwrap()
    }

    fn engine_with(yaml: &str) -> (RateDecisionEngine, Arc<BanRegistry>) {
        let bans = Arc::new(BanRegistry::new(Arc::new(MemoryBanStore::new())));
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        let engine = RateDecisionEngine::with_config(
            Arc::new(MemoryCounterStore::new()),
            bans.clone(),
            config,
        );
        (engine, bans)
    }

    const RULES: &str = r#"
policies:
  - name: auth
    endpoints: ["/login"]
    anonymous: { requests_per_unit: 3, unit: minute }
    authenticated: { requests_per_unit: 6, unit: minute }
  - name: probes
    endpoints: ["/health"]
    anonymous: { requests_per_unit: 100, unit: minute }
"#;

    #[tokio::test]
    async fn test_threshold_then_deny_then_new_window() {
        let (engine, _) = engine_with(RULES);
        let client = ClientIdentity::address("1.2.3.4");

        for i in 0..3 {
            let decision = engine.decide(&client, "/login", at(0, 10)).await.unwrap();
            assert_eq!(decision, Decision::Allow { remaining: 2 - i });
        }

        let decision = engine.decide(&client, "/login", at(0, 20)).await.unwrap();
        assert_eq!(decision, Decision::rate_limited(StdDuration::from_secs(40)));

        // First request of the next window is allowed again
        let decision = engine.decide(&client, "/login", at(1, 0)).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_denied_requests_still_count() {
        let (engine, _) = engine_with(RULES);
        let client = ClientIdentity::address("1.2.3.4");

        for _ in 0..5 {
            engine.decide(&client, "/login", at(0, 0)).await.unwrap();
        }
        assert_eq!(engine.current_count(&client, "/login", at(0, 30)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_health_scenario() {
        let (engine, _) = engine_with(RULES);
        let client = ClientIdentity::address("10.1.1.1");

        for _ in 0..100 {
            let decision = engine.decide(&client, "/health", at(5, 15)).await.unwrap();
            assert!(decision.is_allowed());
        }

        let decision = engine.decide(&client, "/health", at(5, 15)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Deny(Denial {
                reason: DenyReason::RateLimited,
                retry_after: RetryAfter::After(StdDuration::from_secs(45)),
            })
        );
    }

    #[tokio::test]
    async fn test_authenticated_callers_get_larger_budget() {
        let (engine, _) = engine_with(RULES);
        let anon = ClientIdentity::address("tenant-a");
        let key = ClientIdentity::api_key("tenant-a");

        for _ in 0..3 {
            assert!(engine.decide(&anon, "/login", at(0, 0)).await.unwrap().is_allowed());
        }
        assert!(!engine.decide(&anon, "/login", at(0, 0)).await.unwrap().is_allowed());

        for _ in 0..6 {
            assert!(engine.decide(&key, "/login", at(0, 0)).await.unwrap().is_allowed());
        }
        assert!(!engine.decide(&key, "/login", at(0, 0)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_banned_client_denied_without_increment() {
        let (engine, bans) = engine_with(RULES);
        let client = ClientIdentity::address("1.2.3.4");
        bans.ban(
            BanEntry::new(client.clone(), "manual", 0, at(0, 0), Some(Duration::minutes(15))),
            at(0, 0),
        )
        .await
        .unwrap();

        let decision = engine.decide(&client, "/orders", at(5, 0)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Deny(Denial {
                reason: DenyReason::Blocked,
                retry_after: RetryAfter::After(StdDuration::from_secs(600)),
            })
        );
        assert_eq!(engine.current_count(&client, "/orders", at(5, 0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_indefinite_ban_has_no_retry_after() {
        let (engine, bans) = engine_with(RULES);
        let client = ClientIdentity::address("1.2.3.4");
        bans.ban(BanEntry::new(client.clone(), "manual", 0, at(0, 0), None), at(0, 0))
            .await
            .unwrap();

        let decision = engine.decide(&client, "/orders", at(5, 0)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Deny(Denial {
                reason: DenyReason::Blocked,
                retry_after: RetryAfter::Indefinite,
            })
        );
    }

    #[tokio::test]
    async fn test_set_config_changes_thresholds() {
        let (engine, _) = engine_with(RULES);
        let client = ClientIdentity::address("1.2.3.4");

        engine.set_config(
            RateLimitConfig::from_yaml(
                r#"
policies:
  - name: auth
    endpoints: ["/login"]
    anonymous: { requests_per_unit: 1, unit: hour }
"#,
            )
            .unwrap(),
        );

        assert!(engine.decide(&client, "/login", at(0, 0)).await.unwrap().is_allowed());
        assert!(!engine.decide(&client, "/login", at(30, 0)).await.unwrap().is_allowed());
        assert_eq!(engine.config().policies.len(), 1);
    }
}
