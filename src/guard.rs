//! The request-path entry point wiring every component together.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ban::{BanEntry, BanInsert, BanRegistry, BanStore, MemoryBanStore};
use crate::bruteforce::{
    BruteForceMonitor, Evaluation, LoginAttemptLedger, MemoryLedger, NewLoginAttempt,
};
use crate::config::{BulwarkConfig, FailureMode};
use crate::error::{BulwarkError, Result};
use crate::ratelimit::{
    ClientIdentity, Decision, MemoryCounterStore, RateDecisionEngine, WindowCounterStore,
};
use crate::report::{Report, Reporter};
use crate::retention::RetentionSweeper;

/// Outcome of recording a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub attempt_id: Uuid,
    /// Evaluation run for failed attempts; `None` for successes
    pub evaluation: Option<Evaluation>,
}

impl AttemptOutcome {
    /// The ban the client is under after this attempt, if any.
    pub fn ban(&self) -> Option<&BanEntry> {
        self.evaluation.as_ref().and_then(Evaluation::ban)
    }

    /// Whether this attempt caused a new ban.
    pub fn newly_banned(&self) -> bool {
        matches!(self.evaluation, Some(Evaluation::Banned(_)))
    }
}

/// Rate limiting and brute-force protection over shared stores.
///
/// One instance is created at startup and shared by every request handler;
/// all coordination happens through the stores.
pub struct Guard {
    engine: RateDecisionEngine,
    monitor: BruteForceMonitor,
    bans: Arc<BanRegistry>,
    counters: Arc<dyn WindowCounterStore>,
    ledger: Arc<dyn LoginAttemptLedger>,
    reporter: Reporter,
    config: BulwarkConfig,
}

impl Guard {
    /// Create a guard over the given stores.
    pub fn new(
        config: BulwarkConfig,
        counters: Arc<dyn WindowCounterStore>,
        ledger: Arc<dyn LoginAttemptLedger>,
        ban_store: Arc<dyn BanStore>,
    ) -> Self {
        let bans = Arc::new(BanRegistry::new(ban_store));
        let engine = RateDecisionEngine::with_config(
            counters.clone(),
            bans.clone(),
            config.rate_limiting.rules.clone(),
        );
        let monitor =
            BruteForceMonitor::new(ledger.clone(), bans.clone(), config.brute_force.clone());
        let reporter = Reporter::new(
            ledger.clone(),
            bans.clone(),
            config.brute_force.report_threshold,
        );

        Self {
            engine,
            monitor,
            bans,
            counters,
            ledger,
            reporter,
            config,
        }
    }

    /// Create a guard backed by in-process stores.
    pub fn in_memory(config: BulwarkConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryBanStore::new()),
        )
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }

    pub fn engine(&self) -> &RateDecisionEngine {
        &self.engine
    }

    pub fn monitor(&self) -> &BruteForceMonitor {
        &self.monitor
    }

    pub fn ledger(&self) -> &Arc<dyn LoginAttemptLedger> {
        &self.ledger
    }

    /// A retention sweeper over this guard's stores.
    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            self.counters.clone(),
            self.ledger.clone(),
            self.bans.store().clone(),
            self.config.retention.clone(),
        )
    }

    fn store_timeout(&self) -> Duration {
        self.config.rate_limiting.store_timeout()
    }

    /// Run a store-backed operation with the configured I/O bound.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(BulwarkError::Store(format!(
                "{} timed out after {:?}",
                op,
                self.store_timeout()
            ))),
        }
    }

    /// Decide whether a request from `client` to `endpoint` may proceed.
    ///
    /// Store failures never surface as a distinct client-visible error: in
    /// `open` mode the request is allowed, in `closed` mode the caller gets
    /// `Unavailable`.
    pub async fn decide(
        &self,
        client: &ClientIdentity,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let result = self
            .bounded("decide", self.engine.decide(client, endpoint, now))
            .await;

        match result {
            Ok(decision) => Ok(decision),
            Err(e) if e.is_transient() => match self.config.rate_limiting.failure_mode {
                FailureMode::Open => {
                    warn!(
                        client = %client,
                        endpoint = %endpoint,
                        error = %e,
                        "Store failure, failing open"
                    );
                    Ok(Decision::Allow { remaining: 0 })
                }
                FailureMode::Closed => {
                    warn!(
                        client = %client,
                        endpoint = %endpoint,
                        error = %e,
                        "Store failure, failing closed"
                    );
                    Err(BulwarkError::Unavailable(e.to_string()))
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Append a login attempt and, for failures, evaluate the client.
    ///
    /// Attempts made while the client is banned are flagged as rate limited.
    /// Store failures are returned to the caller rather than dropped.
    pub async fn record_login_attempt(
        &self,
        mut attempt: NewLoginAttempt,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        if !attempt.rate_limited {
            // The attempt is recorded even if the ban lookup fails
            attempt.rate_limited = match self
                .bounded("is_active", self.bans.is_active(&attempt.client, now))
                .await
            {
                Ok(ban) => ban.is_some(),
                Err(e) => {
                    warn!(client = %attempt.client, error = %e, "Ban lookup failed");
                    false
                }
            };
        }

        let client = attempt.client.clone();
        let success = attempt.success;
        let attempt_id = self
            .bounded("record", self.ledger.record(attempt, now))
            .await?;

        debug!(
            client = %client,
            attempt_id = %attempt_id,
            success = success,
            "Login attempt recorded"
        );

        let evaluation = if success {
            None
        } else {
            Some(
                self.bounded("evaluate", self.monitor.evaluate(&client, now))
                    .await?,
            )
        };

        Ok(AttemptOutcome {
            attempt_id,
            evaluation,
        })
    }

    /// The client's active ban, if any.
    pub async fn is_active(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<BanEntry>> {
        self.bounded("is_active", self.bans.is_active(client, now))
            .await
    }

    /// Failures currently counted against the client.
    pub async fn recent_failures(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        self.bounded("recent_failures", self.monitor.recent_failures(client, now))
            .await
    }

    /// Impose an operator ban. `None` makes it last until released.
    pub async fn impose_ban(
        &self,
        client: &ClientIdentity,
        reason: &str,
        duration: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Result<BanInsert> {
        let failures = self.recent_failures(client, now).await?;
        let entry = BanEntry::new(client.clone(), reason, failures, now, duration);
        self.bounded("ban", self.bans.ban(entry, now)).await
    }

    /// Release the client's active ban and stamp its ledger records.
    pub async fn release(
        &self,
        client: &ClientIdentity,
        operator: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<BanEntry> {
        let ban = self
            .bounded("release", self.bans.release(client, operator, reason, now))
            .await?;

        // Audit continuity only; the release itself already took effect
        match self
            .bounded("mark_released", self.ledger.mark_released(client, operator, now))
            .await
        {
            Ok(stamped) => info!(
                client = %client,
                records = stamped,
                "Stamped released login attempts"
            ),
            Err(e) => warn!(
                client = %client,
                error = %e,
                "Failed to stamp released login attempts"
            ),
        }

        Ok(ban)
    }

    /// All active bans.
    pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        self.bounded("list_active", self.bans.list_active(now))
            .await
    }

    /// Operator report over the trailing `lookback`.
    pub async fn report(
        &self,
        lookback: chrono::Duration,
        top: usize,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        self.reporter.report(now - lookback, top, now).await
    }
}
