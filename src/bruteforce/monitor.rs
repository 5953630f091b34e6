//! Detection of sustained login failures.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, trace};

use super::ledger::LoginAttemptLedger;
use crate::ban::{BanEntry, BanInsert, BanRegistry};
use crate::config::BruteForceConfig;
use crate::error::Result;
use crate::ratelimit::ClientIdentity;

/// Reason recorded on automatically imposed bans.
pub const BRUTE_FORCE_REASON: &str = "excessive failed login attempts";

/// Result of evaluating a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// The client is on the exempt list and is never banned automatically
    Exempt,
    /// Not enough failures in the lookback to ban
    BelowThreshold { failures: u32 },
    /// The client already had an active ban; nothing changed
    AlreadyBanned(BanEntry),
    /// This evaluation imposed a new ban
    Banned(BanEntry),
}

impl Evaluation {
    /// The ban the client is under after evaluation, if any.
    pub fn ban(&self) -> Option<&BanEntry> {
        match self {
            Evaluation::AlreadyBanned(ban) | Evaluation::Banned(ban) => Some(ban),
            _ => None,
        }
    }
}

/// Inspects the attempt ledger and bans clients that keep failing to log in.
pub struct BruteForceMonitor {
    ledger: Arc<dyn LoginAttemptLedger>,
    bans: Arc<BanRegistry>,
    config: BruteForceConfig,
}

impl BruteForceMonitor {
    pub fn new(
        ledger: Arc<dyn LoginAttemptLedger>,
        bans: Arc<BanRegistry>,
        config: BruteForceConfig,
    ) -> Self {
        Self {
            ledger,
            bans,
            config,
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    /// Start of the failure-counting window for `client`.
    ///
    /// Failures that led to a ban an operator has since released are not
    /// counted again.
    async fn lookback_start(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let since = now - self.config.lookback();
        Ok(match self.bans.last_released_at(client).await? {
            Some(released) if released > since => released,
            _ => since,
        })
    }

    /// Failed attempts counted against `client` at `now`.
    pub async fn recent_failures(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let since = self.lookback_start(client, now).await?;
        self.ledger.count_failures(client, since).await
    }

    /// Evaluate `client` and ban it if its failures reached the threshold.
    ///
    /// Idempotent: a client with an active ban is left as is, and concurrent
    /// evaluations create at most one ban.
    pub async fn evaluate(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        if self.config.is_exempt(client) {
            trace!(client = %client, "Client exempt from brute-force bans");
            return Ok(Evaluation::Exempt);
        }

        if let Some(ban) = self.bans.is_active(client, now).await? {
            return Ok(Evaluation::AlreadyBanned(ban));
        }

        let failures = self.recent_failures(client, now).await?;
        if failures < self.config.ban_threshold {
            if failures >= self.config.report_threshold {
                debug!(
                    client = %client,
                    failures = failures,
                    threshold = self.config.ban_threshold,
                    "Suspicious login failures"
                );
            }
            return Ok(Evaluation::BelowThreshold { failures });
        }

        let entry = BanEntry::new(
            client.clone(),
            BRUTE_FORCE_REASON,
            failures,
            now,
            Some(self.config.block_duration()),
        );

        Ok(match self.bans.ban(entry, now).await? {
            BanInsert::Created(ban) => Evaluation::Banned(ban),
            BanInsert::Existing(ban) => Evaluation::AlreadyBanned(ban),
        })
    }
}
