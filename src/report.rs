//! Operator-facing reporting over the attempt ledger and ban registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ban::{BanEntry, BanRegistry};
use crate::bruteforce::LoginAttemptLedger;
use crate::error::Result;
use crate::ratelimit::ClientIdentity;

/// Login failure counts over a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total_attempts: u64,
    pub failed_attempts: u64,
    pub rate_limited_attempts: u64,
    /// `failed_attempts / total_attempts`, 0 when there were no attempts
    pub failure_rate: f64,
    pub unique_clients: u64,
}

/// A client with repeated login failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub client: ClientIdentity,
    pub failures: u32,
    pub last_failure_at: DateTime<Utc>,
}

/// Combined operator report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub summary: FailureSummary,
    pub blocked: Vec<BanEntry>,
    pub top_offenders: Vec<Offender>,
}

/// Builds reports from the ledger and the ban registry.
pub struct Reporter {
    ledger: Arc<dyn LoginAttemptLedger>,
    bans: Arc<BanRegistry>,
    /// Failures needed to be listed as an offender
    threshold: u32,
}

impl Reporter {
    pub fn new(
        ledger: Arc<dyn LoginAttemptLedger>,
        bans: Arc<BanRegistry>,
        threshold: u32,
    ) -> Self {
        Self {
            ledger,
            bans,
            threshold,
        }
    }

    /// Attempt counts since `since`.
    pub async fn failure_summary(&self, since: DateTime<Utc>) -> Result<FailureSummary> {
        let attempts = self.ledger.attempts_since(since).await?;

        let total = attempts.len() as u64;
        let failed = attempts.iter().filter(|a| !a.success).count() as u64;
        let rate_limited = attempts.iter().filter(|a| a.rate_limited).count() as u64;
        let clients: HashSet<&ClientIdentity> = attempts.iter().map(|a| &a.client).collect();

        Ok(FailureSummary {
            total_attempts: total,
            failed_attempts: failed,
            rate_limited_attempts: rate_limited,
            failure_rate: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
            unique_clients: clients.len() as u64,
        })
    }

    /// Clients with at least the report threshold of failures since `since`,
    /// most failures first.
    pub async fn top_offenders(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Offender>> {
        let attempts = self.ledger.attempts_since(since).await?;

        let mut by_client: HashMap<ClientIdentity, Offender> = HashMap::new();
        for attempt in attempts.into_iter().filter(|a| !a.success) {
            let offender = by_client
                .entry(attempt.client.clone())
                .or_insert_with(|| Offender {
                    client: attempt.client.clone(),
                    failures: 0,
                    last_failure_at: attempt.attempt_time,
                });
            offender.failures += 1;
            offender.last_failure_at = offender.last_failure_at.max(attempt.attempt_time);
        }

        let mut offenders: Vec<Offender> = by_client
            .into_values()
            .filter(|o| o.failures >= self.threshold)
            .collect();
        offenders.sort_by(|a, b| {
            b.failures
                .cmp(&a.failures)
                .then(b.last_failure_at.cmp(&a.last_failure_at))
                .then(a.client.cmp(&b.client))
        });
        offenders.truncate(limit);
        Ok(offenders)
    }

    /// Currently blocked identities.
    pub async fn blocked(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        self.bans.list_active(now).await
    }

    /// Full report for the period starting at `since`.
    pub async fn report(
        &self,
        since: DateTime<Utc>,
        top: usize,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        Ok(Report {
            summary: self.failure_summary(since).await?,
            blocked: self.blocked(now).await?,
            top_offenders: self.top_offenders(since, top).await?,
        })
    }
}
