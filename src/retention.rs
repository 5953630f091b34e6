//! Periodic purging of expired counters, old attempts and ended bans.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ban::BanStore;
use crate::bruteforce::LoginAttemptLedger;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::ratelimit::WindowCounterStore;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub counters: u64,
    pub attempts: u64,
    pub bans: u64,
}

impl SweepStats {
    pub fn total(&self) -> u64 {
        self.counters + self.attempts + self.bans
    }
}

/// Deletes rows by age only, so it can run alongside live traffic.
pub struct RetentionSweeper {
    counters: Arc<dyn WindowCounterStore>,
    ledger: Arc<dyn LoginAttemptLedger>,
    bans: Arc<dyn BanStore>,
    config: RetentionConfig,
}

fn deleted(what: &str, result: Result<u64>) -> u64 {
    match result {
        Ok(count) => count,
        Err(e) => {
            warn!(table = what, error = %e, "Retention sweep failed");
            0
        }
    }
}

impl RetentionSweeper {
    pub fn new(
        counters: Arc<dyn WindowCounterStore>,
        ledger: Arc<dyn LoginAttemptLedger>,
        bans: Arc<dyn BanStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            counters,
            ledger,
            bans,
            config,
        }
    }

    /// Run one sweep as of `now`.
    ///
    /// Counters older than the counter horizon are purged, except for exempt
    /// endpoints, which are kept until the audit horizon. Attempts and ended
    /// bans are purged at the audit horizon. A failing table is logged and
    /// skipped; the others are still swept.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepStats {
        let counter_cutoff = now - self.config.counter_horizon();
        let audit_cutoff = now - self.config.audit_horizon();

        let (counters, exempt_counters, attempts, bans) = futures::join!(
            self.counters
                .delete_older_than(counter_cutoff, &self.config.exempt_endpoints),
            self.counters.delete_older_than(audit_cutoff, &[]),
            self.ledger.delete_older_than(audit_cutoff),
            self.bans.delete_older_than(audit_cutoff, now),
        );

        let stats = SweepStats {
            counters: deleted("window_counters", counters)
                + deleted("window_counters", exempt_counters),
            attempts: deleted("login_attempts", attempts),
            bans: deleted("bans", bans),
        };

        if stats.total() > 0 {
            info!(
                counters = stats.counters,
                attempts = stats.attempts,
                bans = stats.bans,
                "Retention sweep removed expired rows"
            );
        } else {
            debug!("Retention sweep found nothing to remove");
        }
        stats
    }

    /// Start the background sweep task.
    ///
    /// The task sweeps once per configured interval and stops when
    /// `shutdown` changes.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval();
        info!(interval_secs = interval.as_secs(), "Starting retention sweeper");

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.sweep_once(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        info!("Shutting down retention sweeper");
                        break;
                    }
                }
            }
        })
    }
}
