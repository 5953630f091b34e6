//! Outcome of a rate limit decision.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::ban::BanEntry;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The client exhausted its window budget for this endpoint class
    RateLimited,
    /// The client has an active ban
    Blocked,
}

impl DenyReason {
    /// Machine-readable reason surfaced to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a denied client may try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    After(Duration),
    /// Banned until an operator releases the client
    Indefinite,
}

/// A refused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenyReason,
    pub retry_after: RetryAfter,
}

/// Result of deciding on a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed; `remaining` requests are left in the window.
    Allow { remaining: u64 },
    Deny(Denial),
}

impl Decision {
    /// Denial for a client holding an active ban.
    pub fn blocked(ban: &BanEntry, now: DateTime<Utc>) -> Self {
        let retry_after = match ban.expires_at {
            Some(expires_at) => {
                RetryAfter::After((expires_at - now).to_std().unwrap_or(Duration::ZERO))
            }
            None => RetryAfter::Indefinite,
        };
        Decision::Deny(Denial {
            reason: DenyReason::Blocked,
            retry_after,
        })
    }

    /// Denial for a client over its window budget.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Decision::Deny(Denial {
            reason: DenyReason::RateLimited,
            retry_after: RetryAfter::After(retry_after),
        })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// The deny reason, if the request was refused.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Deny(denial) => Some(denial.reason),
        }
    }
}
