//! Login attempt tracking and brute-force detection.

mod ledger;
mod monitor;

pub use ledger::{LoginAttemptLedger, LoginAttemptRecord, MemoryLedger, NewLoginAttempt};
pub use monitor::{BruteForceMonitor, Evaluation, BRUTE_FORCE_REASON};
