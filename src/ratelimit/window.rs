//! Fixed time windows for request counting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    fn seconds(&self) -> i64 {
        self.duration().as_secs() as i64
    }

    /// Truncate `now` to the start of the window containing it.
    ///
    /// Windows are aligned to the Unix epoch, so an instant exactly on a
    /// boundary starts a new window.
    pub fn floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = now.timestamp();
        let start = ts - ts.rem_euclid(self.seconds());
        DateTime::from_timestamp(start, 0).unwrap_or(now)
    }

    /// The first instant after the window starting at `window_start`.
    pub fn end(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        window_start + chrono::Duration::seconds(self.seconds())
    }

    /// Time left in the window containing `now`.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.end(self.floor(now)) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
