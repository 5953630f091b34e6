//! Append-only ledger of authentication attempts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::ClientIdentity;

/// An authentication attempt as reported by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLoginAttempt {
    pub client: ClientIdentity,
    pub username: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    /// The attempt arrived while the client was being refused
    pub rate_limited: bool,
}

impl NewLoginAttempt {
    /// A failed attempt with the given reason.
    pub fn failure(client: ClientIdentity, username: &str, reason: &str) -> Self {
        Self {
            ip: Some(client.value().to_string()),
            client,
            username: username.to_string(),
            user_agent: None,
            success: false,
            failure_reason: Some(reason.to_string()),
            rate_limited: false,
        }
    }

    /// A successful attempt.
    pub fn success(client: ClientIdentity, username: &str) -> Self {
        Self {
            ip: Some(client.value().to_string()),
            client,
            username: username.to_string(),
            user_agent: None,
            success: true,
            failure_reason: None,
            rate_limited: false,
        }
    }
}

/// A stored attempt. Immutable apart from the release stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttemptRecord {
    pub id: Uuid,
    pub client: ClientIdentity,
    pub username: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub rate_limited: bool,
    pub attempt_time: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
}

impl LoginAttemptRecord {
    fn from_attempt(attempt: NewLoginAttempt, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client: attempt.client,
            username: attempt.username,
            ip: attempt.ip,
            user_agent: attempt.user_agent,
            success: attempt.success,
            failure_reason: attempt.failure_reason,
            rate_limited: attempt.rate_limited,
            attempt_time: now,
            released_at: None,
            released_by: None,
        }
    }
}

/// Durable log of login attempts, the evidence behind automatic bans.
#[async_trait]
pub trait LoginAttemptLedger: Send + Sync {
    /// Append an attempt. Failures must never be dropped.
    async fn record(&self, attempt: NewLoginAttempt, now: DateTime<Utc>) -> Result<Uuid>;

    /// Attempts from `client` at or after `since`, newest first.
    async fn recent_by_client(
        &self,
        client: &ClientIdentity,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttemptRecord>>;

    /// Attempts against `username` at or after `since`, newest first.
    async fn recent_by_username(
        &self,
        username: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttemptRecord>>;

    /// Failed attempts from `client` at or after `since`.
    async fn count_failures(&self, client: &ClientIdentity, since: DateTime<Utc>) -> Result<u32>;

    /// Stamp release metadata on the client's un-released rate-limited attempts.
    ///
    /// Returns the number of records stamped.
    async fn mark_released(
        &self,
        client: &ClientIdentity,
        operator: &str,
        time: DateTime<Utc>,
    ) -> Result<u64>;

    /// Every attempt at or after `since`, oldest first.
    async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<LoginAttemptRecord>>;

    /// Delete attempts made before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-process attempt ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<Vec<LoginAttemptRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn newest_matching<F>(&self, limit: usize, matches: F) -> Vec<LoginAttemptRecord>
    where
        F: Fn(&LoginAttemptRecord) -> bool,
    {
        let records = self.records.read();
        let mut found: Vec<LoginAttemptRecord> =
            records.iter().filter(|r| matches(r)).cloned().collect();
        found.sort_by(|a, b| b.attempt_time.cmp(&a.attempt_time));
        found.truncate(limit);
        found
    }
}

#[async_trait]
impl LoginAttemptLedger for MemoryLedger {
    async fn record(&self, attempt: NewLoginAttempt, now: DateTime<Utc>) -> Result<Uuid> {
        let record = LoginAttemptRecord::from_attempt(attempt, now);
        let id = record.id;
        self.records.write().push(record);
        Ok(id)
    }

    async fn recent_by_client(
        &self,
        client: &ClientIdentity,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttemptRecord>> {
        Ok(self.newest_matching(limit, |r| &r.client == client && r.attempt_time >= since))
    }

    async fn recent_by_username(
        &self,
        username: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttemptRecord>> {
        Ok(self.newest_matching(limit, |r| r.username == username && r.attempt_time >= since))
    }

    async fn count_failures(&self, client: &ClientIdentity, since: DateTime<Utc>) -> Result<u32> {
        let records = self.records.read();
        let count = records
            .iter()
            .filter(|r| &r.client == client && !r.success && r.attempt_time >= since)
            .count();
        Ok(count as u32)
    }

    async fn mark_released(
        &self,
        client: &ClientIdentity,
        operator: &str,
        time: DateTime<Utc>,
    ) -> Result<u64> {
        let mut records = self.records.write();
        let mut stamped = 0u64;
        for record in records
            .iter_mut()
            .filter(|r| &r.client == client && r.rate_limited && r.released_at.is_none())
        {
            record.released_at = Some(time);
            record.released_by = Some(operator.to_string());
            stamped += 1;
        }
        Ok(stamped)
    }

    async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<LoginAttemptRecord>> {
        let records = self.records.read();
        let mut found: Vec<LoginAttemptRecord> = records
            .iter()
            .filter(|r| r.attempt_time >= since)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.attempt_time.cmp(&b.attempt_time));
        Ok(found)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.attempt_time >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn client(addr: &str) -> ClientIdentity {
        ClientIdentity::address(addr)
    }

    #[tokio::test]
    async fn test_record_assigns_distinct_ids() {
        let ledger = MemoryLedger::new();
        let a = ledger
            .record(NewLoginAttempt::failure(client("1.1.1.1"), "bob", "bad password"), t0())
            .await
            .unwrap();
        let b = ledger
            .record(NewLoginAttempt::success(client("1.1.1.1"), "bob"), t0())
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_recent_by_client_newest_first_and_limited() {
        let ledger = MemoryLedger::new();
        let c = client("1.1.1.1");
        for i in 0..5 {
            ledger
                .record(
                    NewLoginAttempt::failure(c.clone(), &format!("user{}", i), "bad password"),
                    t0() + Duration::minutes(i),
                )
                .await
                .unwrap();
        }
        ledger
            .record(NewLoginAttempt::failure(client("2.2.2.2"), "x", "bad"), t0())
            .await
            .unwrap();

        let recent = ledger
            .recent_by_client(&c, t0() + Duration::minutes(1), 3)
            .await
            .unwrap();
        let users: Vec<&str> = recent.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(users, vec!["user4", "user3", "user2"]);
    }

    #[tokio::test]
    async fn test_recent_by_username_spans_clients() {
        let ledger = MemoryLedger::new();
        ledger
            .record(NewLoginAttempt::failure(client("1.1.1.1"), "admin", "bad"), t0())
            .await
            .unwrap();
        ledger
            .record(
                NewLoginAttempt::failure(client("2.2.2.2"), "admin", "bad"),
                t0() + Duration::seconds(1),
            )
            .await
            .unwrap();
        ledger
            .record(NewLoginAttempt::failure(client("2.2.2.2"), "other", "bad"), t0())
            .await
            .unwrap();

        let recent = ledger.recent_by_username("admin", t0(), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].client, client("2.2.2.2"));
    }

    #[tokio::test]
    async fn test_count_failures_ignores_successes_and_old_attempts() {
        let ledger = MemoryLedger::new();
        let c = client("1.1.1.1");
        ledger
            .record(NewLoginAttempt::failure(c.clone(), "bob", "bad"), t0() - Duration::days(2))
            .await
            .unwrap();
        ledger
            .record(NewLoginAttempt::failure(c.clone(), "bob", "bad"), t0())
            .await
            .unwrap();
        ledger
            .record(NewLoginAttempt::success(c.clone(), "bob"), t0())
            .await
            .unwrap();

        let since = t0() - Duration::hours(24);
        assert_eq!(ledger.count_failures(&c, since).await.unwrap(), 1);
        assert_eq!(ledger.count_failures(&client("9.9.9.9"), since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_released_stamps_only_rate_limited() {
        let ledger = MemoryLedger::new();
        let c = client("1.1.1.1");
        let mut limited = NewLoginAttempt::failure(c.clone(), "bob", "bad");
        limited.rate_limited = true;

        ledger.record(limited.clone(), t0()).await.unwrap();
        ledger.record(limited, t0()).await.unwrap();
        ledger
            .record(NewLoginAttempt::failure(c.clone(), "bob", "bad"), t0())
            .await
            .unwrap();

        let stamped = ledger.mark_released(&c, "ops", t0()).await.unwrap();
        assert_eq!(stamped, 2);
        // Already stamped records are left alone
        assert_eq!(ledger.mark_released(&c, "ops", t0()).await.unwrap(), 0);

        let records = ledger.recent_by_client(&c, t0(), 10).await.unwrap();
        let released: Vec<_> = records.iter().filter(|r| r.released_at.is_some()).collect();
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|r| r.released_by.as_deref() == Some("ops")));
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let ledger = MemoryLedger::new();
        let c = client("1.1.1.1");
        ledger
            .record(NewLoginAttempt::failure(c.clone(), "bob", "bad"), t0() - Duration::days(100))
            .await
            .unwrap();
        ledger
            .record(NewLoginAttempt::failure(c.clone(), "bob", "bad"), t0())
            .await
            .unwrap();

        let deleted = ledger.delete_older_than(t0() - Duration::days(90)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ledger.attempts_since(t0() - Duration::days(365)).await.unwrap().len(), 1);
    }
}
