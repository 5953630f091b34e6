//! Ban registry: active bans, their release workflow, and ban storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::ClientIdentity;

/// A ban on a client.
///
/// Bans are never deleted while they matter: releasing one stamps the
/// release fields, and expiry is derived from `expires_at` at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: Uuid,
    pub client: ClientIdentity,
    pub reason: String,
    /// Failed attempts counted when the ban was imposed
    pub triggering_attempt_count: u32,
    pub banned_at: DateTime<Utc>,
    /// `None` means the ban only ends by manual release
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
    pub release_reason: Option<String>,
}

impl BanEntry {
    /// Create an unreleased ban starting at `banned_at`.
    ///
    /// A `duration` of `None` makes the ban indefinite.
    pub fn new(
        client: ClientIdentity,
        reason: impl Into<String>,
        triggering_attempt_count: u32,
        banned_at: DateTime<Utc>,
        duration: Option<chrono::Duration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            reason: reason.into(),
            triggering_attempt_count,
            banned_at,
            expires_at: duration.map(|d| banned_at + d),
            released_at: None,
            released_by: None,
            release_reason: None,
        }
    }

    /// Un-released and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at.map_or(true, |expires| expires > now)
    }

    /// When the ban stopped applying, if it has.
    pub fn ended_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.released_at, self.expires_at) {
            (Some(released), _) => Some(released),
            (None, Some(expires)) if expires <= now => Some(expires),
            _ => None,
        }
    }
}

/// Outcome of a conditional ban insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanInsert {
    /// No active ban existed; this one was stored
    Created(BanEntry),
    /// An active ban already existed and was left untouched
    Existing(BanEntry),
}

impl BanInsert {
    pub fn entry(&self) -> &BanEntry {
        match self {
            BanInsert::Created(entry) | BanInsert::Existing(entry) => entry,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, BanInsert::Created(_))
    }
}

/// Storage for ban entries.
#[async_trait]
pub trait BanStore: Send + Sync {
    /// Store `entry` unless the client already has an active ban.
    ///
    /// Must be a conditional insert so concurrent callers create at most one
    /// active ban per client.
    async fn insert_if_absent(&self, entry: BanEntry, now: DateTime<Utc>) -> Result<BanInsert>;

    /// The client's active ban, if any.
    async fn active(&self, client: &ClientIdentity, now: DateTime<Utc>) -> Result<Option<BanEntry>>;

    /// Stamp release fields on the client's active ban and return it.
    async fn release(
        &self,
        client: &ClientIdentity,
        operator: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BanEntry>>;

    /// All active bans, oldest first.
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>>;

    /// Most recent manual release time for the client.
    async fn latest_release(&self, client: &ClientIdentity) -> Result<Option<DateTime<Utc>>>;

    /// Delete bans that ended before `cutoff`. Active bans are never deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;
}

/// In-process ban table guarded by a single lock.
#[derive(Debug, Default)]
pub struct MemoryBanStore {
    bans: Mutex<HashMap<ClientIdentity, Vec<BanEntry>>>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows, including released and expired bans.
    pub fn len(&self) -> usize {
        self.bans.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BanStore for MemoryBanStore {
    async fn insert_if_absent(&self, entry: BanEntry, now: DateTime<Utc>) -> Result<BanInsert> {
        let mut bans = self.bans.lock();
        let history = bans.entry(entry.client.clone()).or_default();

        if let Some(existing) = history.iter().find(|b| b.is_active(now)) {
            return Ok(BanInsert::Existing(existing.clone()));
        }

        history.push(entry.clone());
        Ok(BanInsert::Created(entry))
    }

    async fn active(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<BanEntry>> {
        let bans = self.bans.lock();
        Ok(bans
            .get(client)
            .and_then(|history| history.iter().find(|b| b.is_active(now)).cloned()))
    }

    async fn release(
        &self,
        client: &ClientIdentity,
        operator: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BanEntry>> {
        let mut bans = self.bans.lock();
        let Some(active) = bans
            .get_mut(client)
            .and_then(|history| history.iter_mut().find(|b| b.is_active(now)))
        else {
            return Ok(None);
        };

        active.released_at = Some(now);
        active.released_by = Some(operator.to_string());
        active.release_reason = Some(reason.to_string());
        Ok(Some(active.clone()))
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        let bans = self.bans.lock();
        let mut active: Vec<BanEntry> = bans
            .values()
            .flat_map(|history| history.iter().filter(|b| b.is_active(now)).cloned())
            .collect();
        active.sort_by(|a, b| a.banned_at.cmp(&b.banned_at));
        Ok(active)
    }

    async fn latest_release(&self, client: &ClientIdentity) -> Result<Option<DateTime<Utc>>> {
        let bans = self.bans.lock();
        Ok(bans
            .get(client)
            .and_then(|history| history.iter().filter_map(|b| b.released_at).max()))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut bans = self.bans.lock();
        let mut deleted = 0u64;
        for history in bans.values_mut() {
            let before = history.len();
            history.retain(|b| b.ended_at(now).map_or(true, |ended| ended >= cutoff));
            deleted += (before - history.len()) as u64;
        }
        bans.retain(|_, history| !history.is_empty());
        Ok(deleted)
    }
}

/// Tracks banned clients and the release workflow.
pub struct BanRegistry {
    store: Arc<dyn BanStore>,
}

impl BanRegistry {
    pub fn new(store: Arc<dyn BanStore>) -> Self {
        Self { store }
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<dyn BanStore> {
        &self.store
    }

    /// The client's active ban, if any. Expiry is evaluated lazily against `now`.
    pub async fn is_active(
        &self,
        client: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<BanEntry>> {
        self.store.active(client, now).await
    }

    /// Impose `entry` unless the client is already banned.
    pub async fn ban(&self, entry: BanEntry, now: DateTime<Utc>) -> Result<BanInsert> {
        let outcome = self.store.insert_if_absent(entry, now).await?;
        match &outcome {
            BanInsert::Created(ban) => warn!(
                client = %ban.client,
                reason = %ban.reason,
                attempts = ban.triggering_attempt_count,
                expires_at = ?ban.expires_at,
                "Client banned"
            ),
            BanInsert::Existing(ban) => debug!(
                client = %ban.client,
                ban_id = %ban.id,
                "Client already banned"
            ),
        }
        Ok(outcome)
    }

    /// Release the client's active ban.
    ///
    /// Fails with `NotFound` when the client has no active ban, including
    /// when its last ban was already released or has expired.
    pub async fn release(
        &self,
        client: &ClientIdentity,
        operator: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<BanEntry> {
        match self.store.release(client, operator, reason, now).await? {
            Some(ban) => {
                info!(
                    client = %client,
                    operator = %operator,
                    reason = %reason,
                    "Ban released"
                );
                Ok(ban)
            }
            None => Err(BulwarkError::NotFound(format!(
                "no active ban for client {}",
                client
            ))),
        }
    }

    /// All active bans.
    pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        self.store.list_active(now).await
    }

    /// When the client's most recent ban was released by an operator.
    pub async fn last_released_at(&self, client: &ClientIdentity) -> Result<Option<DateTime<Utc>>> {
        self.store.latest_release(client).await
    }
}
