//! Leader election over a single lease record.
//!
//! Every process generates a random `OwnerId` at startup and periodically
//! tries to claim the lease. The claim is the only operation that needs true
//! cross-process atomicity and is delegated to the `LeaseStore`.
//!
//! A process considers itself leader only while its last renewal succeeded
//! and the claimed expiry is still in the future. Store failures demote the
//! process until the next successful renewal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::StoreError;

/// Opaque identity of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Create a new random owner id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The singleton lease record.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub key: String,
    pub owner_id: OwnerId,
    pub expires_at: DateTime<Utc>,
    /// Bumped whenever the lease changes hands.
    pub epoch: u64,
}

impl Lease {
    /// True if the lease is still valid at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durable storage for lease records.
///
/// `try_claim` must be atomic with respect to other processes: a
/// find-and-modify with upsert semantics in a database-backed store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim or renew the lease for `owner`.
    ///
    /// Succeeds when there is no record, the record is expired at `now`, or
    /// `owner` already holds it. On success the expiry becomes `now + ttl`.
    /// Returns `None` when another owner holds a live lease.
    async fn try_claim(
        &self,
        key: &str,
        owner: OwnerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Give up the lease if `owner` holds it. Returns true if released.
    async fn release(&self, key: &str, owner: OwnerId) -> Result<bool, StoreError>;

    /// Read the current record, if any.
    async fn current(&self, key: &str) -> Result<Option<Lease>, StoreError>;
}

/// Mutex-guarded lease store for a single host, tests and tools.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    // Epochs survive release so they stay monotonic per key.
    epochs: Mutex<HashMap<String, u64>>,
}

impl InMemoryLeaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err(context: &'static str) -> StoreError {
    StoreError::BackendError(format!("poisoned lock: {context}"))
}

fn ttl_delta(ttl: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(ttl).map_err(|e| StoreError::BackendError(format!("invalid ttl: {e}")))
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_claim(
        &self,
        key: &str,
        owner: OwnerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let expires_at = now + ttl_delta(ttl)?;
        let mut leases = self.leases.lock().map_err(|_| lock_err("leases"))?;
        let mut epochs = self.epochs.lock().map_err(|_| lock_err("lease epochs"))?;

        if let Some(existing) = leases.get_mut(key) {
            if existing.owner_id == owner {
                existing.expires_at = expires_at;
                return Ok(Some(existing.clone()));
            }
            if existing.is_live_at(now) {
                return Ok(None);
            }
        }

        let epoch = epochs.entry(key.to_string()).or_insert(0);
        *epoch += 1;
        let lease = Lease {
            key: key.to_string(),
            owner_id: owner,
            expires_at,
            epoch: *epoch,
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, key: &str, owner: OwnerId) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| lock_err("leases"))?;
        match leases.get(key) {
            Some(l) if l.owner_id == owner => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        let leases = self.leases.lock().map_err(|_| lock_err("leases"))?;
        Ok(leases.get(key).cloned())
    }
}

/// Answers whether this process may act on events right now.
pub trait LeaderGate: Send + Sync {
    /// True if this process currently holds a valid lease.
    fn is_leader(&self) -> bool;
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct LeaseManagerConfig {
    pub key: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            key: "change-alerts-leader".to_string(),
            ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
        }
    }
}

/// Periodically renews the lease and tracks local leadership.
pub struct LeaseManager {
    cfg: LeaseManagerConfig,
    owner: OwnerId,
    store: Arc<dyn LeaseStore>,
    leader: AtomicBool,
    leader_until: Mutex<Option<DateTime<Utc>>>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("key", &self.cfg.key)
            .field("owner", &self.owner)
            .field("leader", &self.leader.load(Ordering::Acquire))
            .finish()
    }
}

impl LeaseManager {
    /// Create a manager with a fresh random identity.
    #[must_use]
    pub fn new(cfg: LeaseManagerConfig, store: Arc<dyn LeaseStore>) -> Self {
        Self::with_owner(cfg, store, OwnerId::new())
    }

    /// Create a manager with a fixed identity.
    #[must_use]
    pub fn with_owner(cfg: LeaseManagerConfig, store: Arc<dyn LeaseStore>, owner: OwnerId) -> Self {
        Self {
            cfg,
            owner,
            store,
            leader: AtomicBool::new(false),
            leader_until: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// This process's identity.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Epoch of the most recent successful claim, 0 if never claimed.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Attempt one claim/renewal. Returns whether this process is leader.
    pub async fn renew(&self) -> bool {
        self.renew_at(Utc::now()).await
    }

    /// Attempt one claim/renewal as of `now`.
    pub async fn renew_at(&self, now: DateTime<Utc>) -> bool {
        let result = self
            .store
            .try_claim(&self.cfg.key, self.owner, now, self.cfg.ttl)
            .await;

        let lease = match result {
            Ok(Some(lease)) if lease.owner_id == self.owner => Some(lease),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(key = %self.cfg.key, owner = %self.owner, error = %err, "lease renewal failed");
                None
            }
        };

        let was_leader = self.leader.load(Ordering::Acquire);
        let is_leader = lease.is_some();
        if let Ok(mut until) = self.leader_until.lock() {
            *until = lease.as_ref().map(|l| l.expires_at);
        }
        if let Some(l) = &lease {
            self.epoch.store(l.epoch, Ordering::Release);
        }
        self.leader.store(is_leader, Ordering::Release);

        match (was_leader, is_leader) {
            (false, true) => tracing::info!(key = %self.cfg.key, owner = %self.owner, epoch = self.epoch(), "acquired lease"),
            (true, false) => tracing::info!(key = %self.cfg.key, owner = %self.owner, "lost lease"),
            _ => tracing::trace!(key = %self.cfg.key, is_leader, "lease renewal"),
        }
        is_leader
    }

    /// Leadership as of `now`: last renewal succeeded and has not expired.
    #[must_use]
    pub fn is_leader_at(&self, now: DateTime<Utc>) -> bool {
        if !self.leader.load(Ordering::Acquire) {
            return false;
        }
        self.leader_until
            .lock()
            .map(|until| until.is_some_and(|t| t > now))
            .unwrap_or(false)
    }

    /// Release the lease if held. Errors are logged.
    pub async fn release(&self) {
        self.leader.store(false, Ordering::Release);
        if let Ok(mut until) = self.leader_until.lock() {
            *until = None;
        }
        match self.store.release(&self.cfg.key, self.owner).await {
            Ok(true) => tracing::info!(key = %self.cfg.key, owner = %self.owner, "released lease"),
            Ok(false) => {}
            Err(err) => tracing::warn!(key = %self.cfg.key, error = %err, "lease release failed"),
        }
    }

    /// Renew on a fixed interval until `shutdown` flips to true, then release.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.renew().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.release().await;
    }
}

impl LeaderGate for LeaseManager {
    fn is_leader(&self) -> bool {
        self.is_leader_at(Utc::now())
    }
}
