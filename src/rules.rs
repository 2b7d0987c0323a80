//! Alert rules and the process-local rule cache.
//!
//! Rules are owned by external CRUD actions. This module only reads enabled
//! rules and keeps a complete snapshot in memory, swapped as a whole on every
//! reload so readers never see a partial update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::StoreError;

/// Event type filter of a rule.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEventType {
    Insert,
    /// Matches update and replace.
    Update,
    Replace,
    Delete,
    /// Matches insert, update and replace.
    Upsert,
}

impl RuleEventType {
    /// Wire name of the filter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
        }
    }
}

/// A stored mapping from a change pattern to a notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    /// Scope (workspace) the rule belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub name: String,
    pub event_type: RuleEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub channel: String,
    pub template_text: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

const fn default_enabled() -> bool {
    true
}

impl AlertRule {
    /// Create an enabled rule with no namespace filters.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        event_type: RuleEventType,
        channel: impl Into<String>,
        template_text: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            workspace_id: None,
            event_type,
            database: None,
            collection: None,
            channel: channel.into(),
            template_text: template_text.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Restrict to one database.
    #[must_use]
    pub fn in_database(mut self, db: impl Into<String>) -> Self {
        self.database = Some(db.into());
        self
    }

    /// Restrict to one collection.
    #[must_use]
    pub fn in_collection(mut self, coll: impl Into<String>) -> Self {
        self.collection = Some(coll.into());
        self
    }

    /// Set the owning workspace.
    #[must_use]
    pub fn in_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// Queryable collection of alert rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules with `enabled = true`.
    async fn list_enabled(&self) -> Result<Vec<AlertRule>, StoreError>;
}

/// In-memory rule store, ordered by rule id.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: Mutex<BTreeMap<String, AlertRule>>,
}

impl InMemoryRuleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `rules`.
    #[must_use]
    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.rules.lock() {
            map.extend(rules.into_iter().map(|r| (r.id.clone(), r)));
        }
        store
    }

    /// Insert or replace a rule by id.
    pub fn upsert(&self, rule: AlertRule) -> Result<(), StoreError> {
        let mut map = self.rules.lock().map_err(|_| lock_err())?;
        map.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Remove a rule by id. Returns true if it existed.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut map = self.rules.lock().map_err(|_| lock_err())?;
        Ok(map.remove(id).is_some())
    }
}

fn lock_err() -> StoreError {
    StoreError::BackendError("poisoned lock: rules".to_string())
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list_enabled(&self) -> Result<Vec<AlertRule>, StoreError> {
        let map = self.rules.lock().map_err(|_| lock_err())?;
        Ok(map.values().filter(|r| r.enabled).cloned().collect())
    }
}

/// Immutable view of the enabled rules at one reload.
pub type RuleSnapshot = Arc<[AlertRule]>;

/// Periodically reloaded snapshot of enabled rules.
pub struct RuleCache {
    store: Arc<dyn RuleStore>,
    snapshot: RwLock<RuleSnapshot>,
    refresh_interval: Duration,
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache")
            .field("rules", &self.snapshot().len())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl RuleCache {
    /// Create an empty cache. Call `reload` or `run` to populate it.
    #[must_use]
    pub fn new(store: Arc<dyn RuleStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::from(Vec::new())),
            refresh_interval,
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RuleSnapshot {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Fetch enabled rules and swap them in. On failure the previous
    /// snapshot stays in place.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let rules = match self.store.list_enabled().await {
            Ok(rules) => rules,
            Err(err) => {
                tracing::warn!(error = %err, "rule reload failed; keeping previous snapshot");
                return Err(err);
            }
        };

        let count = rules.len();
        let fresh: RuleSnapshot = Arc::from(rules);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        tracing::debug!(count, "reloaded alert rules");
        Ok(count)
    }

    /// Reload immediately, then on every interval until `shutdown` is set.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.reload().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
