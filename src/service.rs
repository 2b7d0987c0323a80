//! Process wiring for the alert dispatch engine.
//!
//! `AlertService::start` is the single entry point: it refuses to start on
//! configuration errors, warms the rule cache and attempts a first lease
//! claim, spawns the renewal and refresh loops, and attaches the dispatcher
//! to the feed.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::WatchConfig;
use crate::dispatch::{DispatchHandle, DispatchStatsSnapshot, Dispatcher};
use crate::error::{ConfigError, WatchResult};
use crate::feed::{ChangeFeed, ListenerId};
use crate::lease::{LeaderGate, LeaseManager, LeaseStore};
use crate::rules::{RuleCache, RuleStore};
use crate::sink::{Notifier, WebhookNotifier};

/// External collaborators of the engine.
#[allow(missing_docs)]
pub struct AlertDeps {
    pub feed: Arc<dyn ChangeFeed>,
    pub leases: Arc<dyn LeaseStore>,
    pub rules: Arc<dyn RuleStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Build the HTTP notifier described by `cfg`.
pub fn notifier_from_config(cfg: &WatchConfig) -> WatchResult<WebhookNotifier> {
    let base = cfg.require_notify_base_url()?;
    Ok(WebhookNotifier::new(base, cfg.request_timeout())?)
}

/// Entry point for the alert dispatch engine.
#[derive(Debug)]
pub struct AlertService;

impl AlertService {
    /// Validate `cfg` and start the engine against `deps`.
    pub async fn start(cfg: &WatchConfig, deps: AlertDeps) -> WatchResult<AlertServiceHandle> {
        if !cfg.enabled {
            return Err(ConfigError::FeedDisabled.into());
        }
        cfg.validate()?;

        let lease = Arc::new(LeaseManager::new(cfg.lease(), deps.leases));
        let rules = Arc::new(RuleCache::new(deps.rules, cfg.rule_refresh_interval()));

        // Warm start: a failed first attempt is retried by the loops below.
        let _ = rules.reload().await;
        lease.renew().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(&lease).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&rules).run(shutdown_rx)),
        ];

        let dispatch = Dispatcher::new(
            Arc::clone(&lease) as Arc<dyn LeaderGate>,
            Arc::clone(&rules),
            deps.notifier,
        )
        .spawn();
        let listeners = dispatch.attach(deps.feed.as_ref());

        tracing::info!(owner = %lease.owner(), leader = lease.is_leader(), "alert service started");

        Ok(AlertServiceHandle {
            lease,
            rules,
            dispatch,
            feed: deps.feed,
            listeners,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Running engine. Call `shutdown` to stop it.
pub struct AlertServiceHandle {
    lease: Arc<LeaseManager>,
    rules: Arc<RuleCache>,
    dispatch: DispatchHandle,
    feed: Arc<dyn ChangeFeed>,
    listeners: Vec<ListenerId>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AlertServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertServiceHandle")
            .field("lease", &self.lease)
            .field("rules", &self.rules)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

impl AlertServiceHandle {
    #[allow(missing_docs)]
    #[must_use]
    pub fn lease(&self) -> &Arc<LeaseManager> {
        &self.lease
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn rules(&self) -> &Arc<RuleCache> {
        &self.rules
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn dispatch(&self) -> &DispatchHandle {
        &self.dispatch
    }

    /// Dispatch counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatch.stats()
    }

    /// Wait until the feed has ended and all queued events were processed.
    pub async fn drained(&self) {
        self.dispatch.join().await;
    }

    /// Detach from the feed, finish queued work, stop the loops and release
    /// the lease.
    pub async fn shutdown(self) {
        for id in &self.listeners {
            self.feed.detach(*id);
        }
        self.dispatch.close();
        self.dispatch.join().await;

        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "background task failed");
            }
        }
        tracing::info!(owner = %self.lease.owner(), stats = ?self.dispatch.stats(), "alert service stopped");
    }
}
