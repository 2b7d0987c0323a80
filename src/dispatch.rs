//! Serial dispatch of change events to notifications.
//!
//! Events are appended to an unbounded channel and drained by exactly one
//! task, so notifications go out in feed order and the drain loop never runs
//! twice concurrently. Enqueue never drops: it only fails once the queue has
//! been closed. Per-event failures are logged and counted and never stop the
//! drainer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use crate::error::{RenderError, WatchError, WatchResult};
use crate::event::ChangeEvent;
use crate::feed::{ChangeFeed, FeedSignal, Listener, ListenerId, SignalKind};
use crate::lease::LeaderGate;
use crate::matcher::matching_rules;
use crate::rules::{AlertRule, RuleCache};
use crate::sink::{Notification, Notifier};
use crate::template::render;

/// Counters describing what the drainer has done so far.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    skipped_not_leader: AtomicU64,
    matched: AtomicU64,
    delivered: AtomicU64,
    render_failures: AtomicU64,
    delivery_failures: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub skipped_not_leader: u64,
    pub matched: u64,
    pub delivered: u64,
    pub render_failures: u64,
    pub delivery_failures: u64,
    pub panics: u64,
}

impl DispatchStats {
    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped_not_leader: self.skipped_not_leader.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Build the notification for one rule and event.
pub fn build_notification(
    rule: &AlertRule,
    event: &ChangeEvent,
    document: &Value,
) -> Result<Notification, RenderError> {
    let text = render(&rule.template_text, document)?;
    Ok(Notification {
        workspace_id: rule.workspace_id.clone(),
        channel: rule.channel.clone(),
        template: rule.template_text.clone(),
        text,
        sample_document: document.clone(),
        event_type: event.operation_type.to_string(),
        database: event.ns.db.clone(),
        collection: event.ns.coll.clone(),
    })
}

/// Turns change events into notifications. Owned by its drainer task.
pub struct Dispatcher {
    gate: Arc<dyn LeaderGate>,
    rules: Arc<RuleCache>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(gate: Arc<dyn LeaderGate>, rules: Arc<RuleCache>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            gate,
            rules,
            notifier,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Start the drainer task and return the queue handle.
    #[must_use]
    pub fn spawn(self) -> DispatchHandle {
        let (tx, rx) = unbounded_channel::<ChangeEvent>();
        let (done_tx, done_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            self.drain(rx).await;
            let _ = done_tx.send(true);
        });

        DispatchHandle {
            inner: Arc::new(HandleInner {
                tx: Mutex::new(Some(tx)),
                done: done_rx,
                stats,
            }),
        }
    }

    async fn drain(self, mut rx: UnboundedReceiver<ChangeEvent>) {
        while let Some(event) = rx.recv().await {
            let outcome = AssertUnwindSafe(self.process(&event)).catch_unwind().await;
            if outcome.is_err() {
                bump(&self.stats.panics);
                tracing::error!(op = %event.operation_type, ns = %event.ns.coll, "dispatch panicked; continuing");
            }
        }
        tracing::debug!(stats = ?self.stats.snapshot(), "dispatch queue drained and closed");
    }

    async fn process(&self, event: &ChangeEvent) {
        bump(&self.stats.received);

        if !self.gate.is_leader() {
            bump(&self.stats.skipped_not_leader);
            tracing::trace!(op = %event.operation_type, "not leader; dropping event");
            return;
        }

        let rules = self.rules.snapshot();
        let matched = matching_rules(&rules, event);
        if matched.is_empty() {
            return;
        }

        let document = event.render_document();
        for rule in matched {
            bump(&self.stats.matched);
            match self.deliver(rule, event, &document).await {
                Ok(()) => {
                    bump(&self.stats.delivered);
                    tracing::debug!(rule = %rule.id, channel = %rule.channel, "notification delivered");
                }
                Err(WatchError::Render(err)) => {
                    bump(&self.stats.render_failures);
                    tracing::warn!(rule = %rule.id, error = %err, "failed to render notification");
                }
                Err(err) => {
                    bump(&self.stats.delivery_failures);
                    tracing::warn!(
                        rule = %rule.id,
                        channel = %rule.channel,
                        notifier = self.notifier.name(),
                        error = %err,
                        "failed to deliver notification"
                    );
                }
            }
        }
    }

    async fn deliver(&self, rule: &AlertRule, event: &ChangeEvent, document: &Value) -> WatchResult<()> {
        let notification = build_notification(rule, event, document)?;
        self.notifier.notify(&notification).await?;
        Ok(())
    }
}

struct HandleInner {
    tx: Mutex<Option<UnboundedSender<ChangeEvent>>>,
    /// Flips to true when the drainer has processed its last event.
    done: watch::Receiver<bool>,
    stats: Arc<DispatchStats>,
}

/// Cloneable handle to the dispatch queue.
#[derive(Clone)]
pub struct DispatchHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl DispatchHandle {
    /// Append an event to the queue.
    pub fn enqueue(&self, event: ChangeEvent) -> WatchResult<()> {
        let guard = self
            .inner
            .tx
            .lock()
            .map_err(|_| WatchError::internal("poisoned lock: dispatch queue"))?;
        match guard.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| WatchError::DispatchClosed),
            None => Err(WatchError::DispatchClosed),
        }
    }

    /// Stop accepting events. Already queued events are still processed.
    pub fn close(&self) {
        if let Ok(mut guard) = self.inner.tx.lock() {
            if guard.take().is_some() {
                tracing::debug!("dispatch queue closed");
            }
        }
    }

    /// True once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Wait for the drainer to finish. Only returns after `close`.
    ///
    /// Any number of callers may wait, concurrently or later; all of them
    /// return once every queued event has been processed.
    pub async fn join(&self) {
        let mut done = self.inner.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            tracing::error!("dispatch drainer task stopped without finishing");
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Feed change signals into this queue and close it when the feed ends
    /// or fails. Returns the attached listener ids.
    pub fn attach(&self, feed: &dyn ChangeFeed) -> Vec<ListenerId> {
        let queue = self.clone();
        let on_change: Listener = Arc::new(move |signal: &FeedSignal| {
            if let FeedSignal::Change(event) = signal {
                if let Err(err) = queue.enqueue(event.clone()) {
                    tracing::debug!(error = %err, "dropping change after dispatch close");
                }
            }
        });

        let queue = self.clone();
        let on_terminal: Listener = Arc::new(move |signal: &FeedSignal| {
            if let FeedSignal::Error(message) = signal {
                tracing::warn!(%message, "change feed failed; dispatch stops accepting events");
            }
            queue.close();
        });

        vec![
            feed.attach(SignalKind::Change, on_change),
            feed.attach(SignalKind::Error, Arc::clone(&on_terminal)),
            feed.attach(SignalKind::End, on_terminal),
        ]
    }
}
