//! Per-document subscriptions over the shared change feed.
//!
//! Each subscription attaches its own listeners to the feed, filters change
//! events down to one collection and document id, and buffers them in a
//! bounded queue that the consumer pulls from. Cancelling, dropping, or a
//! terminal feed signal detaches the listeners and wakes a pending pull.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::WatchConfig;
use crate::error::SubscriptionError;
use crate::event::ChangeEvent;
use crate::feed::{ChangeFeed, FeedSignal, Listener, ListenerId, SignalKind};

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do when a subscriber falls `capacity` events behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued change and keep going.
    #[default]
    DropOldest,
    /// Deliver a terminal overflow error and close.
    Error,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Max queued items per subscription.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// One item of a subscription's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubscriptionItem {
    /// A matching change event.
    Change(ChangeEvent),
    /// The feed failed. Terminal.
    Error(SubscriptionError),
    /// The feed closed. Terminal.
    End,
}

impl SubscriptionItem {
    /// True for `Error` and `End`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Change(_))
    }
}

#[derive(Default)]
struct SubState {
    queue: VecDeque<SubscriptionItem>,
    /// No further items will be accepted.
    closed: bool,
    /// Consumer gave up; pending and future pulls return `None`.
    cancelled: bool,
    listeners: Vec<ListenerId>,
    detached: bool,
    dropped: u64,
}

struct Shared {
    id: SubscriptionId,
    collection: String,
    document_id: Value,
    cfg: SubscriptionConfig,
    feed: Arc<dyn ChangeFeed>,
    active: Arc<AtomicUsize>,
    state: Mutex<SubState>,
    notify: Notify,
}

impl Shared {
    fn push_change(&self, event: &ChangeEvent) {
        if !event.targets(&self.collection, &self.document_id) {
            return;
        }
        let overflowed = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.closed {
                return;
            }
            let full = st.queue.len() >= self.cfg.capacity.max(1);
            if full && self.cfg.overflow == OverflowPolicy::Error {
                true
            } else {
                if full {
                    st.queue.pop_front();
                    st.dropped += 1;
                }
                st.queue.push_back(SubscriptionItem::Change(event.clone()));
                false
            }
        };

        if overflowed {
            tracing::debug!(subscription = ?self.id, capacity = self.cfg.capacity, "subscription overflowed");
            self.terminate(SubscriptionItem::Error(SubscriptionError::Overflow {
                capacity: self.cfg.capacity,
            }));
        } else {
            self.notify.notify_one();
        }
    }

    /// Enqueue a terminal item (once) and detach from the feed.
    fn terminate(&self, item: SubscriptionItem) {
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.closed {
                return;
            }
            st.queue.push_back(item);
            st.closed = true;
        }
        self.detach();
        self.notify.notify_one();
    }

    fn cancel(&self) {
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.cancelled = true;
            st.closed = true;
            st.queue.clear();
        }
        self.detach();
        self.notify.notify_one();
    }

    fn detach(&self) {
        let ids = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.detached {
                return;
            }
            st.detached = true;
            std::mem::take(&mut st.listeners)
        };
        for id in ids {
            self.feed.detach(id);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(subscription = ?self.id, collection = %self.collection, "subscription detached");
    }
}

fn listener(shared: &Arc<Shared>) -> Listener {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    Arc::new(move |signal: &FeedSignal| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match signal {
            FeedSignal::Change(event) => shared.push_change(event),
            FeedSignal::Error(message) => shared.terminate(SubscriptionItem::Error(SubscriptionError::Feed {
                message: message.clone(),
            })),
            FeedSignal::End => shared.terminate(SubscriptionItem::End),
        }
    })
}

/// Creates subscriptions over one shared feed.
pub struct SubscriptionHub {
    feed: Arc<dyn ChangeFeed>,
    cfg: SubscriptionConfig,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("cfg", &self.cfg)
            .field("active", &self.active())
            .finish()
    }
}

impl SubscriptionHub {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(feed: Arc<dyn ChangeFeed>, cfg: SubscriptionConfig) -> Self {
        Self {
            feed,
            cfg,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hub using the queue bound and overflow policy from `cfg`.
    #[must_use]
    pub fn from_config(feed: Arc<dyn ChangeFeed>, cfg: &WatchConfig) -> Self {
        Self::new(feed, cfg.subscriptions())
    }

    /// Number of subscriptions still attached to the feed.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Subscribe to changes of one document.
    ///
    /// `document_id` is compared by type: `"42"` and `42` are different
    /// documents. A string also selects the object id with that hex form.
    #[must_use]
    pub fn subscribe(&self, collection: impl Into<String>, document_id: impl Into<Value>) -> ChangeSubscription {
        let shared = Arc::new(Shared {
            id: SubscriptionId::new(),
            collection: collection.into(),
            document_id: document_id.into(),
            cfg: self.cfg.clone(),
            feed: Arc::clone(&self.feed),
            active: Arc::clone(&self.active),
            state: Mutex::new(SubState::default()),
            notify: Notify::new(),
        });
        self.active.fetch_add(1, Ordering::AcqRel);

        let l = listener(&shared);
        let ids = vec![
            self.feed.attach(SignalKind::Change, Arc::clone(&l)),
            self.feed.attach(SignalKind::Error, Arc::clone(&l)),
            self.feed.attach(SignalKind::End, l),
        ];

        // A feed that already terminated replays its signal during attach,
        // which may have closed the subscription before the ids were known.
        let leftover = match shared.state.lock() {
            Ok(mut st) if !st.detached => {
                st.listeners = ids;
                None
            }
            _ => Some(ids),
        };
        if let Some(ids) = leftover {
            for id in ids {
                self.feed.detach(id);
            }
        }

        tracing::debug!(
            subscription = ?shared.id,
            collection = %shared.collection,
            document_id = %shared.document_id,
            "subscription opened"
        );
        ChangeSubscription { shared }
    }
}

/// Cancels a subscription from another task.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Detach from the feed and wake any pending pull.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").field("subscription", &self.shared.id).finish()
    }
}

/// A cancellable, filtered pull sequence of change events.
///
/// Dropping the subscription cancels it.
pub struct ChangeSubscription {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("id", &self.shared.id)
            .field("collection", &self.shared.collection)
            .field("document_id", &self.shared.document_id)
            .finish()
    }
}

impl ChangeSubscription {
    /// The subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// A handle that can cancel this subscription from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of changes discarded under `OverflowPolicy::DropOldest`.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().map(|st| st.dropped).unwrap_or(0)
    }

    /// Stop the subscription.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Pull the next item. Suspends while the queue is empty.
    ///
    /// Returns `None` once the subscription is cancelled or a terminal item
    /// has already been returned.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        loop {
            {
                let Ok(mut st) = self.shared.state.lock() else {
                    return None;
                };
                if st.cancelled {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    return Some(item);
                }
                if st.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = SubscriptionItem> {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}
