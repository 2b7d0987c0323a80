//! In-process fan-out hub for the shared change feed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::FeedError;
use crate::event::ChangeEvent;

use super::traits::{ChangeFeed, FeedSignal, Listener, ListenerId, SignalKind};

#[derive(Default)]
struct HubState {
    listeners: BTreeMap<ListenerId, (SignalKind, Listener)>,
    terminal: Option<FeedSignal>,
}

/// Fan-out hub: the single ordered feed of a process.
///
/// Signals are delivered to listeners in attach order, one signal at a time.
/// After `Error` or `End` the hub is closed and rejects further emits.
pub struct FeedHub {
    next_id: AtomicU64,
    state: Mutex<HubState>,
    // Serializes emits so every listener observes feed order.
    emit_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for FeedHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHub")
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedHub {
    /// Create an open hub with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
            emit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().map(|s| s.listeners.len()).unwrap_or(0)
    }

    /// True once a terminal signal has been emitted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.terminal.is_some())
            .unwrap_or(true)
    }

    /// Emit a change event.
    pub async fn emit_change(&self, event: ChangeEvent) -> Result<(), FeedError> {
        self.emit(FeedSignal::Change(event)).await
    }

    /// Emit a feed failure and close the hub.
    pub async fn emit_error(&self, message: impl Into<String>) -> Result<(), FeedError> {
        self.emit(FeedSignal::Error(message.into())).await
    }

    /// Emit end-of-feed and close the hub.
    pub async fn emit_end(&self) -> Result<(), FeedError> {
        self.emit(FeedSignal::End).await
    }

    async fn emit(&self, signal: FeedSignal) -> Result<(), FeedError> {
        let _order = self.emit_lock.lock().await;

        let targets: Vec<Listener> = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| FeedError::Source("poisoned lock: feed hub".to_string()))?;
            if state.terminal.is_some() {
                return Err(FeedError::Closed);
            }
            if signal.is_terminal() {
                state.terminal = Some(signal.clone());
            }
            let kind = signal.kind();
            state
                .listeners
                .values()
                .filter(|(k, _)| *k == kind)
                .map(|(_, l)| l.clone())
                .collect()
        };

        // Listeners run without the state lock so they may detach themselves.
        for listener in targets {
            listener(&signal);
        }
        Ok(())
    }
}

impl ChangeFeed for FeedHub {
    fn attach(&self, kind: SignalKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let replay = match self.state.lock() {
            Ok(mut state) => {
                state.listeners.insert(id, (kind, listener.clone()));
                state.terminal.clone().filter(|t| t.kind() == kind)
            }
            Err(_) => None,
        };
        if let Some(signal) = replay {
            listener(&signal);
        }
        id
    }

    fn detach(&self, id: ListenerId) -> bool {
        self.state
            .lock()
            .map(|mut s| s.listeners.remove(&id).is_some())
            .unwrap_or(false)
    }
}
