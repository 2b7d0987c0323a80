//! Listener contract for the shared change feed.

use std::sync::Arc;

use crate::event::ChangeEvent;

/// Kind of signal a listener is attached to.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Change,
    Error,
    End,
}

/// A signal emitted by the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// A change event, in feed order.
    Change(ChangeEvent),
    /// The feed failed. Terminal.
    Error(String),
    /// The feed closed. Terminal.
    End,
}

impl FeedSignal {
    /// The kind of this signal.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Change(_) => SignalKind::Change,
            Self::Error(_) => SignalKind::Error,
            Self::End => SignalKind::End,
        }
    }

    /// True for `Error` and `End`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Change(_))
    }
}

/// Handle returned by `ChangeFeed::attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Callback invoked for each signal of the attached kind.
///
/// Listeners run on the emitting task and must not block: push into a queue
/// and return.
pub type Listener = Arc<dyn Fn(&FeedSignal) + Send + Sync>;

/// A push-based, ordered change feed with detachable listeners.
pub trait ChangeFeed: Send + Sync {
    /// Attach a listener for one signal kind.
    ///
    /// Attaching a terminal-kind listener to a feed that has already
    /// terminated with that kind invokes it immediately.
    fn attach(&self, kind: SignalKind, listener: Listener) -> ListenerId;

    /// Detach a listener. Returns false if it was not attached.
    fn detach(&self, id: ListenerId) -> bool;
}
