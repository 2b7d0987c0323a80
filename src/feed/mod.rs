//! Change feed abstraction.
//!
//! One ordered feed is opened per process. Consumers never own it: they
//! attach listeners by signal kind and detach them when done, so the dispatch
//! pipeline and the subscription multiplexer share the same source.

mod hub;
mod pump;
mod traits;

pub use hub::FeedHub;
pub use pump::{ndjson_events, pump};
pub use traits::{ChangeFeed, FeedSignal, Listener, ListenerId, SignalKind};
