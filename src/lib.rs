//! # changewatch - change-feed alerts and document subscriptions
//!
//! changewatch turns one ordered database change feed into two things:
//!
//! - **Alert dispatch**: exactly one process (the lease holder) matches each
//!   change against the enabled alert rules, renders a notification from a
//!   template and posts it to a chat channel, in feed order.
//! - **Document subscriptions**: any number of cancellable, per-document pull
//!   streams for UI consumers, layered over the same feed.
//!
//! ## Core Concepts
//!
//! - **Change feed**: the process's single ordered event source ([`feed`])
//! - **Lease**: time-bound claim that makes one process the notifier ([`lease`])
//! - **Rule**: maps a change pattern to a channel and template ([`rules`])
//! - **Subscription**: filtered, cancellable view of the feed ([`subscription`])
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use changewatch::{AlertDeps, AlertService, FeedHub, InMemoryLeaseStore, InMemoryRuleStore, WatchConfig};
//!
//! let feed = Arc::new(FeedHub::new());
//! let cfg = WatchConfig::load("changewatch.toml")?;
//! let notifier = changewatch::service::notifier_from_config(&cfg)?;
//! let service = AlertService::start(&cfg, AlertDeps {
//!     feed: feed.clone(),
//!     leases: Arc::new(InMemoryLeaseStore::new()),
//!     rules: Arc::new(InMemoryRuleStore::new()),
//!     notifier: Arc::new(notifier),
//! }).await?;
//! changewatch::feed::pump(&feed, my_driver_stream).await?;
//! service.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod feed;
pub mod lease;
pub mod matcher;
pub mod rules;
pub mod service;
pub mod sink;
pub mod subscription;
pub mod template;

// Re-export primary types at crate root for convenience
pub use config::WatchConfig;
pub use dispatch::{DispatchHandle, DispatchStatsSnapshot, Dispatcher};
pub use error::{
    ConfigError, DeliveryError, FeedError, RenderError, StoreError, SubscriptionError, WatchError,
    WatchResult,
};
pub use event::{ChangeEvent, DocumentKey, Namespace, OperationType, UpdateDescription};
pub use feed::{ChangeFeed, FeedHub, FeedSignal, SignalKind};
pub use lease::{InMemoryLeaseStore, LeaderGate, Lease, LeaseManager, LeaseManagerConfig, LeaseStore, OwnerId};
pub use matcher::{matches, matching_rules};
pub use rules::{AlertRule, InMemoryRuleStore, RuleCache, RuleEventType, RuleStore};
pub use service::{AlertDeps, AlertService, AlertServiceHandle};
pub use sink::{Notification, Notifier, WebhookNotifier};
pub use subscription::{
    CancelHandle, ChangeSubscription, OverflowPolicy, SubscriptionConfig, SubscriptionHub,
    SubscriptionId, SubscriptionItem,
};
pub use template::render;
