//! Error types for changewatch.
//!
//! All errors are strongly typed using thiserror. Each subsystem has its own
//! enum so callers can match on the failure class; `WatchError` wraps them
//! for code paths that cross subsystem boundaries.

use std::time::Duration;

use thiserror::Error;

/// Configuration errors. A subsystem that hits one of these does not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Change feed is disabled by configuration")]
    FeedDisabled,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Renew interval {interval:?} must be shorter than lease TTL {ttl:?}")]
    IntervalNotBelowTtl {
        interval: Duration,
        ttl: Duration,
    },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        key: String,
        message: String,
    },

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Lease or rule store failures. Always transient: retried on the next cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Template rendering failures. The affected notification is skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Unterminated placeholder starting at byte {offset}")]
    Unterminated {
        offset: usize,
    },

    #[error("Empty placeholder path at byte {offset}")]
    EmptyPath {
        offset: usize,
    },
}

/// Notification delivery failures. Logged, never retried.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Notification endpoint returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("Notification request failed: {0}")]
    Transport(String),

    #[error("Notification endpoint returned an unparsable body: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Terminal failures delivered to subscription consumers.
#[derive(Debug, Error, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionError {
    #[error("Change feed failed: {message}")]
    Feed {
        message: String,
    },

    #[error("Subscription queue overflowed its capacity of {capacity}")]
    Overflow {
        capacity: usize,
    },
}

/// Failures of the change feed source itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Change feed is closed")]
    Closed,

    #[error("Change feed source failed: {0}")]
    Source(String),

    #[error("Malformed change event: {0}")]
    Malformed(String),
}

/// Top-level error type for changewatch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Dispatch queue is closed")]
    DispatchClosed,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl WatchError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the operation may succeed on a later cycle.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::Feed(e) => matches!(e, FeedError::Source(_)),
            Self::Delivery(DeliveryError::Status { status, .. }) => *status >= 500,
            Self::Delivery(DeliveryError::Transport(_)) => true,
            _ => false,
        }
    }
}

/// Result type alias for changewatch operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::IntervalNotBelowTtl {
            interval: Duration::from_secs(60),
            ttl: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("must be shorter"));
    }

    #[test]
    fn delivery_error_includes_body() {
        let err = DeliveryError::Status {
            status: 502,
            body: "upstream down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Notification endpoint returned 502: upstream down"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(WatchError::from(StoreError::BackendError("x".into())).is_retryable());
        assert!(WatchError::from(DeliveryError::Status {
            status: 503,
            body: String::new(),
        })
        .is_retryable());
        assert!(!WatchError::from(DeliveryError::Status {
            status: 400,
            body: String::new(),
        })
        .is_retryable());
        assert!(!WatchError::from(RenderError::EmptyPath { offset: 0 }).is_retryable());
        assert!(WatchError::from(ConfigError::FeedDisabled).is_config());
    }

    #[test]
    fn subscription_error_serializes_with_kind() {
        let v = serde_json::to_value(SubscriptionError::Overflow { capacity: 4 }).unwrap();
        assert_eq!(v["kind"], "overflow");
        assert_eq!(v["capacity"], 4);
    }
}
