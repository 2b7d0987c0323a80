//! Engine configuration.
//!
//! Loaded from TOML. Durations are expressed in whole seconds. Every field
//! has a default, so an empty file is a valid (but disabled-sink) config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lease::LeaseManagerConfig;
use crate::subscription::{OverflowPolicy, SubscriptionConfig};

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// When false the change feed is considered unavailable and nothing starts.
    pub enabled: bool,
    /// Base URL of the notification service; `/notifySlack` is appended.
    pub notify_base_url: Option<String>,
    pub lease_key: String,
    pub lease_ttl_secs: u64,
    pub renew_interval_secs: u64,
    pub rule_refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub subscription_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_base_url: None,
            lease_key: "change-alerts-leader".to_string(),
            lease_ttl_secs: 60,
            renew_interval_secs: 20,
            rule_refresh_interval_secs: 30,
            request_timeout_secs: 10,
            subscription_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl WatchConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "lease_key".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for (key, value) in [
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("renew_interval_secs", self.renew_interval_secs),
            ("rule_refresh_interval_secs", self.rule_refresh_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
        }
        if self.renew_interval_secs >= self.lease_ttl_secs {
            return Err(ConfigError::IntervalNotBelowTtl {
                interval: self.renew_interval(),
                ttl: self.lease_ttl(),
            });
        }
        if self.subscription_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "subscription_capacity".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Base URL for delivery, or a configuration error if none is set.
    pub fn require_notify_base_url(&self) -> Result<&str, ConfigError> {
        match self.notify_base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(ConfigError::MissingField {
                field: "notify_base_url".to_string(),
            }),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn rule_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.rule_refresh_interval_secs)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Lease settings derived from this config.
    #[must_use]
    pub fn lease(&self) -> LeaseManagerConfig {
        LeaseManagerConfig {
            key: self.lease_key.clone(),
            ttl: self.lease_ttl(),
            renew_interval: self.renew_interval(),
        }
    }

    /// Subscription settings derived from this config.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            capacity: self.subscription_capacity,
            overflow: self.overflow_policy,
        }
    }
}
