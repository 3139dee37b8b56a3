//! Server configuration.
//!
//! Every field has a default, so an empty JSON object is a valid configuration:
//!
//! ```
//! use uasub::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{ "publish_timeout_ms": 5000 }"#).unwrap();
//! assert_eq!(config.publish_timeout_ms, 5000);
//! assert!(config.allow_anonymous);
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, UaResult};

/// Limits applied to sessions, subscriptions and monitored items.
///
/// Requested intervals below the minimums are revised upward and reported back to
/// the client; counts above the maximums are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    /// Fastest publishing interval the server will run (ms).
    pub min_publishing_interval_ms: u64,
    /// Fastest sampling interval the server will run (ms).
    pub min_sampling_interval_ms: u64,
    /// Maximum concurrently open sessions.
    pub max_sessions: usize,
    /// Maximum subscriptions one session may own.
    pub max_subscriptions_per_session: usize,
    /// Maximum monitored items in one subscription.
    pub max_monitored_items_per_subscription: usize,
    /// Largest queue size a monitored item may request.
    pub max_queue_size: usize,
    /// Server cap on notifications per publish. 0 means no server cap.
    pub max_notifications_per_publish: u32,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            min_publishing_interval_ms: 50,
            min_sampling_interval_ms: 10,
            max_sessions: 100,
            max_subscriptions_per_session: 100,
            max_monitored_items_per_subscription: 1000,
            max_queue_size: 10_000,
            max_notifications_per_publish: 0,
        }
    }
}

impl SubscriptionLimits {
    /// Minimum publishing interval as a `Duration`.
    #[must_use]
    pub const fn min_publishing_interval(&self) -> Duration {
        Duration::from_millis(self.min_publishing_interval_ms)
    }

    /// Minimum sampling interval as a `Duration`.
    #[must_use]
    pub const fn min_sampling_interval(&self) -> Duration {
        Duration::from_millis(self.min_sampling_interval_ms)
    }
}

/// Build information exposed under `Server.ServerStatus.BuildInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    /// Exposed as `Server.ServerStatus.BuildInfo.ProductName`.
    pub product_name: String,
    /// Exposed as `BuildInfo.BuildNumber`.
    pub build_number: String,
    /// Exposed as `BuildInfo.BuildDate`.
    pub build_date: DateTime<Utc>,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            product_name: "uasub".to_string(),
            build_number: env!("CARGO_PKG_VERSION").to_string(),
            build_date: Utc.with_ymd_and_hms(2014, 6, 2, 0, 0, 0).single().unwrap_or_default(),
        }
    }
}

/// A username/password pair accepted at session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    /// Login name.
    pub username: String,
    /// Plain-text password.
    pub password: String,
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name reported in logs.
    #[serde(default = "ServerConfig::default_application_name")]
    pub application_name: String,

    /// Build information published in the address space.
    #[serde(default)]
    pub build_info: BuildInfo,

    /// Accept sessions without credentials.
    #[serde(default = "ServerConfig::default_allow_anonymous")]
    pub allow_anonymous: bool,

    /// Accepted user name / password pairs.
    #[serde(default)]
    pub users: Vec<UserCredential>,

    /// How long a publish request may wait for output before it is answered with a
    /// keep-alive (ms).
    #[serde(default = "ServerConfig::default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Subscription and session limits.
    #[serde(default)]
    pub limits: SubscriptionLimits,
}

impl ServerConfig {
    fn default_application_name() -> String {
        "uasub server".to_string()
    }
    fn default_allow_anonymous() -> bool {
        true
    }
    fn default_publish_timeout_ms() -> u64 {
        60_000
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the JSON is malformed or a field is out of range.
    pub fn from_json_str(json: &str) -> UaResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidField {
            field: "<root>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |field: &str, reason: &str| ConfigurationError::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.publish_timeout_ms == 0 {
            return Err(invalid("publish_timeout_ms", "must be greater than zero"));
        }
        if self.limits.min_publishing_interval_ms == 0 {
            return Err(invalid("limits.min_publishing_interval_ms", "must be greater than zero"));
        }
        if self.limits.min_sampling_interval_ms == 0 {
            return Err(invalid("limits.min_sampling_interval_ms", "must be greater than zero"));
        }
        if self.limits.max_queue_size == 0 {
            return Err(invalid("limits.max_queue_size", "must be at least 1"));
        }
        if self.limits.max_sessions == 0 {
            return Err(invalid("limits.max_sessions", "must be at least 1"));
        }
        if !self.allow_anonymous && self.users.is_empty() {
            return Err(invalid("users", "anonymous access is disabled and no users are configured"));
        }
        Ok(())
    }

    /// How long a publish request may wait before it is answered with a keep-alive.
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            application_name: Self::default_application_name(),
            build_info: BuildInfo::default(),
            allow_anonymous: Self::default_allow_anonymous(),
            users: Vec::new(),
            publish_timeout_ms: Self::default_publish_timeout_ms(),
            limits: SubscriptionLimits::default(),
        }
    }
}
