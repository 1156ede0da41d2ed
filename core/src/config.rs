//! Repository configuration.
//!
//! All options are optional and default to the values below. Integer options are
//! signed so that values coming from external configuration can be represented
//! as given and rejected at startup by [`RepositoryConfig::validate`].
//!
//! | Option                   | Default         |
//! |--------------------------|-----------------|
//! | `cacheName`              | `"aggregation"` |
//! | `useRecovery`            | `true`          |
//! | `recoveryIntervalMillis` | `5000`          |
//! | `maximumRedeliveries`    | `3`             |
//! | `deadLetterUri`          | absent          |
//! | `allowSerializedHeaders` | `false`         |
//! | `shutdownTimeoutMillis`  | `30000`         |
//!
//! # Example
//!
//! ```
//! use recoverable_aggregation_core::config::RepositoryConfig;
//!
//! let config = RepositoryConfig::from_toml_str(r#"
//!     cacheName = "orders"
//!     maximumRedeliveries = 5
//!     deadLetterUri = "queue:orders.dlq"
//! "#).unwrap();
//!
//! assert_eq!(config.cache_name, "orders");
//! assert!(config.use_recovery);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `maximumRedeliveries` was negative.
    #[error("Maximum redelivery retries must be zero or a positive integer, got {0}")]
    NegativeMaximumRedeliveries(i32),

    /// `recoveryIntervalMillis` was negative.
    #[error("Recovery interval must be zero or a positive integer, got {0}")]
    NegativeRecoveryInterval(i64),

    /// A dead letter address is configured but nothing can forward to it.
    #[error("Dead letter uri {0} is configured but no dead letter forwarder was supplied")]
    MissingDeadLetterForwarder(String),

    /// The configuration document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Parse(String),
}

/// Configuration of a recoverable aggregation repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Name of the backing store instance
    pub cache_name: String,
    /// Whether orphaned aggregates are recovered and redelivered
    pub use_recovery: bool,
    /// Interval between recovery passes in milliseconds
    pub recovery_interval_millis: i64,
    /// Redeliveries allowed before escalating to the dead letter sink
    pub maximum_redeliveries: i32,
    /// Address of the dead letter sink
    pub dead_letter_uri: Option<String>,
    /// Whether complex header/property values are serialized instead of dropped
    pub allow_serialized_headers: bool,
    /// How long `stop()` waits for outstanding redeliveries, in milliseconds
    pub shutdown_timeout_millis: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache_name: "aggregation".to_string(),
            use_recovery: true,
            recovery_interval_millis: 5000,
            maximum_redeliveries: 3,
            dead_letter_uri: None,
            allow_serialized_headers: false,
            shutdown_timeout_millis: 30_000,
        }
    }
}

impl RepositoryConfig {
    /// Create a configuration with default values for the given store name.
    #[must_use]
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document using the camelCase option names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed. Range checks
    /// happen later, in [`RepositoryConfig::validate`].
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Set the store name.
    #[must_use]
    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    /// Enable or disable recovery.
    #[must_use]
    pub const fn with_use_recovery(mut self, use_recovery: bool) -> Self {
        self.use_recovery = use_recovery;
        self
    }

    /// Set the recovery interval in milliseconds.
    #[must_use]
    pub const fn with_recovery_interval_millis(mut self, millis: i64) -> Self {
        self.recovery_interval_millis = millis;
        self
    }

    /// Set the recovery interval.
    #[must_use]
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval_millis = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        self
    }

    /// Set the redelivery budget.
    #[must_use]
    pub const fn with_maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    /// Set the dead letter sink address.
    #[must_use]
    pub fn with_dead_letter_uri(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }

    /// Allow complex header/property values to be serialized.
    #[must_use]
    pub const fn with_allow_serialized_headers(mut self, allow: bool) -> Self {
        self.allow_serialized_headers = allow;
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check the numeric options and produce the policy a running repository uses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NegativeMaximumRedeliveries`] or
    /// [`ConfigError::NegativeRecoveryInterval`].
    pub fn validate(&self) -> Result<RecoveryPolicy, ConfigError> {
        let maximum_redeliveries = u32::try_from(self.maximum_redeliveries)
            .map_err(|_| ConfigError::NegativeMaximumRedeliveries(self.maximum_redeliveries))?;
        let interval_millis = u64::try_from(self.recovery_interval_millis)
            .map_err(|_| ConfigError::NegativeRecoveryInterval(self.recovery_interval_millis))?;

        Ok(RecoveryPolicy {
            use_recovery: self.use_recovery,
            interval: Duration::from_millis(interval_millis),
            maximum_redeliveries,
            dead_letter_uri: self.dead_letter_uri.clone(),
            allow_serialized_headers: self.allow_serialized_headers,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_millis),
        })
    }
}

/// Validated configuration, fixed for the lifetime of a running repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Whether recovery passes run
    pub use_recovery: bool,
    /// Interval between passes; zero means passes only run on demand
    pub interval: Duration,
    /// Redeliveries allowed before escalation
    pub maximum_redeliveries: u32,
    /// Dead letter sink address
    pub dead_letter_uri: Option<String>,
    /// Whether complex header/property values are serialized
    pub allow_serialized_headers: bool,
    /// Bound on waiting for outstanding redeliveries at stop
    pub shutdown_timeout: Duration,
}

impl RecoveryPolicy {
    /// Whether a periodic scheduler should run for this policy.
    #[must_use]
    pub const fn schedules_passes(&self) -> bool {
        self.use_recovery && !self.interval.is_zero()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RepositoryConfig::default();
        assert!(config.use_recovery);
        assert_eq!(config.recovery_interval_millis, 5000);
        assert_eq!(config.maximum_redeliveries, 3);
        assert_eq!(config.dead_letter_uri, None);
        assert!(!config.allow_serialized_headers);
    }

    #[test]
    fn negative_redeliveries_rejected() {
        let config = RepositoryConfig::default().with_maximum_redeliveries(-1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NegativeMaximumRedeliveries(-1))
        );
    }

    #[test]
    fn negative_interval_rejected() {
        let config = RepositoryConfig::default().with_recovery_interval_millis(-1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NegativeRecoveryInterval(-1))
        );
    }

    #[test]
    fn zero_values_are_valid() {
        let policy = RepositoryConfig::default()
            .with_maximum_redeliveries(0)
            .with_recovery_interval_millis(0)
            .validate()
            .unwrap();

        assert_eq!(policy.maximum_redeliveries, 0);
        assert!(!policy.schedules_passes());
    }

    #[test]
    fn toml_uses_camel_case_and_defaults() {
        let config = RepositoryConfig::from_toml_str(
            r#"
            cacheName = "orders"
            useRecovery = false
            recoveryIntervalMillis = 250
            allowSerializedHeaders = true
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_name, "orders");
        assert!(!config.use_recovery);
        assert_eq!(config.recovery_interval_millis, 250);
        assert_eq!(config.maximum_redeliveries, 3);
        assert!(config.allow_serialized_headers);
    }

    #[test]
    fn toml_keeps_negative_values_for_validation() {
        let config = RepositoryConfig::from_toml_str("maximumRedeliveries = -4").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            RepositoryConfig::from_toml_str("useRecovery = \"maybe\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
