//! Redelivery bookkeeping and the hand-off to the routing engine.
//!
//! Per key, a recovery pass walks the state machine
//!
//! ```text
//! InFlight ──pass──▶ PendingRedelivery(1) ──pass──▶ … PendingRedelivery(n)
//!    │                        │                               │ n > max
//!    └──── confirm/remove ────┴──────────▶ Confirmed           ▼
//!                                                       DeadLettered
//! ```

use crate::exchange::Exchange;
use crate::key::CorrelationKey;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Header set to `true` on every redelivered exchange.
pub const REDELIVERED_HEADER: &str = "AggregationRedelivered";

/// Header carrying the redelivery attempt number (1-based).
pub const REDELIVERY_COUNTER_HEADER: &str = "AggregationRedeliveryCounter";

/// Header carrying the redelivery budget.
pub const REDELIVERY_MAX_COUNTER_HEADER: &str = "AggregationRedeliveryMaxCounter";

/// Property carrying the correlation key the exchange was recovered from.
pub const CORRELATION_KEY_PROPERTY: &str = "AggregationCorrelationKey";

/// Recovery state of one correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Stored, not yet observed by a recovery pass
    InFlight,
    /// Stored and redelivered `n` times
    PendingRedelivery(u32),
    /// Removed after successful processing
    Confirmed,
    /// Removed after exhausting the redelivery budget
    DeadLettered,
}

impl RecoveryState {
    /// Whether the key has left the store.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::DeadLettered)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => write!(f, "in-flight"),
            Self::PendingRedelivery(n) => write!(f, "pending-redelivery({n})"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::DeadLettered => write!(f, "dead-lettered"),
        }
    }
}

/// How many recovery passes have observed a key still outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryRecord {
    /// The tracked key
    pub key: CorrelationKey,
    /// Passes that observed the key; never decreases
    pub attempts: u32,
    /// When a pass last observed the key
    pub last_seen_at: DateTime<Utc>,
}

impl RedeliveryRecord {
    /// Start tracking a key.
    #[must_use]
    pub const fn new(key: CorrelationKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            attempts: 0,
            last_seen_at: now,
        }
    }

    /// Register one more observation and return the new attempt count.
    pub const fn observe(&mut self, now: DateTime<Utc>) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.last_seen_at = now;
        self.attempts
    }

    /// Whether the budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self, maximum_redeliveries: u32) -> bool {
        self.attempts > maximum_redeliveries
    }

    /// Current non-terminal state.
    #[must_use]
    pub const fn state(&self) -> RecoveryState {
        if self.attempts == 0 {
            RecoveryState::InFlight
        } else {
            RecoveryState::PendingRedelivery(self.attempts)
        }
    }
}

/// Mark an exchange as a redelivery.
pub fn tag_redelivery(
    exchange: &mut Exchange,
    key: &CorrelationKey,
    attempt: u32,
    maximum_redeliveries: u32,
) {
    exchange.set_header(REDELIVERED_HEADER, true);
    exchange.set_header(REDELIVERY_COUNTER_HEADER, attempt);
    exchange.set_header(REDELIVERY_MAX_COUNTER_HEADER, maximum_redeliveries);
    exchange.set_property(CORRELATION_KEY_PROPERTY, key.as_str());
}

/// Errors reported by a [`Redeliverer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryError {
    /// The routing engine refused the exchange.
    #[error("Redelivery rejected: {0}")]
    Rejected(String),

    /// The routing engine is not accepting work.
    #[error("Routing engine unavailable: {0}")]
    Unavailable(String),
}

/// Resubmits recovered exchanges to the routing engine.
///
/// Successful reprocessing is acknowledged separately, by the engine calling
/// `confirm` on the repository.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so that the repository can hold
/// an `Arc<dyn Redeliverer>`.
pub trait Redeliverer: Send + Sync {
    /// Hand a recovered exchange back for processing.
    ///
    /// # Errors
    ///
    /// Returns [`RedeliveryError`] if the exchange could not be submitted.
    fn redeliver(
        &self,
        key: CorrelationKey,
        exchange: Exchange,
    ) -> Pin<Box<dyn Future<Output = Result<(), RedeliveryError>> + Send + '_>>;
}
