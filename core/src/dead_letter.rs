//! Dead letter escalation.
//!
//! Exchanges that exhaust their redelivery budget are wrapped in a
//! [`DeadLetter`] and handed to a [`DeadLetterForwarder`]. The wire format of the
//! forward belongs to the routing engine behind the forwarder.

use crate::exchange::Exchange;
use crate::key::CorrelationKey;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a [`DeadLetterForwarder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The sink could not be reached.
    #[error("Dead letter sink {uri} unreachable: {reason}")]
    Unreachable {
        /// Address of the sink
        uri: String,
        /// Failure description
        reason: String,
    },

    /// The sink refused the exchange.
    #[error("Dead letter rejected: {0}")]
    Rejected(String),
}

/// An exchange that exhausted its redelivery budget.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Address of the sink
    pub uri: String,

    /// Correlation key the exchange was stored under
    pub key: CorrelationKey,

    /// The exhausted exchange
    pub exchange: Exchange,

    /// Recovery passes that observed the key
    pub attempts: u32,

    /// When escalation happened
    pub escalated_at: DateTime<Utc>,
}

/// Sink for exhausted exchanges.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the repository can hold an
/// `Arc<dyn DeadLetterForwarder>`.
pub trait DeadLetterForwarder: Send + Sync {
    /// Forward one dead letter.
    ///
    /// The repository removes the key from the store only after this succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the letter was not accepted.
    fn forward(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_error_names_uri() {
        let error = DeadLetterError::Unreachable {
            uri: "queue:dlq".to_string(),
            reason: "connection refused".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("queue:dlq"));
        assert!(display.contains("connection refused"));
    }
}
