//! # Recoverable Aggregation Testing
//!
//! Testing utilities for the recoverable aggregation repository.
//!
//! This crate provides:
//! - [`InMemoryAggregationStore`] with fault injection
//! - Recording implementations of the routing-engine collaborators
//! - Deterministic clocks
//! - proptest strategies for keys and exchanges
//!
//! ## Example
//!
//! ```ignore
//! use recoverable_aggregation_testing::{InMemoryAggregationStore, RecordingDeadLetters};
//! use recoverable_aggregation_runtime::RecoverableAggregationRepository;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_escalation() {
//!     let store = InMemoryAggregationStore::new();
//!     let dlq = Arc::new(RecordingDeadLetters::new());
//!     let repository = RecoverableAggregationRepository::builder(store.clone())
//!         .config(config)
//!         .dead_letter_forwarder(dlq.clone())
//!         .build();
//!
//!     repository.start().await.unwrap();
//!     // ...
//!     assert_eq!(dlq.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use recoverable_aggregation_core::environment::Clock;

pub mod store_mocks;

/// Mock implementations for testing.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)]

    use super::{Clock, DateTime, Utc};
    use recoverable_aggregation_core::dead_letter::{
        DeadLetter, DeadLetterError, DeadLetterForwarder,
    };
    use recoverable_aggregation_core::exchange::Exchange;
    use recoverable_aggregation_core::key::CorrelationKey;
    use recoverable_aggregation_core::lifecycle::{RouteError, RouteLifecycleReporter};
    use recoverable_aggregation_core::redelivery::{RedeliveryError, Redeliverer};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use recoverable_aggregation_testing::mocks::FixedClock;
    /// use recoverable_aggregation_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Redeliverer that records every exchange handed to it.
    ///
    /// Optionally delays each redelivery or rejects it.
    #[derive(Debug, Default)]
    pub struct RecordingRedeliverer {
        delivered: Mutex<Vec<(CorrelationKey, Exchange)>>,
        delay: Option<Duration>,
        reject: bool,
    }

    impl RecordingRedeliverer {
        /// Accept every redelivery immediately
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Hold each redelivery for `delay` before accepting it
        #[must_use]
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        /// Record and then reject every redelivery
        #[must_use]
        pub fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::default()
            }
        }

        /// Everything redelivered so far, in order
        #[must_use]
        pub fn delivered(&self) -> Vec<(CorrelationKey, Exchange)> {
            self.delivered.lock().unwrap().clone()
        }

        /// Redeliveries of `key` so far
        #[must_use]
        pub fn count_for(&self, key: &CorrelationKey) -> usize {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .filter(|(delivered, _)| delivered == key)
                .count()
        }

        /// Total redeliveries so far
        #[must_use]
        pub fn len(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }

        /// Whether nothing was redelivered
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.delivered.lock().unwrap().is_empty()
        }
    }

    impl Redeliverer for RecordingRedeliverer {
        fn redeliver(
            &self,
            key: CorrelationKey,
            exchange: Exchange,
        ) -> Pin<Box<dyn Future<Output = Result<(), RedeliveryError>> + Send + '_>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.delivered.lock().unwrap().push((key, exchange));
                if self.reject {
                    return Err(RedeliveryError::Rejected("recording redeliverer rejects".to_string()));
                }
                Ok(())
            })
        }
    }

    /// Dead letter sink that records every letter.
    ///
    /// Can be told to fail the next `n` forwards.
    #[derive(Debug, Default)]
    pub struct RecordingDeadLetters {
        letters: Mutex<Vec<DeadLetter>>,
        failures_left: AtomicU32,
    }

    impl RecordingDeadLetters {
        /// Accept every letter
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `count` forwards with [`DeadLetterError::Unreachable`]
        pub fn fail_next(&self, count: u32) {
            self.failures_left.store(count, Ordering::SeqCst);
        }

        /// Letters accepted so far, in order
        #[must_use]
        pub fn letters(&self) -> Vec<DeadLetter> {
            self.letters.lock().unwrap().clone()
        }

        /// Number of accepted letters
        #[must_use]
        pub fn len(&self) -> usize {
            self.letters.lock().unwrap().len()
        }

        /// Whether no letter was accepted
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.letters.lock().unwrap().is_empty()
        }
    }

    impl DeadLetterForwarder for RecordingDeadLetters {
        fn forward(
            &self,
            letter: DeadLetter,
        ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
            Box::pin(async move {
                let failing = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(DeadLetterError::Unreachable {
                        uri: letter.uri,
                        reason: "injected failure".to_string(),
                    });
                }
                self.letters.lock().unwrap().push(letter);
                Ok(())
            })
        }
    }

    /// Lifecycle reporter that records every report.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingLifecycleReporter {
        reports: Arc<Mutex<Vec<(String, RouteError)>>>,
    }

    impl RecordingLifecycleReporter {
        /// Start with no reports
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reports received so far as `(component, error)`
        #[must_use]
        pub fn reports(&self) -> Vec<(String, RouteError)> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl RouteLifecycleReporter for RecordingLifecycleReporter {
        fn report(&self, component: &str, error: RouteError) {
            self.reports
                .lock()
                .unwrap()
                .push((component.to_string(), error));
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use recoverable_aggregation_core::exchange::Exchange;

    /// Install a `tracing` subscriber that honours `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A partially aggregated exchange with a text body and one header.
    #[must_use]
    pub fn aggregate(id: &str, body: &str) -> Exchange {
        Exchange::new(id)
            .with_header("aggregated", true)
            .with_body(body)
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use recoverable_aggregation_core::exchange::{Exchange, Value};
    use recoverable_aggregation_core::key::CorrelationKey;

    /// Non-empty correlation keys drawn from a small alphabet, so collisions happen.
    pub fn correlation_key() -> impl Strategy<Value = CorrelationKey> {
        "[a-d]{1,2}".prop_map(CorrelationKey::new)
    }

    /// Primitive header/property/body values.
    pub fn primitive_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z ]{0,12}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    /// Exchanges with primitive headers, properties and body.
    pub fn exchange() -> impl Strategy<Value = Exchange> {
        (
            "[a-z0-9]{1,8}",
            proptest::collection::btree_map("[a-z]{1,6}", primitive_value(), 0..4),
            proptest::collection::hash_map("[a-z]{1,6}", primitive_value(), 0..4),
            primitive_value(),
        )
            .prop_map(|(id, headers, properties, body)| Exchange {
                id,
                headers,
                properties,
                body,
                exception: None,
            })
    }
}

// Re-export commonly used items
pub use mocks::{
    FixedClock, RecordingDeadLetters, RecordingLifecycleReporter, RecordingRedeliverer,
    test_clock,
};
pub use store_mocks::{InMemoryAggregationStore, StoreCalls, StoreOp};
