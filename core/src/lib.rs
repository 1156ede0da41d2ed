//! # Recoverable Aggregation Core
//!
//! Data model and capability traits for a durable, crash-tolerant store of
//! in-flight aggregation state.
//!
//! An aggregator correlates several inbound messages into one composite
//! message. While it does so, partial results live in an
//! [`AggregationStore`](store::AggregationStore) keyed by a
//! [`CorrelationKey`](key::CorrelationKey). If the process dies mid-aggregation
//! the stored state survives and a recovery protocol redelivers it, escalating
//! to a dead letter sink once a redelivery budget is spent.
//!
//! ## Modules
//!
//! - [`exchange`]: live messages and their values
//! - [`snapshot`]: storable captures of exchanges
//! - [`store`]: the key/value capability supplied by the host
//! - [`config`]: repository options and startup validation
//! - [`redelivery`]: per-key bookkeeping and the routing-engine hand-off
//! - [`dead_letter`]: escalation sink
//! - [`lifecycle`]: route lifecycle errors and health checks
//!
//! The repository itself lives in `recoverable-aggregation-runtime`.

pub mod config;
pub mod dead_letter;
pub mod exchange;
pub mod key;
pub mod lifecycle;
pub mod redelivery;
pub mod snapshot;
pub mod store;

pub use chrono::{DateTime, Utc};

/// Environment abstractions
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use config::{ConfigError, RecoveryPolicy, RepositoryConfig};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterForwarder};
pub use exchange::{ComplexValue, Exchange, OpaqueValue, Value};
pub use key::CorrelationKey;
pub use lifecycle::{HealthCheck, HealthStatus, Phase, RouteError, RouteLifecycleReporter};
pub use redelivery::{RecoveryState, RedeliveryError, RedeliveryRecord, Redeliverer};
pub use snapshot::{ExchangeSnapshot, SnapshotError, SnapshotValue};
pub use store::{AggregationStore, StoreError};
