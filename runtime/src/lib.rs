//! # Recoverable Aggregation Runtime
//!
//! Runtime implementation of the recoverable aggregation repository.
//!
//! ## Core Components
//!
//! - **`RecoverableAggregationRepository`**: add/get/remove/confirm over an
//!   [`AggregationStore`](recoverable_aggregation_core::store::AggregationStore)
//! - **`RecoveryScheduler`**: fires recovery passes at a fixed interval
//! - **Metrics**: Prometheus counters for operations and recovery
//!
//! ## Example
//!
//! ```ignore
//! use recoverable_aggregation_runtime::RecoverableAggregationRepository;
//! use recoverable_aggregation_core::{CorrelationKey, Exchange, RepositoryConfig};
//!
//! let repository = RecoverableAggregationRepository::builder(store)
//!     .config(RepositoryConfig::new("orders").with_maximum_redeliveries(3))
//!     .redeliverer(Arc::new(engine))
//!     .build();
//!
//! repository.start().await?;
//!
//! let key = CorrelationKey::new("order-7");
//! repository.add(&key, &Exchange::new("ex-1")).await?;
//!
//! // Aggregation completed and the outgoing exchange was processed:
//! repository.remove(&key).await?;
//! repository.confirm("ex-1").await?;
//! ```

/// Prometheus metrics for observability
pub mod metrics;

/// Periodic recovery passes
pub mod recovery;

/// The repository itself
pub mod repository;

/// Error types for repository operations
pub mod error {
    use recoverable_aggregation_core::config::ConfigError;
    use recoverable_aggregation_core::dead_letter::DeadLetterError;
    use recoverable_aggregation_core::snapshot::SnapshotError;
    use recoverable_aggregation_core::store::StoreError;
    use thiserror::Error;

    /// Errors that can occur during repository operations
    #[derive(Error, Debug)]
    pub enum RepositoryError {
        /// The configuration was rejected at start
        #[error(transparent)]
        Config(#[from] ConfigError),

        /// The backing store failed
        ///
        /// Store errors are never swallowed; the caller decides whether to retry.
        #[error(transparent)]
        Store(#[from] StoreError),

        /// The exchange could not be captured for storage
        #[error(transparent)]
        Serialization(#[from] SnapshotError),

        /// Forwarding to the dead letter sink failed
        ///
        /// The key stays stored and is escalated again on the next pass.
        #[error(transparent)]
        DeadLetter(#[from] DeadLetterError),

        /// The repository has not been started, or has been stopped
        #[error("Aggregation repository is not running")]
        NotRunning,

        /// Shutdown timed out waiting for redeliveries to complete
        #[error("Shutdown timed out with {0} redeliveries still running")]
        ShutdownTimeout(usize),

        /// The recovery scheduler task panicked or was cancelled
        #[error("Recovery scheduler failed: {0}")]
        SchedulerJoin(String),
    }
}

pub use error::RepositoryError;
pub use recovery::{KeyOutcome, RecoveryReport, RecoveryScheduler};
pub use repository::{RecoverableAggregationRepository, RepositoryBuilder};
