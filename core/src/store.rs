//! Aggregation store capability.
//!
//! The repository does not implement storage itself. It orchestrates access to
//! whatever key/value backend the host supplies (a distributed cache, an
//! embedded store, an in-memory map) through the [`AggregationStore`] trait.
//!
//! # Implementations
//!
//! - `InMemoryAggregationStore` (in `recoverable-aggregation-testing`): fast,
//!   deterministic testing

use crate::key::CorrelationKey;
use crate::snapshot::{ExchangeSnapshot, SnapshotError};
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;

/// Errors reported by an aggregation store backend.
///
/// The repository surfaces these unmodified and never retries them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed the operation.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored entry could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<SnapshotError> for StoreError {
    fn from(error: SnapshotError) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Key/value capability backing the repository.
///
/// # Contract
///
/// - [`put`](AggregationStore::put) is an atomic swap and must be linearizable
///   per key under concurrent callers.
/// - [`remove`](AggregationStore::remove) is idempotent.
/// - [`keys`](AggregationStore::keys) is a point-in-time view and may be stale
///   relative to concurrent writers.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the repository shares one store
/// between every caller and its recovery scheduler.
pub trait AggregationStore: Send + Sync {
    /// Store `snapshot` under `key`, returning the snapshot it replaced.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn put(
        &self,
        key: &CorrelationKey,
        snapshot: ExchangeSnapshot,
    ) -> impl Future<Output = Result<Option<ExchangeSnapshot>, StoreError>> + Send;

    /// Fetch the snapshot stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get(
        &self,
        key: &CorrelationKey,
    ) -> impl Future<Output = Result<Option<ExchangeSnapshot>, StoreError>> + Send;

    /// Delete the snapshot stored under `key`. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn remove(&self, key: &CorrelationKey) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every key currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn keys(&self) -> impl Future<Output = Result<HashSet<CorrelationKey>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_errors_become_serialization_errors() {
        let error: StoreError = SnapshotError::Codec("truncated".to_string()).into();
        assert!(matches!(error, StoreError::Serialization(ref m) if m.contains("truncated")));
    }
}
