//! In-memory aggregation store for tests
//!
//! Provides fast, deterministic storage that still exercises the binary codec:
//! every snapshot is encoded on `put` and decoded on `get`, the way a
//! distributed cache would hold it.
//!
//! Faults can be injected per operation and key to test error propagation.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use recoverable_aggregation_core::key::CorrelationKey;
use recoverable_aggregation_core::snapshot::ExchangeSnapshot;
use recoverable_aggregation_core::store::{AggregationStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Store operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `put`
    Put,
    /// `get`
    Get,
    /// `remove`
    Remove,
}

/// Number of store calls made, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    /// `put` calls
    pub puts: usize,
    /// `get` calls
    pub gets: usize,
    /// `remove` calls
    pub removes: usize,
    /// `keys` calls
    pub keys: usize,
}

impl StoreCalls {
    /// Calls across all operations
    #[must_use]
    pub const fn total(&self) -> usize {
        self.puts + self.gets + self.removes + self.keys
    }
}

#[derive(Debug, Default)]
struct Faults {
    per_key: HashSet<(StoreOp, CorrelationKey)>,
    unavailable: bool,
    phantom_keys: HashSet<CorrelationKey>,
}

/// In-memory aggregation store.
///
/// # Example
///
/// ```
/// use recoverable_aggregation_testing::InMemoryAggregationStore;
/// use recoverable_aggregation_core::store::AggregationStore;
/// use recoverable_aggregation_core::snapshot::ExchangeSnapshot;
/// use recoverable_aggregation_core::{CorrelationKey, Exchange};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryAggregationStore::new();
/// let key = CorrelationKey::new("order-1");
///
/// let snapshot = ExchangeSnapshot::marshal(&Exchange::new("ex-1"), false)?;
/// assert!(store.put(&key, snapshot).await?.is_none());
/// assert!(store.contains_key(&key));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryAggregationStore {
    data: Arc<RwLock<HashMap<CorrelationKey, Vec<u8>>>>,
    faults: Arc<RwLock<Faults>>,
    calls: Arc<Mutex<StoreCalls>>,
}

impl InMemoryAggregationStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all entries and faults (for test isolation)
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
        *self.faults.write().unwrap() = Faults::default();
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key is stored
    #[must_use]
    pub fn contains_key(&self, key: &CorrelationKey) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// Raw encoded bytes stored under `key`
    #[must_use]
    pub fn raw(&self, key: &CorrelationKey) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    /// Store raw bytes, bypassing the codec
    ///
    /// Useful for simulating state left behind by another node, or corrupt entries.
    pub fn insert_raw(&self, key: CorrelationKey, bytes: Vec<u8>) {
        self.data.write().unwrap().insert(key, bytes);
    }

    /// Make `op` fail for `key` until [`heal`](Self::heal) is called
    pub fn fail_on(&self, op: StoreOp, key: &CorrelationKey) {
        self.faults
            .write()
            .unwrap()
            .per_key
            .insert((op, key.clone()));
    }

    /// Make every operation fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unwrap().unavailable = unavailable;
    }

    /// Report `key` from `keys()` even though nothing is stored under it
    ///
    /// Simulates an entry removed between a scan and the following read.
    pub fn add_phantom_key(&self, key: CorrelationKey) {
        self.faults.write().unwrap().phantom_keys.insert(key);
    }

    /// Store calls made since creation or the last [`reset_calls`](Self::reset_calls)
    #[must_use]
    pub fn calls(&self) -> StoreCalls {
        *self.calls.lock().unwrap()
    }

    /// Start counting store calls from zero
    pub fn reset_calls(&self) {
        *self.calls.lock().unwrap() = StoreCalls::default();
    }

    fn count(&self, bump: impl FnOnce(&mut StoreCalls)) {
        bump(&mut self.calls.lock().unwrap());
    }

    /// Remove all injected faults
    pub fn heal(&self) {
        *self.faults.write().unwrap() = Faults::default();
    }

    fn check(&self, op: StoreOp, key: &CorrelationKey) -> Result<(), StoreError> {
        let faults = self.faults.read().unwrap();
        if faults.unavailable {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        if faults.per_key.contains(&(op, key.clone())) {
            return Err(StoreError::Backend(format!("injected {op:?} failure for {key}")));
        }
        Ok(())
    }

    fn decode(bytes: Option<Vec<u8>>) -> Result<Option<ExchangeSnapshot>, StoreError> {
        bytes
            .map(|bytes| ExchangeSnapshot::decode(&bytes))
            .transpose()
            .map_err(StoreError::from)
    }
}

impl AggregationStore for InMemoryAggregationStore {
    async fn put(
        &self,
        key: &CorrelationKey,
        snapshot: ExchangeSnapshot,
    ) -> Result<Option<ExchangeSnapshot>, StoreError> {
        self.count(|calls| calls.puts += 1);
        self.check(StoreOp::Put, key)?;
        let bytes = snapshot.encode()?;
        let previous = self.data.write().unwrap().insert(key.clone(), bytes);
        Self::decode(previous)
    }

    async fn get(&self, key: &CorrelationKey) -> Result<Option<ExchangeSnapshot>, StoreError> {
        self.count(|calls| calls.gets += 1);
        self.check(StoreOp::Get, key)?;
        let bytes = self.data.read().unwrap().get(key).cloned();
        Self::decode(bytes)
    }

    async fn remove(&self, key: &CorrelationKey) -> Result<(), StoreError> {
        self.count(|calls| calls.removes += 1);
        self.check(StoreOp::Remove, key)?;
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<CorrelationKey>, StoreError> {
        self.count(|calls| calls.keys += 1);
        let faults = self.faults.read().unwrap();
        if faults.unavailable {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        let mut keys: HashSet<CorrelationKey> = self.data.read().unwrap().keys().cloned().collect();
        keys.extend(faults.phantom_keys.iter().cloned());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recoverable_aggregation_core::exchange::Exchange;

    fn snapshot(id: &str) -> ExchangeSnapshot {
        ExchangeSnapshot::marshal(&Exchange::new(id).with_body("payload"), false).unwrap()
    }

    #[tokio::test]
    async fn put_returns_previous_snapshot() {
        let store = InMemoryAggregationStore::new();
        let key = CorrelationKey::new("k");

        assert!(store.put(&key, snapshot("a")).await.unwrap().is_none());
        let previous = store.put(&key, snapshot("b")).await.unwrap().unwrap();
        assert_eq!(previous.id, "a");
        assert_eq!(store.get(&key).await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = InMemoryAggregationStore::new();
        let key = CorrelationKey::new("k");
        store.put(&key, snapshot("a")).await.unwrap();

        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_faults_fail_only_their_key() {
        let store = InMemoryAggregationStore::new();
        let bad = CorrelationKey::new("bad");
        let good = CorrelationKey::new("good");
        store.fail_on(StoreOp::Get, &bad);

        assert!(store.get(&bad).await.is_err());
        assert!(store.get(&good).await.unwrap().is_none());

        store.heal();
        assert!(store.get(&bad).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_bytes_surface_as_serialization_errors() {
        let store = InMemoryAggregationStore::new();
        let key = CorrelationKey::new("k");
        store.insert_raw(key.clone(), vec![0xff, 0x00, 0x13]);

        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn counts_calls_per_operation() {
        let store = InMemoryAggregationStore::new();
        let key = CorrelationKey::new("k");
        store.put(&key, snapshot("a")).await.unwrap();
        store.get(&key).await.unwrap();
        store.get(&key).await.unwrap();
        store.keys().await.unwrap();

        assert_eq!(
            store.calls(),
            StoreCalls { puts: 1, gets: 2, removes: 0, keys: 1 }
        );

        store.reset_calls();
        store.remove(&key).await.unwrap();
        assert_eq!(store.calls().total(), 1);
    }

    #[tokio::test]
    async fn phantom_keys_are_listed_but_not_stored() {
        let store = InMemoryAggregationStore::new();
        let ghost = CorrelationKey::new("ghost");
        store.add_phantom_key(ghost.clone());

        assert!(store.keys().await.unwrap().contains(&ghost));
        assert!(store.get(&ghost).await.unwrap().is_none());
    }
}
