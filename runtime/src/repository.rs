//! The recoverable aggregation repository.
//!
//! [`RecoverableAggregationRepository`] wraps an [`AggregationStore`] with
//! correlation semantics and the recovery protocol. It is cheap to clone; all
//! clones share the same store, bookkeeping, and scheduler.
//!
//! # Lifecycle
//!
//! ```text
//! build() ──▶ start() ──▶ running ──▶ stop()
//!               │ invalid config
//!               ▼
//!         ConfigError (reported to the lifecycle reporter)
//! ```
//!
//! Every operation requires a running repository.

use crate::error::RepositoryError;
use crate::metrics::{RecoveryMetrics, RepositoryMetrics};
use crate::recovery::{InFlightRedeliveries, KeyOutcome, RecoveryReport, RecoveryScheduler};
use recoverable_aggregation_core::config::{ConfigError, RecoveryPolicy, RepositoryConfig};
use recoverable_aggregation_core::dead_letter::{DeadLetter, DeadLetterForwarder};
use recoverable_aggregation_core::environment::{Clock, SystemClock};
use recoverable_aggregation_core::exchange::Exchange;
use recoverable_aggregation_core::key::CorrelationKey;
use recoverable_aggregation_core::lifecycle::{
    HealthCheck, Phase, RouteError, RouteLifecycleReporter, TracingLifecycleReporter,
};
use recoverable_aggregation_core::redelivery::{
    RecoveryState, RedeliveryRecord, Redeliverer, tag_redelivery,
};
use recoverable_aggregation_core::snapshot::ExchangeSnapshot;
use recoverable_aggregation_core::store::AggregationStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Completed exchange ids remembered so a late `confirm` needs no store lookup.
const COMPLETED_CAPACITY: usize = 1024;

/// Exchange id ↔ correlation key index for `confirm`, filled by `add`.
///
/// Entries are hints: the store may have changed behind them, so a hit must be
/// checked against the stored snapshot before it is acted on.
#[derive(Debug, Default)]
struct ExchangeIndex {
    by_id: HashMap<String, CorrelationKey>,
    by_key: HashMap<CorrelationKey, String>,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
}

impl ExchangeIndex {
    fn insert(&mut self, key: &CorrelationKey, exchange_id: &str) {
        if let Some(previous) = self.by_key.insert(key.clone(), exchange_id.to_string()) {
            if previous != exchange_id && self.by_id.get(&previous) == Some(key) {
                self.by_id.remove(&previous);
            }
        }
        self.by_id.insert(exchange_id.to_string(), key.clone());
        if self.completed.remove(exchange_id) {
            self.completed_order.retain(|id| id != exchange_id);
        }
    }

    fn key_for(&self, exchange_id: &str) -> Option<CorrelationKey> {
        self.by_id.get(exchange_id).cloned()
    }

    fn is_completed(&self, exchange_id: &str) -> bool {
        self.completed.contains(exchange_id)
    }

    /// Drop the entry for `key`, remembering its exchange as completed.
    fn forget(&mut self, key: &CorrelationKey) {
        if let Some(id) = self.by_key.remove(key) {
            if self.by_id.get(&id) == Some(key) {
                self.by_id.remove(&id);
            }
            self.complete(id);
        }
    }

    /// Drop an id whose key now holds a different exchange.
    fn forget_id(&mut self, exchange_id: &str) {
        if let Some(key) = self.by_id.remove(exchange_id) {
            if self.by_key.get(&key).map(String::as_str) == Some(exchange_id) {
                self.by_key.remove(&key);
            }
        }
    }

    /// Keep only entries whose key is still stored.
    fn retain_keys(&mut self, stored: &HashSet<CorrelationKey>) {
        let gone: Vec<CorrelationKey> = self
            .by_key
            .keys()
            .filter(|key| !stored.contains(*key))
            .cloned()
            .collect();
        for key in &gone {
            self.forget(key);
        }
    }

    fn complete(&mut self, exchange_id: String) {
        if !self.completed.insert(exchange_id.clone()) {
            return;
        }
        self.completed_order.push_back(exchange_id);
        while self.completed_order.len() > COMPLETED_CAPACITY {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

struct Inner<S> {
    store: S,
    config: RepositoryConfig,
    policy: OnceLock<RecoveryPolicy>,
    running: AtomicBool,
    records: Mutex<HashMap<CorrelationKey, RedeliveryRecord>>,
    index: Mutex<ExchangeIndex>,
    redeliverer: Option<Arc<dyn Redeliverer>>,
    dead_letters: Option<Arc<dyn DeadLetterForwarder>>,
    reporter: Arc<dyn RouteLifecycleReporter>,
    clock: Arc<dyn Clock>,
    in_flight: InFlightRedeliveries,
    dead_lettered: AtomicU64,
    last_error: Mutex<Option<RouteError>>,
    scheduler: tokio::sync::Mutex<Option<RecoveryScheduler>>,
    pass_lock: tokio::sync::Mutex<()>,
}

/// Builder for [`RecoverableAggregationRepository`].
///
/// # Example
///
/// ```ignore
/// let repository = RecoverableAggregationRepository::builder(store)
///     .config(RepositoryConfig::new("orders").with_dead_letter_uri("queue:orders.dlq"))
///     .redeliverer(Arc::new(engine))
///     .dead_letter_forwarder(Arc::new(dlq))
///     .build();
///
/// repository.start().await?;
/// ```
pub struct RepositoryBuilder<S> {
    store: S,
    config: RepositoryConfig,
    redeliverer: Option<Arc<dyn Redeliverer>>,
    dead_letters: Option<Arc<dyn DeadLetterForwarder>>,
    reporter: Arc<dyn RouteLifecycleReporter>,
    clock: Arc<dyn Clock>,
}

impl<S> RepositoryBuilder<S>
where
    S: AggregationStore + 'static,
{
    /// Use this configuration (defaults otherwise).
    #[must_use]
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Where recovered exchanges are resubmitted.
    #[must_use]
    pub fn redeliverer(mut self, redeliverer: Arc<dyn Redeliverer>) -> Self {
        self.redeliverer = Some(redeliverer);
        self
    }

    /// Where exhausted exchanges are forwarded.
    #[must_use]
    pub fn dead_letter_forwarder(mut self, forwarder: Arc<dyn DeadLetterForwarder>) -> Self {
        self.dead_letters = Some(forwarder);
        self
    }

    /// Who hears about lifecycle errors (logs only by default).
    #[must_use]
    pub fn lifecycle_reporter(mut self, reporter: Arc<dyn RouteLifecycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Time source for redelivery records.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a stopped repository.
    #[must_use]
    pub fn build(self) -> RecoverableAggregationRepository<S> {
        RecoverableAggregationRepository {
            inner: Arc::new(Inner {
                store: self.store,
                config: self.config,
                policy: OnceLock::new(),
                running: AtomicBool::new(false),
                records: Mutex::new(HashMap::new()),
                index: Mutex::new(ExchangeIndex::default()),
                redeliverer: self.redeliverer,
                dead_letters: self.dead_letters,
                reporter: self.reporter,
                clock: self.clock,
                in_flight: InFlightRedeliveries::default(),
                dead_lettered: AtomicU64::new(0),
                last_error: Mutex::new(None),
                scheduler: tokio::sync::Mutex::new(None),
                pass_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Durable, crash-tolerant store of in-flight aggregation state.
///
/// # Concurrency
///
/// All operations may be called concurrently. Same-key linearizability comes
/// from the store's atomic `put`/`remove`; the repository adds no locking of
/// its own around store calls.
pub struct RecoverableAggregationRepository<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for RecoverableAggregationRepository<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> RecoverableAggregationRepository<S>
where
    S: AggregationStore + 'static,
{
    /// Start building a repository over `store`.
    #[must_use]
    pub fn builder(store: S) -> RepositoryBuilder<S> {
        RepositoryBuilder {
            store,
            config: RepositoryConfig::default(),
            redeliverer: None,
            dead_letters: None,
            reporter: Arc::new(TracingLifecycleReporter),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a repository with the given configuration and no collaborators.
    #[must_use]
    pub fn new(store: S, config: RepositoryConfig) -> Self {
        Self::builder(store).config(config).build()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Validate the configuration and begin accepting operations.
    ///
    /// Spawns the recovery scheduler when recovery is enabled with a non-zero
    /// interval. Calling `start` on a running repository does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Config`] if the configuration is invalid. The
    /// failure is also reported to the lifecycle reporter as an unhealthy
    /// [`Phase::Start`] error.
    pub async fn start(&self) -> Result<(), RepositoryError> {
        let mut scheduler = self.inner.scheduler.lock().await;
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let policy = match self.validate() {
            Ok(policy) => policy,
            Err(error) => {
                self.inner.report(RouteError::new(Phase::Start, error.clone(), true));
                return Err(error.into());
            }
        };

        let policy = self.inner.policy.get_or_init(|| policy).clone();
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.running.store(true, Ordering::Release);

        if policy.schedules_passes() {
            let weak = Arc::downgrade(&self.inner);
            *scheduler = Some(RecoveryScheduler::spawn(policy.interval, move || {
                scheduled_pass(Weak::clone(&weak))
            }));
        }

        tracing::info!(
            cache_name = %self.inner.config.cache_name,
            use_recovery = policy.use_recovery,
            recovery_interval_ms = policy.interval.as_millis(),
            maximum_redeliveries = policy.maximum_redeliveries,
            dead_letter_uri = policy.dead_letter_uri.as_deref().unwrap_or("<none>"),
            "Aggregation repository started"
        );
        Ok(())
    }

    /// Stop accepting operations and stop the recovery scheduler.
    ///
    /// An active recovery pass is allowed to finish; redelivery dispatches
    /// still running are awaited up to the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::ShutdownTimeout`] if redeliveries were still running
    ///   when the timeout elapsed (reported as a [`Phase::Stop`] error)
    /// - [`RepositoryError::SchedulerJoin`] if the scheduler task panicked
    ///   (reported as a [`Phase::Stop`] error; redeliveries are still drained)
    pub async fn stop(&self) -> Result<(), RepositoryError> {
        let mut scheduler = self.inner.scheduler.lock().await;
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!(cache_name = %self.inner.config.cache_name, "Stopping aggregation repository");

        let mut scheduler_failure = None;
        if let Some(active) = scheduler.take() {
            if let Err(error) = active.stop().await {
                tracing::error!(error = %error, "Recovery scheduler task failed");
                let message = error.to_string();
                self.inner.report(RouteError::new(
                    Phase::Stop,
                    RepositoryError::SchedulerJoin(message.clone()),
                    false,
                ));
                scheduler_failure = Some(message);
            }
        }
        drop(scheduler);

        let timeout = self
            .inner
            .policy
            .get()
            .map_or(Duration::ZERO, |policy| policy.shutdown_timeout);
        let started = Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let pending = self.inner.in_flight.load();
            if pending == 0 {
                if let Some(message) = scheduler_failure {
                    return Err(RepositoryError::SchedulerJoin(message));
                }
                tracing::info!("Aggregation repository stopped");
                return Ok(());
            }

            if started.elapsed() >= timeout {
                tracing::error!(
                    pending_redeliveries = pending,
                    "Shutdown timeout: {} redeliveries still running",
                    pending
                );
                self.inner.report(RouteError::new(
                    Phase::Stop,
                    RepositoryError::ShutdownTimeout(pending),
                    false,
                ));
                return Err(RepositoryError::ShutdownTimeout(pending));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Whether the repository accepts operations.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Current health.
    ///
    /// - unhealthy when the last lifecycle change failed unhealthily
    /// - degraded when exhausted keys are waiting for the dead letter sink
    /// - healthy otherwise
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let component = self.inner.config.cache_name.clone();
        let (tracked, exhausted) = {
            let records = self
                .inner
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let maximum = self
                .inner
                .policy
                .get()
                .map_or(u32::MAX, |policy| policy.maximum_redeliveries);
            let exhausted = records
                .values()
                .filter(|record| record.is_exhausted(maximum))
                .count();
            (records.len(), exhausted)
        };

        let last_error = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let check = match last_error {
            Some(error) if error.is_unhealthy() => {
                HealthCheck::unhealthy(component.clone(), error.to_string())
            }
            _ if exhausted > 0 => HealthCheck::degraded(
                component.clone(),
                format!("{exhausted} exhausted aggregates awaiting dead letter forwarding"),
            ),
            _ if !self.is_running() => HealthCheck::degraded(component.clone(), "not running"),
            _ => HealthCheck::healthy(component.clone()),
        };

        check
            .with_metadata("cache_name", component)
            .with_metadata("tracked_keys", tracked.to_string())
            .with_metadata(
                "dead_lettered",
                self.inner.dead_lettered.load(Ordering::Relaxed).to_string(),
            )
    }

    fn validate(&self) -> Result<RecoveryPolicy, ConfigError> {
        let policy = self.inner.config.validate()?;
        if let Some(uri) = &policy.dead_letter_uri {
            if policy.use_recovery && self.inner.dead_letters.is_none() {
                return Err(ConfigError::MissingDeadLetterForwarder(uri.clone()));
            }
        }
        Ok(policy)
    }

    fn running_policy(&self) -> Result<&RecoveryPolicy, RepositoryError> {
        self.inner.running_policy()
    }

    // ------------------------------------------------------------------
    // Aggregation operations
    // ------------------------------------------------------------------

    /// Store `exchange` under `key`, returning the exchange it replaced.
    ///
    /// Recovery bookkeeping is not touched.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::Serialization`] if the exchange cannot be captured
    /// - [`RepositoryError::Store`] if the store fails
    /// - [`RepositoryError::NotRunning`] if the repository is not running
    pub async fn add(
        &self,
        key: &CorrelationKey,
        exchange: &Exchange,
    ) -> Result<Option<Exchange>, RepositoryError> {
        let policy = self.running_policy()?;
        tracing::trace!(key = %key, exchange_id = %exchange.id, "Adding exchange");

        let snapshot = ExchangeSnapshot::marshal(exchange, policy.allow_serialized_headers)?;
        let previous = self.inner.store.put(key, snapshot).await?;

        self.inner
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, &exchange.id);
        RepositoryMetrics::record_add();

        Ok(previous.map(ExchangeSnapshot::into_exchange))
    }

    /// The exchange currently stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn get(&self, key: &CorrelationKey) -> Result<Option<Exchange>, RepositoryError> {
        self.running_policy()?;
        let snapshot = self.inner.store.get(key).await?;
        Ok(snapshot.map(ExchangeSnapshot::into_exchange))
    }

    /// Delete whatever is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn remove(&self, key: &CorrelationKey) -> Result<(), RepositoryError> {
        self.running_policy()?;
        tracing::trace!(key = %key, "Removing aggregate");

        self.inner.store.remove(key).await?;
        self.inner.forget(key, RecoveryState::Confirmed);
        RepositoryMetrics::record_remove();
        Ok(())
    }

    /// Acknowledge successful processing of the exchange with `exchange_id`.
    ///
    /// Removes the key the exchange is stored under. The key is resolved from
    /// exchanges added through this repository, then by treating the id as a
    /// key, and finally by scanning stored snapshots. Confirming an id that is
    /// no longer stored is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn confirm(&self, exchange_id: &str) -> Result<(), RepositoryError> {
        self.running_policy()?;
        tracing::trace!(exchange_id, "Confirming exchange");

        let Some(key) = self.resolve_key(exchange_id).await? else {
            tracing::trace!(exchange_id, "Nothing stored for confirmed exchange");
            return Ok(());
        };

        self.inner.store.remove(&key).await?;
        self.inner.forget(&key, RecoveryState::Confirmed);
        RepositoryMetrics::record_confirm();
        Ok(())
    }

    async fn resolve_key(&self, exchange_id: &str) -> Result<Option<CorrelationKey>, RepositoryError> {
        let indexed = self.inner.lock_index().key_for(exchange_id);
        if let Some(key) = indexed {
            match self.inner.store.get(&key).await? {
                Some(snapshot) if snapshot.id == exchange_id => return Ok(Some(key)),
                Some(_) => {
                    // Another writer replaced the exchange under this key.
                    tracing::trace!(exchange_id, key = %key, "Dropping stale index entry");
                    self.inner.lock_index().forget_id(exchange_id);
                }
                None => {
                    self.inner.forget(&key, RecoveryState::Confirmed);
                    return Ok(None);
                }
            }
        } else if self.inner.lock_index().is_completed(exchange_id) {
            return Ok(None);
        }

        let as_key = CorrelationKey::new(exchange_id);
        if self.inner.store.get(&as_key).await?.is_some() {
            return Ok(Some(as_key));
        }

        for key in self.inner.store.keys().await? {
            if let Some(snapshot) = self.inner.store.get(&key).await? {
                if snapshot.id == exchange_id {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    /// Every in-flight correlation key.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn get_keys(&self) -> Result<HashSet<CorrelationKey>, RepositoryError> {
        self.running_policy()?;
        Ok(self.inner.store.keys().await?)
    }

    /// Keys a recovery pass should consider; the same set as [`get_keys`](Self::get_keys).
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn scan(&self) -> Result<HashSet<CorrelationKey>, RepositoryError> {
        self.running_policy()?;
        self.inner.scan().await
    }

    /// The stored exchange for `key` if recovery is enabled, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn recover(&self, key: &CorrelationKey) -> Result<Option<Exchange>, RepositoryError> {
        self.running_policy()?;
        self.inner.recover(key).await
    }

    /// Recovery state of `key`, or `None` if nothing is stored under it.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the store fails, or
    /// [`RepositoryError::NotRunning`].
    pub async fn recovery_state(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<RecoveryState>, RepositoryError> {
        self.running_policy()?;
        if self.inner.store.get(key).await?.is_none() {
            return Ok(None);
        }
        let state = self
            .inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(RecoveryState::InFlight, RedeliveryRecord::state);
        Ok(Some(state))
    }

    /// Run one recovery pass now.
    ///
    /// Waits for any pass already running, so passes never overlap.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Store`] if the scan fails (per-key failures are
    /// listed in the report instead), or [`RepositoryError::NotRunning`].
    pub async fn run_recovery_pass(&self) -> Result<RecoveryReport, RepositoryError> {
        self.inner.run_pass().await
    }

    // ------------------------------------------------------------------
    // Configuration getters
    // ------------------------------------------------------------------

    /// Name of the backing store instance.
    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.inner.config.cache_name
    }

    /// Whether recovery is enabled.
    #[must_use]
    pub fn use_recovery(&self) -> bool {
        self.inner.config.use_recovery
    }

    /// Configured recovery interval in milliseconds.
    #[must_use]
    pub fn recovery_interval_millis(&self) -> i64 {
        self.inner.config.recovery_interval_millis
    }

    /// Configured redelivery budget.
    #[must_use]
    pub fn maximum_redeliveries(&self) -> i32 {
        self.inner.config.maximum_redeliveries
    }

    /// Configured dead letter address.
    #[must_use]
    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.inner.config.dead_letter_uri.as_deref()
    }

    /// Whether complex header values are serialized.
    #[must_use]
    pub fn allow_serialized_headers(&self) -> bool {
        self.inner.config.allow_serialized_headers
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }
}

async fn scheduled_pass<S>(inner: Weak<Inner<S>>)
where
    S: AggregationStore + 'static,
{
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Err(error) = inner.run_pass().await {
        tracing::warn!(
            cache_name = %inner.config.cache_name,
            error = %error,
            "Recovery pass failed"
        );
    }
}

impl<S> Inner<S>
where
    S: AggregationStore + 'static,
{
    fn running_policy(&self) -> Result<&RecoveryPolicy, RepositoryError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RepositoryError::NotRunning);
        }
        self.policy.get().ok_or(RepositoryError::NotRunning)
    }

    fn report(&self, error: RouteError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        self.reporter.report(&self.config.cache_name, error);
    }

    fn lock_index(&self) -> MutexGuard<'_, ExchangeIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, key: &CorrelationKey, terminal: RecoveryState) {
        let record = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.lock_index().forget(key);

        if let Some(record) = record {
            tracing::trace!(
                key = %key,
                from = %record.state(),
                to = %terminal,
                "Recovery state transition"
            );
        }
    }

    async fn scan(&self) -> Result<HashSet<CorrelationKey>, RepositoryError> {
        tracing::trace!(cache_name = %self.config.cache_name, "Scanning for exchanges to recover");
        let scanned = self.store.keys().await?;
        tracing::trace!(
            cache_name = %self.config.cache_name,
            count = scanned.len(),
            "Found keys for exchanges to recover"
        );
        Ok(scanned)
    }

    async fn recover(&self, key: &CorrelationKey) -> Result<Option<Exchange>, RepositoryError> {
        tracing::trace!(key = %key, "Recovering exchange");
        if !self.config.use_recovery {
            return Ok(None);
        }
        let snapshot = self.store.get(key).await?;
        Ok(snapshot.map(ExchangeSnapshot::into_exchange))
    }

    #[tracing::instrument(skip(self), name = "recovery_pass", fields(cache_name = %self.config.cache_name))]
    async fn run_pass(&self) -> Result<RecoveryReport, RepositoryError> {
        let policy = self.running_policy()?.clone();
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();

        let keys = self.scan().await?;
        let mut report = RecoveryReport {
            scanned: keys.len(),
            ..RecoveryReport::default()
        };

        if !policy.use_recovery {
            return Ok(report);
        }

        // Records of keys no longer stored were removed behind our back.
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keys.contains(key));
        self.lock_index().retain_keys(&keys);

        for key in keys {
            match self.recover_key(&key, &policy).await {
                Ok(outcome) => report.record(key, outcome),
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "Recovery of key failed");
                    RecoveryMetrics::record_failure();
                    report.record_failure(key);
                }
            }
        }

        RecoveryMetrics::record_pass(started.elapsed());
        tracing::debug!(
            cache_name = %self.config.cache_name,
            scanned = report.scanned,
            redelivered = report.redelivered.len(),
            dead_lettered = report.dead_lettered.len(),
            discarded = report.discarded.len(),
            failed = report.failed.len(),
            "Recovery pass complete"
        );
        Ok(report)
    }

    #[tracing::instrument(skip(self, key, policy), name = "recover_key", fields(key = %key))]
    async fn recover_key(
        &self,
        key: &CorrelationKey,
        policy: &RecoveryPolicy,
    ) -> Result<KeyOutcome, RepositoryError> {
        let now = self.clock.now();
        let (attempts, previous) = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let record = records
                .entry(key.clone())
                .or_insert_with(|| RedeliveryRecord::new(key.clone(), now));
            let previous = record.state();
            (record.observe(now), previous)
        };

        let Some(mut exchange) = self.recover(key).await? else {
            self.forget(key, RecoveryState::Confirmed);
            return Ok(KeyOutcome::Skipped);
        };

        if attempts > policy.maximum_redeliveries {
            return self.escalate(key, exchange, attempts, policy).await;
        }

        tracing::trace!(
            key = %key,
            from = %previous,
            to = %RecoveryState::PendingRedelivery(attempts),
            "Recovery state transition"
        );
        tag_redelivery(&mut exchange, key, attempts, policy.maximum_redeliveries);
        self.dispatch(key.clone(), exchange);
        RecoveryMetrics::record_redelivery();
        Ok(KeyOutcome::Redelivered(attempts))
    }

    fn dispatch(&self, key: CorrelationKey, exchange: Exchange) {
        let Some(redeliverer) = self.redeliverer.as_ref().map(Arc::clone) else {
            tracing::debug!(key = %key, "No redeliverer configured, redelivery counted only");
            return;
        };

        let guard = self.in_flight.track();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = redeliverer.redeliver(key.clone(), exchange).await {
                tracing::warn!(key = %key, error = %error, "Redelivery dispatch failed");
                RecoveryMetrics::record_failure();
            }
        });
    }

    async fn escalate(
        &self,
        key: &CorrelationKey,
        exchange: Exchange,
        attempts: u32,
        policy: &RecoveryPolicy,
    ) -> Result<KeyOutcome, RepositoryError> {
        match (&policy.dead_letter_uri, &self.dead_letters) {
            (Some(uri), Some(forwarder)) => {
                let exchange_id = exchange.id.clone();
                let letter = DeadLetter {
                    uri: uri.clone(),
                    key: key.clone(),
                    exchange,
                    attempts,
                    escalated_at: self.clock.now(),
                };
                forwarder.forward(letter).await?;
                if self.remove_if_current(key, &exchange_id).await? {
                    self.forget(key, RecoveryState::DeadLettered);
                }
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                RecoveryMetrics::record_dead_letter();

                tracing::warn!(
                    key = %key,
                    exchange_id = %exchange_id,
                    attempts,
                    dead_letter_uri = %uri,
                    "Redelivery budget exhausted, exchange moved to dead letter sink"
                );
                Ok(KeyOutcome::DeadLettered)
            }
            _ => {
                if !self.remove_if_current(key, &exchange.id).await? {
                    return Ok(KeyOutcome::Skipped);
                }
                self.forget(key, RecoveryState::DeadLettered);
                RecoveryMetrics::record_discard();

                tracing::error!(
                    key = %key,
                    exchange_id = %exchange.id,
                    attempts,
                    "Redelivery budget exhausted and no dead letter sink configured, exchange discarded"
                );
                Ok(KeyOutcome::Discarded)
            }
        }
    }

    /// Remove `key` only while it still holds `exchange_id`.
    ///
    /// An `add` landing between the check and the remove is still lost; the
    /// store offers no conditional delete.
    async fn remove_if_current(
        &self,
        key: &CorrelationKey,
        exchange_id: &str,
    ) -> Result<bool, RepositoryError> {
        match self.store.get(key).await? {
            Some(snapshot) if snapshot.id == exchange_id => {
                self.store.remove(key).await?;
                Ok(true)
            }
            current => {
                tracing::debug!(
                    key = %key,
                    exchange_id,
                    replaced_by = current.as_ref().map(|snapshot| snapshot.id.as_str()),
                    "Exhausted exchange replaced during escalation, key left in place"
                );
                // The new aggregate starts with a fresh budget.
                self.records
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
                self.lock_index().forget_id(exchange_id);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn index_tracks_latest_exchange_per_key() {
        let mut index = ExchangeIndex::default();
        let key = CorrelationKey::new("order-1");

        index.insert(&key, "ex-1");
        index.insert(&key, "ex-2");

        assert_eq!(index.key_for("ex-1"), None);
        assert_eq!(index.key_for("ex-2"), Some(key.clone()));

        index.forget(&key);
        assert_eq!(index.key_for("ex-2"), None);
        assert!(index.by_key.is_empty());
    }

    #[test]
    fn re_adding_same_exchange_keeps_it_indexed() {
        let mut index = ExchangeIndex::default();
        let key = CorrelationKey::new("order-1");

        index.insert(&key, "ex-1");
        index.insert(&key, "ex-1");

        assert_eq!(index.key_for("ex-1"), Some(key));
    }

    #[test]
    fn forgotten_exchange_is_remembered_as_completed() {
        let mut index = ExchangeIndex::default();
        let key = CorrelationKey::new("order-1");
        index.insert(&key, "ex-1");

        index.forget(&key);
        assert!(index.is_completed("ex-1"));

        // Re-adding the same exchange makes it live again.
        index.insert(&key, "ex-1");
        assert!(!index.is_completed("ex-1"));
        assert_eq!(index.key_for("ex-1"), Some(key));
    }

    #[test]
    fn retain_keys_drops_entries_of_unstored_keys() {
        let mut index = ExchangeIndex::default();
        let gone = CorrelationKey::new("gone");
        let kept = CorrelationKey::new("kept");
        index.insert(&gone, "ex-gone");
        index.insert(&kept, "ex-kept");

        index.retain_keys(&HashSet::from([kept.clone()]));

        assert_eq!(index.key_for("ex-gone"), None);
        assert!(index.is_completed("ex-gone"));
        assert_eq!(index.key_for("ex-kept"), Some(kept));
        assert!(!index.is_completed("ex-kept"));
    }

    #[test]
    fn stale_id_is_dropped_without_touching_newer_entry() {
        let mut index = ExchangeIndex::default();
        let key = CorrelationKey::new("order-1");
        index.insert(&key, "ex-old");

        index.forget_id("ex-old");
        assert_eq!(index.key_for("ex-old"), None);
        assert!(index.by_key.is_empty());
        assert!(!index.is_completed("ex-old"));
    }

    #[test]
    fn completed_ids_are_bounded() {
        let mut index = ExchangeIndex::default();
        for i in 0..=COMPLETED_CAPACITY {
            let key = CorrelationKey::new(format!("k-{i}"));
            index.insert(&key, &format!("ex-{i}"));
            index.forget(&key);
        }

        assert_eq!(index.completed.len(), COMPLETED_CAPACITY);
        assert!(!index.is_completed("ex-0"));
        assert!(index.is_completed(&format!("ex-{COMPLETED_CAPACITY}")));
    }
}
