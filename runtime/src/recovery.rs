//! Periodic recovery scheduling.
//!
//! The [`RecoveryScheduler`] owns one background task that fires a recovery
//! pass every interval. Passes run inside that task one after another, so a
//! slow pass delays the next tick instead of overlapping with it; ticks missed
//! while a pass runs are skipped. Stopping the scheduler prevents new passes
//! but lets an active one finish.

use crate::metrics::RecoveryMetrics;
use recoverable_aggregation_core::key::CorrelationKey;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

/// What one recovery pass did to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Handed back to the routing engine with this attempt number
    Redelivered(u32),
    /// Forwarded to the dead letter sink and removed
    DeadLettered,
    /// Removed without forwarding because no dead letter sink is configured
    Discarded,
    /// Gone before it could be recovered (confirmed concurrently)
    Skipped,
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Keys returned by the scan
    pub scanned: usize,
    /// Keys handed back for redelivery
    pub redelivered: Vec<CorrelationKey>,
    /// Keys forwarded to the dead letter sink
    pub dead_lettered: Vec<CorrelationKey>,
    /// Keys discarded without a dead letter sink
    pub discarded: Vec<CorrelationKey>,
    /// Keys that disappeared between scan and recover
    pub skipped: usize,
    /// Keys whose recovery failed; retried on the next pass
    pub failed: Vec<CorrelationKey>,
}

impl RecoveryReport {
    pub(crate) fn record(&mut self, key: CorrelationKey, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Redelivered(_) => self.redelivered.push(key),
            KeyOutcome::DeadLettered => self.dead_lettered.push(key),
            KeyOutcome::Discarded => self.discarded.push(key),
            KeyOutcome::Skipped => self.skipped += 1,
        }
    }

    pub(crate) fn record_failure(&mut self, key: CorrelationKey) {
        self.failed.push(key);
    }
}

/// Handle to the background task running recovery passes.
#[derive(Debug)]
pub struct RecoveryScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RecoveryScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    ///
    /// The first pass fires one `interval` after spawning.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero (see [`tokio::time::interval_at`]).
    pub fn spawn<F, Fut>(interval: Duration, mut pass: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::debug!(interval_ms = interval.as_millis(), "Recovery scheduler started");

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        pass().await;
                    }
                }
            }

            tracing::debug!("Recovery scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop scheduling passes and wait for the active pass, if any, to finish.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinError`] if the scheduler task panicked.
    pub async fn stop(self) -> Result<(), JoinError> {
        // The receiver may already be gone if the task ended; nothing to signal then.
        let _ = self.shutdown.send(true);
        self.handle.await
    }
}

/// Counts redelivery dispatches that are still running.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlightRedeliveries {
    count: Arc<AtomicUsize>,
}

impl InFlightRedeliveries {
    pub(crate) fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Register a dispatch; the count drops again when the guard is dropped.
    pub(crate) fn track(&self) -> InFlightGuard {
        let now = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        RecoveryMetrics::record_in_flight(now);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }
}

pub(crate) struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        RecoveryMetrics::record_in_flight(now);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_interval() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let scheduler = RecoveryScheduler::spawn(Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.stop().await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pass_never_overlaps() {
        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));
        let (a, m) = (Arc::clone(&active), Arc::clone(&max_active));

        let scheduler = RecoveryScheduler::spawn(Duration::from_millis(10), move || {
            let (a, m) = (Arc::clone(&a), Arc::clone(&m));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(35)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await.unwrap();

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_active_pass_and_prevents_new_ones() {
        let finished = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&finished);

        let scheduler = RecoveryScheduler::spawn(Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // First pass starts at 10ms and is still sleeping at 20ms.
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_tracks_in_flight_count() {
        let in_flight = InFlightRedeliveries::default();
        let a = in_flight.track();
        let b = in_flight.track();
        assert_eq!(in_flight.load(), 2);
        drop(a);
        assert_eq!(in_flight.load(), 1);
        drop(b);
        assert_eq!(in_flight.load(), 0);
    }

    #[test]
    fn report_sorts_outcomes() {
        let mut report = RecoveryReport::default();
        report.record(CorrelationKey::new("a"), KeyOutcome::Redelivered(1));
        report.record(CorrelationKey::new("b"), KeyOutcome::DeadLettered);
        report.record(CorrelationKey::new("c"), KeyOutcome::Skipped);
        report.record_failure(CorrelationKey::new("d"));

        assert_eq!(report.redelivered, vec![CorrelationKey::new("a")]);
        assert_eq!(report.dead_lettered, vec![CorrelationKey::new("b")]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, vec![CorrelationKey::new("d")]);
    }
}
