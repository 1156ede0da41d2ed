//! Prometheus metrics for the aggregation repository.
//!
//! Metrics are emitted through the `metrics` facade at all times; installing a
//! [`MetricsRecorder`] makes them renderable in Prometheus text format.
//!
//! # Example
//!
//! ```rust,no_run
//! use recoverable_aggregation_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the global Prometheus recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), installation is
    /// skipped with a warning and [`MetricsRecorder::render`] returns `None`.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Aggregation metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the Prometheus handle.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this recorder was not the one installed.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "aggregation_adds_total",
        "Total number of exchanges added to the repository"
    );
    describe_counter!(
        "aggregation_removes_total",
        "Total number of aggregates removed after completion"
    );
    describe_counter!(
        "aggregation_confirms_total",
        "Total number of exchanges confirmed after reprocessing"
    );
    describe_counter!(
        "aggregation_recovery_passes_total",
        "Total number of recovery passes run"
    );
    describe_counter!(
        "aggregation_recovery_redelivered_total",
        "Total number of exchanges handed back for redelivery"
    );
    describe_counter!(
        "aggregation_recovery_failures_total",
        "Total number of per-key recovery failures"
    );
    describe_counter!(
        "aggregation_dead_letter_total",
        "Total number of exchanges forwarded to the dead letter sink"
    );
    describe_counter!(
        "aggregation_dead_letter_discarded_total",
        "Total number of exhausted exchanges discarded without a dead letter sink"
    );
    describe_gauge!(
        "aggregation_redeliveries_in_flight",
        "Redelivery dispatches that have not finished yet"
    );
    describe_histogram!(
        "aggregation_recovery_pass_duration_seconds",
        "Time taken by one recovery pass"
    );
}

/// Repository operation metrics.
pub struct RepositoryMetrics;

impl RepositoryMetrics {
    /// Record an add.
    pub fn record_add() {
        counter!("aggregation_adds_total").increment(1);
    }

    /// Record a remove.
    pub fn record_remove() {
        counter!("aggregation_removes_total").increment(1);
    }

    /// Record a confirm.
    pub fn record_confirm() {
        counter!("aggregation_confirms_total").increment(1);
    }
}

/// Recovery metrics.
pub struct RecoveryMetrics;

impl RecoveryMetrics {
    /// Record a completed pass.
    pub fn record_pass(duration: Duration) {
        counter!("aggregation_recovery_passes_total").increment(1);
        histogram!("aggregation_recovery_pass_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a redelivery dispatch.
    pub fn record_redelivery() {
        counter!("aggregation_recovery_redelivered_total").increment(1);
    }

    /// Record a per-key failure.
    pub fn record_failure() {
        counter!("aggregation_recovery_failures_total").increment(1);
    }

    /// Record a dead letter forward.
    pub fn record_dead_letter() {
        counter!("aggregation_dead_letter_total").increment(1);
    }

    /// Record a discarded exchange.
    pub fn record_discard() {
        counter!("aggregation_dead_letter_discarded_total").increment(1);
    }

    /// Record the number of outstanding redelivery dispatches.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_in_flight(count: usize) {
        gauge!("aggregation_redeliveries_in_flight").set(count as f64);
    }
}
