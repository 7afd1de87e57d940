//! Prometheus metrics for the stock engine.
//!
//! Components record through the [`StockMetrics`] recorder; the daemon exposes
//! them with [`MetricsServer`].

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
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

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Reservations
    describe_counter!(
        "stock_reservations_total",
        "Reservation attempts by outcome (reserved, insufficient, pending, error)"
    );
    describe_histogram!(
        "stock_reserve_duration_seconds",
        "Time taken to place a reservation"
    );
    describe_counter!(
        "stock_confirmations_total",
        "Confirmation attempts by outcome (confirmed, expired, ledger_failed, error)"
    );
    describe_counter!(
        "stock_rollbacks_total",
        "Rollback attempts by outcome (rolled_back, noop)"
    );

    // Locks
    describe_counter!("stock_lock_acquired_total", "Lock leases acquired");
    describe_counter!("stock_lock_busy_total", "Lock acquisitions rejected as busy");
    describe_counter!(
        "stock_lock_release_conflicts_total",
        "Releases attempted with a token that no longer owns the lock"
    );

    // Resync
    describe_counter!(
        "stock_resync_total",
        "Counter rebuilds from the ledger by outcome (seeded, present)"
    );
    describe_counter!(
        "stock_resync_failures_total",
        "Counter rebuilds that failed because the ledger was unreachable"
    );

    // Admin
    describe_counter!("stock_admin_writes_total", "Ledger writes made under a product lock");
    describe_counter!(
        "stock_import_products_total",
        "Products written by catalog imports"
    );

    // Sweeper
    describe_counter!(
        "stock_reclaimed_total",
        "Expired pending reservations rolled back"
    );
    describe_histogram!("stock_sweep_duration_seconds", "Time taken by one expiry sweep");

    // Ledger (emitted by the PostgreSQL adapter)
    describe_counter!(
        "stock_ledger_errors_total",
        "Failed ledger statements, labelled by operation"
    );
}

/// Stock engine metrics recorder.
pub struct StockMetrics;

impl StockMetrics {
    /// Record a reservation attempt.
    pub fn record_reserve(outcome: &'static str, duration: Duration) {
        counter!("stock_reservations_total", "outcome" => outcome).increment(1);
        histogram!("stock_reserve_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a confirmation attempt.
    pub fn record_confirm(outcome: &'static str) {
        counter!("stock_confirmations_total", "outcome" => outcome).increment(1);
    }

    /// Record a rollback attempt.
    pub fn record_rollback(outcome: &'static str) {
        counter!("stock_rollbacks_total", "outcome" => outcome).increment(1);
    }

    /// Record an acquired lock.
    pub fn record_lock_acquired() {
        counter!("stock_lock_acquired_total").increment(1);
    }

    /// Record a busy lock.
    pub fn record_lock_busy() {
        counter!("stock_lock_busy_total").increment(1);
    }

    /// Record a release with a stale token.
    pub fn record_lock_release_conflict() {
        counter!("stock_lock_release_conflicts_total").increment(1);
    }

    /// Record a counter rebuild.
    pub fn record_resync(outcome: &'static str) {
        counter!("stock_resync_total", "outcome" => outcome).increment(1);
    }

    /// Record a failed counter rebuild.
    pub fn record_resync_failure() {
        counter!("stock_resync_failures_total").increment(1);
    }

    /// Record a ledger write under a product lock.
    pub fn record_admin_write() {
        counter!("stock_admin_writes_total").increment(1);
    }

    /// Record a catalog import.
    pub fn record_import(products: usize) {
        counter!("stock_import_products_total").increment(products as u64);
    }

    /// Record reclaimed reservations.
    pub fn record_reclaimed(count: usize) {
        counter!("stock_reclaimed_total").increment(count as u64);
    }

    /// Record a completed sweep.
    pub fn record_sweep(duration: Duration) {
        histogram!("stock_sweep_duration_seconds").record(duration.as_secs_f64());
    }
}
