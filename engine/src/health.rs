//! Reservation monitoring and store health.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use stockline_core::environment::Clock;
use stockline_core::store::{KeyCensus, StockStore};
use stockline_core::{ProductId, Reservation, ReservationStatus, Result};

/// Pending reservations older than this count as stuck.
pub const OLD_RESERVATION_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// More live locks than this is reported as a warning.
pub const LOCK_WARNING_THRESHOLD: usize = 10;

/// More old pending reservations than this is reported as a warning.
pub const OLD_RESERVATION_WARNING_THRESHOLD: usize = 100;

/// Reservation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReservationStats {
    /// All records still retained
    pub total: usize,
    /// Pending, including expired ones not yet reclaimed
    pub pending: usize,
    /// Pending past their hold
    pub expired: usize,
    /// Confirmed
    pub confirmed: usize,
    /// Rolled back
    pub rolled_back: usize,
}

/// Overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Nothing unusual
    Healthy,
    /// Too many locks or stuck reservations
    Warning,
    /// The store could not be inspected
    Error,
}

/// Snapshot of the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Verdict
    pub status: HealthStatus,
    /// When the snapshot was taken
    pub checked_at: DateTime<Utc>,
    /// Keys per namespace
    pub census: KeyCensus,
    /// Pending reservations older than [`OLD_RESERVATION_AGE`]
    pub old_pending: usize,
    /// Why the store could not be inspected
    pub error: Option<String>,
}

/// Read-only view over reservations and store keys.
pub struct StockMonitor<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for StockMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: StockStore> StockMonitor<S> {
    /// Create a monitor.
    #[must_use]
    pub const fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Reservations of a product, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](stockline_core::StockError::Store) if the store is unreachable.
    pub async fn product_activity(&self, product_id: &ProductId) -> Result<Vec<Reservation>> {
        let mut reservations = self.store.product_reservations(product_id).await?;
        reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reservations)
    }

    /// Count every retained reservation by status.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](stockline_core::StockError::Store) if the store is unreachable.
    pub async fn reservation_stats(&self) -> Result<ReservationStats> {
        let now = self.clock.now();
        let mut stats = ReservationStats::default();

        for product_id in self.store.reserved_products().await? {
            for reservation in self.store.product_reservations(&product_id).await? {
                stats.total += 1;
                match reservation.status {
                    ReservationStatus::Pending => {
                        stats.pending += 1;
                        if reservation.is_expired(now) {
                            stats.expired += 1;
                        }
                    },
                    ReservationStatus::Confirmed => stats.confirmed += 1,
                    ReservationStatus::RolledBack => stats.rolled_back += 1,
                }
            }
        }
        Ok(stats)
    }

    /// Inspect the store and grade it.
    pub async fn health(&self) -> HealthReport {
        let checked_at = self.clock.now();
        match self.inspect(checked_at).await {
            Ok((census, old_pending)) => {
                let status = if census.lock_keys > LOCK_WARNING_THRESHOLD
                    || old_pending > OLD_RESERVATION_WARNING_THRESHOLD
                {
                    tracing::warn!(
                        lock_keys = census.lock_keys,
                        old_pending,
                        "Stock store health degraded"
                    );
                    HealthStatus::Warning
                } else {
                    HealthStatus::Healthy
                };
                HealthReport {
                    status,
                    checked_at,
                    census,
                    old_pending,
                    error: None,
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Stock store health check failed");
                HealthReport {
                    status: HealthStatus::Error,
                    checked_at,
                    census: KeyCensus::default(),
                    old_pending: 0,
                    error: Some(e.to_string()),
                }
            },
        }
    }

    async fn inspect(&self, now: DateTime<Utc>) -> Result<(KeyCensus, usize)> {
        let census = self.store.census().await?;
        let cutoff = now - chrono::Duration::from_std(OLD_RESERVATION_AGE).unwrap_or_default();

        let mut old_pending = 0;
        for product_id in self.store.reserved_products().await? {
            old_pending += self
                .store
                .product_reservations(&product_id)
                .await?
                .iter()
                .filter(|r| r.is_pending() && r.created_at < cutoff)
                .count();
        }
        Ok((census, old_pending))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::reservation::ReservationCoordinator;
    use stockline_core::UserId;
    use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};

    struct Fixture {
        monitor: StockMonitor<InMemoryStockStore>,
        coordinator: ReservationCoordinator<InMemoryStockStore, InMemoryLedger>,
        store: Arc<InMemoryStockStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStockStore::new(Arc::new(clock.clone())));
        let ledger = Arc::new(InMemoryLedger::new());
        // Holds longer than the stuck threshold so old pending records survive.
        let config = EngineConfig::default().with_hold(Duration::from_secs(4 * 60 * 60));
        Fixture {
            monitor: StockMonitor::new(Arc::clone(&store), Arc::new(clock.clone())),
            coordinator: ReservationCoordinator::new(
                Arc::clone(&store),
                ledger,
                Arc::new(clock.clone()),
                config,
            ),
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn activity_is_newest_first() {
        let f = fixture();
        let product = ProductId::new();
        let (first, second) = (UserId::new(), UserId::new());
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, first, 1).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        f.coordinator.reserve(product, second, 1).await.unwrap();

        let activity = f.monitor.product_activity(&product).await.unwrap();

        let users: Vec<UserId> = activity.iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec![second, first]);
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let f = fixture();
        let product = ProductId::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, a, 1).await.unwrap();
        f.coordinator.reserve(product, b, 1).await.unwrap();
        f.coordinator.reserve(product, c, 1).await.unwrap();
        f.coordinator.rollback(b, product).await.unwrap();

        let stats = f.monitor.reservation_stats().await.unwrap();

        assert_eq!(
            stats,
            ReservationStats {
                total: 3,
                pending: 2,
                expired: 0,
                confirmed: 0,
                rolled_back: 1,
            }
        );
    }

    #[tokio::test]
    async fn health_flags_old_pending_reservations() {
        let f = fixture();
        for _ in 0..=OLD_RESERVATION_WARNING_THRESHOLD {
            let product = ProductId::new();
            f.store.set_counter(product, 1);
            f.coordinator.reserve(product, UserId::new(), 1).await.unwrap();
        }

        assert_eq!(f.monitor.health().await.status, HealthStatus::Healthy);

        f.clock.advance(Duration::from_secs(3 * 60 * 60));
        let report = f.monitor.health().await;

        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.old_pending, OLD_RESERVATION_WARNING_THRESHOLD + 1);
    }

    #[tokio::test]
    async fn unreachable_store_reports_error() {
        let f = fixture();
        f.store.set_unavailable(true);

        let report = f.monitor.health().await;

        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.error.is_some());
    }
}
