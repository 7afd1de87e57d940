//! Expiry sweeper and reservation maintenance.
//!
//! Expired pending reservations are reclaimed lazily by the reserve and
//! confirm calls that touch their pair; the sweeper catches the ones nobody
//! touches again, so abandoned stock always flows back to the counter.

use crate::config::EngineConfig;
use crate::metrics::StockMetrics;
use std::sync::Arc;
use std::time::Instant;
use stockline_core::environment::Clock;
use stockline_core::store::{FinalizeOutcome, ReleaseMode, StockStore};
use stockline_core::{ProductId, Reservation, Result, UserId};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Products whose reservations were inspected
    pub products: usize,
    /// Reservations rolled back
    pub reclaimed: usize,
    /// Units returned to counters
    pub units: u64,
}

/// Rolls back expired or unwanted pending reservations.
pub struct ReservationSweeper<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S> Clone for ReservationSweeper<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

impl<S: StockStore> ReservationSweeper<S> {
    /// Create a sweeper.
    #[must_use]
    pub const fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Reclaim every expired pending reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](stockline_core::StockError::Store) if the store is unreachable.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for product_id in self.store.reserved_products().await? {
            report.products += 1;
            let expired = self
                .store
                .product_reservations(&product_id)
                .await?
                .into_iter()
                .filter(|r| r.is_expired(now));
            for reservation in expired {
                if let Some(quantity) = self.release(&reservation, ReleaseMode::IfExpired).await? {
                    report.reclaimed += 1;
                    report.units += u64::from(quantity);
                }
            }
        }

        StockMetrics::record_reclaimed(report.reclaimed);
        StockMetrics::record_sweep(started.elapsed());
        if report.reclaimed > 0 {
            tracing::info!(
                products = report.products,
                reclaimed = report.reclaimed,
                units = report.units,
                "Expired reservations reclaimed"
            );
        } else {
            tracing::debug!(products = report.products, "Sweep found nothing to reclaim");
        }
        Ok(report)
    }

    /// Roll back every pending reservation of a product. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](stockline_core::StockError::Store) if the store is unreachable.
    pub async fn purge_product(&self, product_id: &ProductId) -> Result<usize> {
        let pending = self.store.product_reservations(product_id).await?;
        let purged = self.release_all(&pending).await?;
        tracing::warn!(product_id = %product_id, purged, "Pending reservations purged for product");
        Ok(purged)
    }

    /// Roll back every pending reservation of a user. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](stockline_core::StockError::Store) if the store is unreachable.
    pub async fn purge_user(&self, user_id: &UserId) -> Result<usize> {
        let pending = self.store.user_reservations(user_id).await?;
        let purged = self.release_all(&pending).await?;
        tracing::warn!(user_id = %user_id, purged, "Pending reservations purged for user");
        Ok(purged)
    }

    async fn release_all(&self, reservations: &[Reservation]) -> Result<usize> {
        let mut released = 0;
        for reservation in reservations.iter().filter(|r| r.is_pending()) {
            if self.release(reservation, ReleaseMode::Always).await?.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release(&self, reservation: &Reservation, mode: ReleaseMode) -> Result<Option<u32>> {
        let outcome = self
            .store
            .release_hold(
                &reservation.user_id,
                &reservation.product_id,
                self.clock.now(),
                self.config.retention(),
                mode,
            )
            .await?;

        Ok(match outcome {
            FinalizeOutcome::Finalized { reservation, counter } => {
                tracing::debug!(
                    product_id = %reservation.product_id,
                    user_id = %reservation.user_id,
                    quantity = reservation.quantity,
                    counter = ?counter,
                    "Reservation released"
                );
                Some(reservation.quantity)
            },
            // Confirmed, rolled back or renewed since it was listed.
            FinalizeOutcome::NotFound
            | FinalizeOutcome::AlreadyFinal(_)
            | FinalizeOutcome::NotExpired(_) => None,
        })
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            "Reservation sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Reservation sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }
}
