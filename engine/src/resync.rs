//! Resync fallback.
//!
//! Rebuilds a missing counter from the ledger. The write is set-if-absent and
//! subtracts the units held by pending reservations in the same atomic step,
//! so a concurrent resync or reservation can never be overwritten and the
//! consistency invariant holds as soon as the counter reappears.
//!
//! A confirmation moves units out of the ledger and out of the pending set in
//! two steps. Ledger reads carry the settlement epoch observed before them and
//! the store refuses to derive a counter across a settlement; the read is then
//! retried a few times with a short backoff.

use crate::metrics::StockMetrics;
use std::sync::Arc;
use std::time::Duration;
use stockline_core::environment::Clock;
use stockline_core::ledger::DurableLedger;
use stockline_core::store::{LedgerSnapshot, SeedOutcome, StockStore};
use stockline_core::{ProductId, Result, StockCounter, StockError};

/// Ledger reads attempted before giving up on a settling product.
pub(crate) const SETTLE_ATTEMPTS: u32 = 5;

/// Backoff unit between attempts; attempt `n` waits `n` units.
const SETTLE_BACKOFF: Duration = Duration::from_millis(20);

/// Wait before the next ledger read of a settling product.
pub(crate) async fn settle_backoff(attempt: u32) {
    tokio::time::sleep(SETTLE_BACKOFF * attempt).await;
}

/// Read the ledger stock of a product, fenced by its settlement epoch.
///
/// The time is taken first and the epoch before the ledger, so a settlement
/// that overlaps the read is always visible to the store.
pub(crate) async fn ledger_snapshot<S: StockStore, D: DurableLedger>(
    store: &S,
    ledger: &D,
    clock: &dyn Clock,
    product_id: &ProductId,
) -> Result<LedgerSnapshot> {
    let at = clock.now();
    let epoch = store.settlement_epoch(product_id).await?;
    let stock = ledger.read_stock(product_id).await?;
    Ok(LedgerSnapshot { stock, epoch, at })
}

/// Summary of a bulk [`Resync::warm`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Counters written from the ledger
    pub seeded: usize,
    /// Counters that were already present and left untouched
    pub present: usize,
    /// Products unknown to the ledger
    pub not_found: Vec<ProductId>,
}

/// Rebuilds counters from the ledger.
pub struct Resync<S, D> {
    store: Arc<S>,
    ledger: Arc<D>,
    clock: Arc<dyn Clock>,
    counter_ttl: Duration,
}

impl<S, D> Clone for Resync<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            clock: Arc::clone(&self.clock),
            counter_ttl: self.counter_ttl,
        }
    }
}

impl<S: StockStore, D: DurableLedger> Resync<S, D> {
    /// Create a resync over `store` and `ledger`.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        ledger: Arc<D>,
        clock: Arc<dyn Clock>,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            counter_ttl,
        }
    }

    /// Repopulate the counter of a product from the ledger.
    ///
    /// Returns the counter now present, which is the value another caller
    /// wrote if it got there first. Nothing is written while a confirmation
    /// of the product is settling.
    ///
    /// # Errors
    ///
    /// - Ledger unreachable → [`StockError::ResyncFailure`]
    /// - Confirmations still settling after every attempt → [`StockError::ResyncFailure`]
    /// - Unknown product → [`StockError::ProductNotFound`] (nothing written)
    /// - Store unreachable → [`StockError::Store`]
    pub async fn resync(&self, product_id: &ProductId) -> Result<StockCounter> {
        for attempt in 1..=SETTLE_ATTEMPTS {
            let snapshot = self.snapshot(product_id).await?;
            let outcome = self
                .store
                .seed_counter(product_id, &snapshot, self.counter_ttl)
                .await?;

            match outcome {
                SeedOutcome::Seeded(quantity) => {
                    StockMetrics::record_resync("seeded");
                    tracing::info!(
                        product_id = %product_id,
                        ledger_stock = snapshot.stock,
                        quantity,
                        "Counter resynced from ledger"
                    );
                    return Ok(StockCounter::resynced(*product_id, quantity));
                },
                SeedOutcome::Present(quantity) => {
                    StockMetrics::record_resync("present");
                    tracing::debug!(
                        product_id = %product_id,
                        quantity,
                        "Counter already repopulated by another caller"
                    );
                    return Ok(StockCounter::resynced(*product_id, quantity));
                },
                SeedOutcome::Settling => {
                    tracing::debug!(
                        product_id = %product_id,
                        attempt,
                        "Confirmation settling; re-reading ledger"
                    );
                    settle_backoff(attempt).await;
                },
            }
        }

        StockMetrics::record_resync_failure();
        tracing::warn!(product_id = %product_id, "Resync gave up; confirmations kept settling");
        Err(StockError::ResyncFailure {
            product_id: *product_id,
            reason: "confirmations kept settling".to_string(),
        })
    }

    async fn snapshot(&self, product_id: &ProductId) -> Result<LedgerSnapshot> {
        ledger_snapshot(&*self.store, &*self.ledger, &*self.clock, product_id)
            .await
            .map_err(|e| match e {
                StockError::ProductNotFound { .. } | StockError::Store(_) => e,
                other => {
                    StockMetrics::record_resync_failure();
                    tracing::error!(
                        product_id = %product_id,
                        error = %other,
                        "Ledger unreachable during resync"
                    );
                    StockError::ResyncFailure {
                        product_id: *product_id,
                        reason: other.to_string(),
                    }
                },
            })
    }

    /// Seed counters for many products, leaving present counters untouched.
    ///
    /// # Errors
    ///
    /// Stops at the first ledger or store failure
    /// ([`StockError::ResyncFailure`] or [`StockError::Store`]).
    pub async fn warm(&self, product_ids: &[ProductId]) -> Result<WarmReport> {
        let mut report = WarmReport::default();
        let current = self.store.counters(product_ids).await?;

        for (product_id, counter) in product_ids.iter().zip(current) {
            if counter.is_some() {
                report.present += 1;
                continue;
            }
            match self.resync(product_id).await {
                Ok(_) => report.seeded += 1,
                Err(StockError::ProductNotFound { .. }) => report.not_found.push(*product_id),
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            seeded = report.seeded,
            present = report.present,
            not_found = report.not_found.len(),
            "Counters warmed"
        );
        Ok(report)
    }
}
