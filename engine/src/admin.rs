//! Admin mutation guard.
//!
//! Direct stock edits from the management backend run under the product lock:
//! acquire, write the ledger, publish the new authoritative value to the
//! counter, release. The lock is released on every exit path, including a
//! panic inside the write. A failed write leaves the counter untouched.
//!
//! Bulk catalog imports hold a single global lock for their whole duration;
//! a second concurrent import is rejected with
//! [`StockError::ImportInProgress`]. An import also takes the lock of every
//! product it writes before touching the ledger, so it never overwrites a
//! product an admin is editing.

use crate::config::EngineConfig;
use crate::lock::{LockLease, LockManager};
use crate::metrics::StockMetrics;
use crate::resync::{SETTLE_ATTEMPTS, ledger_snapshot, settle_backoff};
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use stockline_core::environment::Clock;
use stockline_core::ledger::DurableLedger;
use stockline_core::store::{LockStore, PublishOutcome, StockStore};
use stockline_core::{ProductId, Resource, Result, StockError};

/// Result of a write made under a product lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedWrite<T> {
    /// What the write returned
    pub output: T,
    /// Counter published after the write, or `None` if publishing failed and
    /// the counter was invalidated instead (the next access resyncs it)
    pub published: Option<i64>,
}

/// Summary of a catalog import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Products written to the ledger
    pub written: usize,
    /// Counters published under their product lock
    pub published: usize,
    /// Counters dropped because publishing failed or confirmations kept
    /// settling; they resync on next access
    pub invalidated: usize,
}

/// Serializes admin writes per product and imports globally.
pub struct AdminGuard<S, D> {
    store: Arc<S>,
    ledger: Arc<D>,
    clock: Arc<dyn Clock>,
    locks: LockManager<S>,
    config: EngineConfig,
}

impl<S, D> Clone for AdminGuard<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            clock: Arc::clone(&self.clock),
            locks: self.locks.clone(),
            config: self.config,
        }
    }
}

impl<S, D> AdminGuard<S, D>
where
    S: StockStore + LockStore,
    D: DurableLedger,
{
    /// Create a guard.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        ledger: Arc<D>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            locks: LockManager::new(Arc::clone(&store)),
            store,
            ledger,
            clock,
            config,
        }
    }

    /// Run a ledger write under the product lock and publish the result.
    ///
    /// `write` receives the ledger. After it succeeds the ledger value is
    /// re-read and pushed to the counter (minus units held by pending
    /// reservations) before the lock is released.
    ///
    /// # Errors
    ///
    /// - Product locked by another writer → [`StockError::LockBusy`]
    /// - Whatever `write` returns; the counter is left unmodified
    /// - Store unreachable while locking → [`StockError::Store`]
    pub async fn with_product_lock<F, Fut, T>(
        &self,
        product_id: ProductId,
        write: F,
    ) -> Result<LockedWrite<T>>
    where
        F: FnOnce(Arc<D>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let lease = self
            .locks
            .acquire(Resource::Product(product_id), self.config.lock_ttl())
            .await?;

        let ledger = Arc::clone(&self.ledger);
        let outcome = AssertUnwindSafe(async move { write(ledger).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(output)) => {
                StockMetrics::record_admin_write();
                let published = self.publish(&product_id).await;
                Ok(LockedWrite { output, published })
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    product_id = %product_id,
                    error = %e,
                    "Admin write failed; counter left unmodified"
                );
                Err(e)
            },
            Err(panic) => {
                tracing::error!(product_id = %product_id, "Admin write panicked; releasing lock");
                self.locks.release_lease(&lease).await;
                std::panic::resume_unwind(panic);
            },
        };

        self.locks.release_lease(&lease).await;
        result
    }

    /// Re-read the ledger and overwrite the counter. Must hold the product lock.
    ///
    /// Returns `None` if the counter was invalidated instead.
    async fn publish(&self, product_id: &ProductId) -> Option<i64> {
        match self.try_publish(product_id).await {
            Ok(Some(counter)) => {
                tracing::info!(product_id = %product_id, counter, "Counter published");
                Some(counter)
            },
            Ok(None) => {
                tracing::warn!(
                    product_id = %product_id,
                    "Confirmations kept settling; invalidating counter"
                );
                self.invalidate(product_id).await;
                None
            },
            Err(e) => {
                tracing::error!(
                    product_id = %product_id,
                    error = %e,
                    "Failed to publish counter; invalidating it"
                );
                self.invalidate(product_id).await;
                None
            },
        }
    }

    async fn try_publish(&self, product_id: &ProductId) -> Result<Option<i64>> {
        for attempt in 1..=SETTLE_ATTEMPTS {
            let snapshot =
                ledger_snapshot(&*self.store, &*self.ledger, &*self.clock, product_id).await?;
            match self
                .store
                .publish_counter(product_id, &snapshot, self.config.counter_ttl())
                .await?
            {
                PublishOutcome::Published(counter) => return Ok(Some(counter)),
                PublishOutcome::Settling => {
                    tracing::debug!(
                        product_id = %product_id,
                        attempt,
                        "Confirmation settling; re-reading ledger before publishing"
                    );
                    settle_backoff(attempt).await;
                },
            }
        }
        Ok(None)
    }

    async fn invalidate(&self, product_id: &ProductId) {
        if let Err(e) = self.store.invalidate_counter(product_id).await {
            tracing::error!(
                product_id = %product_id,
                error = %e,
                "Failed to invalidate counter; it stays stale until its TTL"
            );
        }
    }

    /// Set the stock of a product.
    ///
    /// Returns the counter published for the new value.
    ///
    /// # Errors
    ///
    /// - Negative stock → [`StockError::InvalidQuantity`]
    /// - Product locked by another writer → [`StockError::LockBusy`]
    /// - Unknown product → [`StockError::ProductNotFound`]
    /// - Ledger failure → [`StockError::Ledger`]
    pub async fn set_stock(&self, product_id: ProductId, stock: i64) -> Result<LockedWrite<i64>> {
        if stock < 0 {
            return Err(StockError::InvalidQuantity { quantity: stock });
        }

        let written = self
            .with_product_lock(product_id, |ledger| async move {
                ledger.write_stock(&product_id, stock).await?;
                Ok(stock)
            })
            .await?;

        tracing::info!(
            product_id = %product_id,
            stock,
            counter = ?written.published,
            "Stock set by admin"
        );
        Ok(written)
    }

    /// Write the stock of many products in one ledger transaction.
    ///
    /// Holds the global import lock for the whole import, and the lock of
    /// every imported product from before the ledger write until its counter
    /// is published. If any product is locked by another writer the import
    /// writes nothing.
    ///
    /// # Errors
    ///
    /// - Another import running → [`StockError::ImportInProgress`]
    /// - Negative stock in any entry → [`StockError::InvalidQuantity`]
    /// - A product locked by another writer → [`StockError::LockBusy`] (nothing written)
    /// - Ledger transaction failed → [`StockError::Ledger`] (nothing written)
    /// - Store unreachable → [`StockError::Store`]
    pub async fn import_catalog(&self, entries: &[(ProductId, i64)]) -> Result<ImportReport> {
        if let Some((_, stock)) = entries.iter().find(|(_, stock)| *stock < 0) {
            return Err(StockError::InvalidQuantity { quantity: *stock });
        }

        let Some(lease) = self
            .locks
            .try_acquire(Resource::CatalogImport, self.config.import_lock_ttl())
            .await?
        else {
            tracing::warn!(products = entries.len(), "Import rejected; another import is running");
            return Err(StockError::ImportInProgress);
        };

        tracing::info!(products = entries.len(), "Catalog import started");
        let result = self.run_import(entries).await;
        self.locks.release_lease(&lease).await;

        match &result {
            Ok(report) => {
                StockMetrics::record_import(report.written);
                tracing::info!(
                    written = report.written,
                    published = report.published,
                    invalidated = report.invalidated,
                    "Catalog import finished"
                );
            },
            Err(e) => tracing::error!(error = %e, "Catalog import failed"),
        }
        result
    }

    async fn run_import(&self, entries: &[(ProductId, i64)]) -> Result<ImportReport> {
        let mut seen = HashSet::with_capacity(entries.len());
        let products: Vec<ProductId> = entries
            .iter()
            .map(|(product_id, _)| *product_id)
            .filter(|product_id| seen.insert(*product_id))
            .collect();

        let leases = self.lock_products(&products).await?;
        let result = self.write_and_publish(entries, &products).await;
        for lease in &leases {
            self.locks.release_lease(lease).await;
        }
        result
    }

    /// Take the lock of every product, or none of them.
    async fn lock_products(&self, products: &[ProductId]) -> Result<Vec<LockLease>> {
        let mut leases = Vec::with_capacity(products.len());
        for product_id in products {
            match self
                .locks
                .acquire(Resource::Product(*product_id), self.config.import_lock_ttl())
                .await
            {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    tracing::warn!(
                        product_id = %product_id,
                        error = %e,
                        "Import cannot lock product; nothing written"
                    );
                    for lease in &leases {
                        self.locks.release_lease(lease).await;
                    }
                    return Err(e);
                },
            }
        }
        Ok(leases)
    }

    async fn write_and_publish(
        &self,
        entries: &[(ProductId, i64)],
        products: &[ProductId],
    ) -> Result<ImportReport> {
        self.ledger.write_stock_many(entries).await?;

        let mut report = ImportReport {
            written: products.len(),
            ..ImportReport::default()
        };
        for product_id in products {
            match self.publish(product_id).await {
                Some(_) => report.published += 1,
                None => report.invalidated += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stockline_core::UserId;
    use stockline_core::environment::{Clock, deadline};
    use stockline_core::store::HoldRequest;
    use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};

    struct Fixture {
        admin: AdminGuard<InMemoryStockStore, InMemoryLedger>,
        store: Arc<InMemoryStockStore>,
        ledger: Arc<InMemoryLedger>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStockStore::new(clock.clone()));
        let ledger = Arc::new(InMemoryLedger::new());
        Fixture {
            admin: AdminGuard::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                clock,
                EngineConfig::default(),
            ),
            store,
            ledger,
        }
    }

    #[tokio::test]
    async fn set_stock_publishes_and_releases() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);

        let written = f.admin.set_stock(product, 40).await.unwrap();

        assert_eq!(written, LockedWrite { output: 40, published: Some(40) });
        assert_eq!(f.store.counter_value(&product), Some(40));
        assert_eq!(f.store.lock_token(&Resource::Product(product)), None);
    }

    #[tokio::test]
    async fn publish_subtracts_pending_holds() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);
        let now = ManualClock::default().now();
        f.store
            .place_hold(&HoldRequest {
                user_id: UserId::new(),
                product_id: product,
                quantity: 10,
                now,
                expires_at: deadline(now, Duration::from_secs(900)),
                retention: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let written = f.admin.set_stock(product, 50).await.unwrap();

        assert_eq!(written.published, Some(40));
    }

    #[tokio::test]
    async fn negative_stock_is_rejected() {
        let f = fixture();

        let result = f.admin.set_stock(ProductId::new(), -1).await;

        assert_eq!(result, Err(StockError::InvalidQuantity { quantity: -1 }));
    }

    #[tokio::test]
    async fn failed_write_leaves_counter_and_releases_lock() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);
        f.ledger.fail_next_writes(1);

        let result = f.admin.set_stock(product, 10).await;

        assert!(matches!(result, Err(StockError::Ledger(_))));
        assert_eq!(f.store.counter_value(&product), Some(100));
        assert_eq!(f.store.lock_token(&Resource::Product(product)), None);
    }

    #[tokio::test]
    async fn panicking_write_still_releases_lock() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        let admin = f.admin.clone();

        let joined = tokio::spawn(async move {
            admin
                .with_product_lock(product, |_ledger| async move { exploding_write() })
                .await
        })
        .await;

        assert!(joined.is_err_and(|e| e.is_panic()));
        assert_eq!(f.store.lock_token(&Resource::Product(product)), None);
    }

    fn exploding_write() -> Result<()> {
        panic!("write blew up")
    }

    #[tokio::test]
    async fn publish_failure_invalidates_counter() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);
        let ledger = Arc::clone(&f.ledger);

        let written = f
            .admin
            .with_product_lock(product, |l| async move {
                l.write_stock(&product, 60).await?;
                ledger.set_unavailable(true);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(written.published, None);
        assert_eq!(f.store.counter_value(&product), None);
    }

    #[tokio::test]
    async fn concurrent_import_is_rejected() {
        let f = fixture();
        let locks = LockManager::new(Arc::clone(&f.store));
        let _running = locks
            .acquire(Resource::CatalogImport, Duration::from_secs(300))
            .await
            .unwrap();

        let result = f.admin.import_catalog(&[(ProductId::new(), 5)]).await;

        assert_eq!(result, Err(StockError::ImportInProgress));
    }

    #[tokio::test]
    async fn import_publishes_every_product_once() {
        let f = fixture();
        let (a, b) = (ProductId::new(), ProductId::new());
        f.store.set_counter(a, 1);

        let report = f
            .admin
            .import_catalog(&[(a, 30), (b, 40), (a, 35)])
            .await
            .unwrap();

        assert_eq!(
            report,
            ImportReport {
                written: 2,
                published: 2,
                invalidated: 0,
            }
        );
        assert_eq!(f.ledger.stock(&a), Some(35));
        assert_eq!(f.store.counter_value(&a), Some(35));
        assert_eq!(f.store.counter_value(&b), Some(40));
        assert_eq!(f.store.lock_token(&Resource::Product(a)), None);
        assert_eq!(f.store.lock_token(&Resource::CatalogImport), None);
    }

    #[tokio::test]
    async fn import_never_overwrites_a_locked_product() {
        let f = fixture();
        let (free, busy) = (ProductId::new(), ProductId::new());
        f.ledger.insert(free, 1);
        f.ledger.insert(busy, 1);
        f.store.set_counter(free, 1);
        f.store.set_counter(busy, 1);
        let locks = LockManager::new(Arc::clone(&f.store));
        let editing = locks
            .acquire(Resource::Product(busy), Duration::from_secs(5))
            .await
            .unwrap();

        let result = f.admin.import_catalog(&[(free, 30), (busy, 40)]).await;

        assert_eq!(
            result,
            Err(StockError::LockBusy {
                resource: Resource::Product(busy)
            })
        );
        assert_eq!(f.ledger.stock(&free), Some(1));
        assert_eq!(f.ledger.stock(&busy), Some(1));
        assert_eq!(f.ledger.write_count(), 0);
        assert_eq!(f.store.lock_token(&Resource::Product(free)), None);
        assert_eq!(
            f.store.lock_token(&Resource::Product(busy)),
            Some(*editing.token())
        );
        assert_eq!(f.store.lock_token(&Resource::CatalogImport), None);
    }

    #[tokio::test]
    async fn publish_waits_for_settling_confirmation() {
        let f = fixture();
        let product = ProductId::new();
        let user = UserId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);
        let now = ManualClock::default().now();
        f.store
            .begin_settlement(&user, &product, deadline(now, Duration::from_secs(5)))
            .await
            .unwrap();

        let store = Arc::clone(&f.store);
        let ender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.end_settlement(&user, &product).await
        });
        let written = f.admin.set_stock(product, 60).await.unwrap();
        ender.await.unwrap().unwrap();

        assert_eq!(written.published, Some(60));
        assert_eq!(f.store.counter_value(&product), Some(60));
    }

    #[tokio::test]
    async fn publish_gives_up_on_stuck_settlement() {
        let f = fixture();
        let product = ProductId::new();
        f.ledger.insert(product, 100);
        f.store.set_counter(product, 100);
        let now = ManualClock::default().now();
        f.store
            .begin_settlement(&UserId::new(), &product, deadline(now, Duration::from_secs(5)))
            .await
            .unwrap();

        let written = f.admin.set_stock(product, 60).await.unwrap();

        assert_eq!(written.published, None);
        assert_eq!(f.store.counter_value(&product), None);
        assert_eq!(f.ledger.stock(&product), Some(60));
    }
}
