//! In-memory durable ledger with fault and latency injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stockline_core::ledger::DurableLedger;
use stockline_core::{ProductId, Result, StockError};

/// In-memory [`DurableLedger`].
///
/// Clones share the same table. Writes can be slowed down with
/// [`with_write_delay`](Self::with_write_delay) and reads with
/// [`with_read_delay`](Self::with_read_delay) to widen race windows. Writes
/// can be made to fail with [`fail_next_writes`](Self::fail_next_writes).
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    stock: Arc<Mutex<HashMap<ProductId, i64>>>,
    unavailable: Arc<AtomicBool>,
    failing_writes: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    write_delay: Option<Duration>,
    read_delay: Option<Duration>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every write, before it lands.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Sleep for `delay` inside every read, after the value was taken, so the
    /// caller acts on a value that may already be stale.
    #[must_use]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ProductId, i64>> {
        self.stock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a product row (test setup).
    pub fn insert(&self, product_id: ProductId, stock: i64) {
        self.table().insert(product_id, stock);
    }

    /// Current stock of a product, bypassing fault injection.
    #[must_use]
    pub fn stock(&self, product_id: &ProductId) -> Option<i64> {
        self.table().get(product_id).copied()
    }

    /// Make every subsequent call fail (simulates a database outage).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` write calls.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of write calls that reached the table.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StockError::Ledger("in-memory ledger unavailable".to_string()));
        }
        Ok(())
    }

    async fn begin_write(&self) -> Result<()> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StockError::Ledger("injected write failure".to_string()));
        }
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DurableLedger for InMemoryLedger {
    async fn read_stock(&self, product_id: &ProductId) -> Result<i64> {
        self.check_available()?;
        let stock = self.stock(product_id).ok_or(StockError::ProductNotFound {
            product_id: *product_id,
        })?;
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(stock)
    }

    async fn write_stock(&self, product_id: &ProductId, stock: i64) -> Result<()> {
        self.begin_write().await?;
        let mut table = self.table();
        let row = table.get_mut(product_id).ok_or(StockError::ProductNotFound {
            product_id: *product_id,
        })?;
        *row = stock;
        Ok(())
    }

    async fn decrement_stock(&self, product_id: &ProductId, quantity: u32) -> Result<i64> {
        self.begin_write().await?;
        let mut table = self.table();
        let row = table.get_mut(product_id).ok_or(StockError::ProductNotFound {
            product_id: *product_id,
        })?;
        if *row < i64::from(quantity) {
            return Err(StockError::InsufficientStock {
                product_id: *product_id,
                available: *row,
                requested: quantity,
            });
        }
        *row -= i64::from(quantity);
        Ok(*row)
    }

    async fn increment_stock(&self, product_id: &ProductId, quantity: u32) -> Result<i64> {
        self.begin_write().await?;
        let mut table = self.table();
        let row = table.get_mut(product_id).ok_or(StockError::ProductNotFound {
            product_id: *product_id,
        })?;
        *row += i64::from(quantity);
        Ok(*row)
    }

    async fn write_stock_many(&self, entries: &[(ProductId, i64)]) -> Result<()> {
        self.begin_write().await?;
        let mut table = self.table();
        for (product_id, stock) in entries {
            table.insert(*product_id, *stock);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decrement_refuses_to_go_negative() {
        let ledger = InMemoryLedger::new();
        let product = ProductId::new();
        ledger.insert(product, 2);

        let result = ledger.decrement_stock(&product, 3).await;

        assert!(matches!(
            result,
            Err(StockError::InsufficientStock { available: 2, .. })
        ));
        assert_eq!(ledger.stock(&product), Some(2));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let ledger = InMemoryLedger::new();
        let product = ProductId::new();
        ledger.insert(product, 5);
        ledger.fail_next_writes(1);

        assert!(ledger.write_stock(&product, 9).await.is_err());
        assert_eq!(ledger.write_stock(&product, 9).await, Ok(()));
        assert_eq!(ledger.stock(&product), Some(9));
        assert_eq!(ledger.write_count(), 1);
    }

    #[tokio::test]
    async fn unknown_product_is_reported() {
        let ledger = InMemoryLedger::new();

        assert!(matches!(
            ledger.read_stock(&ProductId::new()).await,
            Err(StockError::ProductNotFound { .. })
        ));
    }
}
