//! Durable ledger contract.
//!
//! The ledger is the relational `stock` column per product: the system of
//! record. Every write is transactional. The engine never guesses a value the
//! ledger could not provide.

use crate::error::Result;
use crate::types::ProductId;

/// Authoritative per-product stock.
///
/// # Implementations
///
/// - **Production**: `stockline_postgres::PostgresLedger`
/// - **Testing**: `stockline_testing::InMemoryLedger`
pub trait DurableLedger: Send + Sync {
    /// Read the stock of a product.
    ///
    /// # Errors
    ///
    /// - Unknown product → [`StockError::ProductNotFound`](crate::StockError::ProductNotFound)
    /// - Database failure → [`StockError::Ledger`](crate::StockError::Ledger)
    fn read_stock(
        &self,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    /// Set the stock of a product (admin edit).
    ///
    /// # Errors
    ///
    /// - Unknown product → [`StockError::ProductNotFound`](crate::StockError::ProductNotFound)
    /// - Database failure → [`StockError::Ledger`](crate::StockError::Ledger)
    fn write_stock(
        &self,
        product_id: &ProductId,
        stock: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Subtract confirmed units, returning the new stock.
    ///
    /// Must refuse to go below zero.
    ///
    /// # Errors
    ///
    /// - Not enough stock → [`StockError::InsufficientStock`](crate::StockError::InsufficientStock)
    /// - Unknown product → [`StockError::ProductNotFound`](crate::StockError::ProductNotFound)
    /// - Database failure → [`StockError::Ledger`](crate::StockError::Ledger)
    fn decrement_stock(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    /// Add units back (compensation of a decrement), returning the new stock.
    ///
    /// # Errors
    ///
    /// - Unknown product → [`StockError::ProductNotFound`](crate::StockError::ProductNotFound)
    /// - Database failure → [`StockError::Ledger`](crate::StockError::Ledger)
    fn increment_stock(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    /// Set the stock of many products in a single transaction (bulk import).
    ///
    /// Products that don't exist yet are created.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Ledger`](crate::StockError::Ledger) if the
    /// transaction fails; nothing is written in that case.
    fn write_stock_many(
        &self,
        entries: &[(ProductId, i64)],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
