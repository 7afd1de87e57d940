//! `PostgreSQL` stock ledger for Stockline.
//!
//! The ledger is the system of record: one `stock` column per product, every
//! write transactional. Confirmations decrement with a conditional `UPDATE`
//! so the column can never go negative, even under concurrent confirmations
//! from several engine instances.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE products (
//!     id UUID PRIMARY KEY,
//!     stock BIGINT NOT NULL CHECK (stock >= 0),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stockline_postgres::PostgresLedger;
//!
//! # async fn example() -> stockline_core::Result<()> {
//! let ledger = PostgresLedger::connect("postgres://localhost/shop", 10, Duration::from_secs(5)).await?;
//! ledger.ensure_schema().await?;
//! # Ok(())
//! # }
//! ```

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use stockline_core::ledger::DurableLedger;
use stockline_core::{ProductId, Result, StockError};
use uuid::Uuid;

/// `PostgreSQL`-backed [`DurableLedger`].
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

/// Map a database error to [`StockError::Ledger`], counting it per operation.
fn ledger_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StockError {
    move |e| {
        metrics::counter!("stock_ledger_errors_total", "operation" => operation).increment(1);
        tracing::error!(operation, error = %e, "Ledger statement failed");
        StockError::Ledger(e.to_string())
    }
}

impl PostgresLedger {
    /// Create a ledger over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `PostgreSQL`.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Ledger`] if the pool cannot connect.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StockError::Ledger(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections, "Connected to PostgreSQL ledger");
        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `products` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Ledger`] if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS products (
                id UUID PRIMARY KEY,
                stock BIGINT NOT NULL CHECK (stock >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(ledger_error("ensure_schema"))?;
        Ok(())
    }

    /// Every product in the ledger, for warming the counter cache.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Ledger`] if the query fails.
    pub async fn product_ids(&self) -> Result<Vec<ProductId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM products ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(ledger_error("product_ids"))?;
        Ok(rows.into_iter().map(|(id,)| ProductId::from_uuid(id)).collect())
    }

    async fn current_stock(&self, product_id: &ProductId) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_error("read_stock"))?;
        Ok(row.map(|(stock,)| stock))
    }
}

impl DurableLedger for PostgresLedger {
    async fn read_stock(&self, product_id: &ProductId) -> Result<i64> {
        self.current_stock(product_id)
            .await?
            .ok_or(StockError::ProductNotFound {
                product_id: *product_id,
            })
    }

    async fn write_stock(&self, product_id: &ProductId, stock: i64) -> Result<()> {
        let result = sqlx::query("UPDATE products SET stock = $2, updated_at = now() WHERE id = $1")
            .bind(product_id.as_uuid())
            .bind(stock)
            .execute(&self.pool)
            .await
            .map_err(ledger_error("write_stock"))?;

        if result.rows_affected() == 0 {
            return Err(StockError::ProductNotFound {
                product_id: *product_id,
            });
        }
        tracing::debug!(product_id = %product_id, stock, "Ledger stock written");
        Ok(())
    }

    async fn decrement_stock(&self, product_id: &ProductId, quantity: u32) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE products
            SET stock = stock - $2, updated_at = now()
            WHERE id = $1 AND stock >= $2
            RETURNING stock
            ",
        )
        .bind(product_id.as_uuid())
        .bind(i64::from(quantity))
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error("decrement_stock"))?;

        if let Some((stock,)) = row {
            return Ok(stock);
        }

        match self.current_stock(product_id).await? {
            Some(available) => Err(StockError::InsufficientStock {
                product_id: *product_id,
                available,
                requested: quantity,
            }),
            None => Err(StockError::ProductNotFound {
                product_id: *product_id,
            }),
        }
    }

    async fn increment_stock(&self, product_id: &ProductId, quantity: u32) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE products
            SET stock = stock + $2, updated_at = now()
            WHERE id = $1
            RETURNING stock
            ",
        )
        .bind(product_id.as_uuid())
        .bind(i64::from(quantity))
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error("increment_stock"))?;

        row.map(|(stock,)| stock).ok_or(StockError::ProductNotFound {
            product_id: *product_id,
        })
    }

    async fn write_stock_many(&self, entries: &[(ProductId, i64)]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(ledger_error("write_stock_many"))?;

        for (product_id, stock) in entries {
            sqlx::query(
                r"
                INSERT INTO products (id, stock, updated_at)
                VALUES ($1, $2, now())
                ON CONFLICT (id) DO UPDATE
                SET stock = EXCLUDED.stock, updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(product_id.as_uuid())
            .bind(*stock)
            .execute(&mut *tx)
            .await
            .map_err(ledger_error("write_stock_many"))?;
        }

        tx.commit().await.map_err(ledger_error("write_stock_many"))?;
        tracing::info!(products = entries.len(), "Ledger bulk write committed");
        Ok(())
    }
}
