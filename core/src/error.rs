//! Error types for stock consistency operations.

use crate::types::{ProductId, ReservationStatus, Resource, UserId};
use thiserror::Error;

/// Result type alias for stock operations.
pub type Result<T> = std::result::Result<T, StockError>;

/// Error taxonomy for the stock consistency engine.
///
/// Contention (`InsufficientStock`, `LockBusy`, `ImportInProgress`) is a
/// steady-state outcome, not a fault: callers are expected to match on it and
/// retry or surface it to the end user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    // ═══════════════════════════════════════════════════════════
    // Reservation Errors
    // ═══════════════════════════════════════════════════════════

    /// Requested more units than are available. No state was changed.
    #[error("Insufficient stock for product {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        /// Product that ran short
        product_id: ProductId,
        /// Units available when the request was evaluated
        available: i64,
        /// Units requested
        requested: u32,
    },

    /// The user already holds a pending reservation for this product.
    #[error("User {user_id} already holds a pending reservation of {quantity} for product {product_id}")]
    ReservationPending {
        /// Holder
        user_id: UserId,
        /// Held product
        product_id: ProductId,
        /// Units held by the existing reservation
        quantity: u32,
    },

    /// No reservation exists for this (user, product) pair.
    #[error("No reservation found for user {user_id} and product {product_id}")]
    ReservationNotFound {
        /// Holder
        user_id: UserId,
        /// Held product
        product_id: ProductId,
    },

    /// The reservation already reached a terminal status.
    #[error("Reservation for user {user_id} and product {product_id} is already {status}")]
    ReservationFinalized {
        /// Holder
        user_id: UserId,
        /// Held product
        product_id: ProductId,
        /// Terminal status it reached
        status: ReservationStatus,
    },

    /// The hold lapsed before confirmation; its units were returned.
    #[error("Reservation for user {user_id} and product {product_id} expired")]
    ReservationExpired {
        /// Holder
        user_id: UserId,
        /// Held product
        product_id: ProductId,
    },

    /// Quantity must be a positive number of units.
    #[error("Invalid quantity: {quantity}")]
    InvalidQuantity {
        /// Rejected quantity
        quantity: i64,
    },

    // ═══════════════════════════════════════════════════════════
    // Locking Errors
    // ═══════════════════════════════════════════════════════════

    /// Another holder owns the lock. Retry later.
    #[error("Another update is in progress for {resource}, please retry")]
    LockBusy {
        /// Contended resource
        resource: Resource,
    },

    /// A bulk import is already running.
    #[error("Another import is in progress")]
    ImportInProgress,

    /// The presented token does not own the lock (it expired and was reassigned).
    #[error("Lock on {resource} is no longer owned by this holder")]
    LockReleaseConflict {
        /// Resource whose lock changed hands
        resource: Resource,
    },

    // ═══════════════════════════════════════════════════════════
    // Ledger / Store Errors
    // ═══════════════════════════════════════════════════════════

    /// The ledger could not be read while rebuilding a missing counter.
    #[error("Failed to resync stock for product {product_id}: {reason}")]
    ResyncFailure {
        /// Product whose counter was missing
        product_id: ProductId,
        /// Underlying failure
        reason: String,
    },

    /// The product does not exist in the ledger.
    #[error("Product {product_id} not found")]
    ProductNotFound {
        /// Unknown product
        product_id: ProductId,
    },

    /// Durable ledger operation failed.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Shared store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid argument or configuration.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StockError {
    /// Returns `true` if retrying the same request may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use stockline_core::{Resource, StockError};
    /// assert!(StockError::LockBusy { resource: Resource::CatalogImport }.is_retryable());
    /// assert!(!StockError::Ledger("down".into()).is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockBusy { .. } | Self::ImportInProgress | Self::ReservationPending { .. }
        )
    }

    /// Returns `true` if this error should be shown to the end user as-is.
    ///
    /// # Examples
    ///
    /// ```
    /// # use stockline_core::{ProductId, StockError};
    /// let err = StockError::InsufficientStock {
    ///     product_id: ProductId::new(),
    ///     available: 0,
    ///     requested: 1,
    /// };
    /// assert!(err.is_user_error());
    /// assert!(!StockError::Store("timeout".into()).is_user_error());
    /// ```
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock { .. }
                | Self::ReservationPending { .. }
                | Self::ReservationExpired { .. }
                | Self::InvalidQuantity { .. }
                | Self::LockBusy { .. }
                | Self::ImportInProgress
                | Self::ProductNotFound { .. }
        )
    }
}
