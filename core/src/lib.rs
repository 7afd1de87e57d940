//! # Stockline Core
//!
//! Core types and traits for the Stockline stock consistency engine.
//!
//! Stockline keeps a durable per-product stock ledger (a relational table, the
//! system of record) synchronized with a shared low-latency counter cache that
//! gates checkout. This crate holds everything the engine and its adapters share:
//!
//! - **Types**: product/user identifiers, counters, reservations, lock leases
//! - **Errors**: the [`StockError`] taxonomy and the crate-wide [`Result`] alias
//! - **Environment**: the [`Clock`](environment::Clock) abstraction
//! - **Store traits**: [`StockStore`](store::StockStore) and
//!   [`LockStore`](store::LockStore), the atomic contracts of the shared cache
//! - **Ledger trait**: [`DurableLedger`](ledger::DurableLedger)
//!
//! ## Cache layout
//!
//! ```text
//! stock:<productId>                  integer counter (available units)
//! reservation:<userId>:<productId>   reservation record (status, quantity, timestamps)
//! reservation-index:<productId>      set of user ids holding a record for the product
//! lock:<resource>                    owner token, with TTL
//! ```
//!
//! ## Consistency invariant
//!
//! ```text
//! ledger.stock(p) == counter(p) + Σ pending_reservations(p)
//! ```
//!
//! Every store implementation must keep this true for each atomic operation it
//! performs; the engine only composes those atomic operations.

pub mod environment;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{Result, StockError};
pub use types::{
    CounterSource, LockToken, ProductId, Reservation, ReservationStatus, Resource, StockCounter,
    UserId,
};
