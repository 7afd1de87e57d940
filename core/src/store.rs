//! Shared store contracts.
//!
//! The fast counter cache and the distributed lock manager live in the same
//! low-latency key-value store. Each method of these traits is one **atomic**
//! operation against that store (a Lua script, a `SET NX PX`, a
//! compare-and-delete). The engine never performs a local read-modify-write on
//! shared state; it only sequences these operations.
//!
//! # Implementations
//!
//! - **Production**: `stockline_redis::RedisStockStore`
//! - **Testing**: `stockline_testing::InMemoryStockStore`

use crate::error::Result;
use crate::types::{LockToken, ProductId, Reservation, Resource, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request to place a hold on stock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoldRequest {
    /// Requesting user
    pub user_id: UserId,
    /// Product to hold
    pub product_id: ProductId,
    /// Units to hold (positive)
    pub quantity: u32,
    /// Time of the request
    pub now: DateTime<Utc>,
    /// When the hold lapses if not confirmed
    pub expires_at: DateTime<Utc>,
    /// How long the record is kept after `expires_at` (or after finalization)
    pub retention: Duration,
}

/// Result of an atomic hold attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HoldResult {
    /// Units decremented from the counter and a pending record written.
    Reserved {
        /// The new pending reservation
        reservation: Reservation,
        /// Counter value after the decrement
        remaining: i64,
    },
    /// Not enough units; nothing was decremented.
    Insufficient {
        /// Counter value at evaluation time
        available: i64,
    },
    /// The pair already has an unexpired pending reservation.
    AlreadyPending(Reservation),
    /// No counter is present for the product; resync first.
    CounterMissing,
}

/// Outcome of [`StockStore::place_hold`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoldOutcome {
    /// What happened to the request
    pub result: HoldResult,
    /// An expired pending reservation of the same pair that was rolled back
    /// as part of the same atomic operation.
    pub reclaimed: Option<Reservation>,
}

/// A ledger read taken to derive a counter.
///
/// `epoch` is the product's settlement epoch read *before* `stock`. A counter
/// is only written from the snapshot if no confirmation settled since then and
/// none is settling now; otherwise the ledger value and the pending set may
/// disagree about a confirmed quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Ledger stock
    pub stock: i64,
    /// Settlement epoch observed before the ledger read
    pub epoch: u64,
    /// Time of the read; settlement leases that lapsed before it are ignored
    pub at: DateTime<Utc>,
}

/// Outcome of seeding a counter from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedOutcome {
    /// The counter was absent and has been written.
    Seeded(i64),
    /// A counter was already present (another caller seeded first); left untouched.
    Present(i64),
    /// The counter is absent but a confirmation settled after the snapshot
    /// or is still settling; nothing was written.
    Settling,
}

impl SeedOutcome {
    /// The counter value now present in the store, if any.
    #[must_use]
    pub const fn value(&self) -> Option<i64> {
        match self {
            Self::Seeded(v) | Self::Present(v) => Some(*v),
            Self::Settling => None,
        }
    }
}

/// Outcome of publishing a counter from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The counter was overwritten with this value.
    Published(i64),
    /// A confirmation settled after the snapshot or is still settling;
    /// the counter was left untouched.
    Settling,
}

/// Whether [`StockStore::release_hold`] applies unconditionally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Roll back any pending reservation (explicit rollback).
    Always,
    /// Roll back only if the hold has lapsed (sweeping).
    IfExpired,
}

/// Outcome of [`StockStore::mark_confirmed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The reservation moved from `pending` to `confirmed`.
    Confirmed(Reservation),
    /// No record for the pair.
    NotFound,
    /// The record was already terminal; nothing changed.
    AlreadyFinal(Reservation),
}

/// Outcome of [`StockStore::release_hold`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The reservation was rolled back.
    Finalized {
        /// Reservation in its new terminal status
        reservation: Reservation,
        /// Counter after restoring units, if a counter was present
        counter: Option<i64>,
    },
    /// No record for the pair.
    NotFound,
    /// The record was already terminal; nothing changed.
    AlreadyFinal(Reservation),
    /// [`ReleaseMode::IfExpired`] and the hold is still live; nothing changed.
    NotExpired(Reservation),
}

/// Key counts per namespace, for health reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCensus {
    /// `stock:*` keys
    pub stock_keys: usize,
    /// `reservation:*` keys
    pub reservation_keys: usize,
    /// `lock:*` keys
    pub lock_keys: usize,
}

/// Counter and reservation operations on the shared store.
///
/// Counters written by [`seed_counter`](Self::seed_counter) and
/// [`publish_counter`](Self::publish_counter) are derived from the ledger value
/// minus the units held by pending reservations of the product, evaluated
/// atomically with the write, so the consistency invariant survives eviction.
///
/// A confirmation changes the ledger and the pending set in two steps. It is
/// bracketed by [`begin_settlement`](Self::begin_settlement) and
/// [`end_settlement`](Self::end_settlement), which both bump the product's
/// settlement epoch; ledger-derived writes refuse to run across either.
pub trait StockStore: Send + Sync {
    /// Read a product counter.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn counter(
        &self,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<Option<i64>>> + Send;

    /// Read many product counters in one round trip (same order as the input).
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn counters(
        &self,
        product_ids: &[ProductId],
    ) -> impl std::future::Future<Output = Result<Vec<Option<i64>>>> + Send;

    /// Current settlement epoch of a product (`0` if none was recorded).
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn settlement_epoch(
        &self,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Register a confirmation of the pair as in flight until `lease_until`
    /// and bump the product's settlement epoch.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn begin_settlement(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Clear the in-flight confirmation of the pair and bump the epoch again.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn end_settlement(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Write the counter only if it is still absent.
    ///
    /// The written value is `snapshot.stock - Σ pending(product)`. If another
    /// caller populated the counter first, its value is returned untouched.
    /// Nothing is written if the settlement epoch moved past
    /// `snapshot.epoch` or a confirmation lease is live.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn seed_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<SeedOutcome>> + Send;

    /// Overwrite the counter from a freshly written ledger value.
    ///
    /// Only called while holding the product lock. Guarded by the settlement
    /// epoch like [`seed_counter`](Self::seed_counter).
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn publish_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<PublishOutcome>> + Send;

    /// Drop a counter so the next access resyncs it.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn invalidate_counter(
        &self,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Atomically check availability, decrement and record a pending reservation.
    ///
    /// An expired pending reservation of the same pair is rolled back first.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn place_hold(
        &self,
        request: &HoldRequest,
    ) -> impl std::future::Future<Output = Result<HoldOutcome>> + Send;

    /// Read a reservation record.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn reservation(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<Option<Reservation>>> + Send;

    /// Transition a pending reservation to `confirmed` (compare-and-set).
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn mark_confirmed(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> impl std::future::Future<Output = Result<ConfirmOutcome>> + Send;

    /// Transition a pending reservation to `rolled_back`, returning its units
    /// to the counter if a counter is present.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn release_hold(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
        mode: ReleaseMode,
    ) -> impl std::future::Future<Output = Result<FinalizeOutcome>> + Send;

    /// All reservation records of a product, any status.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn product_reservations(
        &self,
        product_id: &ProductId,
    ) -> impl std::future::Future<Output = Result<Vec<Reservation>>> + Send;

    /// All reservation records of a user, any status.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn user_reservations(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Reservation>>> + Send;

    /// Products that currently have reservation records.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn reserved_products(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ProductId>>> + Send;

    /// Count keys per namespace.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn census(&self) -> impl std::future::Future<Output = Result<KeyCensus>> + Send;
}

/// Result of a compare-and-delete lock release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The token matched and the lock was deleted.
    Released,
    /// The lock is held under a different token; nothing was deleted.
    NotOwner,
    /// No lock exists (it expired).
    NotHeld,
}

/// Current holder of a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockHolder {
    /// Owner token
    pub token: LockToken,
    /// Remaining lease time, if the store reports one
    pub remaining: Option<Duration>,
}

/// Lease primitives on the shared store.
pub trait LockStore: Send + Sync {
    /// Atomic set-if-absent with expiry. Returns `true` if the lock was taken.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn try_acquire(
        &self,
        resource: &Resource,
        token: &LockToken,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Atomic compare-and-delete.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn release(
        &self,
        resource: &Resource,
        token: &LockToken,
    ) -> impl std::future::Future<Output = Result<ReleaseOutcome>> + Send;

    /// Current holder, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn holder(
        &self,
        resource: &Resource,
    ) -> impl std::future::Future<Output = Result<Option<LockHolder>>> + Send;

    /// Delete a lock regardless of owner. Administrative use only.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`](crate::StockError::Store) if the store is unreachable.
    fn force_release(
        &self,
        resource: &Resource,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}
