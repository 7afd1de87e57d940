//! Reservation coordinator.
//!
//! Checkout goes through three calls:
//!
//! 1. [`reserve`](ReservationCoordinator::reserve) holds units on the fast
//!    counter (resyncing it first if it was evicted),
//! 2. [`confirm`](ReservationCoordinator::confirm) consumes them from the
//!    ledger once the order transaction committed,
//! 3. [`rollback`](ReservationCoordinator::rollback) returns them to the
//!    counter if the order failed.
//!
//! The availability check, the decrement and the pending record are one
//! atomic store operation. Confirm and rollback are compare-and-set
//! transitions out of `pending`, so exactly one of them takes effect.

use crate::config::EngineConfig;
use crate::lock::LockManager;
use crate::metrics::StockMetrics;
use crate::resync::Resync;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use stockline_core::environment::{Clock, deadline};
use stockline_core::ledger::DurableLedger;
use stockline_core::store::{
    ConfirmOutcome, FinalizeOutcome, HoldOutcome, HoldRequest, HoldResult, LockStore,
    ReleaseMode, StockStore,
};
use stockline_core::{
    DateTime, ProductId, Reservation, ReservationStatus, Resource, Result, StockCounter,
    StockError, UserId, Utc,
};

/// A successful reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    /// The pending reservation
    pub reservation: Reservation,
    /// Counter value after the decrement
    pub remaining: i64,
}

/// Outcome of [`ReservationCoordinator::rollback`].
///
/// Every variant is a success: rollback is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Units were returned.
    RolledBack {
        /// Units returned
        quantity: u32,
        /// Counter after the return, or `None` if the counter was evicted
        /// (the next resync accounts for the units)
        remaining: Option<i64>,
    },
    /// No reservation exists for the pair.
    NotFound,
    /// Already rolled back (explicitly or by expiry).
    AlreadyRolledBack,
    /// Already confirmed; the units stay consumed.
    AlreadyConfirmed,
}

impl RollbackOutcome {
    /// Whether this call returned units.
    #[must_use]
    pub const fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

/// Reserves, confirms and rolls back stock holds.
pub struct ReservationCoordinator<S, D> {
    store: Arc<S>,
    ledger: Arc<D>,
    clock: Arc<dyn Clock>,
    resync: Resync<S, D>,
    locks: LockManager<S>,
    config: EngineConfig,
}

impl<S, D> Clone for ReservationCoordinator<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            clock: Arc::clone(&self.clock),
            resync: self.resync.clone(),
            locks: self.locks.clone(),
            config: self.config,
        }
    }
}

impl<S, D> ReservationCoordinator<S, D>
where
    S: StockStore + LockStore,
    D: DurableLedger,
{
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        ledger: Arc<D>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resync: Resync::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&clock),
                config.counter_ttl(),
            ),
            locks: LockManager::new(Arc::clone(&store)),
            store,
            ledger,
            clock,
            config,
        }
    }

    /// Hold `quantity` units of a product for a user.
    ///
    /// A duplicate request while the pair still has a live pending hold is
    /// rejected; an expired pending hold of the pair is rolled back first.
    ///
    /// # Errors
    ///
    /// - Zero quantity → [`StockError::InvalidQuantity`]
    /// - Not enough units → [`StockError::InsufficientStock`] (nothing changed)
    /// - Live pending hold for the pair → [`StockError::ReservationPending`]
    /// - Counter evicted and ledger unreachable → [`StockError::ResyncFailure`]
    /// - Unknown product → [`StockError::ProductNotFound`]
    /// - With `reserve_under_lock`, product lock held → [`StockError::LockBusy`]
    /// - Store unreachable → [`StockError::Store`]
    pub async fn reserve(
        &self,
        product_id: ProductId,
        user_id: UserId,
        quantity: u32,
    ) -> Result<Reserved> {
        if quantity == 0 {
            return Err(StockError::InvalidQuantity { quantity: 0 });
        }
        let started = Instant::now();

        let result = if self.config.reserve_under_lock {
            let lease = self
                .locks
                .acquire(Resource::Product(product_id), self.config.lock_ttl())
                .await?;
            let result = self.place(product_id, user_id, quantity).await;
            self.locks.release_lease(&lease).await;
            result
        } else {
            self.place(product_id, user_id, quantity).await
        };

        let outcome = match &result {
            Ok(_) => "reserved",
            Err(StockError::InsufficientStock { .. }) => "insufficient",
            Err(StockError::ReservationPending { .. }) => "pending",
            Err(_) => "error",
        };
        StockMetrics::record_reserve(outcome, started.elapsed());
        result
    }

    async fn place(&self, product_id: ProductId, user_id: UserId, quantity: u32) -> Result<Reserved> {
        let now = self.clock.now();
        let request = HoldRequest {
            user_id,
            product_id,
            quantity,
            now,
            expires_at: deadline(now, self.config.hold()),
            retention: self.config.retention(),
        };

        let mut outcome = self.hold(&request).await?;
        if outcome == HoldResult::CounterMissing {
            self.resync.resync(&product_id).await?;
            outcome = self.hold(&request).await?;
        }

        match outcome {
            HoldResult::Reserved {
                reservation,
                remaining,
            } => {
                tracing::info!(
                    product_id = %product_id,
                    user_id = %user_id,
                    quantity,
                    remaining,
                    expires_at = %reservation.expires_at,
                    "Stock reserved"
                );
                Ok(Reserved {
                    reservation,
                    remaining,
                })
            },
            HoldResult::Insufficient { available } => {
                tracing::info!(
                    product_id = %product_id,
                    user_id = %user_id,
                    requested = quantity,
                    available,
                    "Insufficient stock"
                );
                Err(StockError::InsufficientStock {
                    product_id,
                    available,
                    requested: quantity,
                })
            },
            HoldResult::AlreadyPending(existing) => {
                tracing::warn!(
                    product_id = %product_id,
                    user_id = %user_id,
                    held = existing.quantity,
                    expires_at = %existing.expires_at,
                    "Duplicate reservation rejected"
                );
                Err(StockError::ReservationPending {
                    user_id,
                    product_id,
                    quantity: existing.quantity,
                })
            },
            HoldResult::CounterMissing => Err(StockError::ResyncFailure {
                product_id,
                reason: "counter evicted again right after resync".to_string(),
            }),
        }
    }

    async fn hold(&self, request: &HoldRequest) -> Result<HoldResult> {
        let HoldOutcome { result, reclaimed } = self.store.place_hold(request).await?;
        if let Some(reclaimed) = reclaimed {
            StockMetrics::record_reclaimed(1);
            tracing::warn!(
                product_id = %reclaimed.product_id,
                user_id = %reclaimed.user_id,
                quantity = reclaimed.quantity,
                expired_at = %reclaimed.expires_at,
                "Expired reservation reclaimed"
            );
        }
        Ok(result)
    }

    /// Consume a pending reservation from the ledger.
    ///
    /// If the ledger decrement fails the reservation stays pending and the
    /// caller must [`rollback`](Self::rollback).
    ///
    /// # Errors
    ///
    /// - No record → [`StockError::ReservationNotFound`]
    /// - Already confirmed or rolled back → [`StockError::ReservationFinalized`]
    /// - Hold lapsed → [`StockError::ReservationExpired`] (units returned)
    /// - Ledger failure → [`StockError::Ledger`] or [`StockError::InsufficientStock`]
    /// - Store unreachable → [`StockError::Store`]
    pub async fn confirm(&self, user_id: UserId, product_id: ProductId) -> Result<Reservation> {
        let result = self.try_confirm(user_id, product_id).await;
        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(StockError::ReservationExpired { .. }) => "expired",
            Err(StockError::ReservationNotFound { .. } | StockError::ReservationFinalized { .. }) => {
                "rejected"
            },
            Err(StockError::Ledger(_) | StockError::InsufficientStock { .. }) => "ledger_failed",
            Err(_) => "error",
        };
        StockMetrics::record_confirm(outcome);
        result
    }

    async fn try_confirm(&self, user_id: UserId, product_id: ProductId) -> Result<Reservation> {
        let now = self.clock.now();
        let reservation = self
            .store
            .reservation(&user_id, &product_id)
            .await?
            .ok_or(StockError::ReservationNotFound {
                user_id,
                product_id,
            })?;

        if reservation.status.is_terminal() {
            return Err(StockError::ReservationFinalized {
                user_id,
                product_id,
                status: reservation.status,
            });
        }

        if reservation.is_expired(now) {
            let released = self
                .store
                .release_hold(
                    &user_id,
                    &product_id,
                    now,
                    self.config.retention(),
                    ReleaseMode::IfExpired,
                )
                .await?;
            if matches!(released, FinalizeOutcome::Finalized { .. }) {
                StockMetrics::record_reclaimed(1);
            }
            tracing::warn!(
                product_id = %product_id,
                user_id = %user_id,
                quantity = reservation.quantity,
                expired_at = %reservation.expires_at,
                "Confirmation of expired reservation refused"
            );
            return Err(StockError::ReservationExpired {
                user_id,
                product_id,
            });
        }

        let lease_until = deadline(now, self.config.lock_ttl());
        self.store
            .begin_settlement(&user_id, &product_id, lease_until)
            .await?;
        let result = self.settle(&reservation, now).await;
        if let Err(e) = self.store.end_settlement(&user_id, &product_id).await {
            tracing::warn!(
                product_id = %product_id,
                user_id = %user_id,
                error = %e,
                "Failed to end settlement; counter writes wait for its lease"
            );
        }
        result
    }

    /// Decrement the ledger and mark the record confirmed, compensating the
    /// ledger if the record left `pending` in the meantime. Runs inside a
    /// settlement so no counter is derived from the ledger half-way through.
    async fn settle(&self, reservation: &Reservation, now: DateTime<Utc>) -> Result<Reservation> {
        let (user_id, product_id) = (reservation.user_id, reservation.product_id);
        let ledger_stock = self
            .ledger
            .decrement_stock(&product_id, reservation.quantity)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    product_id = %product_id,
                    user_id = %user_id,
                    quantity = reservation.quantity,
                    error = %e,
                    "Ledger decrement failed; reservation left pending"
                );
            })?;

        let marked = self
            .store
            .mark_confirmed(&user_id, &product_id, now, self.config.retention())
            .await;

        let failure = match marked {
            Ok(ConfirmOutcome::Confirmed(reservation)) => {
                tracing::info!(
                    product_id = %product_id,
                    user_id = %user_id,
                    quantity = reservation.quantity,
                    ledger_stock,
                    "Reservation confirmed"
                );
                return Ok(reservation);
            },
            Ok(ConfirmOutcome::NotFound) => StockError::ReservationNotFound {
                user_id,
                product_id,
            },
            Ok(ConfirmOutcome::AlreadyFinal(current)) => StockError::ReservationFinalized {
                user_id,
                product_id,
                status: current.status,
            },
            Err(e) => match self.store.reservation(&user_id, &product_id).await {
                // The transition landed before the connection failed.
                Ok(Some(current)) if current.status == ReservationStatus::Confirmed => {
                    return Ok(current);
                },
                _ => e,
            },
        };

        self.compensate(&product_id, reservation.quantity).await;
        Err(failure)
    }

    async fn compensate(&self, product_id: &ProductId, quantity: u32) {
        match self.ledger.increment_stock(product_id, quantity).await {
            Ok(stock) => {
                tracing::warn!(
                    product_id = %product_id,
                    quantity,
                    ledger_stock = stock,
                    "Confirmation lost its race; ledger decrement compensated"
                );
            },
            Err(e) => {
                tracing::error!(
                    product_id = %product_id,
                    quantity,
                    error = %e,
                    "Failed to compensate ledger decrement; ledger is short by quantity"
                );
            },
        }
    }

    /// Return the units of a pending reservation to the counter.
    ///
    /// Idempotent: an unknown, confirmed or already rolled back reservation is
    /// a no-op reported through [`RollbackOutcome`]. The ledger is never touched.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn rollback(&self, user_id: UserId, product_id: ProductId) -> Result<RollbackOutcome> {
        let now = self.clock.now();
        let released = self
            .store
            .release_hold(
                &user_id,
                &product_id,
                now,
                self.config.retention(),
                ReleaseMode::Always,
            )
            .await?;

        let outcome = match released {
            FinalizeOutcome::Finalized {
                reservation,
                counter,
            } => {
                tracing::info!(
                    product_id = %product_id,
                    user_id = %user_id,
                    quantity = reservation.quantity,
                    remaining = ?counter,
                    "Reservation rolled back"
                );
                RollbackOutcome::RolledBack {
                    quantity: reservation.quantity,
                    remaining: counter,
                }
            },
            FinalizeOutcome::NotFound => RollbackOutcome::NotFound,
            FinalizeOutcome::AlreadyFinal(current) if current.status == ReservationStatus::Confirmed => {
                RollbackOutcome::AlreadyConfirmed
            },
            FinalizeOutcome::AlreadyFinal(_) | FinalizeOutcome::NotExpired(_) => {
                RollbackOutcome::AlreadyRolledBack
            },
        };

        StockMetrics::record_rollback(if outcome.is_rolled_back() {
            "rolled_back"
        } else {
            "noop"
        });
        if !outcome.is_rolled_back() {
            tracing::debug!(
                product_id = %product_id,
                user_id = %user_id,
                outcome = ?outcome,
                "Rollback had nothing to return"
            );
        }
        Ok(outcome)
    }

    /// Reserve every line of an order, all or nothing.
    ///
    /// Lines for the same product are merged. On the first failure every
    /// reservation already made for this order is rolled back and the failure
    /// is returned.
    ///
    /// # Errors
    ///
    /// Any error of [`reserve`](Self::reserve) for the failing line.
    pub async fn reserve_order(
        &self,
        user_id: UserId,
        items: &[(ProductId, u32)],
    ) -> Result<Vec<Reserved>> {
        let lines = merge_lines(items)?;
        let mut reserved = Vec::with_capacity(lines.len());

        for (product_id, quantity) in lines {
            match self.reserve(product_id, user_id, quantity).await {
                Ok(r) => reserved.push(r),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        failed_product = %product_id,
                        undone = reserved.len(),
                        error = %e,
                        "Order reservation failed; undoing reserved lines"
                    );
                    for done in &reserved {
                        if let Err(undo) = self.rollback(user_id, done.reservation.product_id).await {
                            tracing::error!(
                                user_id = %user_id,
                                product_id = %done.reservation.product_id,
                                error = %undo,
                                "Failed to undo order line; the sweeper will reclaim it"
                            );
                        }
                    }
                    return Err(e);
                },
            }
        }
        Ok(reserved)
    }

    /// Roll back the reservations of an order.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn rollback_order(
        &self,
        user_id: UserId,
        product_ids: &[ProductId],
    ) -> Result<Vec<RollbackOutcome>> {
        let mut outcomes = Vec::with_capacity(product_ids.len());
        for product_id in product_ids {
            outcomes.push(self.rollback(user_id, *product_id).await?);
        }
        Ok(outcomes)
    }

    /// Units currently available for a product, resyncing a missing counter.
    ///
    /// # Errors
    ///
    /// - Ledger unreachable on a miss → [`StockError::ResyncFailure`]
    /// - Unknown product → [`StockError::ProductNotFound`]
    /// - Store unreachable → [`StockError::Store`]
    pub async fn available(&self, product_id: ProductId) -> Result<StockCounter> {
        match self.store.counter(&product_id).await? {
            Some(quantity) => Ok(StockCounter::cached(product_id, quantity)),
            None => self.resync.resync(&product_id).await,
        }
    }

    /// Units available for many products in one round trip; misses are resynced.
    ///
    /// # Errors
    ///
    /// Same as [`available`](Self::available), for the first product that fails.
    pub async fn available_many(&self, product_ids: &[ProductId]) -> Result<Vec<StockCounter>> {
        let cached = self.store.counters(product_ids).await?;
        let mut counters = Vec::with_capacity(product_ids.len());

        for (product_id, quantity) in product_ids.iter().zip(cached) {
            counters.push(match quantity {
                Some(quantity) => StockCounter::cached(*product_id, quantity),
                None => self.resync.resync(product_id).await?,
            });
        }
        Ok(counters)
    }
}

fn merge_lines(items: &[(ProductId, u32)]) -> Result<Vec<(ProductId, u32)>> {
    let mut order: Vec<ProductId> = Vec::with_capacity(items.len());
    let mut totals: HashMap<ProductId, u32> = HashMap::with_capacity(items.len());

    for (product_id, quantity) in items {
        if *quantity == 0 {
            return Err(StockError::InvalidQuantity { quantity: 0 });
        }
        let total = totals.entry(*product_id).or_insert_with(|| {
            order.push(*product_id);
            0
        });
        *total = total.checked_add(*quantity).ok_or(StockError::InvalidQuantity {
            quantity: i64::from(*total) + i64::from(*quantity),
        })?;
    }

    Ok(order
        .into_iter()
        .map(|product_id| (product_id, totals.get(&product_id).copied().unwrap_or_default()))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};

    struct Fixture {
        coordinator: ReservationCoordinator<InMemoryStockStore, InMemoryLedger>,
        store: Arc<InMemoryStockStore>,
        ledger: Arc<InMemoryLedger>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStockStore::new(Arc::new(clock.clone())));
        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = ReservationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        );
        Fixture {
            coordinator,
            store,
            ledger,
            clock,
        }
    }

    #[test]
    fn merge_lines_sums_duplicates_in_first_seen_order() {
        let (a, b) = (ProductId::new(), ProductId::new());

        let lines = merge_lines(&[(a, 1), (b, 2), (a, 3)]).unwrap();

        assert_eq!(lines, vec![(a, 4), (b, 2)]);
    }

    #[test]
    fn merge_lines_rejects_zero() {
        assert_eq!(
            merge_lines(&[(ProductId::new(), 0)]),
            Err(StockError::InvalidQuantity { quantity: 0 })
        );
    }

    #[tokio::test]
    async fn reserve_rejects_zero_quantity() {
        let f = fixture();

        let result = f.coordinator.reserve(ProductId::new(), UserId::new(), 0).await;

        assert_eq!(result, Err(StockError::InvalidQuantity { quantity: 0 }));
    }

    #[tokio::test]
    async fn duplicate_pending_reserve_is_rejected() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);

        f.coordinator.reserve(product, user, 2).await.unwrap();
        let second = f.coordinator.reserve(product, user, 3).await;

        assert_eq!(
            second,
            Err(StockError::ReservationPending {
                user_id: user,
                product_id: product,
                quantity: 2,
            })
        );
        assert_eq!(f.store.counter_value(&product), Some(8));
    }

    #[tokio::test]
    async fn expired_hold_is_reclaimed_by_next_reserve() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);

        f.coordinator.reserve(product, user, 4).await.unwrap();
        f.clock.advance(Duration::from_secs(16 * 60));
        let again = f.coordinator.reserve(product, user, 1).await.unwrap();

        assert_eq!(again.remaining, 9);
        assert_eq!(f.store.pending_units(&product), 1);
    }

    #[tokio::test]
    async fn confirm_decrements_ledger_once() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, user, 3).await.unwrap();

        let confirmed = f.coordinator.confirm(user, product).await.unwrap();
        let again = f.coordinator.confirm(user, product).await;

        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert!(matches!(
            again,
            Err(StockError::ReservationFinalized {
                status: ReservationStatus::Confirmed,
                ..
            })
        ));
        assert_eq!(f.ledger.stock(&product), Some(7));
        assert_eq!(f.store.counter_value(&product), Some(7));
    }

    #[tokio::test]
    async fn confirm_unknown_reservation_is_an_error() {
        let f = fixture();

        let result = f.coordinator.confirm(UserId::new(), ProductId::new()).await;

        assert!(matches!(result, Err(StockError::ReservationNotFound { .. })));
    }

    #[tokio::test]
    async fn failed_ledger_decrement_leaves_reservation_pending() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, user, 3).await.unwrap();
        f.ledger.fail_next_writes(1);

        let result = f.coordinator.confirm(user, product).await;

        assert!(matches!(result, Err(StockError::Ledger(_))));
        assert!(f.store.reservation_record(&user, &product).unwrap().is_pending());

        let rolled_back = f.coordinator.rollback(user, product).await.unwrap();
        assert_eq!(
            rolled_back,
            RollbackOutcome::RolledBack {
                quantity: 3,
                remaining: Some(10),
            }
        );
        assert_eq!(f.ledger.stock(&product), Some(10));
    }

    #[tokio::test]
    async fn confirm_after_expiry_returns_units() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, user, 3).await.unwrap();
        f.clock.advance(Duration::from_secs(15 * 60));

        let result = f.coordinator.confirm(user, product).await;

        assert!(matches!(result, Err(StockError::ReservationExpired { .. })));
        assert_eq!(f.store.counter_value(&product), Some(10));
        assert_eq!(f.ledger.stock(&product), Some(10));
    }

    #[tokio::test]
    async fn rollback_after_confirm_is_a_noop() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, user, 3).await.unwrap();
        f.coordinator.confirm(user, product).await.unwrap();

        let outcome = f.coordinator.rollback(user, product).await.unwrap();

        assert_eq!(outcome, RollbackOutcome::AlreadyConfirmed);
        assert_eq!(f.store.counter_value(&product), Some(7));
    }

    #[tokio::test]
    async fn rollback_without_counter_leaves_it_to_resync() {
        let f = fixture();
        let (product, user) = (ProductId::new(), UserId::new());
        f.ledger.insert(product, 10);
        f.store.set_counter(product, 10);
        f.coordinator.reserve(product, user, 3).await.unwrap();
        f.store.evict_counter(&product);

        let outcome = f.coordinator.rollback(user, product).await.unwrap();
        let available = f.coordinator.available(product).await.unwrap();

        assert_eq!(
            outcome,
            RollbackOutcome::RolledBack {
                quantity: 3,
                remaining: None,
            }
        );
        assert_eq!(available.quantity, 10);
    }

    #[tokio::test]
    async fn failed_order_line_undoes_earlier_lines() {
        let f = fixture();
        let user = UserId::new();
        let (plenty, scarce) = (ProductId::new(), ProductId::new());
        f.ledger.insert(plenty, 10);
        f.ledger.insert(scarce, 1);
        f.store.set_counter(plenty, 10);
        f.store.set_counter(scarce, 1);

        let result = f
            .coordinator
            .reserve_order(user, &[(plenty, 2), (scarce, 2)])
            .await;

        assert!(matches!(result, Err(StockError::InsufficientStock { .. })));
        assert_eq!(f.store.counter_value(&plenty), Some(10));
        assert_eq!(f.store.counter_value(&scarce), Some(1));
        assert_eq!(
            f.store.reservation_record(&user, &plenty).unwrap().status,
            ReservationStatus::RolledBack
        );
    }

    #[tokio::test]
    async fn available_many_resyncs_misses() {
        let f = fixture();
        let (cached, evicted) = (ProductId::new(), ProductId::new());
        f.ledger.insert(cached, 10);
        f.ledger.insert(evicted, 20);
        f.store.set_counter(cached, 8);

        let counters = f.coordinator.available_many(&[cached, evicted]).await.unwrap();

        assert_eq!(
            counters,
            vec![
                StockCounter::cached(cached, 8),
                StockCounter::resynced(evicted, 20),
            ]
        );
    }

    #[tokio::test]
    async fn reserve_under_lock_fails_fast_while_admin_holds_product() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStockStore::new(Arc::new(clock.clone())));
        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = ReservationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::new(clock),
            EngineConfig::default().with_reserve_under_lock(true),
        );
        let product = ProductId::new();
        ledger.insert(product, 10);
        store.set_counter(product, 10);
        let locks = LockManager::new(Arc::clone(&store));
        let _admin = locks
            .acquire(Resource::Product(product), Duration::from_secs(5))
            .await
            .unwrap();

        let result = coordinator.reserve(product, UserId::new(), 1).await;

        assert_eq!(
            result,
            Err(StockError::LockBusy {
                resource: Resource::Product(product),
            })
        );
        assert_eq!(store.counter_value(&product), Some(10));
    }
}
