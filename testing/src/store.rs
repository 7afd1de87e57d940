//! In-memory shared store.
//!
//! Every trait method runs under a single mutex, which gives it the same
//! all-or-nothing behaviour a Lua script has on a Redis server. Key expiry is
//! evaluated against the injected clock, so tests can evict counters, lapse
//! holds and expire lock leases by advancing a [`ManualClock`](crate::ManualClock).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stockline_core::environment::{Clock, deadline};
use stockline_core::store::{
    ConfirmOutcome, FinalizeOutcome, HoldOutcome, HoldRequest, HoldResult, KeyCensus,
    LedgerSnapshot, LockHolder, LockStore, PublishOutcome, ReleaseMode, ReleaseOutcome,
    SeedOutcome, StockStore,
};
use stockline_core::{
    LockToken, ProductId, Reservation, ReservationStatus, Resource, Result, StockError, UserId,
};

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Entry<T> {
    const fn new(value: T, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Settlement {
    epoch: u64,
    in_flight: HashMap<UserId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<ProductId, Entry<i64>>,
    reservations: HashMap<(UserId, ProductId), Entry<Reservation>>,
    index: HashMap<ProductId, HashSet<UserId>>,
    settlements: HashMap<ProductId, Settlement>,
    locks: HashMap<Resource, Entry<LockToken>>,
}

impl State {
    /// No confirmation settled since `snapshot` and none is in flight.
    fn is_settled(&mut self, product_id: &ProductId, snapshot: &LedgerSnapshot) -> bool {
        let Some(settlement) = self.settlements.get_mut(product_id) else {
            return snapshot.epoch == 0;
        };
        settlement.in_flight.retain(|_, until| *until > snapshot.at);
        settlement.epoch == snapshot.epoch && settlement.in_flight.is_empty()
    }

    fn counter(&mut self, product_id: &ProductId, now: DateTime<Utc>) -> Option<i64> {
        if self.counters.get(product_id).is_some_and(|e| !e.is_live(now)) {
            self.counters.remove(product_id);
        }
        self.counters.get(product_id).map(|e| e.value)
    }

    fn reservation(
        &mut self,
        user_id: &UserId,
        product_id: &ProductId,
        now: DateTime<Utc>,
    ) -> Option<Reservation> {
        let key = (*user_id, *product_id);
        if self.reservations.get(&key).is_some_and(|e| !e.is_live(now)) {
            self.reservations.remove(&key);
        }
        self.reservations.get(&key).map(|e| e.value.clone())
    }

    fn put_reservation(&mut self, reservation: Reservation, expires_at: DateTime<Utc>) {
        self.index
            .entry(reservation.product_id)
            .or_default()
            .insert(reservation.user_id);
        self.reservations.insert(
            (reservation.user_id, reservation.product_id),
            Entry::new(reservation, Some(expires_at)),
        );
    }

    fn product_reservations(
        &mut self,
        product_id: &ProductId,
        now: DateTime<Utc>,
    ) -> Vec<Reservation> {
        let users: Vec<UserId> = self
            .index
            .get(product_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut found = Vec::with_capacity(users.len());
        for user_id in users {
            match self.reservation(&user_id, product_id, now) {
                Some(reservation) => found.push(reservation),
                None => {
                    if let Some(set) = self.index.get_mut(product_id) {
                        set.remove(&user_id);
                    }
                },
            }
        }
        if self.index.get(product_id).is_some_and(HashSet::is_empty) {
            self.index.remove(product_id);
        }
        found
    }

    fn pending_total(&mut self, product_id: &ProductId, now: DateTime<Utc>) -> i64 {
        self.product_reservations(product_id, now)
            .iter()
            .filter(|r| r.is_pending())
            .map(|r| i64::from(r.quantity))
            .sum()
    }

    /// Return units to a counter that is still present.
    fn restore_units(
        &mut self,
        product_id: &ProductId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        self.counter(product_id, now)?;
        let entry = self.counters.get_mut(product_id)?;
        entry.value += i64::from(quantity);
        Some(entry.value)
    }

    fn roll_back(
        &mut self,
        mut reservation: Reservation,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> (Reservation, Option<i64>) {
        let counter = self.restore_units(&reservation.product_id, reservation.quantity, now);
        reservation.status = ReservationStatus::RolledBack;
        reservation.finalized_at = Some(now);
        self.put_reservation(reservation.clone(), deadline(now, retention));
        (reservation, counter)
    }

    fn lock(&mut self, resource: &Resource, now: DateTime<Utc>) -> Option<(LockToken, DateTime<Utc>)> {
        if self.locks.get(resource).is_some_and(|e| !e.is_live(now)) {
            self.locks.remove(resource);
        }
        self.locks
            .get(resource)
            .map(|e| (e.value, e.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC)))
    }
}

/// In-memory implementation of [`StockStore`] and [`LockStore`].
///
/// Clones share the same state, like several connections to one server.
#[derive(Clone)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStockStore {
    /// Create an empty store whose key expiry follows `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StockError::Store("in-memory store unavailable".to_string()));
        }
        Ok(())
    }

    /// Make every subsequent operation fail (simulates an outage).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a counter directly, without TTL (test setup).
    pub fn set_counter(&self, product_id: ProductId, value: i64) {
        self.state()
            .counters
            .insert(product_id, Entry::new(value, None));
    }

    /// Drop a counter as a cache eviction would.
    pub fn evict_counter(&self, product_id: &ProductId) {
        self.state().counters.remove(product_id);
    }

    /// Current counter value, honoring expiry.
    #[must_use]
    pub fn counter_value(&self, product_id: &ProductId) -> Option<i64> {
        let now = self.clock.now();
        self.state().counter(product_id, now)
    }

    /// Current reservation record, honoring expiry.
    #[must_use]
    pub fn reservation_record(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> Option<Reservation> {
        let now = self.clock.now();
        self.state().reservation(user_id, product_id, now)
    }

    /// Units held by pending reservations of a product.
    #[must_use]
    pub fn pending_units(&self, product_id: &ProductId) -> i64 {
        let now = self.clock.now();
        self.state().pending_total(product_id, now)
    }

    /// Confirmations of a product currently registered as in flight.
    #[must_use]
    pub fn settlements_in_flight(&self, product_id: &ProductId) -> usize {
        self.state()
            .settlements
            .get(product_id)
            .map_or(0, |s| s.in_flight.len())
    }

    /// Current owner token of a lock, honoring expiry.
    #[must_use]
    pub fn lock_token(&self, resource: &Resource) -> Option<LockToken> {
        let now = self.clock.now();
        self.state().lock(resource, now).map(|(token, _)| token)
    }
}

impl StockStore for InMemoryStockStore {
    async fn counter(&self, product_id: &ProductId) -> Result<Option<i64>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self.state().counter(product_id, now))
    }

    async fn counters(&self, product_ids: &[ProductId]) -> Result<Vec<Option<i64>>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();
        Ok(product_ids.iter().map(|p| state.counter(p, now)).collect())
    }

    async fn settlement_epoch(&self, product_id: &ProductId) -> Result<u64> {
        self.check_available()?;
        Ok(self
            .state()
            .settlements
            .get(product_id)
            .map_or(0, |s| s.epoch))
    }

    async fn begin_settlement(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        lease_until: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state();
        let settlement = state.settlements.entry(*product_id).or_default();
        settlement.epoch += 1;
        settlement.in_flight.insert(*user_id, lease_until);
        Ok(())
    }

    async fn end_settlement(&self, user_id: &UserId, product_id: &ProductId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state();
        let settlement = state.settlements.entry(*product_id).or_default();
        settlement.epoch += 1;
        settlement.in_flight.remove(user_id);
        Ok(())
    }

    async fn seed_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> Result<SeedOutcome> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();

        if let Some(current) = state.counter(product_id, now) {
            return Ok(SeedOutcome::Present(current));
        }
        if !state.is_settled(product_id, snapshot) {
            return Ok(SeedOutcome::Settling);
        }

        let value = snapshot.stock - state.pending_total(product_id, now);
        state
            .counters
            .insert(*product_id, Entry::new(value, Some(deadline(now, ttl))));
        Ok(SeedOutcome::Seeded(value))
    }

    async fn publish_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> Result<PublishOutcome> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();

        if !state.is_settled(product_id, snapshot) {
            return Ok(PublishOutcome::Settling);
        }

        let value = snapshot.stock - state.pending_total(product_id, now);
        state
            .counters
            .insert(*product_id, Entry::new(value, Some(deadline(now, ttl))));
        Ok(PublishOutcome::Published(value))
    }

    async fn invalidate_counter(&self, product_id: &ProductId) -> Result<bool> {
        self.check_available()?;
        Ok(self.state().counters.remove(product_id).is_some())
    }

    async fn place_hold(&self, request: &HoldRequest) -> Result<HoldOutcome> {
        self.check_available()?;
        let now = request.now;
        let mut state = self.state();

        let mut reclaimed = None;
        if let Some(existing) = state.reservation(&request.user_id, &request.product_id, now) {
            if existing.is_pending() {
                if existing.expires_at > now {
                    return Ok(HoldOutcome {
                        result: HoldResult::AlreadyPending(existing),
                        reclaimed: None,
                    });
                }
                let (rolled_back, _) = state.roll_back(existing, now, request.retention);
                reclaimed = Some(rolled_back);
            }
        }

        let Some(current) = state.counter(&request.product_id, now) else {
            return Ok(HoldOutcome {
                result: HoldResult::CounterMissing,
                reclaimed,
            });
        };

        if current < i64::from(request.quantity) {
            return Ok(HoldOutcome {
                result: HoldResult::Insufficient { available: current },
                reclaimed,
            });
        }

        let remaining = current - i64::from(request.quantity);
        if let Some(entry) = state.counters.get_mut(&request.product_id) {
            entry.value = remaining;
        }

        let reservation = Reservation::pending(
            request.user_id,
            request.product_id,
            request.quantity,
            now,
            request.expires_at,
        );
        state.put_reservation(
            reservation.clone(),
            deadline(request.expires_at, request.retention),
        );

        Ok(HoldOutcome {
            result: HoldResult::Reserved {
                reservation,
                remaining,
            },
            reclaimed,
        })
    }

    async fn reservation(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> Result<Option<Reservation>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self.state().reservation(user_id, product_id, now))
    }

    async fn mark_confirmed(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ConfirmOutcome> {
        self.check_available()?;
        let mut state = self.state();

        let Some(mut reservation) = state.reservation(user_id, product_id, at) else {
            return Ok(ConfirmOutcome::NotFound);
        };
        if !reservation.is_pending() {
            return Ok(ConfirmOutcome::AlreadyFinal(reservation));
        }

        reservation.status = ReservationStatus::Confirmed;
        reservation.finalized_at = Some(at);
        state.put_reservation(reservation.clone(), deadline(at, retention));

        Ok(ConfirmOutcome::Confirmed(reservation))
    }

    async fn release_hold(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
        mode: ReleaseMode,
    ) -> Result<FinalizeOutcome> {
        self.check_available()?;
        let mut state = self.state();

        let Some(reservation) = state.reservation(user_id, product_id, at) else {
            return Ok(FinalizeOutcome::NotFound);
        };
        if !reservation.is_pending() {
            return Ok(FinalizeOutcome::AlreadyFinal(reservation));
        }
        if mode == ReleaseMode::IfExpired && reservation.expires_at > at {
            return Ok(FinalizeOutcome::NotExpired(reservation));
        }

        let (reservation, counter) = state.roll_back(reservation, at, retention);
        Ok(FinalizeOutcome::Finalized {
            reservation,
            counter,
        })
    }

    async fn product_reservations(&self, product_id: &ProductId) -> Result<Vec<Reservation>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self.state().product_reservations(product_id, now))
    }

    async fn user_reservations(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        self.check_available()?;
        let now = self.clock.now();
        let state = self.state();
        Ok(state
            .reservations
            .iter()
            .filter(|((user, _), entry)| user == user_id && entry.is_live(now))
            .map(|(_, entry)| entry.value.clone())
            .collect())
    }

    async fn reserved_products(&self) -> Result<Vec<ProductId>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();
        let products: Vec<ProductId> = state.index.keys().copied().collect();
        Ok(products
            .into_iter()
            .filter(|p| !state.product_reservations(p, now).is_empty())
            .collect())
    }

    async fn census(&self) -> Result<KeyCensus> {
        self.check_available()?;
        let now = self.clock.now();
        let state = self.state();
        Ok(KeyCensus {
            stock_keys: state.counters.values().filter(|e| e.is_live(now)).count(),
            reservation_keys: state.reservations.values().filter(|e| e.is_live(now)).count(),
            lock_keys: state.locks.values().filter(|e| e.is_live(now)).count(),
        })
    }
}

impl LockStore for InMemoryStockStore {
    async fn try_acquire(
        &self,
        resource: &Resource,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();

        if state.lock(resource, now).is_some() {
            return Ok(false);
        }
        state
            .locks
            .insert(*resource, Entry::new(*token, Some(deadline(now, ttl))));
        Ok(true)
    }

    async fn release(&self, resource: &Resource, token: &LockToken) -> Result<ReleaseOutcome> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();

        match state.lock(resource, now) {
            None => Ok(ReleaseOutcome::NotHeld),
            Some((owner, _)) if owner == *token => {
                state.locks.remove(resource);
                Ok(ReleaseOutcome::Released)
            },
            Some(_) => Ok(ReleaseOutcome::NotOwner),
        }
    }

    async fn holder(&self, resource: &Resource) -> Result<Option<LockHolder>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .state()
            .lock(resource, now)
            .map(|(token, expires_at)| LockHolder {
                token,
                remaining: (expires_at - now).to_std().ok(),
            }))
    }

    async fn force_release(&self, resource: &Resource) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state();
        let held = state.lock(resource, now).is_some();
        state.locks.remove(resource);
        Ok(held)
    }
}
