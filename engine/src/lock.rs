//! Distributed lock manager.
//!
//! Short-lived, owner-tokened leases on top of the shared store. Acquisition is
//! a single set-if-absent-with-expiry and never waits: a held resource fails
//! fast with [`StockError::LockBusy`]. Release is a compare-and-delete on the
//! owner token, so a holder whose lease expired can never delete the lock of
//! whoever took the resource next.

use crate::metrics::StockMetrics;
use std::sync::Arc;
use std::time::Duration;
use stockline_core::environment::millis;
use stockline_core::store::{LockHolder, LockStore, ReleaseOutcome};
use stockline_core::{LockToken, Resource, Result, StockError};

/// A lease on a resource, proof of ownership for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLease {
    resource: Resource,
    token: LockToken,
    ttl: Duration,
}

impl LockLease {
    /// Locked resource
    #[must_use]
    pub const fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Owner token
    #[must_use]
    pub const fn token(&self) -> &LockToken {
        &self.token
    }

    /// Lease duration requested at acquisition
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Acquires and releases leases on a [`LockStore`].
pub struct LockManager<L> {
    store: Arc<L>,
}

impl<L> Clone for LockManager<L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<L: LockStore> LockManager<L> {
    /// Create a lock manager over `store`.
    #[must_use]
    pub const fn new(store: Arc<L>) -> Self {
        Self { store }
    }

    /// Take a lease, or report the resource busy.
    ///
    /// # Errors
    ///
    /// - Resource held by someone else → [`StockError::LockBusy`]
    /// - Store unreachable → [`StockError::Store`]
    pub async fn acquire(&self, resource: Resource, ttl: Duration) -> Result<LockLease> {
        self.try_acquire(resource, ttl)
            .await?
            .ok_or(StockError::LockBusy { resource })
    }

    /// Take a lease if the resource is free.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn try_acquire(&self, resource: Resource, ttl: Duration) -> Result<Option<LockLease>> {
        let token = LockToken::new();

        if !self.store.try_acquire(&resource, &token, ttl).await? {
            StockMetrics::record_lock_busy();
            tracing::debug!(resource = %resource, "Lock busy");
            return Ok(None);
        }

        StockMetrics::record_lock_acquired();
        tracing::debug!(
            resource = %resource,
            token = %token,
            ttl_ms = millis(ttl),
            "Lock acquired"
        );
        Ok(Some(LockLease {
            resource,
            token,
            ttl,
        }))
    }

    /// Release a lease held under `token`.
    ///
    /// # Errors
    ///
    /// - Token does not own the lock, or the lease already expired →
    ///   [`StockError::LockReleaseConflict`]
    /// - Store unreachable → [`StockError::Store`]
    pub async fn release(&self, resource: &Resource, token: &LockToken) -> Result<()> {
        match self.store.release(resource, token).await? {
            ReleaseOutcome::Released => {
                tracing::debug!(resource = %resource, token = %token, "Lock released");
                Ok(())
            },
            outcome @ (ReleaseOutcome::NotOwner | ReleaseOutcome::NotHeld) => {
                StockMetrics::record_lock_release_conflict();
                tracing::warn!(
                    resource = %resource,
                    token = %token,
                    reassigned = outcome == ReleaseOutcome::NotOwner,
                    "Lock lease lapsed before release"
                );
                Err(StockError::LockReleaseConflict {
                    resource: *resource,
                })
            },
        }
    }

    /// Release a lease, logging instead of failing.
    ///
    /// Used on exit paths where the protected work already completed.
    pub async fn release_lease(&self, lease: &LockLease) {
        match self.release(&lease.resource, &lease.token).await {
            Ok(()) | Err(StockError::LockReleaseConflict { .. }) => {},
            Err(e) => {
                tracing::error!(
                    resource = %lease.resource,
                    error = %e,
                    "Failed to release lock; it will expire with its lease"
                );
            },
        }
    }

    /// Whether the resource is currently leased.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn is_locked(&self, resource: &Resource) -> Result<bool> {
        Ok(self.store.holder(resource).await?.is_some())
    }

    /// Current holder of the resource.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn owner(&self, resource: &Resource) -> Result<Option<LockHolder>> {
        self.store.holder(resource).await
    }

    /// Delete a lock regardless of its owner.
    ///
    /// For operators clearing a lock left by a crashed holder. Returns whether
    /// a lock was present.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the store is unreachable.
    pub async fn force_release(&self, resource: &Resource) -> Result<bool> {
        let removed = self.store.force_release(resource).await?;
        tracing::warn!(resource = %resource, removed, "Lock force-released");
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stockline_core::ProductId;
    use stockline_testing::{InMemoryStockStore, ManualClock};

    fn manager() -> (LockManager<InMemoryStockStore>, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryStockStore::new(Arc::new(clock.clone()));
        (LockManager::new(Arc::new(store)), clock)
    }

    #[tokio::test]
    async fn second_acquire_is_busy() {
        let (locks, _) = manager();
        let resource = Resource::Product(ProductId::new());

        let lease = locks.acquire(resource, Duration::from_secs(5)).await.unwrap();
        let second = locks.acquire(resource, Duration::from_secs(5)).await;

        assert_eq!(second, Err(StockError::LockBusy { resource }));
        assert!(locks.is_locked(&resource).await.unwrap());
        assert_eq!(
            locks.owner(&resource).await.unwrap().map(|h| h.token),
            Some(*lease.token())
        );
    }

    #[tokio::test]
    async fn release_frees_the_resource() {
        let (locks, _) = manager();
        let resource = Resource::CatalogImport;

        let lease = locks.acquire(resource, Duration::from_secs(5)).await.unwrap();
        locks.release(lease.resource(), lease.token()).await.unwrap();

        assert!(!locks.is_locked(&resource).await.unwrap());
        assert!(locks.acquire(resource, Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_new_owner() {
        let (locks, clock) = manager();
        let resource = Resource::Product(ProductId::new());

        let stale = locks.acquire(resource, Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(6));
        let current = locks.acquire(resource, Duration::from_secs(5)).await.unwrap();

        let result = locks.release(stale.resource(), stale.token()).await;

        assert_eq!(result, Err(StockError::LockReleaseConflict { resource }));
        assert_eq!(
            locks.owner(&resource).await.unwrap().map(|h| h.token),
            Some(*current.token())
        );
    }

    #[tokio::test]
    async fn force_release_ignores_owner() {
        let (locks, _) = manager();
        let resource = Resource::Product(ProductId::new());
        let _lease = locks.acquire(resource, Duration::from_secs(5)).await.unwrap();

        assert!(locks.force_release(&resource).await.unwrap());
        assert!(!locks.force_release(&resource).await.unwrap());
        assert!(!locks.is_locked(&resource).await.unwrap());
    }
}
