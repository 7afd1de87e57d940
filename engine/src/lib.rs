//! # Stockline Engine
//!
//! Keeps the durable stock ledger and the shared counter cache consistent while
//! checkouts and administrators race on the same products.
//!
//! ## Components
//!
//! - [`LockManager`]: owner-tokened leases with fail-fast acquisition
//! - [`Resync`]: rebuilds evicted counters from the ledger (set-if-absent)
//! - [`ReservationCoordinator`]: `reserve` / `confirm` / `rollback` for checkout
//! - [`AdminGuard`]: admin writes and catalog imports under locks
//! - [`ReservationSweeper`]: reclaims abandoned holds
//! - [`StockMonitor`]: activity, statistics and health
//!
//! [`StockEngine`] wires all of them over one shared store, one ledger and one
//! clock.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stockline_core::{ProductId, UserId};
//! use stockline_engine::{EngineConfig, StockEngine};
//! use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stockline_core::Result<()> {
//! let clock = Arc::new(ManualClock::default());
//! let store = Arc::new(InMemoryStockStore::new(clock.clone()));
//! let ledger = Arc::new(InMemoryLedger::new());
//! let product = ProductId::new();
//! ledger.insert(product, 100);
//!
//! let engine = StockEngine::new(store, ledger.clone(), clock, EngineConfig::default())?;
//!
//! let user = UserId::new();
//! let reserved = engine.reservations().reserve(product, user, 10).await?;
//! assert_eq!(reserved.remaining, 90);
//!
//! engine.reservations().confirm(user, product).await?;
//! assert_eq!(ledger.stock(&product), Some(90));
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod reservation;
pub mod resync;
pub mod sweep;

pub use admin::{AdminGuard, ImportReport, LockedWrite};
pub use config::{Config, EngineConfig, PostgresConfig, RedisConfig, SweeperConfig};
pub use health::{HealthReport, HealthStatus, ReservationStats, StockMonitor};
pub use lock::{LockLease, LockManager};
pub use reservation::{ReservationCoordinator, Reserved, RollbackOutcome};
pub use resync::{Resync, WarmReport};
pub use sweep::{ReservationSweeper, SweepReport};

use std::sync::Arc;
use stockline_core::Result;
use stockline_core::environment::Clock;
use stockline_core::ledger::DurableLedger;
use stockline_core::store::{LockStore, StockStore};

/// All engine components over one store, ledger and clock.
pub struct StockEngine<S, D> {
    config: EngineConfig,
    locks: LockManager<S>,
    resync: Resync<S, D>,
    reservations: ReservationCoordinator<S, D>,
    admin: AdminGuard<S, D>,
    sweeper: ReservationSweeper<S>,
    monitor: StockMonitor<S>,
}

impl<S, D> Clone for StockEngine<S, D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            locks: self.locks.clone(),
            resync: self.resync.clone(),
            reservations: self.reservations.clone(),
            admin: self.admin.clone(),
            sweeper: self.sweeper.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<S, D> StockEngine<S, D>
where
    S: StockStore + LockStore,
    D: DurableLedger,
{
    /// Wire the engine.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::InvalidArgument`](stockline_core::StockError::InvalidArgument)
    /// if `config` has a zero lease, hold or TTL.
    pub fn new(
        store: Arc<S>,
        ledger: Arc<D>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            locks: LockManager::new(Arc::clone(&store)),
            resync: Resync::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&clock),
                config.counter_ttl(),
            ),
            reservations: ReservationCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&clock),
                config,
            ),
            admin: AdminGuard::new(Arc::clone(&store), ledger, Arc::clone(&clock), config),
            sweeper: ReservationSweeper::new(Arc::clone(&store), Arc::clone(&clock), config),
            monitor: StockMonitor::new(store, clock),
        })
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock manager
    #[must_use]
    pub const fn locks(&self) -> &LockManager<S> {
        &self.locks
    }

    /// Resync fallback
    #[must_use]
    pub const fn resync(&self) -> &Resync<S, D> {
        &self.resync
    }

    /// Checkout operations
    #[must_use]
    pub const fn reservations(&self) -> &ReservationCoordinator<S, D> {
        &self.reservations
    }

    /// Admin operations
    #[must_use]
    pub const fn admin(&self) -> &AdminGuard<S, D> {
        &self.admin
    }

    /// Expiry sweeper and purges
    #[must_use]
    pub const fn sweeper(&self) -> &ReservationSweeper<S> {
        &self.sweeper
    }

    /// Monitoring
    #[must_use]
    pub const fn monitor(&self) -> &StockMonitor<S> {
        &self.monitor
    }
}
