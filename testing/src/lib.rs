//! # Stockline Testing
//!
//! Testing utilities for the Stockline stock consistency engine.
//!
//! This crate provides:
//! - [`InMemoryStockStore`]: counters, reservations and locks with the same
//!   atomicity as the Redis scripts, driven by an injected clock
//! - [`InMemoryLedger`]: a durable ledger with fault and latency injection
//! - [`FixedClock`] and [`ManualClock`] for deterministic time
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stockline_core::ProductId;
//! use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};
//!
//! let clock = Arc::new(ManualClock::default());
//! let store = InMemoryStockStore::new(clock.clone());
//! let ledger = InMemoryLedger::new();
//!
//! let product = ProductId::new();
//! ledger.insert(product, 100);
//! store.set_counter(product, 100);
//! assert_eq!(store.counter_value(&product), Some(100));
//! ```

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stockline_core::environment::{Clock, deadline};

pub mod ledger;
pub mod store;

pub use ledger::InMemoryLedger;
pub use store::InMemoryStockStore;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Arc, Clock, DateTime, Duration, Mutex, PoisonError, Utc, deadline};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stockline_testing::mocks::FixedClock;
    /// use stockline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the engine
    /// and the store and advance it from the outside to expire holds and leases.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = deadline(*time, by);
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
