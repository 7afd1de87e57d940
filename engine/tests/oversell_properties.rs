//! Property-based tests for the no-oversell guarantee.
//!
//! Concurrent reservations whose total exceeds the stock must never drive the
//! counter below zero, and must never hold more units than the ledger has.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use stockline_core::{ProductId, UserId};
use stockline_engine::{EngineConfig, StockEngine};
use stockline_testing::{InMemoryLedger, InMemoryStockStore, ManualClock};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn concurrent_reserves_never_oversell(
        stock in 0i64..60,
        requests in prop::collection::vec(1u32..12, 1..40),
        warm in any::<bool>(),
    ) {
        let rt = runtime();
        let (reserved, counter, pending) = rt.block_on(async {
            let clock = ManualClock::default();
            let store = Arc::new(InMemoryStockStore::new(Arc::new(clock.clone())));
            let ledger = Arc::new(InMemoryLedger::new());
            let engine = StockEngine::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::new(clock),
                EngineConfig::default(),
            )
            .unwrap();

            let product = ProductId::new();
            ledger.insert(product, stock);
            if warm {
                store.set_counter(product, stock);
            }

            let tasks = requests.iter().map(|quantity| {
                let engine = engine.clone();
                let quantity = *quantity;
                tokio::spawn(async move {
                    engine
                        .reservations()
                        .reserve(product, UserId::new(), quantity)
                        .await
                        .map(|r| i64::from(r.reservation.quantity))
                })
            });
            let reserved: i64 = join_all(tasks)
                .await
                .into_iter()
                .map(|joined| joined.unwrap().unwrap_or(0))
                .sum();

            (
                reserved,
                store.counter_value(&product).unwrap(),
                store.pending_units(&product),
            )
        });

        prop_assert!(counter >= 0);
        prop_assert!(reserved <= stock);
        prop_assert_eq!(reserved, pending);
        prop_assert_eq!(counter + pending, stock);
    }

    #[test]
    fn rollbacks_return_exactly_what_was_held(
        stock in 1i64..40,
        requests in prop::collection::vec(1u32..8, 1..20),
    ) {
        let rt = runtime();
        let counter = rt.block_on(async {
            let clock = ManualClock::default();
            let store = Arc::new(InMemoryStockStore::new(Arc::new(clock.clone())));
            let ledger = Arc::new(InMemoryLedger::new());
            let engine = StockEngine::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::new(clock.clone()),
                EngineConfig::default(),
            )
            .unwrap();
            let product = ProductId::new();
            ledger.insert(product, stock);

            let users: Vec<UserId> = requests.iter().map(|_| UserId::new()).collect();
            for (user, quantity) in users.iter().zip(&requests) {
                let _ = engine.reservations().reserve(product, *user, *quantity).await;
            }
            // Half are rolled back explicitly, the rest lapse and are swept.
            for user in users.iter().step_by(2) {
                engine.reservations().rollback(*user, product).await.unwrap();
            }
            clock.advance(Duration::from_secs(engine.config().hold_secs));
            engine.sweeper().sweep_expired().await.unwrap();

            store.counter_value(&product).unwrap()
        });

        prop_assert_eq!(counter, stock);
    }
}
