//! Integration tests for `RedisStockStore` using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. Run with `cargo test -p stockline-redis -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::Utc;
use std::time::Duration;
use stockline_core::store::{
    ConfirmOutcome, FinalizeOutcome, HoldRequest, HoldResult, LedgerSnapshot, LockStore,
    PublishOutcome, ReleaseMode, ReleaseOutcome, SeedOutcome, StockStore,
};
use stockline_core::{LockToken, ProductId, ReservationStatus, Resource, UserId};
use stockline_redis::RedisStockStore;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

const TTL: Duration = Duration::from_secs(60);
const RETENTION: Duration = Duration::from_secs(3600);

async fn setup_store() -> (ContainerAsync<Redis>, RedisStockStore) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");

    let store = RedisStockStore::connect(&format!("redis://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to redis");
    (container, store)
}

fn hold(user_id: UserId, product_id: ProductId, quantity: u32) -> HoldRequest {
    let now = Utc::now();
    HoldRequest {
        user_id,
        product_id,
        quantity,
        now,
        expires_at: now + chrono::Duration::minutes(15),
        retention: RETENTION,
    }
}

/// Ledger read taken before any confirmation of the product.
fn snapshot(stock: i64) -> LedgerSnapshot {
    LedgerSnapshot {
        stock,
        epoch: 0,
        at: Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn seed_is_set_if_absent() {
    let (_container, store) = setup_store().await;
    let product = ProductId::new();

    let first = store.seed_counter(&product, &snapshot(100), TTL).await.unwrap();
    let second = store.seed_counter(&product, &snapshot(50), TTL).await.unwrap();

    assert_eq!(first, SeedOutcome::Seeded(100));
    assert_eq!(second, SeedOutcome::Present(100));
    assert_eq!(store.counter(&product).await.unwrap(), Some(100));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn hold_then_release_restores_counter() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());
    store.seed_counter(&product, &snapshot(10), TTL).await.unwrap();

    let outcome = store.place_hold(&hold(user, product, 4)).await.unwrap();
    assert!(matches!(outcome.result, HoldResult::Reserved { remaining: 6, .. }));
    assert!(outcome.reclaimed.is_none());

    let record = store.reservation(&user, &product).await.unwrap().unwrap();
    assert_eq!(record.status, ReservationStatus::Pending);
    assert_eq!(record.quantity, 4);

    let released = store
        .release_hold(&user, &product, Utc::now(), RETENTION, ReleaseMode::Always)
        .await
        .unwrap();
    assert!(matches!(
        released,
        FinalizeOutcome::Finalized {
            counter: Some(10),
            ..
        }
    ));

    let again = store
        .release_hold(&user, &product, Utc::now(), RETENTION, ReleaseMode::Always)
        .await
        .unwrap();
    assert!(matches!(again, FinalizeOutcome::AlreadyFinal(r) if r.status == ReservationStatus::RolledBack));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn hold_rejections() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());

    let missing = store.place_hold(&hold(user, product, 1)).await.unwrap();
    assert_eq!(missing.result, HoldResult::CounterMissing);

    store.seed_counter(&product, &snapshot(3), TTL).await.unwrap();
    let short = store.place_hold(&hold(user, product, 5)).await.unwrap();
    assert_eq!(short.result, HoldResult::Insufficient { available: 3 });

    store.place_hold(&hold(user, product, 2)).await.unwrap();
    let duplicate = store.place_hold(&hold(user, product, 1)).await.unwrap();
    assert!(matches!(duplicate.result, HoldResult::AlreadyPending(r) if r.quantity == 2));
    assert_eq!(store.counter(&product).await.unwrap(), Some(1));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn seed_subtracts_pending_after_eviction() {
    let (_container, store) = setup_store().await;
    let product = ProductId::new();
    store.seed_counter(&product, &snapshot(20), TTL).await.unwrap();
    store.place_hold(&hold(UserId::new(), product, 5)).await.unwrap();
    store.place_hold(&hold(UserId::new(), product, 3)).await.unwrap();

    assert!(store.invalidate_counter(&product).await.unwrap());
    let seeded = store.seed_counter(&product, &snapshot(20), TTL).await.unwrap();

    assert_eq!(seeded, SeedOutcome::Seeded(12));
    assert_eq!(
        store.publish_counter(&product, &snapshot(30), TTL).await.unwrap(),
        PublishOutcome::Published(22)
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn confirm_is_compare_and_set() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());
    store.seed_counter(&product, &snapshot(5), TTL).await.unwrap();
    store.place_hold(&hold(user, product, 2)).await.unwrap();

    let confirmed = store
        .mark_confirmed(&user, &product, Utc::now(), RETENTION)
        .await
        .unwrap();
    assert!(matches!(confirmed, ConfirmOutcome::Confirmed(r) if r.status == ReservationStatus::Confirmed));

    let rollback = store
        .release_hold(&user, &product, Utc::now(), RETENTION, ReleaseMode::Always)
        .await
        .unwrap();
    assert!(matches!(rollback, FinalizeOutcome::AlreadyFinal(r) if r.status == ReservationStatus::Confirmed));
    assert_eq!(store.counter(&product).await.unwrap(), Some(3));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn live_hold_is_not_swept() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());
    store.seed_counter(&product, &snapshot(5), TTL).await.unwrap();
    store.place_hold(&hold(user, product, 2)).await.unwrap();

    let outcome = store
        .release_hold(&user, &product, Utc::now(), RETENTION, ReleaseMode::IfExpired)
        .await
        .unwrap();

    assert!(matches!(outcome, FinalizeOutcome::NotExpired(_)));
    assert_eq!(store.reserved_products().await.unwrap(), vec![product]);
    assert_eq!(store.product_reservations(&product).await.unwrap().len(), 1);
    assert_eq!(store.user_reservations(&user).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn locks_are_owner_tokened() {
    let (_container, store) = setup_store().await;
    let resource = Resource::Product(ProductId::new());
    let (owner, intruder) = (LockToken::new(), LockToken::new());

    assert!(store.try_acquire(&resource, &owner, TTL).await.unwrap());
    assert!(!store.try_acquire(&resource, &intruder, TTL).await.unwrap());

    let holder = store.holder(&resource).await.unwrap().unwrap();
    assert_eq!(holder.token, owner);
    assert!(holder.remaining.is_some());

    assert_eq!(
        store.release(&resource, &intruder).await.unwrap(),
        ReleaseOutcome::NotOwner
    );
    assert_eq!(
        store.release(&resource, &owner).await.unwrap(),
        ReleaseOutcome::Released
    );
    assert_eq!(
        store.release(&resource, &owner).await.unwrap(),
        ReleaseOutcome::NotHeld
    );
    assert!(store.holder(&resource).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn census_counts_namespaces() {
    let (_container, store) = setup_store().await;
    let product = ProductId::new();
    store.seed_counter(&product, &snapshot(5), TTL).await.unwrap();
    store.place_hold(&hold(UserId::new(), product, 1)).await.unwrap();
    store
        .try_acquire(&Resource::CatalogImport, &LockToken::new(), TTL)
        .await
        .unwrap();

    let census = store.census().await.unwrap();

    assert_eq!(census.stock_keys, 1);
    assert_eq!(census.reservation_keys, 1);
    assert_eq!(census.lock_keys, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn settlement_fences_ledger_derived_writes() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());
    let before = snapshot(10);

    store
        .begin_settlement(&user, &product, Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(store.settlement_epoch(&product).await.unwrap(), 1);
    assert_eq!(
        store.seed_counter(&product, &before, TTL).await.unwrap(),
        SeedOutcome::Settling
    );

    store.end_settlement(&user, &product).await.unwrap();
    assert_eq!(
        store.publish_counter(&product, &before, TTL).await.unwrap(),
        PublishOutcome::Settling
    );
    assert_eq!(store.counter(&product).await.unwrap(), None);

    let fresh = LedgerSnapshot {
        epoch: store.settlement_epoch(&product).await.unwrap(),
        ..snapshot(10)
    };
    assert_eq!(
        store.seed_counter(&product, &fresh, TTL).await.unwrap(),
        SeedOutcome::Seeded(10)
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lapsed_settlement_lease_is_pruned() {
    let (_container, store) = setup_store().await;
    let (user, product) = (UserId::new(), ProductId::new());
    store
        .begin_settlement(&user, &product, Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();

    let after_crash = LedgerSnapshot {
        epoch: store.settlement_epoch(&product).await.unwrap(),
        ..snapshot(7)
    };

    assert_eq!(
        store.seed_counter(&product, &after_crash, TTL).await.unwrap(),
        SeedOutcome::Seeded(7)
    );
}
