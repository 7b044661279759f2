//! Retry behavior: conflicting commits re-run the whole attempt on fresh
//! state, other failures surface immediately.

use std::sync::Arc;

use stockhold::{
    InventoryStore, InventoryWrites, MaxRetryAttempts, Operation, ProductLockRegistry,
    ReservationConfig, ReservationCoordinator, ReservationError, RetryBaseDelayMs, RetryConfig,
    RetryMaxDelayMs, StoreError,
};
use stockhold_memory::{InMemoryInventoryStore, InMemoryProductCatalog};
use stockhold_testing::fixtures::{unique_product_id, LotFixture};
use stockhold_testing::{ChaosConfig, ChaosInventoryStore, ChaosInventoryStoreExt};
use tracing_test::traced_test;

type ChaosCoordinator =
    ReservationCoordinator<ChaosInventoryStore<InMemoryInventoryStore>, InMemoryProductCatalog>;

fn fast_retry(attempts: u32) -> ReservationConfig {
    let retry = RetryConfig::new(
        MaxRetryAttempts::try_new(attempts).unwrap(),
        RetryBaseDelayMs::try_new(1).unwrap(),
        RetryMaxDelayMs::try_new(10).unwrap(),
    )
    .unwrap();
    ReservationConfig::default().with_retry(retry)
}

fn chaos_coordinator(chaos: ChaosConfig, config: ReservationConfig) -> ChaosCoordinator {
    ReservationCoordinator::new(
        InMemoryInventoryStore::new().with_chaos(chaos),
        InMemoryProductCatalog::new(),
        Arc::new(ProductLockRegistry::new()),
    )
    .with_config(config)
}

#[tokio::test]
#[traced_test]
async fn conflicting_commits_are_retried_until_one_succeeds() {
    let coordinator = chaos_coordinator(
        ChaosConfig::deterministic().with_scripted_conflicts(2),
        fast_retry(3),
    );
    let product = unique_product_id();
    let lot = LotFixture::new(product, 5).build();
    let lot_id = lot.id();
    coordinator
        .store()
        .inner()
        .commit(InventoryWrites::new().with_insert(lot))
        .await
        .unwrap();

    assert!(coordinator.try_reserve(product, 2).await.unwrap());

    let chaos = coordinator.store();
    assert_eq!(chaos.commit_attempts(), 3);
    assert_eq!(chaos.injected_conflicts(), 2);
    let stored = chaos.inner().load_lot(lot_id).await.unwrap().unwrap();
    assert_eq!(stored.reserved_quantity(), 2);
    assert_eq!(stored.version(), 2);
    assert!(logs_contain("[coordinator.retry] concurrency conflict, retrying"));
}

#[tokio::test]
#[traced_test]
async fn exhausted_retries_report_the_attempts_made() {
    let coordinator = chaos_coordinator(
        ChaosConfig::deterministic().with_version_conflict_probability(1.0),
        fast_retry(3),
    );
    let product = unique_product_id();
    coordinator
        .store()
        .inner()
        .commit(InventoryWrites::new().with_insert(LotFixture::new(product, 5).build()))
        .await
        .unwrap();

    let result = coordinator.try_reserve(product, 1).await;

    assert_eq!(result, Err(ReservationError::ConcurrencyConflict { attempts: 3 }));
    assert_eq!(coordinator.store().commit_attempts(), 3);
    let level = coordinator.stock_level(product).await.unwrap();
    assert_eq!((level.available, level.reserved), (5, 0));
    assert!(logs_contain("[coordinator.retry] concurrency conflict persisted, giving up"));
}

#[tokio::test]
async fn seeding_conflicts_are_retried_too() {
    let coordinator = chaos_coordinator(
        ChaosConfig::deterministic().with_scripted_conflicts(1),
        fast_retry(2),
    );
    let product = unique_product_id();
    coordinator.catalog().set_stock(product, 4);

    assert!(coordinator.try_reserve(product, 4).await.unwrap());

    let records = coordinator.store().inner().snapshot().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reserved_quantity, 4);
}

#[tokio::test]
async fn store_failures_are_not_retried() {
    let coordinator = chaos_coordinator(
        ChaosConfig::deterministic().with_failure_probability(1.0),
        fast_retry(5),
    );
    let product = unique_product_id();

    let result = coordinator.try_reserve(product, 1).await;

    assert_eq!(
        result,
        Err(ReservationError::Store(StoreError::StoreFailure {
            operation: Operation::LoadLots
        }))
    );
    assert_eq!(coordinator.store().commit_attempts(), 0);
    assert!(!result.unwrap_err().is_caller_error());
}

#[tokio::test]
async fn single_attempt_configuration_gives_up_at_once() {
    let coordinator = chaos_coordinator(
        ChaosConfig::deterministic().with_scripted_conflicts(1),
        ReservationConfig::default().with_retry(RetryConfig::no_retry()),
    );
    let product = unique_product_id();
    coordinator.catalog().set_stock(product, 4);

    let result = coordinator.release(product, 1).await;

    // Release never commits when nothing is reserved, so no conflict is seen
    assert!(matches!(result, Err(ReservationError::InvariantViolation { .. })));

    let result = coordinator.try_reserve(product, 1).await;
    assert_eq!(result, Err(ReservationError::ConcurrencyConflict { attempts: 1 }));
}
