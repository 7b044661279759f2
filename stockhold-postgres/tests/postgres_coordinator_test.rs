mod common;

use std::sync::Arc;

use chrono::Utc;
use stockhold::{
    InventoryStore, LotScope, MaxRetryAttempts, ProductCatalog, ProductId, ProductLockRegistry,
    ProductSnapshot, ReservationConfig, ReservationCoordinator, ReservationError,
    RetryBaseDelayMs, RetryConfig, RetryMaxDelayMs, StockItem,
};
use stockhold_postgres::{PostgresInventoryStore, PostgresProductCatalog};
use stockhold_testing::fixtures::unique_product_id;

type PostgresCoordinator = ReservationCoordinator<PostgresInventoryStore, PostgresProductCatalog>;

async fn coordinator() -> PostgresCoordinator {
    let store = common::store().await;
    let catalog = common::catalog(&store);
    ReservationCoordinator::new(store, catalog, Arc::new(ProductLockRegistry::new()))
}

async fn insert_product(store: &PostgresInventoryStore, product: ProductId, stock: i64) {
    let _ = sqlx::query("INSERT INTO products (id, stock_quantity) VALUES ($1, $2)")
        .bind(product.into_inner())
        .bind(stock)
        .execute(store.pool())
        .await
        .expect("should insert catalog product");
}

#[tokio::test]
#[ignore = "requires PostgreSQL at STOCKHOLD_TEST_POSTGRES_URL"]
async fn catalog_reads_products_table() {
    let store = common::store().await;
    let catalog = common::catalog(&store);
    let product = unique_product_id();
    insert_product(&store, product, 42).await;

    let found = catalog.get_product(product).await.unwrap();
    let missing = catalog.get_product(unique_product_id()).await.unwrap();

    assert_eq!(
        found,
        Some(ProductSnapshot {
            id: product,
            stock_quantity: 42
        })
    );
    assert_eq!(missing, None);
}

#[tokio::test]
#[ignore = "requires PostgreSQL at STOCKHOLD_TEST_POSTGRES_URL"]
async fn first_reservation_seeds_from_catalog_and_persists() {
    let coordinator = coordinator().await;
    let product = unique_product_id();
    insert_product(coordinator.store(), product, 10).await;

    assert!(coordinator.try_reserve(product, 4).await.unwrap());
    coordinator.release(product, 1).await.unwrap();
    coordinator.commit_sale(product, 3).await.unwrap();

    let lots = coordinator
        .store()
        .load_lots(&[product], LotScope::All, Utc::now())
        .await
        .unwrap()
        .remove(&product)
        .unwrap();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].available_stock(), 7);
    assert_eq!(lots[0].reserved_quantity(), 0);
    assert_eq!(lots[0].sold_quantity(), 3);
    // seed insert, reserve, release, sale
    assert_eq!(lots[0].version(), 4);
}

#[tokio::test]
#[ignore = "requires PostgreSQL at STOCKHOLD_TEST_POSTGRES_URL"]
async fn unknown_product_is_reported() {
    let coordinator = coordinator().await;
    let product = unique_product_id();

    let result = coordinator.try_reserve(product, 1).await;

    assert_eq!(result, Err(ReservationError::ProductNotFound(product)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL at STOCKHOLD_TEST_POSTGRES_URL"]
async fn two_nodes_never_oversell_a_product() {
    // Separate lock registries stand in for two processes; only the version
    // check in the database keeps them apart.
    let retry = RetryConfig::new(
        MaxRetryAttempts::try_new(10).unwrap(),
        RetryBaseDelayMs::try_new(5).unwrap(),
        RetryMaxDelayMs::try_new(200).unwrap(),
    )
    .unwrap();
    let config = ReservationConfig::default().with_retry(retry);
    let left = Arc::new(coordinator().await.with_config(config));
    let right = Arc::new(coordinator().await.with_config(config));
    let product = unique_product_id();
    insert_product(left.store(), product, 10).await;
    assert_eq!(left.stock_level(product).await.unwrap().available, 0);
    assert!(left.try_reserve(product, 1).await.unwrap());
    left.release(product, 1).await.unwrap();

    let mut handles = Vec::new();
    for attempt in 0..20 {
        let node = if attempt % 2 == 0 {
            Arc::clone(&left)
        } else {
            Arc::clone(&right)
        };
        handles.push(tokio::spawn(async move {
            node.try_reserve_multiple(&[StockItem::new(product, 1)]).await
        }));
    }

    let mut reserved: u64 = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(true) => reserved += 1,
            Ok(false) | Err(ReservationError::ConcurrencyConflict { .. }) => {}
            Err(other) => panic!("unexpected reservation error: {other}"),
        }
    }

    let level = left.stock_level(product).await.unwrap();
    assert!(reserved <= 10);
    assert_eq!(level.reserved, reserved);
    assert_eq!(level.available + level.reserved, 10);
}
