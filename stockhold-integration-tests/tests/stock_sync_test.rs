//! External stock updates and lot administration.

use chrono::{Duration, Utc};
use stockhold::{Money, NewLot, ReservationError, StockLevel, SyncStatus};
use stockhold_integration_tests::Harness;
use stockhold_testing::fixtures::{now, unique_product_id, LotFixture};
use tracing_test::traced_test;

#[tokio::test]
async fn raising_stock_tops_up_the_newest_lot() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![
            LotFixture::new(product, 3).reserved(1).build(),
            LotFixture::new(product, 2).created_later(5).build(),
        ])
        .await
        .unwrap();
    let synced_at = now();

    harness
        .coordinator
        .set_available_stock(product, 9, synced_at)
        .await
        .unwrap();

    let lots = harness.lots(product).unwrap();
    let available: Vec<u32> = lots.iter().map(|lot| lot.available_quantity).collect();
    assert_eq!(available, vec![3, 6]);
    assert_eq!(lots[0].reserved_quantity, 1);
    assert!(lots
        .iter()
        .all(|lot| lot.sync_status == SyncStatus::Synced && lot.last_sync_at == Some(synced_at)));
}

#[tokio::test]
async fn cutting_stock_drains_oldest_lots_first() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![
            LotFixture::new(product, 3).sold(2).build(),
            LotFixture::new(product, 4).created_later(5).build(),
        ])
        .await
        .unwrap();

    harness
        .coordinator
        .set_available_stock(product, 2, now())
        .await
        .unwrap();

    let lots = harness.lots(product).unwrap();
    let available: Vec<u32> = lots.iter().map(|lot| lot.available_quantity).collect();
    assert_eq!(available, vec![0, 2]);
    assert_eq!(lots[0].sold_quantity, 2);
}

#[tokio::test]
async fn absolute_stock_ignores_expired_lots() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![
            LotFixture::new(product, 7).expired().build(),
            LotFixture::new(product, 1).created_later(5).build(),
        ])
        .await
        .unwrap();

    harness
        .coordinator
        .set_available_stock(product, 4, now())
        .await
        .unwrap();

    let lots = harness.lots(product).unwrap();
    assert_eq!(lots[0].available_quantity, 7);
    assert_eq!(lots[0].sync_status, SyncStatus::NotSynced);
    assert_eq!(lots[1].available_quantity, 4);
    assert_eq!(
        harness.coordinator.stock_level(product).await.unwrap().available,
        4
    );
}

#[tokio::test]
async fn setting_stock_of_a_product_without_lots_creates_one() {
    let harness = Harness::new();
    let product = unique_product_id();
    let synced_at = now();

    harness
        .coordinator
        .set_available_stock(product, 12, synced_at)
        .await
        .unwrap();

    let lots = harness.lots(product).unwrap();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].available_quantity, 12);
    assert_eq!(lots[0].sync_status, SyncStatus::Synced);
    assert!(harness.coordinator.try_reserve(product, 12).await.unwrap());
}

#[tokio::test]
async fn setting_unchanged_stock_only_stamps_the_sync() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![LotFixture::new(product, 5).sync_failed("timeout").build()])
        .await
        .unwrap();

    harness
        .coordinator
        .set_available_stock(product, 5, now())
        .await
        .unwrap();

    let lot = &harness.lots(product).unwrap()[0];
    assert_eq!(lot.available_quantity, 5);
    assert_eq!(lot.sync_status, SyncStatus::Synced);
    assert_eq!(lot.sync_error, None);
}

#[tokio::test]
#[traced_test]
async fn failed_sync_is_recorded_on_live_lots() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![
            LotFixture::new(product, 3).build(),
            LotFixture::new(product, 1).created_later(1).expired().build(),
            LotFixture::new(product, 9).created_later(2).deleted().build(),
        ])
        .await
        .unwrap();
    let at = now();

    let marked = harness
        .coordinator
        .record_sync_failure(product, "erp unreachable", at)
        .await
        .unwrap();

    assert_eq!(marked, 2);
    let lots = harness.lots(product).unwrap();
    for lot in &lots[..2] {
        assert_eq!(lot.sync_status, SyncStatus::Failed);
        assert_eq!(lot.sync_error.as_deref(), Some("erp unreachable"));
        assert_eq!(lot.last_sync_at, Some(at));
    }
    assert_eq!(lots[2].sync_status, SyncStatus::NotSynced);
    assert_eq!(lots[0].available_quantity, 3);
    assert!(logs_contain("[coordinator.record_sync_failure] external update failed"));
}

#[tokio::test]
async fn restock_adds_a_lot_consumed_after_older_ones() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![LotFixture::new(product, 2).build()])
        .await
        .unwrap();
    let expires_at = now() + Duration::days(90);

    let lot_id = harness
        .coordinator
        .add_lot(
            product,
            NewLot {
                quantity: 5,
                cost_price: Money::try_new(400).ok(),
                selling_price: Money::try_new(999).ok(),
                expires_at: Some(expires_at),
            },
        )
        .await
        .unwrap();
    assert!(harness.coordinator.try_reserve(product, 3).await.unwrap());

    let lots = harness.lots(product).unwrap();
    assert_eq!(lots[1].id, lot_id);
    assert_eq!(lots[1].selling_price, Money::try_new(999).ok());
    assert_eq!(lots[1].expires_at, Some(expires_at));
    let reserved: Vec<u32> = lots.iter().map(|lot| lot.reserved_quantity).collect();
    assert_eq!(reserved, vec![2, 1]);
}

#[tokio::test]
async fn retired_lot_leaves_sellable_stock() {
    let harness = Harness::new();
    let product = unique_product_id();
    let lot = LotFixture::new(product, 4).build();
    let lot_id = lot.id();
    harness
        .stock(vec![lot, LotFixture::new(product, 1).created_later(1).build()])
        .await
        .unwrap();

    harness.coordinator.retire_lot(product, lot_id).await.unwrap();
    harness.coordinator.retire_lot(product, lot_id).await.unwrap();

    assert_eq!(
        harness.coordinator.stock_level(product).await.unwrap(),
        StockLevel {
            available: 1,
            reserved: 0,
            sold: 0,
            lots: 1
        }
    );
    assert!(!harness.coordinator.try_reserve(product, 2).await.unwrap());
}

#[tokio::test]
async fn lot_holding_reservations_cannot_be_retired() {
    let harness = Harness::new();
    let product = unique_product_id();
    let lot = LotFixture::new(product, 4).reserved(1).build();
    let lot_id = lot.id();
    harness.stock(vec![lot]).await.unwrap();

    let result = harness.coordinator.retire_lot(product, lot_id).await;

    assert!(matches!(result, Err(ReservationError::InvariantViolation { .. })));
    assert!(!harness.lots(product).unwrap()[0].deleted);
}

#[tokio::test]
async fn retiring_another_products_lot_is_rejected() {
    let harness = Harness::new();
    let owner = unique_product_id();
    let other = unique_product_id();
    let lot = LotFixture::new(owner, 4).build();
    let lot_id = lot.id();
    harness.stock(vec![lot]).await.unwrap();

    let wrong_product = harness.coordinator.retire_lot(other, lot_id).await;
    let missing = harness
        .coordinator
        .retire_lot(owner, LotFixture::new(owner, 1).build().id())
        .await;

    assert!(matches!(wrong_product, Err(ReservationError::InvalidArgument(_))));
    assert!(matches!(missing, Err(ReservationError::InvalidArgument(_))));
    assert!(!harness.lots(owner).unwrap()[0].deleted);
}

#[tokio::test]
async fn stock_level_of_unknown_product_is_empty_and_seeds_nothing() {
    let harness = Harness::new();
    let product = harness.catalog_product(10);

    let level = harness.coordinator.stock_level(product).await.unwrap();

    assert_eq!(level, StockLevel::default());
    assert_eq!(harness.store.lot_count().unwrap(), 0);
}

#[tokio::test]
async fn stock_level_counts_expired_reservations_but_not_expired_stock() {
    let harness = Harness::new();
    let product = unique_product_id();
    harness
        .stock(vec![
            LotFixture::new(product, 5)
                .reserved(2)
                .sold(1)
                .expires_at(Utc::now() - Duration::minutes(5))
                .build(),
            LotFixture::new(product, 3).created_later(1).build(),
        ])
        .await
        .unwrap();

    assert_eq!(
        harness.coordinator.stock_level(product).await.unwrap(),
        StockLevel {
            available: 3,
            reserved: 2,
            sold: 1,
            lots: 2
        }
    );
}
