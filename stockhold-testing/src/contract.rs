//! Behavioral contract for [`InventoryStore`] implementations.
//!
//! Every scenario is a plain async function taking a store factory, so it can
//! be called directly. The [`inventory_store_contract_tests!`] macro turns the
//! whole suite into `#[tokio::test]`s for one backend; new scenarios added
//! here reach every backend that invokes the macro.
//!
//! Scenarios only touch products created for them, so the suite can run in
//! parallel against one shared database.

use std::fmt;

use chrono::{Duration, Utc};
use stockhold::{
    InventoryLot, InventoryStore, InventoryWrites, LotId, LotRecord, LotScope, ProductId,
    StoreError,
};

use crate::fixtures::{now, unique_product_id, LotFixture};

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

async fn insert_lots<S: InventoryStore>(
    scenario: &'static str,
    store: &S,
    lots: Vec<InventoryLot>,
) -> ContractTestResult {
    let writes = lots
        .into_iter()
        .fold(InventoryWrites::new(), InventoryWrites::with_insert);
    store
        .commit(writes)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "commit", &error))
}

async fn load_one<S: InventoryStore>(
    scenario: &'static str,
    store: &S,
    lot_id: LotId,
) -> Result<InventoryLot, ContractTestFailure> {
    store
        .load_lot(lot_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "load_lot", &error))?
        .ok_or_else(|| ContractTestFailure::assertion(scenario, format!("lot {lot_id} not found")))
}

async fn load_ids<S: InventoryStore>(
    scenario: &'static str,
    store: &S,
    product: ProductId,
    scope: LotScope,
) -> Result<Vec<LotId>, ContractTestFailure> {
    let mut lots = store
        .load_lots(&[product], scope, Utc::now())
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "load_lots", &error))?;
    Ok(lots
        .remove(&product)
        .unwrap_or_default()
        .iter()
        .map(InventoryLot::id)
        .collect())
}

/// Fields a store owns: the version it assigns and the update time it stamps.
fn without_store_fields(mut record: LotRecord) -> LotRecord {
    record.version = 0;
    record.updated_at = record.created_at;
    record
}

/// An inserted lot reads back unchanged at version one.
pub async fn test_insert_and_load_round_trip<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "insert_and_load_round_trip";

    let store = make_store();
    let product = unique_product_id();
    let lot = LotFixture::new(product, 9)
        .reserved(2)
        .sold(4)
        .priced(350, 990)
        .expires_at(now() + Duration::days(30))
        .sync_failed("erp timeout")
        .build();
    let expected = lot.record().clone();

    insert_lots(SCENARIO, &store, vec![lot]).await?;
    let stored = load_one(SCENARIO, &store, expected.id).await?;

    if stored.version() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected inserted lot at version 1, observed {}", stored.version()),
        ));
    }
    if without_store_fields(stored.into_record()) != without_store_fields(expected) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "stored lot differs from the inserted one",
        ));
    }
    Ok(())
}

/// Lots come back oldest first, whatever order they were inserted in.
pub async fn test_fifo_ordering<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "fifo_ordering";

    let store = make_store();
    let product = unique_product_id();
    let start = now() - Duration::hours(1);
    let newest = LotFixture::new(product, 1).created_at(start + Duration::seconds(20)).build();
    let oldest = LotFixture::new(product, 1).created_at(start).build();
    let middle = LotFixture::new(product, 1).created_at(start + Duration::seconds(10)).build();
    let expected = vec![oldest.id(), middle.id(), newest.id()];

    insert_lots(SCENARIO, &store, vec![newest, oldest, middle]).await?;
    let observed = load_ids(SCENARIO, &store, product, LotScope::Sellable).await?;

    if observed != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected lots oldest first {expected:?}, observed {observed:?}"),
        ));
    }
    Ok(())
}

/// Each scope returns exactly the lots it admits: `Sellable` drops expired and
/// deleted lots, `Live` only deleted ones, `All` none.
pub async fn test_scope_filtering<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "scope_filtering";

    let store = make_store();
    let product = unique_product_id();
    let sellable = LotFixture::new(product, 1).build();
    let expired = LotFixture::new(product, 1).created_later(1).expired().build();
    let deleted = LotFixture::new(product, 1).created_later(2).deleted().build();
    let sellable_id = sellable.id();
    let expired_id = expired.id();
    let deleted_id = deleted.id();

    insert_lots(SCENARIO, &store, vec![sellable, expired, deleted]).await?;

    let cases = [
        (LotScope::Sellable, vec![sellable_id]),
        (LotScope::Live, vec![sellable_id, expired_id]),
        (LotScope::All, vec![sellable_id, expired_id, deleted_id]),
    ];
    for (scope, expected) in cases {
        let observed = load_ids(SCENARIO, &store, product, scope).await?;
        if observed != expected {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("scope {scope:?}: expected {expected:?}, observed {observed:?}"),
            ));
        }
    }
    Ok(())
}

/// An update carrying an outdated version is refused with a conflict.
pub async fn test_stale_version_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "stale_version_is_rejected";

    let store = make_store();
    let lot = LotFixture::new(unique_product_id(), 10).build();
    let lot_id = lot.id();
    insert_lots(SCENARIO, &store, vec![lot]).await?;

    let mut first = load_one(SCENARIO, &store, lot_id).await?;
    let mut second = first.clone();
    first
        .reserve_quantity(3)
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    second
        .reserve_quantity(4)
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;

    store
        .commit(InventoryWrites::new().with_update(first))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    match store.commit(InventoryWrites::new().with_update(second)).await {
        Err(StoreError::ConcurrencyConflict) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "commit", &error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected version conflict but stale commit succeeded",
            ))
        }
    }

    let stored = load_one(SCENARIO, &store, lot_id).await?;
    if stored.reserved_quantity() != 3 || stored.version() != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected reserved=3 at version 2, observed reserved={} at version {}",
                stored.reserved_quantity(),
                stored.version()
            ),
        ));
    }
    Ok(())
}

/// One stale update in a batch leaves every other write of the batch unapplied.
pub async fn test_conflict_preserves_atomicity<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "conflict_preserves_atomicity";

    let store = make_store();
    let left = LotFixture::new(unique_product_id(), 5).build();
    let right = LotFixture::new(unique_product_id(), 5).build();
    let (left_id, right_id) = (left.id(), right.id());
    insert_lots(SCENARIO, &store, vec![left, right]).await?;

    // Advance the right lot so the copy below is stale.
    let mut right_current = load_one(SCENARIO, &store, right_id).await?;
    let right_stale = right_current.clone();
    right_current
        .reserve_quantity(1)
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    store
        .commit(InventoryWrites::new().with_update(right_current))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    let mut left_fresh = load_one(SCENARIO, &store, left_id).await?;
    left_fresh
        .reserve_quantity(2)
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let extra = LotFixture::new(unique_product_id(), 1).build();
    let extra_id = extra.id();
    let writes = InventoryWrites::new()
        .with_insert(extra)
        .with_update(left_fresh)
        .with_update(right_stale);

    match store.commit(writes).await {
        Err(StoreError::ConcurrencyConflict) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "commit", &error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected version conflict but batch with a stale lot succeeded",
            ))
        }
    }

    let left_after = load_one(SCENARIO, &store, left_id).await?;
    if left_after.available_stock() != 5 || left_after.version() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected untouched lot to stay at available=5 version 1, observed available={} version {}",
                left_after.available_stock(),
                left_after.version()
            ),
        ));
    }
    let extra_after = store
        .load_lot(extra_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "load_lot", &error))?;
    if extra_after.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "insert from the rejected batch was persisted",
        ));
    }
    Ok(())
}

/// Inserting an existing lot id fails with `DuplicateLot`.
pub async fn test_duplicate_insert_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "duplicate_insert_is_rejected";

    let store = make_store();
    let lot = LotFixture::new(unique_product_id(), 2).build();
    let lot_id = lot.id();
    insert_lots(SCENARIO, &store, vec![lot.clone()]).await?;

    match store.commit(InventoryWrites::new().with_insert(lot)).await {
        Err(StoreError::DuplicateLot(id)) if id == lot_id => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(SCENARIO, "commit", &error)),
        Ok(()) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected duplicate lot error but insert succeeded",
        )),
    }
}

/// Reads only return lots of the requested products, each requested product present.
pub async fn test_product_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "product_isolation";

    let store = make_store();
    let first = unique_product_id();
    let second = unique_product_id();
    let untouched = unique_product_id();
    let first_lot = LotFixture::new(first, 1).build();
    let second_lot = LotFixture::new(second, 1).build();
    let (first_id, second_id) = (first_lot.id(), second_lot.id());
    insert_lots(SCENARIO, &store, vec![first_lot, second_lot]).await?;

    let lots = store
        .load_lots(&[first, untouched], LotScope::All, Utc::now())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "load_lots", &error))?;

    let first_ids: Option<Vec<LotId>> = lots
        .get(&first)
        .map(|lots| lots.iter().map(InventoryLot::id).collect());
    if first_ids != Some(vec![first_id]) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected only {first_id} for the first product, observed {first_ids:?}"),
        ));
    }
    if lots.get(&untouched).map(Vec::len) != Some(0) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected an empty entry for a product without lots",
        ));
    }
    if lots.contains_key(&second) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("lot {second_id} of an unrequested product was returned"),
        ));
    }
    Ok(())
}

/// Unknown lots and products read as absent or empty, not as errors.
pub async fn test_missing_lot_reads<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: InventoryStore + 'static,
{
    const SCENARIO: &str = "missing_lot_reads";

    let store = make_store();
    let missing = store
        .load_lot(LotId::new())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "load_lot", &error))?;
    if missing.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected no lot for a fresh id",
        ));
    }
    Ok(())
}

/// Expands the contract suite into `#[tokio::test]`s for one store.
///
/// `make_store` is called once per scenario. Backends that need external
/// infrastructure can pass `ignore = "reason"` so the suite only runs with
/// `cargo test -- --ignored`.
#[macro_export]
macro_rules! inventory_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        $crate::inventory_store_contract_tests!(@suite $suite, $make_store);
    };
    (suite = $suite:ident, make_store = $make_store:expr, ignore = $reason:literal $(,)?) => {
        $crate::inventory_store_contract_tests!(@suite $suite, $make_store, #[ignore = $reason]);
    };
    (@suite $suite:ident, $make_store:expr $(, #[$attr:meta])*) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_conflict_preserves_atomicity, test_duplicate_insert_is_rejected,
                test_fifo_ordering, test_insert_and_load_round_trip, test_missing_lot_reads,
                test_product_isolation, test_scope_filtering, test_stale_version_is_rejected,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn insert_and_load_round_trip_contract() {
                test_insert_and_load_round_trip($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn fifo_ordering_contract() {
                test_fifo_ordering($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn scope_filtering_contract() {
                test_scope_filtering($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn stale_version_is_rejected_contract() {
                test_stale_version_is_rejected($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn conflict_preserves_atomicity_contract() {
                test_conflict_preserves_atomicity($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn duplicate_insert_is_rejected_contract() {
                test_duplicate_insert_is_rejected($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn product_isolation_contract() {
                test_product_isolation($make_store)
                    .await
                    .expect("inventory store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn missing_lot_reads_contract() {
                test_missing_lot_reads($make_store)
                    .await
                    .expect("inventory store contract failed");
            }
        }
    };
}

pub use inventory_store_contract_tests;
