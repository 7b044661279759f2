//! The reservation coordinator.
//!
//! Every mutating operation runs as one or more attempts. An attempt:
//!
//! 1. locks every product it touches, in ascending [`ProductId`] order
//! 2. loads the products' lots through the store's scope predicate
//! 3. plans the change for every product, refusing before anything is mutated
//!    if one of them cannot be satisfied
//! 4. applies the plan and persists every touched lot in one atomic commit
//! 5. drops its locks, in reverse order
//!
//! A commit rejected for a version conflict sends the operation back to step 1
//! with fresh state (see [`crate::RetryConfig`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::allocation::{self, Allocation, Bucket};
use crate::config::ReservationConfig;
use crate::errors::{LotError, ReservationError, ReservationResult};
use crate::locks::{ProductLockRegistry, ProductLockSet};
use crate::lot::{InventoryLot, NewLot};
use crate::retry::retry_on_conflict;
use crate::store::{InventoryStore, InventoryWrites, ProductCatalog};
use crate::types::{LotId, LotScope, ProductId, StockItem, StockLevel};

/// A product that could not cover its requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    /// The short product.
    pub product_id: ProductId,
    /// Total requested for the product, duplicate lines summed.
    pub requested: u64,
    /// Total available across the product's sellable lots.
    pub available: u64,
}

/// Result of a multi-item reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationOutcome {
    /// Every line was reserved.
    Reserved,
    /// Nothing was reserved; these products were short.
    Insufficient { shortages: Vec<Shortage> },
}

impl ReservationOutcome {
    /// Whether every line was reserved.
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }
}

/// Moves reserved units out of the reserved bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Release,
    Sale,
}

impl Settlement {
    const fn name(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Sale => "sale",
        }
    }

    fn apply(self, lot: &mut InventoryLot, quantity: u32) -> Result<(), LotError> {
        match self {
            Self::Release => lot.release_reservation(quantity),
            Self::Sale => lot.commit_sale(quantity),
        }
    }
}

/// Serializes and applies stock changes for one or many products.
///
/// The coordinator is cheap to share: wrap it in an `Arc` and hand it to every
/// request handler. Coordinators built over the same store must share one
/// [`ProductLockRegistry`], otherwise they do not exclude each other.
///
/// # Example
///
/// ```rust,ignore
/// let locks = Arc::new(ProductLockRegistry::new());
/// let coordinator = ReservationCoordinator::new(store, catalog, locks);
///
/// let cart = [StockItem::new(shirt, 2), StockItem::new(socks, 1)];
/// if !coordinator.try_reserve_multiple(&cart).await? {
///     // show the out-of-stock message
/// }
/// ```
#[derive(Debug)]
pub struct ReservationCoordinator<S, C> {
    store: S,
    catalog: C,
    locks: Arc<ProductLockRegistry>,
    config: ReservationConfig,
}

impl<S, C> ReservationCoordinator<S, C>
where
    S: InventoryStore,
    C: ProductCatalog,
{
    /// Creates a coordinator with the default [`ReservationConfig`].
    pub fn new(store: S, catalog: C, locks: Arc<ProductLockRegistry>) -> Self {
        Self {
            store,
            catalog,
            locks,
            config: ReservationConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub const fn with_config(mut self, config: ReservationConfig) -> Self {
        self.config = config;
        self
    }

    /// The inventory store behind this coordinator.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The catalog used to seed first lots.
    pub const fn catalog(&self) -> &C {
        &self.catalog
    }

    /// The active configuration.
    pub const fn config(&self) -> &ReservationConfig {
        &self.config
    }

    /// The lock registry shared by this coordinator.
    pub fn locks(&self) -> &Arc<ProductLockRegistry> {
        &self.locks
    }

    /// Reserves `quantity` units of one product.
    ///
    /// Returns `Ok(false)` without changing anything when the product's sellable
    /// lots do not hold enough units.
    #[instrument(name = "coordinator.try_reserve", skip(self), fields(product = %product_id))]
    pub async fn try_reserve(
        &self,
        product_id: ProductId,
        quantity: u32,
    ) -> ReservationResult<bool> {
        let outcome = self
            .reserve_items(&[StockItem::new(product_id, quantity)])
            .await?;
        Ok(outcome.is_reserved())
    }

    /// Reserves every line of `items`, or none of them.
    #[instrument(name = "coordinator.try_reserve_multiple", skip(self, items), fields(lines = items.len()))]
    pub async fn try_reserve_multiple(&self, items: &[StockItem]) -> ReservationResult<bool> {
        Ok(self.reserve_items(items).await?.is_reserved())
    }

    /// Reserves every line of `items`, or none of them, reporting the short products.
    ///
    /// Lines naming the same product are summed. Products that have never had
    /// a lot get one seeded from the catalog first.
    #[instrument(name = "coordinator.reserve_items", skip(self, items), fields(lines = items.len()))]
    pub async fn reserve_items(&self, items: &[StockItem]) -> ReservationResult<ReservationOutcome> {
        let demand = aggregate(items)?;
        if demand.is_empty() {
            return Ok(ReservationOutcome::Reserved);
        }
        let demand = &demand;
        retry_on_conflict(&self.config.retry, "reserve", move |_| {
            self.reserve_attempt(demand)
        })
        .await
    }

    /// Returns `quantity` reserved units of one product to its available stock.
    ///
    /// Releasing more than is reserved is a caller bug and fails with
    /// [`ReservationError::InvariantViolation`] without changing anything.
    #[instrument(name = "coordinator.release", skip(self), fields(product = %product_id))]
    pub async fn release(&self, product_id: ProductId, quantity: u32) -> ReservationResult<()> {
        self.settle(&[StockItem::new(product_id, quantity)], Settlement::Release)
            .await
    }

    /// Releases every line of `items`, or none of them (order cancellation).
    #[instrument(name = "coordinator.release_multiple", skip(self, items), fields(lines = items.len()))]
    pub async fn release_multiple(&self, items: &[StockItem]) -> ReservationResult<()> {
        self.settle(items, Settlement::Release).await
    }

    /// Marks `quantity` reserved units of one product as sold.
    #[instrument(name = "coordinator.commit_sale", skip(self), fields(product = %product_id))]
    pub async fn commit_sale(&self, product_id: ProductId, quantity: u32) -> ReservationResult<()> {
        self.settle(&[StockItem::new(product_id, quantity)], Settlement::Sale)
            .await
    }

    /// Marks every line of `items` as sold, or none of them.
    #[instrument(name = "coordinator.commit_sale_multiple", skip(self, items), fields(lines = items.len()))]
    pub async fn commit_sale_multiple(&self, items: &[StockItem]) -> ReservationResult<()> {
        self.settle(items, Settlement::Sale).await
    }

    /// Creates a new lot for `product_id` (restock).
    #[instrument(name = "coordinator.add_lot", skip(self, new_lot), fields(product = %product_id, quantity = new_lot.quantity))]
    pub async fn add_lot(&self, product_id: ProductId, new_lot: NewLot) -> ReservationResult<LotId> {
        let new_lot = &new_lot;
        retry_on_conflict(&self.config.retry, "add_lot", move |_| async move {
            let _locks = self.lock(&[product_id]).await?;
            let lot = InventoryLot::from_new_lot(product_id, new_lot.clone(), Utc::now());
            let lot_id = lot.id();
            self.store
                .commit(InventoryWrites::new().with_insert(lot))
                .await?;
            info!(lot = %lot_id, "[coordinator.add_lot] lot created");
            Ok(lot_id)
        })
        .await
    }

    /// Makes the product's total sellable available stock equal `target`.
    ///
    /// This is the entry point of external (ERP) stock updates. A raise is
    /// added to the newest lot, a cut is taken from the oldest lots first, and
    /// reserved or sold units never change. A product without sellable lots
    /// gets a new lot holding `target`. The product's sellable lots are stamped
    /// as synced at `synced_at`.
    #[instrument(name = "coordinator.set_available_stock", skip(self), fields(product = %product_id))]
    pub async fn set_available_stock(
        &self,
        product_id: ProductId,
        target: u32,
        synced_at: DateTime<Utc>,
    ) -> ReservationResult<()> {
        retry_on_conflict(&self.config.retry, "set_available_stock", move |_| {
            self.set_available_attempt(product_id, target, synced_at)
        })
        .await
    }

    /// Records a failed external update on every live lot of the product.
    ///
    /// Quantities are left alone. Returns the number of lots marked.
    #[instrument(name = "coordinator.record_sync_failure", skip(self, error), fields(product = %product_id))]
    pub async fn record_sync_failure(
        &self,
        product_id: ProductId,
        error: &str,
        at: DateTime<Utc>,
    ) -> ReservationResult<usize> {
        retry_on_conflict(&self.config.retry, "record_sync_failure", move |_| async move {
            let _locks = self.lock(&[product_id]).await?;
            let lots = self.load(product_id, LotScope::Live, at).await?;
            let marked = lots.len();
            let mut writes = InventoryWrites::new();
            for mut lot in lots {
                lot.mark_sync_failed(at, error);
                writes.push_update(lot);
            }
            if !writes.is_empty() {
                self.store.commit(writes).await?;
            }
            warn!(lots = marked, sync_error = error, "[coordinator.record_sync_failure] external update failed");
            Ok(marked)
        })
        .await
    }

    /// Soft-deletes one lot of `product_id`.
    ///
    /// Retiring a lot that still holds reserved units is refused. Retiring an
    /// already retired lot does nothing.
    #[instrument(name = "coordinator.retire_lot", skip(self), fields(product = %product_id, lot = %lot_id))]
    pub async fn retire_lot(&self, product_id: ProductId, lot_id: LotId) -> ReservationResult<()> {
        retry_on_conflict(&self.config.retry, "retire_lot", move |_| async move {
            let _locks = self.lock(&[product_id]).await?;
            let Some(mut lot) = self.store.load_lot(lot_id).await? else {
                return Err(ReservationError::InvalidArgument(format!(
                    "lot {lot_id} does not exist"
                )));
            };
            if lot.product_id() != product_id {
                return Err(ReservationError::InvalidArgument(format!(
                    "lot {lot_id} belongs to product {}",
                    lot.product_id()
                )));
            }
            if lot.is_deleted() {
                return Ok(());
            }
            lot.soft_delete().map_err(|error| {
                error!(error = %error, "[coordinator.retire_lot] lot cannot be retired");
                ReservationError::InvariantViolation {
                    product: product_id,
                    detail: error.to_string(),
                }
            })?;
            self.store
                .commit(InventoryWrites::new().with_update(lot))
                .await?;
            info!("[coordinator.retire_lot] lot retired");
            Ok(())
        })
        .await
    }

    /// Current stock totals of a product.
    ///
    /// Takes no lock, so the totals may be slightly stale under concurrent
    /// writes. Never seeds a lot.
    #[instrument(name = "coordinator.stock_level", skip(self), fields(product = %product_id))]
    pub async fn stock_level(&self, product_id: ProductId) -> ReservationResult<StockLevel> {
        let now = Utc::now();
        let sellable = self.load(product_id, LotScope::Sellable, now).await?;
        let live = self.load(product_id, LotScope::Live, now).await?;
        Ok(StockLevel {
            available: allocation::total(&sellable, Bucket::Available),
            reserved: allocation::total(&live, Bucket::Reserved),
            sold: live.iter().map(|lot| u64::from(lot.sold_quantity())).sum(),
            lots: live.len(),
        })
    }

    async fn reserve_attempt(
        &self,
        demand: &BTreeMap<ProductId, u32>,
    ) -> ReservationResult<ReservationOutcome> {
        let products: Vec<ProductId> = demand.keys().copied().collect();
        let _locks = self.lock(&products).await?;
        let now = Utc::now();
        self.ensure_inventory(&products, now).await?;

        let mut lots = self
            .store
            .load_lots(&products, LotScope::Sellable, now)
            .await?;

        let mut plans = Vec::with_capacity(demand.len());
        let mut shortages = Vec::new();
        for (&product, &quantity) in demand {
            let product_lots = lots.remove(&product).unwrap_or_default();
            match allocation::plan_fifo(&product_lots, quantity, Bucket::Available) {
                Ok(plan) => plans.push((product, product_lots, plan)),
                Err(shortfall) => shortages.push(Shortage {
                    product_id: product,
                    requested: shortfall.requested,
                    available: shortfall.held,
                }),
            }
        }

        if !shortages.is_empty() {
            for shortage in &shortages {
                warn!(
                    product = %shortage.product_id,
                    requested = shortage.requested,
                    available = shortage.available,
                    "[coordinator.reserve] insufficient stock, nothing reserved"
                );
            }
            return Ok(ReservationOutcome::Insufficient { shortages });
        }

        let mut writes = InventoryWrites::new();
        for (product, product_lots, plan) in plans {
            debug!(product = %product, lots = plan.len(), "[coordinator.reserve] allocation planned");
            apply_plan(product, product_lots, &plan, &mut writes, |lot, quantity| {
                lot.reserve_quantity(quantity)
            })?;
        }
        let touched = writes.len();
        self.store.commit(writes).await?;

        info!(
            products = demand.len(),
            lots = touched,
            "[coordinator.reserve] reservation committed"
        );
        Ok(ReservationOutcome::Reserved)
    }

    async fn settle(&self, items: &[StockItem], settlement: Settlement) -> ReservationResult<()> {
        let demand = aggregate(items)?;
        if demand.is_empty() {
            return Ok(());
        }
        let demand = &demand;
        retry_on_conflict(&self.config.retry, settlement.name(), move |_| {
            self.settle_attempt(demand, settlement)
        })
        .await
    }

    async fn settle_attempt(
        &self,
        demand: &BTreeMap<ProductId, u32>,
        settlement: Settlement,
    ) -> ReservationResult<()> {
        let products: Vec<ProductId> = demand.keys().copied().collect();
        let _locks = self.lock(&products).await?;
        let mut lots = self
            .store
            .load_lots(&products, LotScope::Live, Utc::now())
            .await?;

        let mut plans = Vec::with_capacity(demand.len());
        for (&product, &quantity) in demand {
            let product_lots = lots.remove(&product).unwrap_or_default();
            match allocation::plan_fifo(&product_lots, quantity, Bucket::Reserved) {
                Ok(plan) => plans.push((product, product_lots, plan)),
                Err(shortfall) => {
                    error!(
                        product = %product,
                        requested = shortfall.requested,
                        reserved = shortfall.held,
                        "[coordinator.{}] quantity exceeds reserved stock",
                        settlement.name()
                    );
                    return Err(ReservationError::InvariantViolation {
                        product,
                        detail: format!(
                            "{} of {} exceeds reserved quantity {}",
                            settlement.name(),
                            shortfall.requested,
                            shortfall.held
                        ),
                    });
                }
            }
        }

        let mut writes = InventoryWrites::new();
        for (product, product_lots, plan) in plans {
            apply_plan(product, product_lots, &plan, &mut writes, |lot, quantity| {
                settlement.apply(lot, quantity)
            })?;
        }
        self.store.commit(writes).await?;

        info!(
            products = demand.len(),
            "[coordinator.{}] reserved stock settled",
            settlement.name()
        );
        Ok(())
    }

    async fn set_available_attempt(
        &self,
        product_id: ProductId,
        target: u32,
        synced_at: DateTime<Utc>,
    ) -> ReservationResult<()> {
        let _locks = self.lock(&[product_id]).await?;
        let now = Utc::now();
        let lots = self.load(product_id, LotScope::Sellable, now).await?;

        let mut writes = InventoryWrites::new();
        if lots.is_empty() {
            let mut lot = InventoryLot::from_new_lot(product_id, NewLot::with_quantity(target), now);
            lot.mark_synced(synced_at);
            writes.push_insert(lot);
        } else {
            let previous = allocation::total(&lots, Bucket::Available);
            let mut changes: HashMap<usize, u32> =
                allocation::plan_absolute(&lots, target).into_iter().collect();
            for (index, mut lot) in lots.into_iter().enumerate() {
                if let Some(available) = changes.remove(&index) {
                    lot.update_inventory(lot.with_available(available))
                        .map_err(|error| lot_failure(product_id, &error))?;
                }
                lot.mark_synced(synced_at);
                writes.push_update(lot);
            }
            debug!(previous, target, "[coordinator.set_available_stock] adjustment planned");
        }
        self.store.commit(writes).await?;

        info!(target, "[coordinator.set_available_stock] available stock set");
        Ok(())
    }

    /// Seeds a lot from the catalog for every product that has never had one.
    ///
    /// Must run under the products' locks: two first reservations of the same
    /// product would otherwise both seed it.
    async fn ensure_inventory(
        &self,
        products: &[ProductId],
        now: DateTime<Utc>,
    ) -> ReservationResult<()> {
        let existing = self.store.load_lots(products, LotScope::All, now).await?;
        let mut writes = InventoryWrites::new();
        for &product in products {
            if existing.get(&product).is_some_and(|lots| !lots.is_empty()) {
                continue;
            }
            let snapshot = self
                .catalog
                .get_product(product)
                .await?
                .ok_or(ReservationError::ProductNotFound(product))?;
            let lot = InventoryLot::create(product, snapshot.stock_quantity, now).map_err(|error| {
                ReservationError::InvalidArgument(format!(
                    "cannot seed inventory for product {product}: {error}"
                ))
            })?;
            info!(
                product = %product,
                quantity = lot.available_stock(),
                "[coordinator.ensure_inventory] seeding first lot from catalog"
            );
            writes.push_insert(lot);
        }
        if !writes.is_empty() {
            self.store.commit(writes).await?;
        }
        Ok(())
    }

    async fn lock(&self, products: &[ProductId]) -> ReservationResult<ProductLockSet> {
        self.locks
            .acquire(products.iter().copied(), self.lock_timeout())
            .await
    }

    async fn load(
        &self,
        product_id: ProductId,
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> ReservationResult<Vec<InventoryLot>> {
        let mut lots = self.store.load_lots(&[product_id], scope, as_of).await?;
        Ok(lots.remove(&product_id).unwrap_or_default())
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout.as_duration()
    }
}

/// Sums the lines per product, rejecting zero quantities and overflow.
fn aggregate(items: &[StockItem]) -> ReservationResult<BTreeMap<ProductId, u32>> {
    let mut demand = BTreeMap::new();
    for item in items {
        if item.quantity == 0 {
            return Err(ReservationError::InvalidArgument(format!(
                "quantity for product {} must be positive",
                item.product_id
            )));
        }
        let total: &mut u32 = demand.entry(item.product_id).or_default();
        *total = total.checked_add(item.quantity).ok_or_else(|| {
            ReservationError::InvalidArgument(format!(
                "total quantity for product {} overflows",
                item.product_id
            ))
        })?;
    }
    Ok(demand)
}

/// Applies `transition` to the planned lots and queues them for the commit.
fn apply_plan(
    product: ProductId,
    lots: Vec<InventoryLot>,
    plan: &[Allocation],
    writes: &mut InventoryWrites,
    transition: impl Fn(&mut InventoryLot, u32) -> Result<(), LotError>,
) -> ReservationResult<()> {
    let mut plan = plan.iter().peekable();
    for (index, mut lot) in lots.into_iter().enumerate() {
        let Some(step) = plan.next_if(|step| step.lot_index == index) else {
            continue;
        };
        transition(&mut lot, step.quantity).map_err(|error| lot_failure(product, &error))?;
        writes.push_update(lot);
    }
    Ok(())
}

/// A lot refused a transition the plan said it could take.
fn lot_failure(product: ProductId, error: &LotError) -> ReservationError {
    error!(product = %product, error = %error, "[coordinator] lot refused planned change");
    ReservationError::InvariantViolation {
        product,
        detail: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> ProductId {
        ProductId::try_new(raw).unwrap()
    }

    #[test]
    fn duplicate_lines_are_summed() {
        let demand = aggregate(&[
            StockItem::new(id(2), 3),
            StockItem::new(id(1), 1),
            StockItem::new(id(2), 4),
        ])
        .unwrap();
        assert_eq!(demand.into_iter().collect::<Vec<_>>(), vec![(id(1), 1), (id(2), 7)]);
    }

    #[test]
    fn zero_quantity_line_is_invalid() {
        let result = aggregate(&[StockItem::new(id(1), 2), StockItem::new(id(3), 0)]);
        assert!(matches!(result, Err(ReservationError::InvalidArgument(_))));
    }

    #[test]
    fn overflowing_sum_is_invalid() {
        let result = aggregate(&[StockItem::new(id(1), u32::MAX), StockItem::new(id(1), 1)]);
        assert!(matches!(result, Err(ReservationError::InvalidArgument(_))));
    }

    #[test]
    fn apply_plan_only_writes_planned_lots() {
        let now = Utc::now();
        let lots: Vec<InventoryLot> = [3, 5, 2]
            .into_iter()
            .map(|quantity| InventoryLot::create(id(1), quantity, now).unwrap())
            .collect();
        let plan = [Allocation {
            lot_index: 1,
            quantity: 4,
        }];
        let mut writes = InventoryWrites::new();

        apply_plan(id(1), lots, &plan, &mut writes, |lot, quantity| {
            lot.reserve_quantity(quantity)
        })
        .unwrap();

        assert_eq!(writes.len(), 1);
        assert_eq!(writes.updates()[0].available_quantity, 1);
        assert_eq!(writes.updates()[0].reserved_quantity, 4);
    }

    #[test]
    fn outcome_reports_reserved() {
        assert!(ReservationOutcome::Reserved.is_reserved());
        assert!(!ReservationOutcome::Insufficient { shortages: vec![] }.is_reserved());
    }
}
