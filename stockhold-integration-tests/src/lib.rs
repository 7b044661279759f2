//! Integration tests for `stockhold`
//!
//! This crate exercises the reservation coordinator together with the
//! in-memory adapters and the testing utilities. [`Harness`] wires them up
//! the way an application would.

#![forbid(unsafe_code)]

use std::sync::Arc;

use stockhold::{
    InventoryLot, InventoryStore, InventoryWrites, LotRecord, ProductId, ProductLockRegistry,
    ReservationConfig, ReservationCoordinator, StoreError,
};
use stockhold_memory::{InMemoryInventoryStore, InMemoryProductCatalog};
use stockhold_testing::fixtures::unique_product_id;

/// Coordinator over the in-memory adapters.
pub type MemoryCoordinator =
    ReservationCoordinator<Arc<InMemoryInventoryStore>, Arc<InMemoryProductCatalog>>;

/// A coordinator plus direct handles on the store and catalog behind it.
#[derive(Debug)]
pub struct Harness {
    /// The store the coordinator writes to.
    pub store: Arc<InMemoryInventoryStore>,
    /// The catalog first lots are seeded from.
    pub catalog: Arc<InMemoryProductCatalog>,
    /// Coordinator under test.
    pub coordinator: Arc<MemoryCoordinator>,
}

impl Harness {
    /// Empty store and catalog, default configuration.
    pub fn new() -> Self {
        Self::with_config(ReservationConfig::default())
    }

    /// Empty store and catalog with `config`.
    pub fn with_config(config: ReservationConfig) -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        let catalog = Arc::new(InMemoryProductCatalog::new());
        let coordinator = ReservationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::new(ProductLockRegistry::new()),
        )
        .with_config(config);

        Self {
            store,
            catalog,
            coordinator: Arc::new(coordinator),
        }
    }

    /// A fresh product known to the catalog with `stock_quantity` units.
    pub fn catalog_product(&self, stock_quantity: i64) -> ProductId {
        let product = unique_product_id();
        self.catalog.set_stock(product, stock_quantity);
        product
    }

    /// Stores `lots` as they are, bypassing the coordinator.
    pub async fn stock(&self, lots: Vec<InventoryLot>) -> Result<(), StoreError> {
        let writes = lots
            .into_iter()
            .fold(InventoryWrites::new(), InventoryWrites::with_insert);
        self.store.commit(writes).await
    }

    /// Every stored lot of `product`, deleted ones included, oldest first.
    pub fn lots(&self, product: ProductId) -> Result<Vec<LotRecord>, StoreError> {
        Ok(self
            .store
            .snapshot()?
            .into_iter()
            .filter(|record| record.product_id == product)
            .collect())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
