//! In-memory adapters for the `stockhold` inventory library
//!
//! This crate provides in-memory implementations of the `InventoryStore` and
//! `ProductCatalog` traits, useful for testing and development scenarios where
//! persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use stockhold::{
    fifo_order, CatalogError, InventoryLot, InventoryStore, InventoryWrites, LotId, LotRecord,
    LotScope, Operation, ProductCatalog, ProductId, ProductSnapshot, StoreError,
};
use tracing::debug;

/// In-memory inventory store.
///
/// All lots live in one map behind a `std::sync::Mutex`. A commit verifies every
/// insert and every version before it writes anything, so a rejected batch
/// leaves the store untouched.
///
/// # Intended Use
///
/// - **Development**: running the coordinator without a database
/// - **Testing**: deterministic unit and integration tests
///
/// For production workloads use `PostgresInventoryStore` from
/// `stockhold-postgres`.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    lots: Mutex<HashMap<LotId, LotRecord>>,
}

impl InMemoryInventoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored lot, deleted ones included, oldest first.
    pub fn snapshot(&self) -> Result<Vec<LotRecord>, StoreError> {
        let lots = self.lots.lock().map_err(|_| StoreError::StoreFailure {
            operation: Operation::LoadLots,
        })?;
        let mut records: Vec<LotRecord> = lots.values().cloned().collect();
        records.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(records)
    }

    /// Number of stored lots, deleted ones included.
    pub fn lot_count(&self) -> Result<usize, StoreError> {
        let lots = self.lots.lock().map_err(|_| StoreError::StoreFailure {
            operation: Operation::LoadLots,
        })?;
        Ok(lots.len())
    }
}

impl InventoryStore for InMemoryInventoryStore {
    async fn load_lots(
        &self,
        products: &[ProductId],
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> Result<HashMap<ProductId, Vec<InventoryLot>>, StoreError> {
        let lots = self.lots.lock().map_err(|_| StoreError::StoreFailure {
            operation: Operation::LoadLots,
        })?;

        let mut by_product: HashMap<ProductId, Vec<InventoryLot>> = products
            .iter()
            .map(|product| (*product, Vec::new()))
            .collect();
        for record in lots.values() {
            if !scope.admits(record.deleted, record.expires_at, as_of) {
                continue;
            }
            if let Some(product_lots) = by_product.get_mut(&record.product_id) {
                product_lots.push(InventoryLot::from_record(record.clone()));
            }
        }
        drop(lots);

        for product_lots in by_product.values_mut() {
            product_lots.sort_by(fifo_order);
        }
        Ok(by_product)
    }

    async fn load_lot(&self, lot_id: LotId) -> Result<Option<InventoryLot>, StoreError> {
        let lots = self.lots.lock().map_err(|_| StoreError::StoreFailure {
            operation: Operation::LoadLot,
        })?;
        Ok(lots.get(&lot_id).cloned().map(InventoryLot::from_record))
    }

    async fn commit(&self, writes: InventoryWrites) -> Result<(), StoreError> {
        let mut lots = self.lots.lock().map_err(|_| StoreError::StoreFailure {
            operation: Operation::CommitTransaction,
        })?;

        // Check every constraint before writing any lot
        let mut seen = HashSet::with_capacity(writes.len());
        for record in writes.inserts() {
            if lots.contains_key(&record.id) || !seen.insert(record.id) {
                debug!(lot = %record.id, "[memory.commit] duplicate lot id");
                return Err(StoreError::DuplicateLot(record.id));
            }
        }
        for record in writes.updates() {
            let current = lots.get(&record.id).map(|stored| stored.version);
            if current != Some(record.version) || !seen.insert(record.id) {
                debug!(
                    lot = %record.id,
                    expected = record.version,
                    current = ?current,
                    "[memory.commit] version conflict"
                );
                return Err(StoreError::ConcurrencyConflict);
            }
        }

        // All versions match - proceed with writes
        let now = Utc::now();
        let (inserts, updates) = writes.into_parts();
        for mut record in inserts {
            record.version = 1;
            let _ = lots.insert(record.id, record);
        }
        for mut record in updates {
            record.version += 1;
            record.updated_at = now;
            let _ = lots.insert(record.id, record);
        }
        Ok(())
    }
}

/// In-memory product catalog.
#[derive(Debug, Default)]
pub struct InMemoryProductCatalog {
    products: Mutex<HashMap<ProductId, i64>>,
}

impl InMemoryProductCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a product, returning the catalog for chaining.
    #[must_use]
    pub fn with_product(self, product_id: ProductId, stock_quantity: i64) -> Self {
        self.set_stock(product_id, stock_quantity);
        self
    }

    /// Inserts or replaces a product's catalog stock.
    pub fn set_stock(&self, product_id: ProductId, stock_quantity: i64) {
        if let Ok(mut products) = self.products.lock() {
            let _ = products.insert(product_id, stock_quantity);
        }
    }

    /// Removes a product from the catalog.
    pub fn remove(&self, product_id: ProductId) {
        if let Ok(mut products) = self.products.lock() {
            let _ = products.remove(&product_id);
        }
    }
}

impl ProductCatalog for InMemoryProductCatalog {
    async fn get_product(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductSnapshot>, CatalogError> {
        let products = self
            .products
            .lock()
            .map_err(|_| CatalogError::Unavailable("catalog mutex poisoned".to_string()))?;
        Ok(products
            .get(&product_id)
            .map(|stock_quantity| ProductSnapshot {
                id: product_id,
                stock_quantity: *stock_quantity,
            }))
    }
}
