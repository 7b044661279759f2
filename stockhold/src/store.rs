//! Storage and catalog ports.
//!
//! The coordinator talks to persistence through [`InventoryStore`] and to the
//! product catalog through [`ProductCatalog`]. Implementations include:
//! - `stockhold-postgres`: the relational `inventory_lots` table
//! - `stockhold-memory`: in-memory adapters for tests and development

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::{CatalogError, StoreError};
use crate::lot::{InventoryLot, LotRecord};
use crate::types::{LotId, LotScope, ProductId, ProductSnapshot};

/// A batch of lot writes committed atomically.
///
/// Updated lots carry the version they were loaded at; the store rejects the
/// whole batch if any of them changed in the meantime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryWrites {
    inserts: Vec<LotRecord>,
    updates: Vec<LotRecord>,
}

impl InventoryWrites {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lot that does not exist in the store yet.
    #[must_use]
    pub fn with_insert(mut self, lot: InventoryLot) -> Self {
        self.inserts.push(lot.into_record());
        self
    }

    /// Adds a changed lot, expected to still be at the version it was read at.
    #[must_use]
    pub fn with_update(mut self, lot: InventoryLot) -> Self {
        self.updates.push(lot.into_record());
        self
    }

    /// Adds a changed lot in place.
    pub fn push_update(&mut self, lot: InventoryLot) {
        self.updates.push(lot.into_record());
    }

    /// Adds a new lot in place.
    pub fn push_insert(&mut self, lot: InventoryLot) {
        self.inserts.push(lot.into_record());
    }

    /// Whether the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    /// Number of lots written by the batch.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len()
    }

    /// Lots to insert.
    pub fn inserts(&self) -> &[LotRecord] {
        &self.inserts
    }

    /// Lots to update, each carrying its expected version.
    pub fn updates(&self) -> &[LotRecord] {
        &self.updates
    }

    /// Splits the batch into `(inserts, updates)`.
    pub fn into_parts(self) -> (Vec<LotRecord>, Vec<LotRecord>) {
        (self.inserts, self.updates)
    }
}

/// Contract for inventory lot storage.
///
/// # Atomicity Guarantee
///
/// [`InventoryStore::commit`] writes all lots of a batch or none of them. If an
/// updated lot's stored version differs from the version it carries, or an
/// inserted id already exists, the batch is rejected and nothing changes.
///
/// # Scope Filtering
///
/// Reads take a [`LotScope`] that the store evaluates itself, so soft-deleted
/// and expired lots are excluded the same way on every code path.
pub trait InventoryStore: Send + Sync {
    /// Load the lots of every product in `products` that satisfy `scope` at `as_of`.
    ///
    /// Every requested product appears in the result, with an empty vec when it
    /// has no matching lots. Lots are ordered oldest first by `(created_at, id)`.
    fn load_lots(
        &self,
        products: &[ProductId],
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = Result<HashMap<ProductId, Vec<InventoryLot>>, StoreError>> + Send;

    /// Load one lot regardless of scope.
    fn load_lot(
        &self,
        lot_id: LotId,
    ) -> impl Future<Output = Result<Option<InventoryLot>, StoreError>> + Send;

    /// Atomically apply a batch of inserts and version-checked updates.
    ///
    /// Stored versions of updated lots advance by one; inserted lots start at
    /// version one.
    fn commit(
        &self,
        writes: InventoryWrites,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Read access to the product catalog.
pub trait ProductCatalog: Send + Sync {
    /// Fetch a product's catalog snapshot, `None` when it does not exist.
    fn get_product(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<ProductSnapshot>, CatalogError>> + Send;
}

impl<S: InventoryStore> InventoryStore for Arc<S> {
    fn load_lots(
        &self,
        products: &[ProductId],
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = Result<HashMap<ProductId, Vec<InventoryLot>>, StoreError>> + Send
    {
        (**self).load_lots(products, scope, as_of)
    }

    fn load_lot(
        &self,
        lot_id: LotId,
    ) -> impl Future<Output = Result<Option<InventoryLot>, StoreError>> + Send {
        (**self).load_lot(lot_id)
    }

    fn commit(
        &self,
        writes: InventoryWrites,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).commit(writes)
    }
}

impl<C: ProductCatalog> ProductCatalog for Arc<C> {
    fn get_product(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<ProductSnapshot>, CatalogError>> + Send {
        (**self).get_product(product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot(quantity: i64) -> InventoryLot {
        InventoryLot::create(ProductId::try_new(3).unwrap(), quantity, Utc::now()).unwrap()
    }

    #[test]
    fn empty_batch_reports_empty() {
        let writes = InventoryWrites::new();
        assert!(writes.is_empty());
        assert_eq!(writes.len(), 0);
    }

    #[test]
    fn builder_keeps_inserts_and_updates_apart() {
        let inserted = lot(1);
        let updated = lot(2);
        let writes = InventoryWrites::new()
            .with_insert(inserted.clone())
            .with_update(updated.clone());

        assert_eq!(writes.len(), 2);
        let (inserts, updates) = writes.into_parts();
        assert_eq!(inserts, vec![inserted.into_record()]);
        assert_eq!(updates, vec![updated.into_record()]);
    }
}
