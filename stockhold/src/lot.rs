//! The `InventoryLot` aggregate.
//!
//! A lot is one batch of stock for a product. It tracks three disjoint
//! quantities: units that are `available`, units `reserved` for pending orders
//! and units `sold`. Every transition moves units between these buckets, so a
//! lot can never hold more than was put into it.
//!
//! The aggregate only guards its own invariants. Looking across lots, and
//! making sure no stale state is read between a check and a mutation, is the
//! job of [`crate::ReservationCoordinator`], which mutates lots only while it
//! holds the product's lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LotError;
use crate::types::{LotId, Money, ProductId, SyncStatus};

/// Persistence form of a lot.
///
/// Storage backends read and write this plain record; the coordinator only
/// ever manipulates lots through [`InventoryLot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRecord {
    /// Identity of the lot.
    pub id: LotId,
    /// Product the lot holds stock of.
    pub product_id: ProductId,
    /// Units that can still be reserved.
    pub available_quantity: u32,
    /// Units held for checkouts that have not completed.
    pub reserved_quantity: u32,
    /// Units that left the lot through a completed sale.
    pub sold_quantity: u32,
    /// Purchase price per unit, in minor currency units.
    pub cost_price: Option<Money>,
    /// Sale price per unit, in minor currency units.
    pub selling_price: Option<Money>,
    /// Past this instant the lot's available units are no longer sellable.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last external (ERP) update attempt, successful or not.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Outcome of the last external update.
    pub sync_status: SyncStatus,
    /// Error text of the last failed external update.
    pub sync_error: Option<String>,
    /// Creation time; the primary FIFO key.
    pub created_at: DateTime<Utc>,
    /// Time of the last committed change.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete flag. Deleted lots are invisible to every scoped read.
    pub deleted: bool,
    /// Optimistic concurrency token; `0` for a lot that was never stored.
    pub version: u64,
}

/// Optional attributes of a lot created explicitly (admin or ERP restock).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLot {
    /// Units available in the new lot.
    pub quantity: u32,
    /// Purchase price per unit.
    pub cost_price: Option<Money>,
    /// Sale price per unit.
    pub selling_price: Option<Money>,
    /// Expiry; `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewLot {
    /// A lot of `quantity` units with no prices and no expiry.
    pub fn with_quantity(quantity: u32) -> Self {
        Self {
            quantity,
            ..Self::default()
        }
    }
}

/// Administrative overwrite of a lot's quantities.
///
/// Quantities are signed so that bad input coming from an external system is
/// rejected instead of wrapping around. Prices left as `None` are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryUpdate {
    /// New available quantity; must fit in `0..=u32::MAX`.
    pub available: i64,
    /// New reserved quantity; same range as `available`.
    pub reserved: i64,
    /// New sold quantity; same range as `available`.
    pub sold: i64,
    /// Replacement purchase price.
    pub cost_price: Option<Money>,
    /// Replacement sale price.
    pub selling_price: Option<Money>,
}

/// One stock lot of a product and its valid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryLot {
    record: LotRecord,
}

impl InventoryLot {
    /// Creates a fresh lot holding `initial_quantity` available units.
    ///
    /// Fails with [`LotError::InvalidArgument`] when the quantity is negative or
    /// does not fit the lot's counters.
    pub fn create(
        product_id: ProductId,
        initial_quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, LotError> {
        let available = to_quantity("initial quantity", initial_quantity)?;
        Ok(Self::fresh(product_id, available, now))
    }

    /// Creates a lot from explicit restock attributes.
    pub fn from_new_lot(product_id: ProductId, new_lot: NewLot, now: DateTime<Utc>) -> Self {
        let mut lot = Self::fresh(product_id, new_lot.quantity, now);
        lot.record.cost_price = new_lot.cost_price;
        lot.record.selling_price = new_lot.selling_price;
        lot.record.expires_at = new_lot.expires_at;
        lot
    }

    fn fresh(product_id: ProductId, available: u32, now: DateTime<Utc>) -> Self {
        Self {
            record: LotRecord {
                id: LotId::new(),
                product_id,
                available_quantity: available,
                reserved_quantity: 0,
                sold_quantity: 0,
                cost_price: None,
                selling_price: None,
                expires_at: None,
                last_sync_at: None,
                sync_status: SyncStatus::NotSynced,
                sync_error: None,
                created_at: now,
                updated_at: now,
                deleted: false,
                version: 0,
            },
        }
    }

    /// Rebuilds a lot from its stored form.
    pub const fn from_record(record: LotRecord) -> Self {
        Self { record }
    }

    /// The stored form of this lot.
    pub const fn record(&self) -> &LotRecord {
        &self.record
    }

    /// Consumes the lot, returning its stored form.
    pub fn into_record(self) -> LotRecord {
        self.record
    }

    /// Identity of the lot.
    pub const fn id(&self) -> LotId {
        self.record.id
    }

    /// Product the lot holds stock of.
    pub const fn product_id(&self) -> ProductId {
        self.record.product_id
    }

    /// Units of this lot that are neither reserved nor sold.
    ///
    /// Only this lot is considered; totals across lots are computed by the
    /// coordinator.
    pub const fn available_stock(&self) -> u32 {
        self.record.available_quantity
    }

    /// Units of this lot held for pending checkouts.
    pub const fn reserved_quantity(&self) -> u32 {
        self.record.reserved_quantity
    }

    /// Units of this lot already sold.
    pub const fn sold_quantity(&self) -> u32 {
        self.record.sold_quantity
    }

    /// Creation time, used to order lots oldest first.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// Version the lot was loaded at; `0` before its first commit.
    pub const fn version(&self) -> u64 {
        self.record.version
    }

    /// Whether the lot was soft-deleted.
    pub const fn is_deleted(&self) -> bool {
        self.record.deleted
    }

    /// Whether the lot expired at or before `as_of`.
    pub fn is_expired(&self, as_of: DateTime<Utc>) -> bool {
        self.record.expires_at.is_some_and(|expiry| expiry <= as_of)
    }

    /// Holds `amount` units for a pending order.
    pub fn reserve_quantity(&mut self, amount: u32) -> Result<(), LotError> {
        require_positive("reservation", amount)?;
        if amount > self.record.available_quantity {
            return Err(LotError::InsufficientStock {
                requested: amount,
                available: self.record.available_quantity,
            });
        }
        let reserved = self
            .record
            .reserved_quantity
            .checked_add(amount)
            .ok_or_else(|| LotError::InvalidArgument("reserved quantity overflow".into()))?;

        self.record.available_quantity -= amount;
        self.record.reserved_quantity = reserved;
        Ok(())
    }

    /// Returns `amount` previously reserved units to the available pool.
    pub fn release_reservation(&mut self, amount: u32) -> Result<(), LotError> {
        require_positive("release", amount)?;
        self.require_reserved("release", amount)?;
        let available = self
            .record
            .available_quantity
            .checked_add(amount)
            .ok_or_else(|| LotError::InvalidArgument("available quantity overflow".into()))?;

        self.record.reserved_quantity -= amount;
        self.record.available_quantity = available;
        Ok(())
    }

    /// Marks `amount` reserved units as sold.
    pub fn commit_sale(&mut self, amount: u32) -> Result<(), LotError> {
        require_positive("sale", amount)?;
        self.require_reserved("sale", amount)?;
        let sold = self
            .record
            .sold_quantity
            .checked_add(amount)
            .ok_or_else(|| LotError::InvalidArgument("sold quantity overflow".into()))?;

        self.record.reserved_quantity -= amount;
        self.record.sold_quantity = sold;
        Ok(())
    }

    /// Overwrites quantities and prices. Reserved for the external sync path.
    ///
    /// The update is validated as a whole before anything changes.
    pub fn update_inventory(&mut self, update: InventoryUpdate) -> Result<(), LotError> {
        let available = to_quantity("available quantity", update.available)?;
        let reserved = to_quantity("reserved quantity", update.reserved)?;
        let sold = to_quantity("sold quantity", update.sold)?;

        self.record.available_quantity = available;
        self.record.reserved_quantity = reserved;
        self.record.sold_quantity = sold;
        if update.cost_price.is_some() {
            self.record.cost_price = update.cost_price;
        }
        if update.selling_price.is_some() {
            self.record.selling_price = update.selling_price;
        }
        Ok(())
    }

    /// The overwrite that keeps every current value except `available`.
    pub fn with_available(&self, available: u32) -> InventoryUpdate {
        InventoryUpdate {
            available: i64::from(available),
            reserved: i64::from(self.record.reserved_quantity),
            sold: i64::from(self.record.sold_quantity),
            cost_price: None,
            selling_price: None,
        }
    }

    /// Records a successful external update.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.record.last_sync_at = Some(at);
        self.record.sync_status = SyncStatus::Synced;
        self.record.sync_error = None;
    }

    /// Records a failed external update, keeping quantities untouched.
    pub fn mark_sync_failed(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.record.last_sync_at = Some(at);
        self.record.sync_status = SyncStatus::Failed;
        self.record.sync_error = Some(error.into());
    }

    /// Soft-deletes the lot. A lot still holding reservations cannot be retired.
    pub fn soft_delete(&mut self) -> Result<(), LotError> {
        if self.record.reserved_quantity > 0 {
            return Err(LotError::InvalidArgument(format!(
                "lot still holds {} reserved units",
                self.record.reserved_quantity
            )));
        }
        self.record.deleted = true;
        Ok(())
    }
}

fn require_positive(what: &str, amount: u32) -> Result<(), LotError> {
    if amount == 0 {
        return Err(LotError::InvalidArgument(format!(
            "{what} quantity must be positive"
        )));
    }
    Ok(())
}

fn to_quantity(what: &str, value: i64) -> Result<u32, LotError> {
    u32::try_from(value)
        .map_err(|_| LotError::InvalidArgument(format!("{what} {value} is out of range")))
}

impl InventoryLot {
    fn require_reserved(&self, what: &str, amount: u32) -> Result<(), LotError> {
        if amount > self.record.reserved_quantity {
            return Err(LotError::InvalidArgument(format!(
                "{what} of {amount} exceeds reserved quantity {}",
                self.record.reserved_quantity
            )));
        }
        Ok(())
    }
}
