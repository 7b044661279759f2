//! Fixtures for store and coordinator tests.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use stockhold::{InventoryLot, LotId, LotRecord, Money, ProductId, SyncStatus};

/// A product id no other test is likely to use.
///
/// Contract tests may run in parallel against one shared database, so every
/// scenario works on its own products.
pub fn unique_product_id() -> ProductId {
    let raw = rand::rng().random_range(1_000_000..i64::MAX);
    ProductId::try_new(raw).expect("range starts above zero")
}

/// `at` truncated to whole microseconds, the precision of `TIMESTAMPTZ`.
pub fn micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

/// Now, at storage precision.
pub fn now() -> DateTime<Utc> {
    micros(Utc::now())
}

/// Builder for lot records in arbitrary states.
#[derive(Debug, Clone)]
pub struct LotFixture {
    record: LotRecord,
}

impl LotFixture {
    /// A never-stored lot of `product_id` holding `available` units, created now.
    pub fn new(product_id: ProductId, available: u32) -> Self {
        let created_at = now();
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
                created_at,
                updated_at: created_at,
                deleted: false,
                version: 0,
            },
        }
    }

    /// Sets the creation time, at storage precision.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.created_at = micros(at);
        self.record.updated_at = self.record.created_at;
        self
    }

    /// Moves the creation time `seconds` after the current one.
    #[must_use]
    pub fn created_later(self, seconds: i64) -> Self {
        let at = self.record.created_at + Duration::seconds(seconds);
        self.created_at(at)
    }

    /// Sets the reserved quantity.
    #[must_use]
    pub const fn reserved(mut self, reserved: u32) -> Self {
        self.record.reserved_quantity = reserved;
        self
    }

    /// Sets the sold quantity.
    #[must_use]
    pub const fn sold(mut self, sold: u32) -> Self {
        self.record.sold_quantity = sold;
        self
    }

    /// Sets both prices, in minor units.
    #[must_use]
    pub fn priced(mut self, cost: i64, selling: i64) -> Self {
        self.record.cost_price = Money::try_new(cost).ok();
        self.record.selling_price = Money::try_new(selling).ok();
        self
    }

    /// Makes the lot expire at `at`.
    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.expires_at = Some(micros(at));
        self
    }

    /// Makes the lot already expired.
    #[must_use]
    pub fn expired(self) -> Self {
        self.expires_at(Utc::now() - Duration::hours(1))
    }

    /// Marks the lot soft-deleted.
    #[must_use]
    pub const fn deleted(mut self) -> Self {
        self.record.deleted = true;
        self
    }

    /// Records a failed external update.
    #[must_use]
    pub fn sync_failed(mut self, error: &str) -> Self {
        self.record.last_sync_at = Some(self.record.created_at);
        self.record.sync_status = SyncStatus::Failed;
        self.record.sync_error = Some(error.to_string());
        self
    }

    /// Builds the lot aggregate.
    pub fn build(self) -> InventoryLot {
        InventoryLot::from_record(self.record)
    }

    /// Returns the raw record, for store-level tests.
    pub fn record(self) -> LotRecord {
        self.record
    }
}
