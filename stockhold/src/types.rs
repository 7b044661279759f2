//! Core types for the `stockhold` inventory library.
//!
//! All identifiers and amounts use smart constructors so that a value, once
//! built, is always valid. Invalid input is rejected at the boundary, never
//! inside the reservation path.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog identity of a product.
///
/// Product ids are strictly positive. Their ascending order is the single global
/// order in which per-product locks are acquired.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(i64);

/// Identity of a single inventory lot.
///
/// `LotId` values are UUIDv7, so lots created one after another also sort by id.
/// The FIFO order uses the id to break ties between lots sharing a creation time.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LotId(Uuid);

impl LotId {
    /// Creates a new `LotId` from the current timestamp.
    pub fn new() -> Self {
        // Uuid::now_v7() always yields a version 7 uuid
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for LotId {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-negative monetary amount in minor currency units (e.g. cents).
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Money(i64);

/// Provenance of the last external (ERP) update applied to a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The lot has never been touched by the external sync.
    #[default]
    NotSynced,
    /// The last external update was applied.
    Synced,
    /// The last external update failed; see the lot's sync error.
    Failed,
}

impl SyncStatus {
    /// Stable textual form used by storage backends.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSynced => "not_synced",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Parses the textual form produced by [`SyncStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_synced" => Some(Self::NotSynced),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which lots a storage query returns.
///
/// The predicate is evaluated by the store itself so that soft-delete and expiry
/// filtering is applied the same way on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LotScope {
    /// Lots that are neither soft-deleted nor expired: the stock that may be sold.
    Sellable,
    /// Lots that are not soft-deleted, expired ones included.
    Live,
    /// Every lot, soft-deleted ones included.
    All,
}

impl LotScope {
    /// Evaluates the scope predicate against a lot's flags at `as_of`.
    pub fn admits(
        self,
        deleted: bool,
        expires_at: Option<DateTime<Utc>>,
        as_of: DateTime<Utc>,
    ) -> bool {
        match self {
            Self::All => true,
            Self::Live => !deleted,
            Self::Sellable => !deleted && expires_at.is_none_or(|expiry| expiry > as_of),
        }
    }
}

/// One requested line of a multi-item operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockItem {
    /// The product the line refers to.
    pub product_id: ProductId,
    /// Units requested for the product on this line.
    pub quantity: u32,
}

impl StockItem {
    /// Creates a new line.
    pub const fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// The catalog's view of a product, used to seed a first inventory lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    /// Catalog identity.
    pub id: ProductId,
    /// Stock recorded on the product itself; may be negative in legacy data.
    pub stock_quantity: i64,
}

/// Aggregated stock of one product across its lots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockLevel {
    /// Units available across sellable lots.
    pub available: u64,
    /// Units reserved across live lots.
    pub reserved: u64,
    /// Units sold across live lots.
    pub sold: u64,
    /// Number of live lots.
    pub lots: usize,
}
