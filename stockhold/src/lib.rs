//! Oversell-free inventory reservation for e-commerce checkouts.
//!
//! Stock of a product is kept in one or more lots ([`InventoryLot`]). A
//! [`ReservationCoordinator`] reserves, releases and sells stock across those
//! lots, oldest lot first, for one product or for a whole cart at once.
//!
//! # Guarantees
//!
//! - **No oversell**: the sufficiency check and the deduction happen under the
//!   product's lock, on freshly loaded lots.
//! - **All-or-nothing**: a multi-item reservation either reserves every line or
//!   changes nothing. Running out of stock is `Ok(false)`, not an error.
//! - **Deadlock freedom**: product locks are always taken in ascending
//!   [`ProductId`] order and released in reverse.
//! - **Atomic persistence**: every operation ends in one
//!   [`InventoryStore::commit`], so a cancelled call either fully applied or
//!   did not apply at all.
//!
//! # Crates
//!
//! - `stockhold-memory`: in-memory store and catalog
//! - `stockhold-postgres`: PostgreSQL store and catalog
//! - `stockhold-testing`: store contract suite and failure injection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stockhold::{ProductLockRegistry, ReservationCoordinator, StockItem};
//!
//! let locks = Arc::new(ProductLockRegistry::new());
//! let coordinator = ReservationCoordinator::new(store, catalog, locks);
//!
//! let reserved = coordinator
//!     .try_reserve_multiple(&[StockItem::new(a, 3), StockItem::new(b, 1)])
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod allocation;
mod config;
mod coordinator;
mod errors;
mod locks;
mod lot;
mod retry;
mod store;
mod types;

pub use allocation::{fifo_order, plan_absolute, plan_fifo, Allocation, Bucket, Shortfall};
pub use config::{
    LockTimeoutMs, MaxRetryAttempts, ReservationConfig, RetryBaseDelayMs, RetryConfig,
    RetryMaxDelayMs, LOCK_TIMEOUT_MS_VAR, MAX_RETRY_ATTEMPTS_VAR, RETRY_BASE_DELAY_MS_VAR,
    RETRY_MAX_DELAY_MS_VAR,
};
pub use coordinator::{ReservationCoordinator, ReservationOutcome, Shortage};
pub use errors::{
    CatalogError, ConfigError, LotError, Operation, ReservationError, ReservationResult,
    StoreError,
};
pub use locks::{ProductLockRegistry, ProductLockSet};
pub use lot::{InventoryLot, InventoryUpdate, LotRecord, NewLot};
pub use store::{InventoryStore, InventoryWrites, ProductCatalog};
pub use types::{LotId, LotScope, Money, ProductId, ProductSnapshot, StockItem, StockLevel, SyncStatus};
