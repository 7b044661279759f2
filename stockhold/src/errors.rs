//! Error types for stockhold.
//!
//! Each layer has its own error enum so callers can tell apart the outcomes
//! they are expected to handle from the ones that indicate a bug or an outage.
//!
//! # Error Categories
//!
//! - **LotError**: a state transition on a single lot was refused
//! - **StoreError**: the storage backend rejected or failed a read or commit
//! - **CatalogError**: the product catalog could not be consulted
//! - **ReservationError**: a coordinator operation failed fatally
//! - **ConfigError**: configuration could not be parsed or validated
//!
//! Running out of stock is not an error at the coordinator level: it is reported
//! as `Ok(false)` (or [`crate::ReservationOutcome::Insufficient`]) so that checkout
//! can handle it on the hot path without unwinding.

use thiserror::Error;

use crate::types::{LotId, ProductId};

/// Errors raised by [`crate::InventoryLot`] state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LotError {
    /// The requested transition used a quantity the lot cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The lot does not hold enough available units for the reservation.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock {
        /// Units requested.
        requested: u32,
        /// Units available on the lot.
        available: u32,
    },
}

/// Storage operation that failed, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Loading lots for a set of products.
    LoadLots,
    /// Loading a single lot.
    LoadLot,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Writing a lot inside a transaction.
    WriteLot,
    /// Committing a database transaction.
    CommitTransaction,
    /// Reading a product from the catalog.
    LoadProduct,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadLots => write!(f, "load_lots"),
            Self::LoadLot => write!(f, "load_lot"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::WriteLot => write!(f, "write_lot"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
            Self::LoadProduct => write!(f, "load_product"),
        }
    }
}

/// Errors returned by [`crate::InventoryStore`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A lot in the batch changed since it was read; nothing was written.
    #[error("version conflict detected")]
    ConcurrencyConflict,

    /// An inserted lot id already exists; nothing was written.
    #[error("lot {0} already exists")]
    DuplicateLot(LotId),

    /// The backend failed while performing the operation.
    #[error("{operation} operation failed")]
    StoreFailure {
        /// The failing operation.
        operation: Operation,
    },

    /// A stored row does not describe a valid lot.
    #[error("stored lot {lot} is corrupted: {detail}")]
    Corrupted {
        /// Raw identifier of the offending row.
        lot: String,
        /// What was wrong with it.
        detail: String,
    },
}

/// Errors returned by [`crate::ProductCatalog`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The catalog could not be reached or queried.
    #[error("product catalog unavailable: {0}")]
    Unavailable(String),
}

/// Fatal failures of a [`crate::ReservationCoordinator`] operation.
///
/// # Error Handling Strategy
///
/// - **InvalidArgument**: caller bug, answer with a 4xx-equivalent
/// - **InvariantViolation**: caller bug (e.g. releasing more than was reserved),
///   already logged, answer with a 4xx-equivalent
/// - **ProductNotFound**: the catalog does not know the product
/// - **LockTimeout**: contention; the caller may retry the whole checkout
/// - **ConcurrencyConflict**: retries were exhausted; abort the checkout
/// - **Store** / **Catalog**: infrastructure failure; abort the checkout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Applying the request would break an inventory invariant.
    #[error("inventory invariant violated for product {product}: {detail}")]
    InvariantViolation {
        /// Product whose lots refused the change.
        product: ProductId,
        /// Description of the violation.
        detail: String,
    },

    /// The catalog has no product with this id, so no lot can be seeded.
    #[error("product {0} not found in catalog")]
    ProductNotFound(ProductId),

    /// The per-product lock could not be acquired in time.
    #[error("timed out acquiring lock for product {product}")]
    LockTimeout {
        /// Product whose lock was contended.
        product: ProductId,
    },

    /// Every attempt hit a concurrent modification.
    #[error("concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The inventory store failed.
    #[error("inventory store error: {0}")]
    Store(StoreError),

    /// The product catalog failed.
    #[error("product catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl ReservationError {
    /// Whether the failure was caused by the caller rather than the system.
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvariantViolation { .. } | Self::ProductNotFound(_)
        )
    }
}

impl From<StoreError> for ReservationError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Errors raised while building a [`crate::ReservationConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable held something that is not a number.
    #[error("{variable} must be an unsigned integer, got {value:?}")]
    NotANumber {
        /// Name of the variable.
        variable: &'static str,
        /// Raw value found.
        value: String,
    },

    /// A value was outside its allowed range.
    #[error("{parameter} out of range: {detail}")]
    OutOfRange {
        /// Name of the parameter.
        parameter: &'static str,
        /// Validation message.
        detail: String,
    },

    /// The maximum retry delay is below the base delay.
    #[error("retry max delay {max_ms}ms is below base delay {base_ms}ms")]
    InconsistentDelays {
        /// Configured base delay.
        base_ms: u64,
        /// Configured maximum delay.
        max_ms: u64,
    },
}

/// Convenience alias for coordinator results.
pub type ReservationResult<T> = Result<T, ReservationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_classified() {
        let product = ProductId::try_new(7).unwrap();

        assert!(ReservationError::InvalidArgument("zero".into()).is_caller_error());
        assert!(ReservationError::InvariantViolation {
            product,
            detail: "over-release".into()
        }
        .is_caller_error());
        assert!(ReservationError::ProductNotFound(product).is_caller_error());
        assert!(!ReservationError::LockTimeout { product }.is_caller_error());
        assert!(!ReservationError::ConcurrencyConflict { attempts: 3 }.is_caller_error());
        assert!(!ReservationError::Store(StoreError::ConcurrencyConflict).is_caller_error());
    }

    #[test]
    fn store_failure_names_the_operation() {
        let error = StoreError::StoreFailure {
            operation: Operation::CommitTransaction,
        };
        assert_eq!(error.to_string(), "commit_transaction operation failed");
    }
}
