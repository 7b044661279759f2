//! Per-product mutual exclusion.
//!
//! The registry lazily creates one async mutex per product and hands out the
//! same mutex for every later lookup. It is an ordinary value owned by the
//! application (usually behind an `Arc` shared by every coordinator), so tests
//! can build and drop as many registries as they like.
//!
//! Deadlock freedom rests on one rule: a [`ProductLockSet`] always acquires its
//! locks in ascending [`ProductId`] order and releases them in reverse order.
//! Nothing else in the crate takes a product lock.
//!
//! Entries do not accumulate: when a set is dropped, each of its products whose
//! lock nobody else holds or waits for is removed from the registry again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as ProductMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::errors::{ReservationError, ReservationResult};
use crate::types::ProductId;

type LockMap = Mutex<HashMap<ProductId, Arc<ProductMutex<()>>>>;

/// Registry mapping product identity to its lock.
#[derive(Debug, Default)]
pub struct ProductLockRegistry {
    locks: Arc<LockMap>,
}

impl ProductLockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock of `product`.
    ///
    /// Lookup and insertion happen under one registry guard, so concurrent
    /// first lookups for a product always observe the same lock.
    pub fn lock_for(&self, product: ProductId) -> Arc<ProductMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(product).or_default())
    }

    /// Number of products with a cached lock.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no product has a cached lock.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Drops every cached lock that nobody holds or waits for.
    ///
    /// Released lock sets already prune their own products; this sweeps up
    /// entries created by [`Self::lock_for`] alone. Returns the number of
    /// entries removed.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    /// Locks every product in `products`, in ascending order.
    ///
    /// Duplicates are acquired once. Each acquisition may wait at most
    /// `timeout`; on expiry every lock already taken is released (in reverse
    /// order) and [`ReservationError::LockTimeout`] names the contended product.
    pub async fn acquire(
        &self,
        products: impl IntoIterator<Item = ProductId>,
        timeout: Duration,
    ) -> ReservationResult<ProductLockSet> {
        let mut ordered: Vec<ProductId> = products.into_iter().collect();
        ordered.sort_unstable();
        ordered.dedup();

        let mut set = ProductLockSet {
            guards: Vec::with_capacity(ordered.len()),
            registry: Arc::clone(&self.locks),
        };
        for product in ordered {
            let lock = self.lock_for(product);
            match tokio::time::timeout(timeout, lock.lock_owned()).await {
                Ok(guard) => {
                    debug!(product = %product, "[locks.acquire] product lock acquired");
                    set.guards.push((product, guard));
                }
                Err(_) => {
                    warn!(
                        product = %product,
                        timeout_ms = timeout.as_millis(),
                        "[locks.acquire] timed out waiting for product lock"
                    );
                    return Err(ReservationError::LockTimeout { product });
                }
            }
        }
        Ok(set)
    }
}

/// Locks held for one operation; released in reverse acquisition order on drop.
pub struct ProductLockSet {
    guards: Vec<(ProductId, OwnedMutexGuard<()>)>,
    registry: Arc<LockMap>,
}

impl std::fmt::Debug for ProductLockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductLockSet")
            .field("products", &self.products())
            .finish_non_exhaustive()
    }
}

impl ProductLockSet {
    /// Products held, in acquisition order.
    pub fn products(&self) -> Vec<ProductId> {
        self.guards.iter().map(|(product, _)| *product).collect()
    }

    /// Whether `product` is held by this set.
    pub fn holds(&self, product: ProductId) -> bool {
        self.guards.iter().any(|(held, _)| *held == product)
    }

    /// Releases the locks now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProductLockSet {
    fn drop(&mut self) {
        let mut released = Vec::with_capacity(self.guards.len());
        while let Some((product, guard)) = self.guards.pop() {
            drop(guard);
            debug!(product = %product, "[locks.release] product lock released");
            released.push(product);
        }

        // Lookups clone under the same guard, so a count of one cannot grow
        // while it is held.
        let mut locks = self.registry.lock();
        for product in released {
            if locks
                .get(&product)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&product);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> ProductId {
        ProductId::try_new(raw).unwrap()
    }

    #[test]
    fn same_product_returns_same_lock() {
        let registry = ProductLockRegistry::new();
        let first = registry.lock_for(id(1));
        let second = registry.lock_for(id(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_products_return_different_locks() {
        let registry = ProductLockRegistry::new();
        let first = registry.lock_for(id(1));
        let second = registry.lock_for(id(2));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn registries_are_independent() {
        let left = ProductLockRegistry::new();
        let right = ProductLockRegistry::new();
        assert!(!Arc::ptr_eq(&left.lock_for(id(1)), &right.lock_for(id(1))));
    }

    #[tokio::test]
    async fn acquire_sorts_and_dedups_products() {
        let registry = ProductLockRegistry::new();
        let set = registry
            .acquire([id(9), id(2), id(5), id(2)], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(set.products(), vec![id(2), id(5), id(9)]);
        assert!(set.holds(id(5)));
        assert!(!set.holds(id(3)));
    }

    #[tokio::test]
    async fn held_lock_blocks_other_sets_until_dropped() {
        let registry = ProductLockRegistry::new();
        let held = registry
            .acquire([id(1)], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(registry.lock_for(id(1)).try_lock().is_err());

        held.release();
        assert!(registry.lock_for(id(1)).try_lock().is_ok());
    }

    #[tokio::test]
    async fn waiting_acquisition_stays_pending_while_lock_is_held() {
        let registry = ProductLockRegistry::new();
        let held = registry
            .acquire([id(4)], Duration::from_secs(1))
            .await
            .unwrap();

        let mut waiting =
            tokio_test::task::spawn(registry.acquire([id(4)], Duration::from_secs(60)));
        tokio_test::assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let set = tokio_test::assert_ready_ok!(waiting.poll());
        assert!(set.holds(id(4)));
    }

    #[tokio::test]
    async fn timeout_releases_locks_already_taken() {
        let registry = ProductLockRegistry::new();
        let blocker = registry
            .acquire([id(2)], Duration::from_secs(1))
            .await
            .unwrap();

        let result = registry
            .acquire([id(1), id(2)], Duration::from_millis(20))
            .await;
        assert_eq!(
            result.unwrap_err(),
            ReservationError::LockTimeout { product: id(2) }
        );
        assert!(registry.lock_for(id(1)).try_lock().is_ok());
        drop(blocker);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let registry = ProductLockRegistry::new();
        let held = registry
            .acquire([id(1), id(2)], Duration::from_secs(1))
            .await
            .unwrap();
        let _ = registry.lock_for(id(3));

        assert_eq!(registry.prune_idle(), 1);
        assert_eq!(registry.len(), 2);

        drop(held);
        assert!(registry.is_empty());
        assert_eq!(registry.prune_idle(), 0);
    }

    #[tokio::test]
    async fn released_sets_leave_no_entries_behind() {
        let registry = ProductLockRegistry::new();
        for raw in 1..=50 {
            let set = registry
                .acquire([id(raw), id(raw + 1)], Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(registry.len(), 2);
            drop(set);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn release_keeps_entries_with_waiters() {
        let registry = ProductLockRegistry::new();
        let held = registry
            .acquire([id(7), id(8)], Duration::from_secs(1))
            .await
            .unwrap();
        let mut waiting =
            tokio_test::task::spawn(registry.acquire([id(7)], Duration::from_secs(60)));
        tokio_test::assert_pending!(waiting.poll());

        drop(held);

        assert_eq!(registry.len(), 1);
        let set = tokio_test::assert_ready_ok!(waiting.poll());
        assert!(set.holds(id(7)));
        assert!(Arc::ptr_eq(&registry.lock_for(id(7)), &registry.lock_for(id(7))));
        drop(set);
        assert!(registry.is_empty());
    }
}
