//! Failure injection for inventory stores.
//!
//! [`ChaosInventoryStore`] wraps a real store and, depending on its
//! [`ChaosConfig`], fails reads and commits or rejects commits with version
//! conflicts. It is how the coordinator's retry and error paths are exercised
//! without a misbehaving database.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use nutype::nutype;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use stockhold::{
    InventoryLot, InventoryStore, InventoryWrites, LotId, LotScope, Operation, ProductId,
    StoreError,
};

/// Probability value for chaos injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

/// What a [`ChaosInventoryStore`] injects.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
    scripted_conflicts: u32,
}

impl ChaosConfig {
    /// No injection, with a fixed random seed.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Probability that any operation fails with a store failure.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    /// Probability that a commit is rejected with a version conflict.
    #[must_use]
    pub fn with_version_conflict_probability(mut self, probability: f32) -> Self {
        self.version_conflict_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    /// Rejects the first `count` commits with a version conflict, then behaves.
    #[must_use]
    pub const fn with_scripted_conflicts(mut self, count: u32) -> Self {
        self.scripted_conflicts = count;
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("0.0 is valid probability"),
            version_conflict_probability: Probability::try_new(0.0)
                .expect("0.0 is valid probability"),
            scripted_conflicts: 0,
        }
    }
}

/// Wraps any store in a [`ChaosInventoryStore`].
pub trait ChaosInventoryStoreExt: Sized {
    /// Wraps `self` with the given injection settings.
    fn with_chaos(self, config: ChaosConfig) -> ChaosInventoryStore<Self>;
}

/// A store that injects failures in front of another store.
#[derive(Debug)]
pub struct ChaosInventoryStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    commits: AtomicU32,
    injected_conflicts: AtomicU32,
}

impl<S> ChaosInventoryStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
            commits: AtomicU32::new(0),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// The wrapped store, for inspecting state without injection.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    /// Number of commits attempted through this wrapper.
    pub fn commit_attempts(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of commits rejected with an injected conflict.
    pub fn injected_conflicts(&self) -> u32 {
        self.injected_conflicts.load(Ordering::SeqCst)
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let prob_f32: f32 = probability.into();

        if prob_f32 <= 0.0 {
            return false;
        }

        if prob_f32 >= 1.0 {
            return true;
        }

        let mut rng = self
            .rng
            .lock()
            .expect("chaos RNG mutex should not be poisoned");

        rng.random_bool(f64::from(prob_f32))
    }
}

impl<S> InventoryStore for ChaosInventoryStore<S>
where
    S: InventoryStore,
{
    fn load_lots(
        &self,
        products: &[ProductId],
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = Result<HashMap<ProductId, Vec<InventoryLot>>, StoreError>> + Send
    {
        let should_fail = self.should_inject(self.config.failure_probability);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::StoreFailure {
                    operation: Operation::LoadLots,
                });
            }

            store.load_lots(products, scope, as_of).await
        }
    }

    fn load_lot(
        &self,
        lot_id: LotId,
    ) -> impl Future<Output = Result<Option<InventoryLot>, StoreError>> + Send {
        let should_fail = self.should_inject(self.config.failure_probability);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::StoreFailure {
                    operation: Operation::LoadLot,
                });
            }

            store.load_lot(lot_id).await
        }
    }

    fn commit(
        &self,
        writes: InventoryWrites,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let attempt = self.commits.fetch_add(1, Ordering::SeqCst);
        let should_conflict = attempt < self.config.scripted_conflicts
            || self.should_inject(self.config.version_conflict_probability);
        let should_fail = self.should_inject(self.config.failure_probability);
        if should_conflict {
            let _ = self.injected_conflicts.fetch_add(1, Ordering::SeqCst);
        }
        let store = &self.store;

        async move {
            if should_conflict {
                return Err(StoreError::ConcurrencyConflict);
            }

            if should_fail {
                return Err(StoreError::StoreFailure {
                    operation: Operation::CommitTransaction,
                });
            }

            store.commit(writes).await
        }
    }
}

impl<S> ChaosInventoryStoreExt for S
where
    S: InventoryStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosInventoryStore<Self> {
        ChaosInventoryStore::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{unique_product_id, LotFixture};
    use stockhold_memory::InMemoryInventoryStore;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn probabilities_are_clamped() {
        let config = ChaosConfig::deterministic()
            .with_failure_probability(3.0)
            .with_version_conflict_probability(-1.0);
        assert!((config.failure_probability.into_inner() - 1.0).abs() < f32::EPSILON);
        assert!(config.version_conflict_probability.into_inner().abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn zero_probability_passthrough_allows_normal_operations() {
        let product = unique_product_id();
        let lot = LotFixture::new(product, 3).build();
        let lot_id = lot.id();
        let chaos_store = InMemoryInventoryStore::new().with_chaos(ChaosConfig::default());

        let commit_result = chaos_store
            .commit(InventoryWrites::new().with_insert(lot))
            .await;
        let load_result = chaos_store.load_lot(lot_id).await;

        assert!(commit_result.is_ok());
        assert!(matches!(load_result, Ok(Some(_))));
    }

    #[tokio::test]
    async fn scripted_conflicts_reject_only_the_first_commits() {
        let product = unique_product_id();
        let chaos_store = InMemoryInventoryStore::new()
            .with_chaos(ChaosConfig::deterministic().with_scripted_conflicts(2));

        for expected_conflict in [true, true, false] {
            let writes = InventoryWrites::new().with_insert(LotFixture::new(product, 1).build());
            let result = chaos_store.commit(writes).await;
            assert_eq!(result.is_err(), expected_conflict);
        }
        assert_eq!(chaos_store.commit_attempts(), 3);
        assert_eq!(chaos_store.injected_conflicts(), 2);
        assert_eq!(chaos_store.inner().lot_count().unwrap(), 1);
    }

    #[test]
    fn deterministic_half_probability_does_not_inject_immediately() {
        let chaos_store = ChaosInventoryStore::new(
            InMemoryInventoryStore::new(),
            ChaosConfig::deterministic().with_failure_probability(0.5),
        );

        let injected = chaos_store.should_inject(Probability::try_new(0.5).unwrap());
        let again = ChaosInventoryStore::new(
            InMemoryInventoryStore::new(),
            ChaosConfig::deterministic().with_failure_probability(0.5),
        )
        .should_inject(Probability::try_new(0.5).unwrap());

        assert_eq!(injected, again);
    }
}
