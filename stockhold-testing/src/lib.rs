//! Testing utilities for `stockhold` storage backends.
//!
//! - [`contract`]: the behavioral suite every [`stockhold::InventoryStore`]
//!   must pass, packaged as the [`inventory_store_contract_tests!`] macro
//! - [`chaos`]: a store wrapper that injects failures and version conflicts
//! - [`fixtures`]: lot records and identifiers for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;
pub mod fixtures;

pub use chaos::{ChaosConfig, ChaosInventoryStore, ChaosInventoryStoreExt, Probability};
pub use contract::{ContractTestFailure, ContractTestResult};
