//! Relayer fleet: signing accounts, the per-chain availability queue, and the
//! manager that hands relayers out to requests

pub mod account;
mod manager;
mod queue;
mod strategy;

pub use account::{format_address, Account, RelayerAccount};
pub use manager::{FleetStats, RelayerManager};
pub use queue::RelayerQueue;
pub use strategy::SelectionStrategy;

#[cfg(test)]
pub(crate) use manager::tests as manager_tests;
