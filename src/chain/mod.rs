//! Chain module - the network service the relayer core talks to
//!
//! This module provides:
//! - The `NetworkService` capability consumed by the nonce manager, gas price
//!   service, relayer manager and transaction sender
//! - An ethers HTTP implementation with multi-RPC failover

pub mod provider;

pub use provider::{ChainProvider, GasPrice};

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};

/// Per-chain network operations.
///
/// Submission failures come back as `RelayerError::Rpc` carrying the
/// provider's message; transport failures as `ChainConnection`, `Timeout` or
/// `RateLimited`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Transaction count for `address`, including mempool transactions when
    /// `pending` is set.
    async fn get_nonce(&self, address: Address, pending: bool) -> RelayerResult<u64>;

    async fn get_balance(&self, address: Address) -> RelayerResult<U256>;

    async fn get_gas_price(&self) -> RelayerResult<GasPrice>;

    /// Broadcast a signed, RLP-encoded transaction.
    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256>;

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>>;

    async fn health_check(&self) -> bool;
}
