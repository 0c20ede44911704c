//! Chain provider with multi-RPC support and automatic failover

use super::NetworkService;
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        })
    }

    /// Last block number seen by `get_block_number`
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;
        let max_fee = std::cmp::min(max_fee, self.config.max_gas_price());

        Ok((max_fee, priority_fee))
    }

    /// Turn a provider error into a relayer error, keeping the node's message
    /// intact when the node answered with a JSON-RPC error.
    fn map_provider_error(&self, err: ProviderError) -> RelayerError {
        let chain_id = self.config.chain_id;
        if let Some(response) = RpcError::as_error_response(&err) {
            return RelayerError::Rpc {
                chain_id,
                message: response.message.clone(),
            };
        }

        let message = err.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("429") || lowered.contains("rate limit") {
            RelayerError::RateLimited { chain_id }
        } else {
            RelayerError::ChainConnection { chain_id, message }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[async_trait]
impl NetworkService for ChainProvider {
    async fn get_nonce(&self, address: Address, pending: bool) -> RelayerResult<u64> {
        let block = if pending {
            BlockNumber::Pending
        } else {
            BlockNumber::Latest
        };

        self.http()
            .get_transaction_count(address, Some(block.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| RelayerError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!(
                        "Failed to get balance of {:?} on chain {}: {}",
                        address, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed to get balance".to_string(),
        })
    }

    /// Get current gas price based on chain strategy
    async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                // Arbitrum prices L1 data into the L2 gas price
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        // No failover here: a rejection from one node is an answer, and
        // broadcasting the same bytes elsewhere only produces "already known".
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| self.map_provider_error(e))
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.map_provider_error(e))
    }

    async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
