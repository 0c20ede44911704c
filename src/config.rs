//! Configuration management for the fleet relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every chain carries its own fleet and retry policy, validated when the
//! chain's fleet is bootstrapped.

use crate::error::{RelayerError, RelayerResult};
use crate::relayer::SelectionStrategy;

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub max_concurrent_txs: usize,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
    pub fleet: FleetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,
    #[serde(default = "default_gas_price_refresh_secs")]
    pub gas_price_refresh_secs: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
}

/// Fleet sizing and funding policy for one chain
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    pub min_relayer_count: usize,
    pub max_relayer_count: usize,
    pub funding_threshold_eth: f64,
    pub funding_amount_eth: f64,
    pub inactive_relayer_count_threshold: usize,
    pub pending_transaction_count_threshold: u64,
    pub new_relayer_instance_count: usize,
    #[serde(default)]
    pub selection_strategy: SelectionStrategy,
    /// Name of the env var holding the BIP-39 phrase relayers are derived from
    pub seed_phrase_env: String,
    /// Name of the env var holding the owner key that funds new relayers
    pub owner_private_key_env: Option<String>,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_fleet_check_interval_secs")]
    pub fleet_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub bump_percentage: u64,
    pub retry_delay_ms: u64,
    pub send_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            bump_percentage: 10,
            retry_delay_ms: 1_000,
            send_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    pub slack_webhook_url: Option<String>,
}

fn default_nonce_ttl_secs() -> u64 {
    300
}

fn default_gas_price_refresh_secs() -> u64 {
    600
}

fn default_receipt_timeout_secs() -> u64 {
    60
}

fn default_receipt_poll_interval_ms() -> u64 {
    1_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_fleet_check_interval_secs() -> u64 {
    60
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references
    pub fn parse(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.relayer.max_concurrent_txs == 0 {
            anyhow::bail!("relayer.max_concurrent_txs must be greater than zero");
        }

        // Per-chain fleet policies are checked again at bootstrap so a bad chain
        // is excluded instead of taking the whole process down.
        for (name, chain) in self.enabled_chains() {
            if let Err(e) = chain.validate() {
                tracing::warn!("Chain {} has an invalid configuration: {}", name, e);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

impl ChainConfig {
    /// Reject fleet policies the relayer manager cannot honour.
    pub fn validate(&self) -> RelayerResult<()> {
        let fail = |message: String| {
            Err(RelayerError::Config(format!(
                "chain {}: {}",
                self.chain_id, message
            )))
        };

        if self.rpc_urls.is_empty() {
            return fail("no RPC URLs configured".to_string());
        }
        if self.fleet.max_relayer_count == 0 {
            return fail("max_relayer_count must be greater than zero".to_string());
        }
        if self.fleet.min_relayer_count == 0 {
            return fail("min_relayer_count must be greater than zero".to_string());
        }
        if self.fleet.min_relayer_count > self.fleet.max_relayer_count {
            return fail(format!(
                "min_relayer_count {} exceeds max_relayer_count {}",
                self.fleet.min_relayer_count, self.fleet.max_relayer_count
            ));
        }
        if self.fleet.funding_threshold_eth < 0.0 || self.fleet.funding_amount_eth < 0.0 {
            return fail("funding amounts must not be negative".to_string());
        }
        if self.fleet.seed_phrase_env.is_empty() {
            return fail("seed_phrase_env must name an environment variable".to_string());
        }
        if self.retry.bump_percentage == 0 {
            return fail("bump_percentage must be greater than zero".to_string());
        }
        if self.nonce_ttl_secs == 0 {
            return fail("nonce_ttl_secs must be greater than zero".to_string());
        }
        if self.receipt_poll_interval_ms == 0 {
            return fail("receipt_poll_interval_ms must be greater than zero".to_string());
        }

        Ok(())
    }

    pub fn funding_threshold(&self) -> RelayerResult<U256> {
        eth_to_wei(self.fleet.funding_threshold_eth)
    }

    pub fn funding_amount(&self) -> RelayerResult<U256> {
        eth_to_wei(self.fleet.funding_amount_eth)
    }

    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.fleet.acquire_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

fn eth_to_wei(amount: f64) -> RelayerResult<U256> {
    ethers::utils::parse_ether(amount)
        .map_err(|e| RelayerError::Config(format!("invalid ether amount {}: {}", amount, e)))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
