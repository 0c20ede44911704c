//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Request outcomes and retries by failure class
//! - Fleet size, availability and balances
//! - Nonce refreshes and gas price feed health
//! - Funding and notification failures

use crate::chain::GasPrice;
use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Request metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "fleet_relayer_transactions_submitted_total",
        "Total broadcasts accepted by a node",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "fleet_relayer_transactions_confirmed_total",
        "Total requests mined successfully",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "fleet_relayer_transactions_failed_total",
        "Total requests ending in FAILED",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_DROPPED: CounterVec = register_counter_vec!(
        "fleet_relayer_transactions_dropped_total",
        "Total requests ending in DROPPED",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_RETRIES: CounterVec = register_counter_vec!(
        "fleet_relayer_transaction_retries_total",
        "Total resubmissions by failure class",
        &["chain_id", "class"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "fleet_relayer_confirmation_latency_seconds",
        "Time from acceptance to a mined receipt",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Nonce and gas
    pub static ref NONCE_REFRESHES: CounterVec = register_counter_vec!(
        "fleet_relayer_nonce_refreshes_total",
        "Total forced nonce reloads from the network",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_PRICE_GWEI: GaugeVec = register_gauge_vec!(
        "fleet_relayer_gas_price_gwei",
        "Last fetched gas price (max fee for EIP-1559 chains)",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_PRICE_FAILURES: CounterVec = register_counter_vec!(
        "fleet_relayer_gas_price_refresh_failures_total",
        "Total failed gas price refreshes",
        &["chain_id"]
    ).unwrap();

    // Fleet metrics
    pub static ref FLEET_SIZE: GaugeVec = register_gauge_vec!(
        "fleet_relayer_fleet_size",
        "Relayers in the fleet",
        &["chain_id"]
    ).unwrap();

    pub static ref FLEET_INACTIVE: GaugeVec = register_gauge_vec!(
        "fleet_relayer_fleet_inactive",
        "Relayers out of rotation",
        &["chain_id"]
    ).unwrap();

    pub static ref QUEUE_SIZE: GaugeVec = register_gauge_vec!(
        "fleet_relayer_queue_size",
        "Relayers available for a new request",
        &["chain_id"]
    ).unwrap();

    pub static ref FLEET_EXHAUSTED: CounterVec = register_counter_vec!(
        "fleet_relayer_fleet_exhausted_total",
        "Total acquisitions that found no relayer in time",
        &["chain_id"]
    ).unwrap();

    pub static ref RELAYER_BALANCE: GaugeVec = register_gauge_vec!(
        "fleet_relayer_balance_eth",
        "Relayer balance in ETH",
        &["chain_id", "address"]
    ).unwrap();

    pub static ref FUNDING_FAILURES: CounterVec = register_counter_vec!(
        "fleet_relayer_funding_failures_total",
        "Total failed funding transfers",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "fleet_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref NOTIFICATION_FAILURES: CounterVec = register_counter_vec!(
        "fleet_relayer_notification_failures_total",
        "Total alerts that could not be delivered",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn wei_to_unit(value: U256, decimals: u32) -> f64 {
    ethers::utils::format_units(value, decimals)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(f64::MAX)
}

// Helper functions to record metrics

pub fn record_tx_submitted(chain_id: u64, kind: &str) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64, kind: &str) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, kind: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_tx_dropped(chain_id: u64, kind: &str) {
    TX_DROPPED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_retry(chain_id: u64, class: &str) {
    TX_RETRIES
        .with_label_values(&[&chain_id.to_string(), class])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_nonce_refresh(chain_id: u64) {
    NONCE_REFRESHES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_price(chain_id: u64, price: &GasPrice) {
    let wei = match price {
        GasPrice::Legacy(price) => *price,
        GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
    };
    GAS_PRICE_GWEI
        .with_label_values(&[&chain_id.to_string()])
        .set(wei_to_unit(wei, 9));
}

pub fn record_gas_price_failure(chain_id: u64) {
    GAS_PRICE_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fleet(chain_id: u64, size: usize, inactive: usize, available: usize) {
    let chain = chain_id.to_string();
    FLEET_SIZE.with_label_values(&[&chain]).set(size as f64);
    FLEET_INACTIVE.with_label_values(&[&chain]).set(inactive as f64);
    QUEUE_SIZE.with_label_values(&[&chain]).set(available as f64);
}

pub fn record_fleet_exhausted(chain_id: u64) {
    FLEET_EXHAUSTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_relayer_balance(chain_id: u64, address: &str, balance: U256) {
    RELAYER_BALANCE
        .with_label_values(&[&chain_id.to_string(), address])
        .set(wei_to_unit(balance, 18));
}

pub fn record_funding_failure(chain_id: u64) {
    FUNDING_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_notification_failure() {
    NOTIFICATION_FAILURES.with_label_values(&[]).inc();
}
