//! Relay requests and their lifecycle record

use crate::chain::GasPrice;
use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionRequest as LegacyTxRequest, H256, U256,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a relay request.
///
/// `InProcess -> Pending -> {Success | Failed | Dropped}`. A request can also
/// fail straight from `InProcess`. Terminal records are never modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    InProcess,
    Pending,
    Success,
    Failed,
    Dropped,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success | TransactionStatus::Failed | TransactionStatus::Dropped
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (InProcess, _) => true,
            (Pending, InProcess) => false,
            (Pending, _) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::InProcess => "IN_PROCESS",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Dropped => "DROPPED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    #[default]
    Transaction,
    /// A batched meta-transaction wrapped in a bundler call
    UserOperation,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Transaction => "transaction",
            RequestKind::UserOperation => "user_operation",
        }
    }
}

/// What a caller submits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Caller-chosen id; one is generated when empty
    #[serde(default)]
    pub id: String,
    pub chain_id: u64,
    #[serde(default)]
    pub kind: RequestKind,
    pub to: Address,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
    pub gas_limit: U256,
    /// Explicit fees; the chain's cached gas price is used otherwise
    #[serde(default)]
    pub gas_price: Option<GasPrice>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// One signed broadcast of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub relayer: Address,
    pub nonce: u64,
    pub gas_price: GasPrice,
    /// Set when the node accepted (or already held) the transaction
    pub hash: Option<H256>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable record of a relay request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub id: String,
    pub chain_id: u64,
    pub kind: RequestKind,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    pub gas_price: Option<GasPrice>,
    pub relayer_address: Option<Address>,
    pub nonce: Option<u64>,
    pub status: TransactionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Hash of the latest accepted broadcast
    pub tx_hash: Option<H256>,
    pub attempts: Vec<SubmissionAttempt>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRequest {
    pub fn new(new: NewTransaction, default_max_retries: u32) -> RelayerResult<Self> {
        if new.id.trim().is_empty() {
            return Err(RelayerError::Transaction("request id must not be empty".to_string()));
        }
        if new.gas_limit.is_zero() {
            return Err(RelayerError::Transaction(format!(
                "request {} has a zero gas limit",
                new.id
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: new.id,
            chain_id: new.chain_id,
            kind: new.kind,
            to: new.to,
            data: new.data,
            value: new.value,
            gas_limit: new.gas_limit,
            gas_price: new.gas_price,
            relayer_address: None,
            nonce: None,
            status: TransactionStatus::InProcess,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            tx_hash: None,
            attempts: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Every hash that reached a mempool, oldest first
    pub fn broadcast_hashes(&self) -> Vec<H256> {
        self.attempts.iter().filter_map(|a| a.hash).collect()
    }

    /// Whether some transaction with the current nonce is already out
    pub fn has_broadcast(&self) -> bool {
        self.attempts.iter().any(|a| a.hash.is_some())
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Sign-ready transaction for the given nonce and fees
    pub fn to_typed(&self, nonce: u64, fee: &GasPrice) -> TypedTransaction {
        build_transaction(
            self.chain_id,
            self.to,
            self.data.clone(),
            self.value,
            self.gas_limit,
            nonce,
            fee,
        )
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: TransactionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(relayer) = update.relayer_address {
            self.relayer_address = Some(relayer);
        }
        if let Some(nonce) = update.nonce {
            self.nonce = Some(nonce);
        }
        if let Some(gas_price) = update.gas_price {
            self.gas_price = Some(gas_price);
        }
        if let Some(hash) = update.tx_hash {
            self.tx_hash = Some(hash);
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(attempt) = update.attempt {
            self.attempts.push(attempt);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a stored request. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TransactionUpdate {
    pub status: Option<TransactionStatus>,
    pub relayer_address: Option<Address>,
    pub nonce: Option<u64>,
    pub gas_price: Option<GasPrice>,
    pub tx_hash: Option<H256>,
    pub retry_count: Option<u32>,
    /// Appended to the attempt history
    pub attempt: Option<SubmissionAttempt>,
    pub error: Option<String>,
}

/// Build a legacy or EIP-1559 transaction depending on the fee model.
pub fn build_transaction(
    chain_id: u64,
    to: Address,
    data: Bytes,
    value: U256,
    gas_limit: U256,
    nonce: u64,
    fee: &GasPrice,
) -> TypedTransaction {
    match fee {
        GasPrice::Legacy(price) => LegacyTxRequest::new()
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(*price)
            .chain_id(chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
    }
}
