//! Error types for the fleet relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    /// The node answered but rejected the call. `message` is the provider's
    /// wording and is what submission failures are classified on.
    #[error("RPC error on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No relayer available on chain {chain_id}")]
    FleetExhausted { chain_id: u64 },

    #[error("Relayer {address} not found on chain {chain_id}")]
    RelayerNotFound { chain_id: u64, address: String },

    #[error("Funding error on chain {chain_id}: {message}")]
    Funding { chain_id: u64, message: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::RateLimited { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::FleetExhausted { .. }
                | RelayerError::Funding { .. }
                | RelayerError::Signing(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
