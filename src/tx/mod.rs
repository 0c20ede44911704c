//! Relay request lifecycle: nonces, fees, submission and receipt tracking

pub mod classify;
mod gas;
mod nonce;
mod receipt;
pub mod request;
mod sender;

pub use classify::{classify, FailureKind};
pub use gas::{bump_fee, calculate_cost, effective_price, ensure_within_cap, GasPriceService};
pub use nonce::NonceManager;
pub use receipt::{ReceiptOutcome, ReceiptWatcher};
pub use request::{
    NewTransaction, RequestKind, SubmissionAttempt, TransactionRequest, TransactionStatus,
    TransactionUpdate,
};
pub use sender::TransactionSender;
