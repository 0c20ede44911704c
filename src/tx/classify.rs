//! Submission failure classification
//!
//! Nodes report rejections as free text and the wording differs between
//! clients, so failures are matched against an ordered table of substrings.
//! The first matching rule wins.

use crate::error::RelayerError;

use serde::Serialize;
use std::fmt;

/// What went wrong with a broadcast, as far as the retry logic cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The nonce was already consumed on chain
    NonceTooLow,
    /// A transaction with this nonce is pooled at an equal or higher fee
    ReplacementUnderpriced,
    /// The node already holds these exact bytes
    AlreadyKnown,
    /// The relayer cannot pay for gas plus value
    InsufficientFunds,
    /// Transport failure; the same bytes may be sent again
    Transient,
    /// Anything else; no retry
    Unrecoverable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NonceTooLow => "nonce_too_low",
            FailureKind::ReplacementUnderpriced => "replacement_underpriced",
            FailureKind::AlreadyKnown => "already_known",
            FailureKind::InsufficientFunds => "insufficient_funds",
            FailureKind::Transient => "transient",
            FailureKind::Unrecoverable => "unrecoverable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase substrings mapped to a failure kind, in priority order
const RULES: &[(&str, FailureKind)] = &[
    ("nonce too low", FailureKind::NonceTooLow),
    ("increasing gas price or incrementing nonce", FailureKind::NonceTooLow),
    ("nonce has already been used", FailureKind::NonceTooLow),
    ("replacement transaction underpriced", FailureKind::ReplacementUnderpriced),
    ("replacement fee too low", FailureKind::ReplacementUnderpriced),
    ("transaction underpriced", FailureKind::ReplacementUnderpriced),
    ("already known", FailureKind::AlreadyKnown),
    ("known transaction", FailureKind::AlreadyKnown),
    ("insufficient funds", FailureKind::InsufficientFunds),
];

/// Classify a provider message.
pub fn classify(message: &str) -> FailureKind {
    let message = message.to_lowercase();
    RULES
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Unrecoverable)
}

/// Classify a failed network call. Transport errors never reached a node's
/// mempool logic and are retried as they are.
pub fn classify_error(err: &RelayerError) -> FailureKind {
    if err.is_retryable() {
        return FailureKind::Transient;
    }
    match err {
        RelayerError::Rpc { message, .. } => classify(message),
        other => classify(&other.to_string()),
    }
}
