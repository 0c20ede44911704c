//! Fleet Relayer - multi-chain transaction relaying through a managed pool of
//! funded signing accounts
//!
//! Requests are assigned a relayer and a collision-free nonce, broadcast,
//! watched until mined, and resubmitted with fresh nonces, bumped fees or
//! another relayer when a node rejects them for a recoverable reason.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod relayer;
pub mod state;
pub mod tx;
