//! Request intake and per-chain orchestration
//!
//! The relay engine:
//! 1. Accepts requests and persists them before any processing
//! 2. Runs one task per request, bounded by the configured concurrency
//! 3. Keeps gas prices and fleets fresh in background loops
//! 4. Resumes unfinished requests after a restart

pub mod engine;

pub use engine::RelayEngine;
