//! Receipt polling for broadcast transactions
//!
//! A request may have several broadcasts sharing one nonce (fee-bumped
//! replacements). Any of them can be the one that gets mined, so every hash is
//! checked on each poll.

use crate::chain::NetworkService;
use crate::error::RelayerResult;

use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum ReceiptOutcome {
    Mined {
        hash: H256,
        receipt: TransactionReceipt,
    },
    /// No hash was mined before the deadline. Not a terminal failure by itself.
    TimedOut,
}

impl ReceiptOutcome {
    /// `Some(true)` for a successful execution, `Some(false)` for a revert
    pub fn succeeded(&self) -> Option<bool> {
        match self {
            ReceiptOutcome::Mined { receipt, .. } => {
                Some(receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false))
            }
            ReceiptOutcome::TimedOut => None,
        }
    }
}

pub struct ReceiptWatcher {
    chain_id: u64,
    network: Arc<dyn NetworkService>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ReceiptWatcher {
    pub fn new(
        chain_id: u64,
        network: Arc<dyn NetworkService>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain_id,
            network,
            timeout,
            poll_interval,
        }
    }

    /// Poll until one of `hashes` has a receipt or the timeout elapses.
    ///
    /// Lookup failures are logged and polling continues; only the deadline
    /// ends the wait.
    pub async fn wait(&self, hashes: &[H256]) -> RelayerResult<ReceiptOutcome> {
        let deadline = Instant::now() + self.timeout;

        loop {
            for hash in hashes {
                match self.network.get_receipt(*hash).await {
                    Ok(Some(receipt)) => {
                        debug!(
                            "Receipt for {:?} on chain {} in block {:?}",
                            hash, self.chain_id, receipt.block_number
                        );
                        return Ok(ReceiptOutcome::Mined {
                            hash: *hash,
                            receipt,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "Receipt lookup for {:?} on chain {} failed: {}",
                            hash, self.chain_id, e
                        );
                    }
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Ok(ReceiptOutcome::TimedOut);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
