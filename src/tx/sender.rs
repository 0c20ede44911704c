//! Transaction sender with retry logic and stuck transaction handling
//!
//! One call to [`TransactionSender::process`] drives a request from
//! `IN_PROCESS` to a terminal status:
//!
//! 1. acquire a relayer and a nonce, then sign and broadcast
//! 2. on acceptance, release the relayer and wait for a receipt
//! 3. on rejection, classify the node's message and either resubmit with a
//!    fresh nonce, a bumped fee or another relayer, or give up
//! 4. on a receipt timeout, replace the transaction (same nonce, higher fee)
//!    while the retry budget lasts, otherwise mark it dropped
//!
//! Every transition is written to the store so an interrupted request can be
//! resumed after a restart.

use super::classify::{classify_error, FailureKind};
use super::gas::{bump_fee, ensure_within_cap, GasPriceService};
use super::receipt::{ReceiptOutcome, ReceiptWatcher};
use super::request::{SubmissionAttempt, TransactionRequest, TransactionStatus, TransactionUpdate};
use crate::chain::{GasPrice, NetworkService};
use crate::config::{ChainConfig, RetryConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::relayer::{RelayerAccount, RelayerManager};
use crate::state::TransactionStore;

use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Next thing to do for a request in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Sign and broadcast with the held relayer, nonce and fee
    Submit,
    /// Wait for any broadcast of the current nonce to be mined
    AwaitReceipt,
    /// The request reached a terminal status
    Done,
}

/// Working state of one request
struct Flight {
    request: TransactionRequest,
    relayer: RelayerAccount,
    nonce: u64,
    fee: GasPrice,
    /// Whether this request currently has the relayer checked out
    holding: bool,
}

/// Drives relay requests for one chain
pub struct TransactionSender {
    chain_id: u64,
    retry: RetryConfig,
    max_gas_price: U256,
    receipt_timeout: Duration,
    network: Arc<dyn NetworkService>,
    relayers: Arc<RelayerManager>,
    gas: Arc<GasPriceService>,
    store: Arc<dyn TransactionStore>,
    receipts: ReceiptWatcher,
}

impl TransactionSender {
    pub fn new(
        config: &ChainConfig,
        network: Arc<dyn NetworkService>,
        relayers: Arc<RelayerManager>,
        gas: Arc<GasPriceService>,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        Self {
            chain_id: config.chain_id,
            retry: config.retry.clone(),
            max_gas_price: config.max_gas_price(),
            receipt_timeout: config.receipt_timeout(),
            receipts: ReceiptWatcher::new(
                config.chain_id,
                network.clone(),
                config.receipt_timeout(),
                config.receipt_poll_interval(),
            ),
            network,
            relayers,
            gas,
            store,
        }
    }

    /// Drive the stored request `id` to a terminal status and return the
    /// final record. Requests with a broadcast already out resume at
    /// receipt waiting.
    pub async fn process(&self, id: &str) -> RelayerResult<TransactionRequest> {
        let request = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| RelayerError::TransactionNotFound { tx_id: id.to_string() })?;

        if request.status.is_terminal() {
            return Ok(request);
        }
        if request.chain_id != self.chain_id {
            return Err(RelayerError::ChainNotFound {
                chain_id: request.chain_id,
            });
        }

        if request.has_broadcast() {
            self.resume(request).await
        } else {
            self.start(request).await
        }
    }

    async fn start(&self, request: TransactionRequest) -> RelayerResult<TransactionRequest> {
        let relayer = match self.relayers.acquire_relayer().await {
            Ok(relayer) => relayer,
            Err(e) => return self.fail_unassigned(request, e.to_string()).await,
        };
        let address = relayer.address;

        let nonce = match self.relayers.nonce_manager().get_nonce(address).await {
            Ok(nonce) => nonce,
            Err(e) => {
                self.release(address).await;
                return self.fail_unassigned(request, e.to_string()).await;
            }
        };

        let fee = match self.initial_fee(&request).await {
            Ok(fee) => fee,
            Err(e) => {
                self.relayers.nonce_manager().release_nonce(address, nonce).await;
                self.release(address).await;
                return self.fail_unassigned(request, e.to_string()).await;
            }
        };

        let flight = Flight {
            request,
            relayer,
            nonce,
            fee,
            holding: true,
        };
        self.run(flight, Step::Submit).await
    }

    /// Pick up a request that was broadcast before a restart.
    async fn resume(&self, request: TransactionRequest) -> RelayerResult<TransactionRequest> {
        let last = request
            .attempts
            .iter()
            .rev()
            .find(|a| a.hash.is_some())
            .cloned();
        let Some(last) = last else {
            return self.start(request).await;
        };

        let Some(relayer) = self.relayers.get(&last.relayer).await else {
            warn!(
                tx_id = %request.id,
                chain_id = self.chain_id,
                "Relayer {:?} is no longer in the fleet; waiting for the last broadcast only",
                last.relayer
            );
            return self.final_receipt_check(request).await;
        };

        info!(
            tx_id = %request.id,
            relayer = %relayer.address_string(),
            chain_id = self.chain_id,
            nonce = last.nonce,
            "Resuming receipt wait"
        );
        self.relayers.nonce_manager().mark_used(relayer.address, last.nonce).await;
        self.relayers.record_submission(relayer.address, last.nonce).await;

        let flight = Flight {
            request,
            relayer,
            nonce: last.nonce,
            fee: last.gas_price,
            holding: false,
        };
        self.run(flight, Step::AwaitReceipt).await
    }

    async fn run(&self, mut flight: Flight, mut step: Step) -> RelayerResult<TransactionRequest> {
        loop {
            let next = match step {
                Step::Submit => self.submit(&mut flight).await,
                Step::AwaitReceipt => self.await_receipt(&mut flight).await,
                Step::Done => return Ok(flight.request),
            };

            step = match next {
                Ok(next) => next,
                Err(e) => {
                    error!(
                        tx_id = %flight.request.id,
                        relayer = %flight.relayer.address_string(),
                        chain_id = self.chain_id,
                        "Processing aborted: {}", e
                    );
                    if flight.holding {
                        // An unsent nonce goes back with the relayer.
                        if !flight.request.has_broadcast() {
                            self.relayers
                                .nonce_manager()
                                .release_nonce(flight.relayer.address, flight.nonce)
                                .await;
                        }
                        self.release(flight.relayer.address).await;
                    }
                    return Err(e);
                }
            };
        }
    }

    /// Fees for the first broadcast: the caller's, else the cached network
    /// price (fetched once if the cache is still empty).
    async fn initial_fee(&self, request: &TransactionRequest) -> RelayerResult<GasPrice> {
        let fee = match &request.gas_price {
            Some(fee) => fee.clone(),
            None => self.gas.current_or_fetch().await?,
        };
        ensure_within_cap(self.chain_id, &fee, self.max_gas_price)?;
        Ok(fee)
    }

    async fn submit(&self, flight: &mut Flight) -> RelayerResult<Step> {
        let tx = flight.request.to_typed(flight.nonce, &flight.fee);
        let raw = match flight.relayer.account.sign_transaction(&tx).await {
            Ok(raw) => raw,
            Err(e) => return self.on_rejected(flight, e, Bytes::default()).await,
        };

        debug!(
            tx_id = %flight.request.id,
            relayer = %flight.relayer.address_string(),
            chain_id = self.chain_id,
            nonce = flight.nonce,
            attempt = flight.request.attempts.len() + 1,
            "Broadcasting with fee {:?}", flight.fee
        );

        let send_timeout = Duration::from_secs(self.retry.send_timeout_secs);
        let sent = match timeout(send_timeout, self.network.send_raw_transaction(raw.clone())).await {
            Ok(sent) => sent,
            Err(_) => Err(RelayerError::Timeout {
                operation: "send transaction".to_string(),
            }),
        };

        match sent {
            Ok(hash) => {
                self.on_broadcast(flight, hash).await?;
                self.release_held(flight).await;
                Ok(Step::AwaitReceipt)
            }
            Err(e) => self.on_rejected(flight, e, raw).await,
        }
    }

    /// Book a broadcast that reached a mempool.
    async fn on_broadcast(&self, flight: &mut Flight, hash: H256) -> RelayerResult<()> {
        let address = flight.relayer.address;
        let replacing = flight.request.has_broadcast();
        let nonces = self.relayers.nonce_manager();

        nonces.mark_used(address, flight.nonce).await;
        if !replacing {
            nonces.increment_nonce(address).await;
            self.relayers.record_submission(address, flight.nonce).await;
        }

        let attempt = self.attempt(flight, Some(hash), None);
        self.persist(
            flight,
            TransactionStatus::Pending,
            TransactionUpdate {
                tx_hash: Some(hash),
                attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await?;

        crate::metrics::record_tx_submitted(self.chain_id, flight.request.kind.as_str());
        info!(
            tx_id = %flight.request.id,
            relayer = %flight.relayer.address_string(),
            chain_id = self.chain_id,
            nonce = flight.nonce,
            attempt = flight.request.attempts.len(),
            "Transaction sent: {:?}", hash
        );
        Ok(())
    }

    async fn on_rejected(&self, flight: &mut Flight, err: RelayerError, raw: Bytes) -> RelayerResult<Step> {
        let kind = classify_error(&err);
        let message = err.to_string();
        let replacing = flight.request.has_broadcast();

        warn!(
            tx_id = %flight.request.id,
            relayer = %flight.relayer.address_string(),
            chain_id = self.chain_id,
            nonce = flight.nonce,
            attempt = flight.request.attempts.len() + 1,
            class = %kind,
            "Submission rejected: {}", message
        );

        if kind == FailureKind::AlreadyKnown {
            // The node holds these bytes already; keep the relayer until a
            // receipt shows up so the nonce is not reused.
            let hash = H256::from(keccak256(&raw));
            self.on_broadcast(flight, hash).await?;
            return Ok(Step::AwaitReceipt);
        }

        let attempt = self.attempt(flight, None, Some(message.clone()));
        let status = flight.request.status;
        self.persist(
            flight,
            status,
            TransactionUpdate {
                attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await?;

        match kind {
            FailureKind::NonceTooLow if replacing => {
                // An earlier broadcast with this nonce was mined.
                self.release_held(flight).await;
                Ok(Step::AwaitReceipt)
            }
            FailureKind::NonceTooLow => {
                if !flight.request.retries_left() {
                    return self.give_up(flight, message).await;
                }
                let address = flight.relayer.address;
                match self.relayers.nonce_manager().refresh_nonce(address).await {
                    Ok(nonce) => flight.nonce = nonce,
                    Err(e) => return self.give_up(flight, e.to_string()).await,
                }
                self.count_retry(flight, kind).await?;
                Ok(Step::Submit)
            }
            FailureKind::ReplacementUnderpriced => {
                if !flight.request.retries_left() {
                    return self.give_up(flight, message).await;
                }
                let network = self.gas.get_gas_price().await;
                let bumped = bump_fee(&flight.fee, network.as_ref(), self.retry.bump_percentage);
                if let Err(e) = ensure_within_cap(self.chain_id, &bumped, self.max_gas_price) {
                    return self.give_up(flight, e.to_string()).await;
                }
                flight.fee = bumped;
                self.count_retry(flight, kind).await?;
                Ok(Step::Submit)
            }
            FailureKind::InsufficientFunds => {
                let address = flight.relayer.address;
                self.relayers
                    .deactivate(address, "insufficient funds for gas")
                    .await;
                if replacing {
                    self.release_held(flight).await;
                    return Ok(Step::AwaitReceipt);
                }

                self.relayers.nonce_manager().release_nonce(address, flight.nonce).await;
                self.release_held(flight).await;
                if !flight.request.retries_left() {
                    return self.settle(flight, TransactionStatus::Failed, Some(message)).await;
                }
                if let Err(e) = self.reassign(flight).await {
                    let reason = format!("{}; {}", message, e);
                    return self.settle(flight, TransactionStatus::Failed, Some(reason)).await;
                }
                self.count_retry(flight, kind).await?;
                Ok(Step::Submit)
            }
            FailureKind::Transient => {
                if !flight.request.retries_left() {
                    return self.give_up(flight, message).await;
                }
                tokio::time::sleep(Duration::from_millis(self.retry.retry_delay_ms)).await;
                self.count_retry(flight, kind).await?;
                Ok(Step::Submit)
            }
            FailureKind::Unrecoverable | FailureKind::AlreadyKnown => self.give_up(flight, message).await,
        }
    }

    /// Move an unsent request to a fresh relayer and nonce.
    async fn reassign(&self, flight: &mut Flight) -> RelayerResult<()> {
        let relayer = self.relayers.acquire_relayer().await?;
        let nonce = match self.relayers.nonce_manager().get_nonce(relayer.address).await {
            Ok(nonce) => nonce,
            Err(e) => {
                self.release(relayer.address).await;
                return Err(e);
            }
        };

        info!(
            tx_id = %flight.request.id,
            from = %flight.relayer.address_string(),
            to = %relayer.address_string(),
            chain_id = self.chain_id,
            "Reassigning request to another relayer"
        );
        flight.relayer = relayer;
        flight.nonce = nonce;
        flight.holding = true;
        Ok(())
    }

    async fn await_receipt(&self, flight: &mut Flight) -> RelayerResult<Step> {
        let hashes = flight.request.broadcast_hashes();
        let outcome = self.receipts.wait(&hashes).await?;
        let succeeded = outcome.succeeded();
        match outcome {
            ReceiptOutcome::Mined { hash, receipt } => {
                flight.request.tx_hash = Some(hash);
                if succeeded == Some(true) {
                    self.settle(flight, TransactionStatus::Success, None).await
                } else {
                    let reason = format!(
                        "transaction {:?} reverted in block {:?}",
                        hash, receipt.block_number
                    );
                    self.settle(flight, TransactionStatus::Failed, Some(reason)).await
                }
            }
            ReceiptOutcome::TimedOut => self.on_receipt_timeout(flight).await,
        }
    }

    /// Replace a broadcast that was not mined in time, or give up on it.
    async fn on_receipt_timeout(&self, flight: &mut Flight) -> RelayerResult<Step> {
        let waited = format!(
            "not mined within {:?} after {} broadcast(s)",
            self.receipt_timeout,
            flight.request.broadcast_hashes().len()
        );
        warn!(
            tx_id = %flight.request.id,
            relayer = %flight.relayer.address_string(),
            chain_id = self.chain_id,
            nonce = flight.nonce,
            "Receipt wait timed out"
        );

        if !flight.request.retries_left() {
            return self.settle(flight, TransactionStatus::Dropped, Some(waited)).await;
        }

        let network = self.gas.get_gas_price().await;
        let bumped = bump_fee(&flight.fee, network.as_ref(), self.retry.bump_percentage);
        if let Err(e) = ensure_within_cap(self.chain_id, &bumped, self.max_gas_price) {
            return self
                .settle(flight, TransactionStatus::Failed, Some(format!("{}; {}", waited, e)))
                .await;
        }

        if !flight.holding {
            match self.relayers.acquire_specific(flight.relayer.address).await {
                Ok(relayer) => {
                    flight.relayer = relayer;
                    flight.holding = true;
                }
                Err(e) => {
                    // Keep waiting on what is already out; this still spends budget.
                    warn!(
                        tx_id = %flight.request.id,
                        chain_id = self.chain_id,
                        "Cannot replace transaction: {}", e
                    );
                    self.count_retry_labelled(flight, "receipt_timeout").await?;
                    return Ok(Step::AwaitReceipt);
                }
            }
        }

        flight.fee = bumped;
        self.count_retry_labelled(flight, "receipt_timeout").await?;
        Ok(Step::Submit)
    }

    /// Stop resubmitting. A request with a broadcast still out waits for it
    /// one last time; anything else fails now.
    async fn give_up(&self, flight: &mut Flight, message: String) -> RelayerResult<Step> {
        if flight.request.has_broadcast() {
            self.release_held(flight).await;
            return Ok(Step::AwaitReceipt);
        }

        self.relayers
            .nonce_manager()
            .release_nonce(flight.relayer.address, flight.nonce)
            .await;
        self.release_held(flight).await;
        self.settle(flight, TransactionStatus::Failed, Some(message)).await
    }

    /// Write a terminal status and return the relayer's pending slot.
    async fn settle(
        &self,
        flight: &mut Flight,
        status: TransactionStatus,
        error: Option<String>,
    ) -> RelayerResult<Step> {
        self.release_held(flight).await;
        if flight.request.has_broadcast() {
            self.relayers.transaction_settled(flight.relayer.address).await;
        }

        let tx_hash = flight.request.tx_hash;
        self.persist(
            flight,
            status,
            TransactionUpdate {
                tx_hash,
                error: error.clone(),
                ..Default::default()
            },
        )
        .await?;

        let kind = flight.request.kind.as_str();
        match status {
            TransactionStatus::Success => {
                let latency = Utc::now() - flight.request.created_at;
                crate::metrics::record_tx_confirmed(self.chain_id, kind);
                crate::metrics::record_tx_latency(
                    self.chain_id,
                    latency.num_milliseconds() as f64 / 1000.0,
                );
                info!(
                    tx_id = %flight.request.id,
                    relayer = %flight.relayer.address_string(),
                    chain_id = self.chain_id,
                    "Transaction confirmed: {:?}", tx_hash
                );
            }
            TransactionStatus::Dropped => {
                crate::metrics::record_tx_dropped(self.chain_id, kind);
                warn!(
                    tx_id = %flight.request.id,
                    relayer = %flight.relayer.address_string(),
                    chain_id = self.chain_id,
                    "Transaction dropped: {}", error.unwrap_or_default()
                );
            }
            _ => {
                crate::metrics::record_tx_failed(self.chain_id, kind);
                error!(
                    tx_id = %flight.request.id,
                    relayer = %flight.relayer.address_string(),
                    chain_id = self.chain_id,
                    "Transaction failed: {}", error.unwrap_or_default()
                );
            }
        }
        Ok(Step::Done)
    }

    /// Fail a request that never got a relayer and nonce.
    async fn fail_unassigned(
        &self,
        request: TransactionRequest,
        message: String,
    ) -> RelayerResult<TransactionRequest> {
        error!(
            tx_id = %request.id,
            chain_id = self.chain_id,
            "Transaction failed before submission: {}", message
        );
        crate::metrics::record_tx_failed(self.chain_id, request.kind.as_str());
        self.store
            .update_status(
                &request.id,
                TransactionStatus::Failed,
                TransactionUpdate {
                    error: Some(message),
                    ..Default::default()
                },
            )
            .await
    }

    /// Resolve a broadcast request whose relayer is gone: one receipt wait,
    /// then a terminal status.
    async fn final_receipt_check(&self, request: TransactionRequest) -> RelayerResult<TransactionRequest> {
        let outcome = self.receipts.wait(&request.broadcast_hashes()).await?;
        let (status, tx_hash, error) = match &outcome {
            ReceiptOutcome::Mined { hash, .. } if outcome.succeeded() == Some(true) => {
                (TransactionStatus::Success, Some(*hash), None)
            }
            ReceiptOutcome::Mined { hash, .. } => (
                TransactionStatus::Failed,
                Some(*hash),
                Some("transaction reverted".to_string()),
            ),
            ReceiptOutcome::TimedOut => (
                TransactionStatus::Dropped,
                None,
                Some("relayer left the fleet before the transaction was mined".to_string()),
            ),
        };
        self.store
            .update_status(
                &request.id,
                status,
                TransactionUpdate {
                    tx_hash,
                    error,
                    ..Default::default()
                },
            )
            .await
    }

    fn attempt(&self, flight: &Flight, hash: Option<H256>, error: Option<String>) -> SubmissionAttempt {
        SubmissionAttempt {
            relayer: flight.relayer.address,
            nonce: flight.nonce,
            gas_price: flight.fee.clone(),
            hash,
            error,
            at: Utc::now(),
        }
    }

    async fn count_retry(&self, flight: &mut Flight, kind: FailureKind) -> RelayerResult<()> {
        self.count_retry_labelled(flight, kind.as_str()).await
    }

    async fn count_retry_labelled(&self, flight: &mut Flight, class: &str) -> RelayerResult<()> {
        crate::metrics::record_retry(self.chain_id, class);
        let status = flight.request.status;
        let retry_count = flight.request.retry_count + 1;
        self.persist(
            flight,
            status,
            TransactionUpdate {
                retry_count: Some(retry_count),
                ..Default::default()
            },
        )
        .await
    }

    /// Store `update` plus the current relayer, nonce and fee.
    async fn persist(
        &self,
        flight: &mut Flight,
        status: TransactionStatus,
        mut update: TransactionUpdate,
    ) -> RelayerResult<()> {
        update.relayer_address = Some(flight.relayer.address);
        update.nonce = Some(flight.nonce);
        update.gas_price = Some(flight.fee.clone());
        flight.request = self
            .store
            .update_status(&flight.request.id, status, update)
            .await?;
        Ok(())
    }

    async fn release_held(&self, flight: &mut Flight) {
        if flight.holding {
            self.release(flight.relayer.address).await;
            flight.holding = false;
        }
    }

    async fn release(&self, address: Address) {
        if let Err(e) = self.relayers.release_relayer(address).await {
            error!(
                relayer = ?address,
                chain_id = self.chain_id,
                "Failed to release relayer: {}", e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkService;
    use crate::config::tests::sample_chain;
    use crate::notify::LogNotifier;
    use crate::relayer::account::tests::test_account;
    use crate::relayer::manager_tests::{eth, test_manager};
    use crate::state::{FlakyStore, InMemoryTransactionStore};
    use crate::tx::gas::effective_price;
    use crate::tx::request::tests::sample_new;
    use ethers::types::TransactionReceipt;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Harness {
        sender: TransactionSender,
        store: Arc<InMemoryTransactionStore>,
        relayers: Arc<RelayerManager>,
    }

    async fn harness(network: MockNetworkService, config: ChainConfig, balances: &[U256]) -> Harness {
        let network: Arc<dyn NetworkService> = Arc::new(network);
        let relayers = test_manager(
            config.clone(),
            network.clone(),
            Arc::new(LogNotifier),
            balances,
            None,
        )
        .await;
        let gas = Arc::new(GasPriceService::new(
            config.chain_id,
            network.clone(),
            Duration::from_secs(600),
        ));
        let store = Arc::new(InMemoryTransactionStore::new());
        let sender = TransactionSender::new(&config, network, relayers.clone(), gas, store.clone());
        Harness {
            sender,
            store,
            relayers,
        }
    }

    async fn submit(h: &Harness, id: &str, max_retries: Option<u32>) -> TransactionRequest {
        let mut new = sample_new(id);
        new.max_retries = max_retries;
        let request = TransactionRequest::new(new, 3).unwrap();
        h.store.save(&request).await.unwrap();
        h.sender.process(id).await.unwrap()
    }

    fn mined(hash: H256) -> Option<TransactionReceipt> {
        Some(TransactionReceipt {
            transaction_hash: hash,
            status: Some(1u64.into()),
            ..Default::default()
        })
    }

    fn rejected(message: &str) -> RelayerError {
        RelayerError::Rpc {
            chain_id: 137,
            message: message.to_string(),
        }
    }

    fn fee_of(attempt: &SubmissionAttempt) -> U256 {
        effective_price(&attempt.gas_price)
    }

    #[tokio::test]
    async fn confirms_successful_submission() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(5));
        network
            .expect_send_raw_transaction()
            .returning(|_| Ok(H256::repeat_byte(0xab)));
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-1", None).await;

        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.tx_hash, Some(H256::repeat_byte(0xab)));
        assert_eq!(done.nonce, Some(5));
        assert_eq!(done.retry_count, 0);

        let relayer = test_account(0).address();
        let queued = h.relayers.queue().get(&relayer).await.unwrap();
        assert_eq!(queued.pending_tx_count, 0);
        // The next nonce comes from the cache.
        assert_eq!(h.relayers.nonce_manager().get_nonce(relayer).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn nonce_too_low_forces_network_refresh() {
        let nonce_calls = Arc::new(AtomicU64::new(0));
        let send_calls = Arc::new(AtomicU64::new(0));
        let mut network = MockNetworkService::new();
        let counter = nonce_calls.clone();
        network.expect_get_nonce().returning(move |_, _| {
            Ok(if counter.fetch_add(1, Ordering::SeqCst) == 0 { 5 } else { 9 })
        });
        let counter = send_calls.clone();
        network.expect_send_raw_transaction().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(rejected("nonce too low"))
            } else {
                Ok(H256::repeat_byte(1))
            }
        });
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-c", None).await;

        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.retry_count, 1);
        assert_eq!(nonce_calls.load(Ordering::SeqCst), 2);
        assert_eq!(done.attempts[0].nonce, 5);
        assert_eq!(done.attempts[1].nonce, 9);
        assert_eq!(fee_of(&done.attempts[0]), fee_of(&done.attempts[1]));
    }

    #[tokio::test]
    async fn insufficient_funds_moves_request_to_another_relayer() {
        let send_calls = Arc::new(AtomicU64::new(0));
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        let counter = send_calls.clone();
        network.expect_send_raw_transaction().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(rejected("insufficient funds for gas * price + value"))
            } else {
                Ok(H256::repeat_byte(2))
            }
        });
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = harness(network, sample_chain(), &[eth(1), eth(2)]).await;

        let done = submit(&h, "tx-d", None).await;

        let broke = test_account(0).address();
        let other = test_account(1).address();
        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.attempts[0].relayer, broke);
        assert_eq!(done.relayer_address, Some(other));
        assert!(!h.relayers.get(&broke).await.unwrap().active);
        assert!(h.relayers.queue().get(&broke).await.is_none());
    }

    #[tokio::test]
    async fn insufficient_funds_without_budget_fails() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(4));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("insufficient funds for transfer")));
        let h = harness(network, sample_chain(), &[eth(1), eth(2)]).await;

        let done = submit(&h, "tx-d2", Some(0)).await;

        let broke = test_account(0).address();
        assert_eq!(done.status, TransactionStatus::Failed);
        assert!(done.error.unwrap().contains("insufficient funds"));
        assert_eq!(h.relayers.inactive_relayers().await, vec![broke]);
        assert_eq!(h.relayers.queue().size().await, 1);
        // The unsent nonce is free again.
        assert_eq!(h.relayers.nonce_manager().get_nonce(broke).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn insufficient_funds_with_no_other_relayer_fails() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("insufficient funds for gas * price + value")));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-alone", Some(3)).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert_eq!(done.retry_count, 0);
        assert!(done.error.unwrap().contains("insufficient funds"));
        let stored = h.store.get_by_id("tx-alone").await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(
            h.relayers.inactive_relayers().await,
            vec![test_account(0).address()]
        );
    }

    #[tokio::test]
    async fn store_failure_before_broadcast_returns_nonce_and_relayer() {
        let sends = Arc::new(AtomicU64::new(0));
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(0));
        let counter = sends.clone();
        network.expect_send_raw_transaction().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RelayerError::ChainConnection {
                    chain_id: 137,
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(H256::repeat_byte(5))
            }
        });
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));

        let config = sample_chain();
        let network: Arc<dyn NetworkService> = Arc::new(network);
        let relayers = test_manager(
            config.clone(),
            network.clone(),
            Arc::new(LogNotifier),
            &[eth(1)],
            None,
        )
        .await;
        let gas = Arc::new(GasPriceService::new(137, network.clone(), Duration::from_secs(600)));
        let store = Arc::new(FlakyStore::default());
        let sender = TransactionSender::new(&config, network, relayers.clone(), gas, store.clone());

        let request = TransactionRequest::new(sample_new("tx-flaky"), 3).unwrap();
        store.save(&request).await.unwrap();

        assert!(sender.process("tx-flaky").await.is_err());
        let relayer = test_account(0).address();
        assert!(relayers.queue().get(&relayer).await.is_some());

        // The same relayer and nonce serve the next run.
        let done = sender.process("tx-flaky").await.unwrap();
        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.relayer_address, Some(relayer));
        assert_eq!(done.nonce, Some(0));
    }

    #[tokio::test]
    async fn underpriced_until_budget_exhausted_fails_with_rising_fees() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(4)
            .returning(|_| Err(rejected("replacement transaction underpriced")));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-e", Some(3)).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert_eq!(done.retry_count, 3);
        assert_eq!(done.attempts.len(), 4);
        for pair in done.attempts.windows(2) {
            assert!(fee_of(&pair[1]) > fee_of(&pair[0]));
        }
        assert!(fee_of(&done.attempts[2]) > fee_of(&done.attempts[0]));
        assert_eq!(h.relayers.queue().size().await, 1);
    }

    #[tokio::test]
    async fn transient_errors_respect_retry_budget() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network.expect_send_raw_transaction().times(3).returning(|_| {
            Err(RelayerError::ChainConnection {
                chain_id: 137,
                message: "connection reset".to_string(),
            })
        });
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-t", Some(2)).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert_eq!(done.retry_count, 2);
        assert!(done.attempts.iter().all(|a| a.nonce == 0));
    }

    #[tokio::test]
    async fn unrecoverable_error_fails_without_retry() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("execution reverted: paused")));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-u", None).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert_eq!(done.retry_count, 0);
        assert!(done.error.unwrap().contains("execution reverted"));
    }

    #[tokio::test]
    async fn already_known_waits_for_receipt() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(5));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("already known")));
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-k", None).await;

        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.retry_count, 0);
        assert!(done.tx_hash.is_some());
        assert_eq!(done.attempts[0].hash, done.tx_hash);

        let relayer = test_account(0).address();
        assert!(h.relayers.queue().get(&relayer).await.is_some());
        assert_eq!(h.relayers.nonce_manager().get_nonce(relayer).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn receipt_timeout_replaces_with_same_nonce() {
        let send_calls = Arc::new(AtomicU64::new(0));
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(5));
        let counter = send_calls.clone();
        network.expect_send_raw_transaction().returning(move |_| {
            Ok(H256::from_low_u64_be(counter.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let replacement = H256::from_low_u64_be(2);
        network
            .expect_get_receipt()
            .returning(move |hash| Ok(if hash == replacement { mined(hash) } else { None }));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-r", None).await;

        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.tx_hash, Some(replacement));
        assert_eq!(done.attempts.len(), 2);
        assert_eq!(done.attempts[0].nonce, done.attempts[1].nonce);
        assert!(fee_of(&done.attempts[1]) > fee_of(&done.attempts[0]));
        assert_eq!(
            h.relayers.get(&test_account(0).address()).await.unwrap().pending_tx_count,
            0
        );
    }

    #[tokio::test]
    async fn unmined_transaction_is_dropped_when_budget_is_spent() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(3)));
        network.expect_get_receipt().returning(|_| Ok(None));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-x", Some(0)).await;

        assert_eq!(done.status, TransactionStatus::Dropped);
        assert!(done.error.unwrap().contains("not mined"));
        assert_eq!(
            h.relayers.get(&test_account(0).address()).await.unwrap().pending_tx_count,
            0
        );
    }

    #[tokio::test]
    async fn reverted_receipt_fails_request() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .returning(|_| Ok(H256::repeat_byte(4)));
        network.expect_get_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                status: Some(0u64.into()),
                ..Default::default()
            }))
        });
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let done = submit(&h, "tx-v", None).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert!(done.error.unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn fee_cap_stops_bumping() {
        let mut config = sample_chain();
        config.max_gas_price_gwei = 1;
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(rejected("replacement transaction underpriced")));
        let h = harness(network, config, &[eth(1)]).await;

        let done = submit(&h, "tx-cap", None).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert_eq!(done.retry_count, 0);
        assert!(done.error.unwrap().contains("exceeds the cap"));
    }

    #[tokio::test]
    async fn exhausted_fleet_fails_request() {
        let network = MockNetworkService::new();
        let h = harness(network, sample_chain(), &[]).await;

        let done = submit(&h, "tx-none", None).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert!(done.relayer_address.is_none());
    }

    #[tokio::test]
    async fn resumes_broadcast_request_after_restart() {
        let mut network = MockNetworkService::new();
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = harness(network, sample_chain(), &[eth(1)]).await;

        let relayer = test_account(0).address();
        let hash = H256::repeat_byte(7);
        let mut request = TransactionRequest::new(sample_new("tx-resume"), 3).unwrap();
        request.apply(TransactionUpdate {
            status: Some(TransactionStatus::Pending),
            relayer_address: Some(relayer),
            nonce: Some(11),
            tx_hash: Some(hash),
            attempt: Some(SubmissionAttempt {
                relayer,
                nonce: 11,
                gas_price: GasPrice::Legacy(U256::from(1_000_000_000u64)),
                hash: Some(hash),
                error: None,
                at: Utc::now(),
            }),
            ..Default::default()
        });
        h.store.save(&request).await.unwrap();

        let done = h.sender.process("tx-resume").await.unwrap();

        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.tx_hash, Some(hash));
        assert_eq!(h.relayers.get(&relayer).await.unwrap().pending_tx_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_share_relayer_nonce_pairs() {
        let mut config = sample_chain();
        config.fleet.acquire_timeout_ms = 5_000;
        let sent: Arc<StdMutex<Vec<Bytes>>> = Arc::new(StdMutex::new(Vec::new()));
        let hashes = Arc::new(AtomicU64::new(1));
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        let log = sent.clone();
        network.expect_send_raw_transaction().returning(move |raw| {
            log.lock().unwrap().push(raw);
            Ok(H256::from_low_u64_be(hashes.fetch_add(1, Ordering::SeqCst)))
        });
        network.expect_get_receipt().returning(|hash| Ok(mined(hash)));
        let h = Arc::new(harness(network, config, &[eth(1), eth(2)]).await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                submit(&h, &format!("tx-{}", i), None).await
            }));
        }

        let mut used: HashMap<Address, HashSet<u64>> = HashMap::new();
        for handle in futures::future::join_all(handles).await {
            let done = handle.unwrap();
            assert_eq!(done.status, TransactionStatus::Success);
            let relayer = done.relayer_address.unwrap();
            assert!(used.entry(relayer).or_default().insert(done.nonce.unwrap()));
        }
        assert_eq!(sent.lock().unwrap().len(), 8);
        assert_eq!(h.relayers.queue().size().await, 2);
    }
}
