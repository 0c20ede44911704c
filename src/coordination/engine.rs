//! Relay engine: request intake and per-chain background work

use crate::chain::NetworkService;
use crate::error::{RelayerError, RelayerResult};
use crate::relayer::RelayerManager;
use crate::state::TransactionStore;
use crate::tx::{
    GasPriceService, NewTransaction, TransactionRequest, TransactionSender, TransactionStatus,
    TransactionUpdate,
};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the engine runs for one chain
struct ChainContext {
    relayers: Arc<RelayerManager>,
    network: Arc<dyn NetworkService>,
    gas: Arc<GasPriceService>,
    sender: Arc<TransactionSender>,
    max_retries: u32,
    fleet_check_interval: Duration,
}

/// Multi-chain relay engine
pub struct RelayEngine {
    chains: HashMap<u64, ChainContext>,
    store: Arc<dyn TransactionStore>,
    /// Bounds the number of requests processed at once
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new(store: Arc<dyn TransactionStore>, max_concurrent_txs: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            chains: HashMap::new(),
            store,
            permits: Arc::new(Semaphore::new(max_concurrent_txs.max(1))),
            shutdown,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Wire a bootstrapped fleet into the engine.
    pub fn add_chain(&mut self, relayers: Arc<RelayerManager>, network: Arc<dyn NetworkService>) {
        let config = relayers.config().clone();
        let gas = Arc::new(GasPriceService::new(
            config.chain_id,
            network.clone(),
            Duration::from_secs(config.gas_price_refresh_secs),
        ));
        let sender = Arc::new(TransactionSender::new(
            &config,
            network.clone(),
            relayers.clone(),
            gas.clone(),
            self.store.clone(),
        ));

        info!("Chain {} ({}) added to relay engine", config.chain_id, config.name);
        self.chains.insert(
            config.chain_id,
            ChainContext {
                relayers,
                network,
                gas,
                sender,
                max_retries: config.retry.max_retries,
                fleet_check_interval: Duration::from_secs(config.fleet.fleet_check_interval_secs),
            },
        );
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn relayers(&self, chain_id: u64) -> Option<&Arc<RelayerManager>> {
        self.chains.get(&chain_id).map(|chain| &chain.relayers)
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Accept a request and start processing it in the background.
    ///
    /// Returns the request id, generating one when the caller left it empty.
    /// Submitting an id that is already stored returns that id and does
    /// nothing else.
    pub async fn submit(&self, mut new: NewTransaction) -> RelayerResult<String> {
        let chain = self
            .chains
            .get(&new.chain_id)
            .ok_or(RelayerError::ChainNotFound {
                chain_id: new.chain_id,
            })?;

        if new.id.is_empty() {
            new.id = Uuid::new_v4().to_string();
        }
        if let Some(existing) = self.store.get_by_id(&new.id).await? {
            debug!(tx_id = %existing.id, "Duplicate submission ignored");
            return Ok(existing.id);
        }

        let request = TransactionRequest::new(new, chain.max_retries)?;
        self.store.save(&request).await?;
        info!(
            tx_id = %request.id,
            chain_id = request.chain_id,
            kind = request.kind.as_str(),
            "Request accepted"
        );

        self.spawn(chain, request.id.clone());
        Ok(request.id)
    }

    pub async fn get_status(&self, id: &str) -> RelayerResult<TransactionRequest> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| RelayerError::TransactionNotFound { tx_id: id.to_string() })
    }

    /// Restart processing of every request left unfinished by a previous run.
    pub async fn recover(&self) -> RelayerResult<usize> {
        let unfinished = self.store.list_unfinished().await?;
        let mut resumed = 0;

        for request in unfinished {
            match self.chains.get(&request.chain_id) {
                Some(chain) => {
                    self.spawn(chain, request.id.clone());
                    resumed += 1;
                }
                None => warn!(
                    tx_id = %request.id,
                    chain_id = request.chain_id,
                    "Unfinished request for a chain that is not running"
                ),
            }
        }

        if resumed > 0 {
            info!("Recovered {} unfinished requests", resumed);
        }
        Ok(resumed)
    }

    fn spawn(&self, chain: &ChainContext, id: String) {
        let sender = chain.sender.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = sender.process(&id).await {
                error!(tx_id = %id, "Request processing failed: {}", e);
                fail_abandoned(store.as_ref(), &id, &e).await;
            }
        });
    }

    /// Start gas price refresh and fleet maintenance for every chain.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;

        for (chain_id, chain) in &self.chains {
            background.push(tokio::spawn(chain.gas.clone().run(self.shutdown.subscribe())));

            let relayers = chain.relayers.clone();
            let period = chain.fleet_check_interval;
            let mut shutdown = self.shutdown.subscribe();
            let chain_id = *chain_id;
            background.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = relayers.maintain_fleet().await {
                                error!("Fleet maintenance failed on chain {}: {}", chain_id, e);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Fleet maintenance stopped on chain {}", chain_id);
            }));
        }

        info!("Relay engine started for {} chains", self.chains.len());
    }

    /// Chain connectivity, one entry per running chain
    pub async fn health(&self) -> Vec<(u64, bool)> {
        let mut health = Vec::with_capacity(self.chains.len());
        for chain_id in self.chain_ids() {
            if let Some(chain) = self.chains.get(&chain_id) {
                health.push((chain_id, chain.network.health_check().await));
            }
        }
        health
    }

    /// Stop background loops. In-flight requests keep running until their
    /// tasks finish or the runtime shuts down.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Relay engine stopped");
    }
}

/// Mark a request FAILED after its processing task errored out.
///
/// Requests with a broadcast out are left for restart recovery, since the
/// transaction may still be mined.
async fn fail_abandoned(store: &dyn TransactionStore, id: &str, cause: &RelayerError) {
    let request = match store.get_by_id(id).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            error!(tx_id = %id, "Cannot load abandoned request: {}", e);
            return;
        }
    };
    if request.status != TransactionStatus::InProcess || request.has_broadcast() {
        return;
    }

    let update = TransactionUpdate {
        error: Some(cause.to_string()),
        ..Default::default()
    };
    match store.update_status(id, TransactionStatus::Failed, update).await {
        Ok(_) => crate::metrics::record_tx_failed(request.chain_id, request.kind.as_str()),
        Err(e) => error!(tx_id = %id, "Cannot mark abandoned request failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{GasPrice, MockNetworkService};
    use crate::config::tests::sample_chain;
    use crate::notify::LogNotifier;
    use crate::relayer::manager_tests::{eth, test_manager};
    use crate::state::{FlakyStore, InMemoryTransactionStore};
    use crate::tx::request::tests::sample_new;
    use ethers::types::{TransactionReceipt, H256, U256};

    fn happy_network(broadcasts: usize) -> MockNetworkService {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network
            .expect_send_raw_transaction()
            .times(broadcasts)
            .returning(|_| Ok(H256::repeat_byte(9)));
        network.expect_get_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                status: Some(1u64.into()),
                ..Default::default()
            }))
        });
        network
            .expect_get_gas_price()
            .returning(|| Ok(GasPrice::Legacy(U256::from(2_000_000_000u64))));
        network.expect_health_check().returning(|| true);
        network
    }

    async fn engine(network: MockNetworkService) -> (RelayEngine, Arc<InMemoryTransactionStore>) {
        let network: Arc<dyn NetworkService> = Arc::new(network);
        let relayers =
            test_manager(sample_chain(), network.clone(), Arc::new(LogNotifier), &[eth(1)], None)
                .await;
        let store = Arc::new(InMemoryTransactionStore::new());
        let mut engine = RelayEngine::new(store.clone(), 4);
        engine.add_chain(relayers, network);
        (engine, store)
    }

    async fn wait_terminal(engine: &RelayEngine, id: &str) -> TransactionRequest {
        for _ in 0..500 {
            let request = engine.get_status(id).await.unwrap();
            if request.status.is_terminal() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {} did not finish", id);
    }

    #[tokio::test]
    async fn submit_processes_request_to_success() {
        let (engine, _) = engine(happy_network(1)).await;

        let id = engine.submit(sample_new("")).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let done = wait_terminal(&engine, &id).await;
        assert_eq!(done.status, TransactionStatus::Success);
        assert_eq!(done.tx_hash, Some(H256::repeat_byte(9)));
    }

    #[tokio::test]
    async fn duplicate_submission_is_ignored() {
        let (engine, store) = engine(happy_network(1)).await;

        let first = engine.submit(sample_new("same")).await.unwrap();
        let second = engine.submit(sample_new("same")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);

        wait_terminal(&engine, "same").await;
    }

    #[tokio::test]
    async fn rejects_unknown_chain() {
        let (engine, store) = engine(MockNetworkService::new()).await;

        let mut new = sample_new("elsewhere");
        new.chain_id = 1;
        let result = engine.submit(new).await;
        assert!(matches!(result, Err(RelayerError::ChainNotFound { chain_id: 1 })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (engine, _) = engine(MockNetworkService::new()).await;
        let result = engine.get_status("missing").await;
        assert!(matches!(result, Err(RelayerError::TransactionNotFound { .. })));
    }

    #[tokio::test]
    async fn recovers_unfinished_requests() {
        let (engine, store) = engine(happy_network(1)).await;

        let request = TransactionRequest::new(sample_new("left-over"), 3).unwrap();
        store.save(&request).await.unwrap();
        let finished = TransactionRequest::new(sample_new("finished"), 3).unwrap();
        store.save(&finished).await.unwrap();
        store
            .update_status(
                "finished",
                TransactionStatus::Failed,
                TransactionUpdate::default(),
            )
            .await
            .unwrap();

        assert_eq!(engine.recover().await.unwrap(), 1);
        let done = wait_terminal(&engine, "left-over").await;
        assert_eq!(done.status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn errored_request_without_broadcast_is_marked_failed() {
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        network.expect_send_raw_transaction().times(1).returning(|_| {
            Err(RelayerError::ChainConnection {
                chain_id: 137,
                message: "connection reset".into(),
            })
        });
        network
            .expect_get_gas_price()
            .returning(|| Ok(GasPrice::Legacy(U256::from(2_000_000_000u64))));
        network.expect_health_check().returning(|| true);
        let network: Arc<dyn NetworkService> = Arc::new(network);

        let relayers =
            test_manager(sample_chain(), network.clone(), Arc::new(LogNotifier), &[eth(1)], None)
                .await;
        // The first status write fails, so processing aborts mid-flight.
        let store = Arc::new(FlakyStore::default());
        let mut engine = RelayEngine::new(store.clone(), 4);
        engine.add_chain(relayers, network);

        let id = engine.submit(sample_new("")).await.unwrap();
        let done = wait_terminal(&engine, &id).await;

        assert_eq!(done.status, TransactionStatus::Failed);
        assert!(done.error.as_ref().unwrap().contains("db down"));
        assert!(!done.has_broadcast());
    }

    #[tokio::test]
    async fn background_loops_stop_on_shutdown() {
        let (engine, _) = engine(happy_network(0)).await;

        engine.start().await;
        for _ in 0..200 {
            if engine.chains[&137].gas.get_gas_price().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.chains[&137].gas.get_gas_price().await.is_some());
        assert_eq!(engine.health().await, vec![(137, true)]);

        engine.stop().await;
        assert!(engine.background.lock().await.is_empty());
    }
}
