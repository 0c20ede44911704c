//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Per-address nonce caching with a TTL, so externally submitted
//!   transactions are eventually picked up
//! - Staleness detection (`pending == used`) and forced refreshes
//! - Refusing to hand the same nonce to two requests at once
//!
//! Every address has its own lock; a slow network lookup for one relayer never
//! blocks nonce assignment for another.

use crate::chain::NetworkService;
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Cached nonce state for one address
#[derive(Debug, Clone, Default)]
struct NonceRecord {
    /// Next nonce to hand out
    pending: Option<u64>,
    /// Most recent nonce consumed by a broadcast transaction
    used: Option<u64>,
    /// Nonce handed out and not yet consumed or released
    issued: Option<u64>,
    /// When `pending` was last read from the network
    fetched_at: Option<Instant>,
}

impl NonceRecord {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }
}

/// Nonce bookkeeping for every relayer of one chain
pub struct NonceManager {
    chain_id: u64,
    network: Arc<dyn NetworkService>,
    ttl: Duration,
    records: DashMap<Address, Arc<Mutex<NonceRecord>>>,
}

impl NonceManager {
    pub fn new(chain_id: u64, network: Arc<dyn NetworkService>, ttl: Duration) -> Self {
        Self {
            chain_id,
            network,
            ttl,
            records: DashMap::new(),
        }
    }

    fn record(&self, address: Address) -> Arc<Mutex<NonceRecord>> {
        // Clone the Arc out so the map shard is not held across an await.
        self.records
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(NonceRecord::default())))
            .value()
            .clone()
    }

    /// Next nonce for `address`.
    ///
    /// Answers from the cache when the entry is fresh and not stale, otherwise
    /// asks the network for the pending transaction count. Fails if the
    /// current nonce is already held by another request.
    pub async fn get_nonce(&self, address: Address) -> RelayerResult<u64> {
        let record = self.record(address);
        let mut record = record.lock().await;

        let expired = record.fetched_at.is_some() && !record.is_fresh(self.ttl);
        let cached = record
            .pending
            .filter(|pending| record.is_fresh(self.ttl) && Some(*pending) != record.used);

        let nonce = match cached {
            Some(pending) => {
                if record.issued == Some(pending) {
                    return Err(RelayerError::Nonce {
                        chain_id: self.chain_id,
                        message: format!("nonce {} of {:?} is already in flight", pending, address),
                    });
                }
                debug!("Nonce cache hit for {:?} on chain {}: {}", address, self.chain_id, pending);
                pending
            }
            None => {
                let fetched = self.network.get_nonce(address, true).await?;
                // The node may not have seen our last broadcast yet.
                let floor = record.used.map(|used| used + 1).unwrap_or(0);
                if fetched < floor {
                    warn!(
                        "Network nonce {} for {:?} on chain {} is behind local broadcast {}",
                        fetched, address, self.chain_id, floor - 1
                    );
                }
                let nonce = fetched.max(floor);
                // An issue older than the TTL was never consumed or released.
                if expired {
                    if let Some(abandoned) = record.issued.take() {
                        warn!(
                            "Dropping abandoned nonce {} of {:?} on chain {}",
                            abandoned, address, self.chain_id
                        );
                    }
                }
                if record.issued == Some(nonce) {
                    return Err(RelayerError::Nonce {
                        chain_id: self.chain_id,
                        message: format!("nonce {} of {:?} is already in flight", nonce, address),
                    });
                }
                debug!("Fetched nonce for {:?} on chain {}: {}", address, self.chain_id, nonce);
                record.pending = Some(nonce);
                record.fetched_at = Some(Instant::now());
                nonce
            }
        };

        record.issued = Some(nonce);
        Ok(nonce)
    }

    /// Bypass the cache and reload the nonce from the network. Used after a
    /// "nonce too low" rejection by the request that already holds the
    /// address, so the new value is issued to that same caller.
    pub async fn refresh_nonce(&self, address: Address) -> RelayerResult<u64> {
        let record = self.record(address);
        let mut record = record.lock().await;

        let fetched = self.network.get_nonce(address, true).await?;
        if let Some(previous) = record.pending {
            if fetched < previous {
                warn!(
                    "Network nonce {} for {:?} on chain {} is behind cached {}",
                    fetched, address, self.chain_id, previous
                );
            }
        }

        debug!("Refreshed nonce for {:?} on chain {}: {}", address, self.chain_id, fetched);
        record.pending = Some(fetched);
        record.used = None;
        record.issued = Some(fetched);
        record.fetched_at = Some(Instant::now());
        crate::metrics::record_nonce_refresh(self.chain_id);
        Ok(fetched)
    }

    /// Record that `nonce` was broadcast for `address`.
    pub async fn mark_used(&self, address: Address, nonce: u64) {
        let record = self.record(address);
        let mut record = record.lock().await;
        record.used = Some(record.used.map_or(nonce, |used| used.max(nonce)));
        if record.issued == Some(nonce) {
            record.issued = None;
        }
    }

    /// Advance the cached nonce after a successful broadcast.
    ///
    /// Moves past the highest nonce consumed or handed out, and never moves
    /// the cache backwards.
    pub async fn increment_nonce(&self, address: Address) {
        let record = self.record(address);
        let mut record = record.lock().await;

        let consumed = match (record.used, record.issued) {
            (Some(used), Some(issued)) => Some(used.max(issued)),
            (used, issued) => used.or(issued).or(record.pending),
        };
        let Some(consumed) = consumed else {
            warn!(
                "Increment for {:?} on chain {} without a cached nonce",
                address, self.chain_id
            );
            return;
        };

        let next = consumed + 1;
        record.pending = Some(record.pending.map_or(next, |pending| pending.max(next)));
        if record.issued.is_some_and(|issued| issued <= consumed) {
            record.issued = None;
        }
    }

    /// Give back an issued nonce that was never broadcast.
    pub async fn release_nonce(&self, address: Address, nonce: u64) {
        let record = self.record(address);
        let mut record = record.lock().await;
        if record.issued == Some(nonce) {
            record.issued = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkService;
    use crate::relayer::account::tests::test_account;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn manager(network: MockNetworkService, ttl: Duration) -> NonceManager {
        NonceManager::new(137, Arc::new(network), ttl)
    }

    #[tokio::test]
    async fn increment_advances_without_network_call() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(1).returning(|_, _| Ok(5));
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 5);
        nonces.increment_nonce(address).await;
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn stale_entry_is_refetched() {
        let address = test_account(0).address();
        let calls = Arc::new(AtomicU64::new(0));
        let mut network = MockNetworkService::new();
        let counter = calls.clone();
        network.expect_get_nonce().returning(move |_, pending| {
            assert!(pending);
            Ok(7 + counter.fetch_add(1, Ordering::SeqCst))
        });
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 7);
        // Broadcast without increment: pending == used, so the cache is stale.
        nonces.mark_used(address, 7).await;
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lagging_node_never_rewinds_past_broadcast() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(7));
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 7);
        nonces.mark_used(address, 7).await;
        // The node still reports 7; reissuing it would double-assign.
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let address = test_account(0).address();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(move |_, _| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 10)
        });
        let nonces = manager(network, Duration::ZERO);

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 10);
        nonces.release_nonce(address, 10).await;
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn refuses_nonce_already_in_flight() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(3));
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 3);
        assert!(matches!(
            nonces.get_nonce(address).await,
            Err(RelayerError::Nonce { .. })
        ));

        nonces.release_nonce(address, 3).await;
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn expired_issue_is_treated_as_abandoned() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().times(2).returning(|_, _| Ok(3));
        let nonces = manager(network, Duration::from_millis(20));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(nonces.get_nonce(address).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn refresh_bypasses_cache() {
        let address = test_account(0).address();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(move |_, _| {
            Ok(if counter.fetch_add(1, Ordering::SeqCst) == 0 { 4 } else { 9 })
        });
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(address).await.unwrap(), 4);
        assert_eq!(nonces.refresh_nonce(address).await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn network_failure_propagates() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| {
            Err(RelayerError::ChainConnection {
                chain_id: 137,
                message: "connection refused".to_string(),
            })
        });
        let nonces = manager(network, Duration::from_secs(60));

        assert!(nonces.get_nonce(address).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_share_a_nonce() {
        let address = test_account(0).address();
        let mut network = MockNetworkService::new();
        network.expect_get_nonce().returning(|_, _| Ok(0));
        let nonces = Arc::new(manager(network, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let nonces = nonces.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..20 {
                    if let Ok(nonce) = nonces.get_nonce(address).await {
                        got.push(nonce);
                        nonces.mark_used(address, nonce).await;
                        nonces.increment_nonce(address).await;
                    }
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for handle in futures::future::join_all(handles).await {
            for nonce in handle.unwrap() {
                assert!(seen.insert(nonce), "nonce {} handed out twice", nonce);
            }
        }
        assert!(!seen.is_empty());
    }

    #[tokio::test]
    async fn addresses_are_independent() {
        let first = test_account(0).address();
        let second = test_account(1).address();
        let mut network = MockNetworkService::new();
        network
            .expect_get_nonce()
            .returning(move |address, _| Ok(if address == first { 1 } else { 40 }));
        let nonces = manager(network, Duration::from_secs(60));

        assert_eq!(nonces.get_nonce(first).await.unwrap(), 1);
        assert_eq!(nonces.get_nonce(second).await.unwrap(), 40);
    }
}
