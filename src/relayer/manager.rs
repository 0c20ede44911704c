//! Relayer fleet management for one chain
//!
//! The manager owns the chain's relayer queue and nonce manager. It hands
//! relayers out to requests, takes them back, and keeps the fleet within its
//! configured size and balance policy:
//! - relayers below the funding threshold are taken out of rotation and
//!   flagged, and put back once their balance recovers
//! - when too many relayers are inactive or too many transactions are
//!   pending, new accounts are derived from the seed and funded from the owner
//!   account before joining the queue

use super::{Account, RelayerAccount, RelayerQueue};
use crate::chain::NetworkService;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::notify::{send_alert, Notifier};
use crate::tx::request::build_transaction;
use crate::tx::{calculate_cost, NonceManager, ReceiptWatcher};

use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Gas for a plain value transfer
const TRANSFER_GAS: u64 = 21_000;

struct FleetEntry {
    relayer: RelayerAccount,
    /// Held by a request, so neither queued nor free to queue
    checked_out: bool,
}

/// Fleet counters used by the sizing policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub size: usize,
    pub active: usize,
    pub inactive: usize,
    pub pending_transactions: u64,
}

pub struct RelayerManager {
    chain_id: u64,
    config: ChainConfig,
    network: Arc<dyn NetworkService>,
    queue: RelayerQueue,
    nonces: Arc<NonceManager>,
    notifier: Arc<dyn Notifier>,
    fleet: RwLock<HashMap<Address, FleetEntry>>,
    released: Notify,
    seed_phrase: Option<String>,
    /// Next seed derivation index; also serializes fleet growth
    next_index: Mutex<u32>,
    owner: Option<Account>,
    funding_threshold: U256,
    funding_amount: U256,
}

impl RelayerManager {
    pub fn new(
        config: ChainConfig,
        network: Arc<dyn NetworkService>,
        notifier: Arc<dyn Notifier>,
        seed_phrase: Option<String>,
        owner: Option<Account>,
    ) -> RelayerResult<Self> {
        config.validate()?;

        let chain_id = config.chain_id;
        Ok(Self {
            chain_id,
            queue: RelayerQueue::new(chain_id, config.fleet.selection_strategy),
            nonces: Arc::new(NonceManager::new(chain_id, network.clone(), config.nonce_ttl())),
            funding_threshold: config.funding_threshold()?,
            funding_amount: config.funding_amount()?,
            config,
            network,
            notifier,
            fleet: RwLock::new(HashMap::new()),
            released: Notify::new(),
            seed_phrase,
            next_index: Mutex::new(0),
            owner,
        })
    }

    /// Build the chain's fleet from its configuration.
    ///
    /// Derives `min_relayer_count` relayers from the seed phrase and loads
    /// their balances and nonces. Any error here means the chain cannot be
    /// served.
    pub async fn bootstrap(
        config: ChainConfig,
        network: Arc<dyn NetworkService>,
        notifier: Arc<dyn Notifier>,
    ) -> RelayerResult<Self> {
        config.validate()?;

        let seed_phrase = env::var(&config.fleet.seed_phrase_env).map_err(|_| {
            RelayerError::Config(format!(
                "chain {}: seed phrase variable {} is not set",
                config.chain_id, config.fleet.seed_phrase_env
            ))
        })?;

        let owner = match config.fleet.owner_private_key_env.as_deref() {
            Some(var) => match env::var(var) {
                Ok(key) => Some(Account::from_private_key(&key, config.chain_id)?),
                Err(_) => {
                    warn!(
                        "Owner key variable {} is not set; chain {} fleet cannot grow",
                        var, config.chain_id
                    );
                    None
                }
            },
            None => None,
        };

        let min = config.fleet.min_relayer_count as u32;
        let manager = Self::new(config, network, notifier, Some(seed_phrase.clone()), owner)?;

        for index in 0..min {
            let account = Account::from_mnemonic(&seed_phrase, index, manager.chain_id)?;
            manager.register(account, Some(index)).await?;
        }

        let stats = manager.stats().await;
        if stats.active == 0 {
            warn!(
                "Chain {} has no funded relayer; requests will wait for a top-up",
                manager.chain_id
            );
        }
        info!(
            "Chain {} fleet ready: {} relayers, {} active",
            manager.chain_id, stats.size, stats.active
        );
        Ok(manager)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn nonce_manager(&self) -> &Arc<NonceManager> {
        &self.nonces
    }

    pub fn queue(&self) -> &RelayerQueue {
        &self.queue
    }

    /// Load balance and nonce for `account` and add it to the fleet
    pub async fn register(&self, account: Account, derivation_index: Option<u32>) -> RelayerResult<()> {
        let mut relayer = RelayerAccount::new(account, self.chain_id, derivation_index);
        relayer.balance = self.network.get_balance(relayer.address).await?;
        relayer.nonce = self.network.get_nonce(relayer.address, true).await?;
        self.add_relayer(relayer).await
    }

    /// Add a relayer with known metadata. Relayers below the funding
    /// threshold join inactive.
    pub async fn add_relayer(&self, mut relayer: RelayerAccount) -> RelayerResult<()> {
        if relayer.chain_id != self.chain_id {
            return Err(RelayerError::Config(format!(
                "relayer {} belongs to chain {}, not {}",
                relayer.address_string(),
                relayer.chain_id,
                self.chain_id
            )));
        }

        relayer.active = relayer.balance >= self.funding_threshold;
        crate::metrics::record_relayer_balance(self.chain_id, &relayer.address_string(), relayer.balance);

        if let Some(index) = relayer.derivation_index {
            let mut next = self.next_index.lock().await;
            *next = (*next).max(index + 1);
        }

        if relayer.active {
            self.queue.push(relayer.clone()).await?;
        } else {
            warn!(
                "Relayer {} on chain {} starts inactive with balance {}",
                relayer.address_string(),
                self.chain_id,
                relayer.balance
            );
            self.alert(format!(
                "Relayer {} on chain {} needs funding: balance {} below threshold {}",
                relayer.address_string(),
                self.chain_id,
                relayer.balance,
                self.funding_threshold
            ))
            .await;
        }

        self.fleet.write().await.insert(
            relayer.address,
            FleetEntry {
                relayer,
                checked_out: false,
            },
        );
        self.released.notify_waiters();
        self.record_gauges().await;
        Ok(())
    }

    /// Take the best-ranked available relayer, waiting up to the configured
    /// acquire timeout for one to be released.
    pub async fn acquire_relayer(&self) -> RelayerResult<RelayerAccount> {
        self.checkout(None).await
    }

    /// Take one particular relayer, waiting for its current holder to release
    /// it. Used to replace a transaction with the nonce it was sent with.
    pub async fn acquire_specific(&self, address: Address) -> RelayerResult<RelayerAccount> {
        match self.fleet.read().await.get(&address) {
            Some(entry) if entry.relayer.active => {}
            _ => {
                return Err(RelayerError::RelayerNotFound {
                    chain_id: self.chain_id,
                    address: super::format_address(&address),
                })
            }
        }
        self.checkout(Some(address)).await
    }

    async fn checkout(&self, wanted: Option<Address>) -> RelayerResult<RelayerAccount> {
        let deadline = Instant::now() + self.config.acquire_timeout();

        loop {
            // Register for wakeups before looking, so a release between the
            // look and the wait is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let popped = match wanted {
                Some(address) => self.queue.take(&address).await,
                None => self.queue.pop().await,
            };

            if let Some(popped) = popped {
                let mut fleet = self.fleet.write().await;
                match fleet.get_mut(&popped.address) {
                    Some(entry) if entry.relayer.active => {
                        entry.checked_out = true;
                        debug!(
                            "Relayer {} checked out on chain {}",
                            entry.relayer.address_string(),
                            self.chain_id
                        );
                        return Ok(entry.relayer.clone());
                    }
                    // Deactivated while queued; leave it out of rotation.
                    _ => continue,
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                break;
            }
        }

        crate::metrics::record_fleet_exhausted(self.chain_id);
        let err = match wanted {
            Some(address) => RelayerError::Timeout {
                operation: format!(
                    "relayer {} on chain {}",
                    super::format_address(&address),
                    self.chain_id
                ),
            },
            None => RelayerError::FleetExhausted {
                chain_id: self.chain_id,
            },
        };
        if err.should_alert() {
            self.alert(format!(
                "No relayer became available on chain {} within {:?}",
                self.chain_id,
                self.config.acquire_timeout()
            ))
            .await;
        }
        Err(err)
    }

    /// Return a relayer after use. Inactive relayers stay out of the queue.
    pub async fn release_relayer(&self, address: Address) -> RelayerResult<()> {
        let requeue = {
            let mut fleet = self.fleet.write().await;
            let entry = fleet
                .get_mut(&address)
                .ok_or_else(|| RelayerError::RelayerNotFound {
                    chain_id: self.chain_id,
                    address: super::format_address(&address),
                })?;
            entry.checked_out = false;
            entry.relayer.active.then(|| entry.relayer.clone())
        };

        if let Some(relayer) = requeue {
            self.queue.push(relayer).await?;
        }
        self.released.notify_waiters();
        self.record_gauges().await;
        Ok(())
    }

    /// Note a broadcast from `address` with `nonce`
    pub async fn record_submission(&self, address: Address, nonce: u64) {
        if let Some(entry) = self.fleet.write().await.get_mut(&address) {
            entry.relayer.pending_tx_count += 1;
            entry.relayer.nonce = entry.relayer.nonce.max(nonce + 1);
        }
    }

    /// Note that a transaction from `address` reached a terminal state
    pub async fn transaction_settled(&self, address: Address) {
        let pending = {
            let mut fleet = self.fleet.write().await;
            let Some(entry) = fleet.get_mut(&address) else {
                return;
            };
            entry.relayer.pending_tx_count = entry.relayer.pending_tx_count.saturating_sub(1);
            entry.relayer.pending_tx_count
        };
        self.queue
            .update(&address, |r| r.pending_tx_count = pending)
            .await;
    }

    /// Take a relayer out of rotation and flag it for a top-up.
    pub async fn deactivate(&self, address: Address, reason: &str) {
        let was_active = {
            let mut fleet = self.fleet.write().await;
            match fleet.get_mut(&address) {
                Some(entry) => std::mem::replace(&mut entry.relayer.active, false),
                None => return,
            }
        };
        self.queue.take(&address).await;

        if was_active {
            let address = super::format_address(&address);
            warn!(
                relayer = %address,
                chain_id = self.chain_id,
                "Relayer taken out of rotation: {}", reason
            );
            self.alert(format!(
                "Relayer {} on chain {} taken out of rotation: {}",
                address, self.chain_id, reason
            ))
            .await;
        }
        self.record_gauges().await;
    }

    async fn reactivate(&self, address: Address) -> RelayerResult<()> {
        let requeue = {
            let mut fleet = self.fleet.write().await;
            let Some(entry) = fleet.get_mut(&address) else {
                return Ok(());
            };
            entry.relayer.active = true;
            (!entry.checked_out).then(|| entry.relayer.clone())
        };

        info!(
            "Relayer {} back in rotation on chain {}",
            super::format_address(&address),
            self.chain_id
        );
        if let Some(relayer) = requeue {
            self.queue.push(relayer).await?;
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Every relayer of the fleet, in queue order
    pub async fn fleet(&self) -> Vec<RelayerAccount> {
        let strategy = self.queue.strategy();
        let mut relayers: Vec<_> = self
            .fleet
            .read()
            .await
            .values()
            .map(|e| e.relayer.clone())
            .collect();
        relayers.sort_by(|a, b| strategy.compare(a, b));
        relayers
    }

    pub async fn get(&self, address: &Address) -> Option<RelayerAccount> {
        self.fleet.read().await.get(address).map(|e| e.relayer.clone())
    }

    /// Relayers flagged for a top-up
    pub async fn inactive_relayers(&self) -> Vec<Address> {
        self.fleet
            .read()
            .await
            .values()
            .filter(|e| !e.relayer.active)
            .map(|e| e.relayer.address)
            .collect()
    }

    pub async fn stats(&self) -> FleetStats {
        let fleet = self.fleet.read().await;
        let active = fleet.values().filter(|e| e.relayer.active).count();
        FleetStats {
            size: fleet.len(),
            active,
            inactive: fleet.len() - active,
            pending_transactions: fleet.values().map(|e| e.relayer.pending_tx_count).sum(),
        }
    }

    async fn record_gauges(&self) {
        let stats = self.stats().await;
        crate::metrics::record_fleet(self.chain_id, stats.size, stats.inactive, self.queue.size().await);
    }

    async fn alert(&self, message: String) {
        send_alert(self.notifier.as_ref(), &message).await;
    }

    /// Refresh balances and grow the fleet when the sizing policy asks for it.
    pub async fn maintain_fleet(&self) -> RelayerResult<()> {
        self.refresh_balances().await;
        self.grow_if_needed().await;
        self.record_gauges().await;
        Ok(())
    }

    async fn refresh_balances(&self) {
        let addresses: Vec<Address> = self.fleet.read().await.keys().copied().collect();

        for address in addresses {
            let balance = match self.network.get_balance(address).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(
                        "Balance refresh for {} on chain {} failed: {}",
                        super::format_address(&address),
                        self.chain_id,
                        e
                    );
                    continue;
                }
            };

            let was_active = {
                let mut fleet = self.fleet.write().await;
                let Some(entry) = fleet.get_mut(&address) else {
                    continue;
                };
                entry.relayer.balance = balance;
                entry.relayer.active
            };
            self.queue.update(&address, |r| r.balance = balance).await;
            crate::metrics::record_relayer_balance(
                self.chain_id,
                &super::format_address(&address),
                balance,
            );

            let funded = balance >= self.funding_threshold;
            if was_active && !funded {
                self.deactivate(address, "balance below funding threshold").await;
            } else if !was_active && funded {
                if let Err(e) = self.reactivate(address).await {
                    error!("Failed to requeue relayer on chain {}: {}", self.chain_id, e);
                }
            }
        }
    }

    async fn grow_if_needed(&self) {
        let stats = self.stats().await;
        let policy = &self.config.fleet;

        let wants_growth = stats.active < policy.min_relayer_count
            || stats.inactive > policy.inactive_relayer_count_threshold
            || stats.pending_transactions > policy.pending_transaction_count_threshold;
        if !wants_growth {
            return;
        }

        let room = policy.max_relayer_count.saturating_sub(stats.size);
        if room == 0 {
            warn!(
                "Chain {} fleet needs more relayers but is at its maximum of {}",
                self.chain_id, policy.max_relayer_count
            );
            self.alert(format!(
                "Chain {} fleet is at its maximum of {} relayers ({} inactive, {} pending transactions)",
                self.chain_id, policy.max_relayer_count, stats.inactive, stats.pending_transactions
            ))
            .await;
            return;
        }

        let count = policy.new_relayer_instance_count.max(1).min(room);
        for _ in 0..count {
            match self.grow_one().await {
                Ok(address) => info!(
                    "Added relayer {} to chain {} fleet",
                    super::format_address(&address),
                    self.chain_id
                ),
                Err(e) => {
                    error!("Failed to add relayer on chain {}: {}", self.chain_id, e);
                    crate::metrics::record_funding_failure(self.chain_id);
                    self.alert(format!(
                        "Fleet growth on chain {} failed: {}",
                        self.chain_id, e
                    ))
                    .await;
                    break;
                }
            }
        }
    }

    /// Derive, fund and register the next relayer.
    async fn grow_one(&self) -> RelayerResult<Address> {
        let seed = self.seed_phrase.as_deref().ok_or_else(|| RelayerError::Funding {
            chain_id: self.chain_id,
            message: "no seed phrase to derive relayers from".to_string(),
        })?;
        let owner = self.owner.as_ref().ok_or_else(|| RelayerError::Funding {
            chain_id: self.chain_id,
            message: "no owner account configured".to_string(),
        })?;

        let mut next = self.next_index.lock().await;
        let index = *next;
        let account = Account::from_mnemonic(seed, index, self.chain_id)?;
        let address = account.address();

        self.fund_relayer(owner, address, self.funding_amount).await?;
        *next = index + 1;
        drop(next);

        self.register(account, Some(index)).await?;
        Ok(address)
    }

    /// Transfer `amount` from `owner` to `to` and wait for it to be mined.
    pub async fn fund_relayer(&self, owner: &Account, to: Address, amount: U256) -> RelayerResult<H256> {
        let funding_error = |message: String| RelayerError::Funding {
            chain_id: self.chain_id,
            message,
        };
        let from = owner.address();
        let fee = self
            .network
            .get_gas_price()
            .await
            .map_err(|e| funding_error(e.to_string()))?;
        let need = amount + calculate_cost(U256::from(TRANSFER_GAS), &fee);
        let have = self
            .network
            .get_balance(from)
            .await
            .map_err(|e| funding_error(e.to_string()))?;
        if have < need {
            return Err(RelayerError::InsufficientBalance {
                chain_id: self.chain_id,
                have: have.to_string(),
                need: need.to_string(),
            });
        }

        let nonce = self.nonces.get_nonce(from).await?;
        let sent = async {
            let tx = build_transaction(
                self.chain_id,
                to,
                Bytes::default(),
                amount,
                U256::from(TRANSFER_GAS),
                nonce,
                &fee,
            );
            let raw = owner.sign_transaction(&tx).await?;
            self.network.send_raw_transaction(raw).await
        }
        .await;

        let hash = match sent {
            Ok(hash) => hash,
            Err(e) => {
                self.nonces.release_nonce(from, nonce).await;
                return Err(funding_error(e.to_string()));
            }
        };
        self.nonces.mark_used(from, nonce).await;
        self.nonces.increment_nonce(from).await;
        info!(
            "Funding {} with {} wei on chain {}: {:?}",
            super::format_address(&to),
            amount,
            self.chain_id,
            hash
        );

        let watcher = ReceiptWatcher::new(
            self.chain_id,
            self.network.clone(),
            self.config.receipt_timeout(),
            self.config.receipt_poll_interval(),
        );
        match watcher.wait(&[hash]).await?.succeeded() {
            Some(true) => Ok(hash),
            Some(false) => Err(funding_error(format!("transfer {:?} reverted", hash))),
            None => Err(funding_error(format!(
                "transfer {:?} not mined within {:?}",
                hash,
                self.config.receipt_timeout()
            ))),
        }
    }
}
