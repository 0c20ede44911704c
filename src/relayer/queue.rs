//! Priority-ordered pool of available relayers for one chain
//!
//! A relayer is either in the queue or checked out by exactly one request,
//! never both. `pop` and `push` each run inside their own critical region so
//! two callers can never pop the same relayer, while a push in progress does
//! not hold up a pop of a different relayer.

use super::{RelayerAccount, SelectionStrategy};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;
use std::collections::VecDeque;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub struct RelayerQueue {
    chain_id: u64,
    strategy: SelectionStrategy,
    relayers: RwLock<VecDeque<RelayerAccount>>,
    pop_lock: Mutex<()>,
    push_lock: Mutex<()>,
}

impl RelayerQueue {
    pub fn new(chain_id: u64, strategy: SelectionStrategy) -> Self {
        Self {
            chain_id,
            strategy,
            relayers: RwLock::new(VecDeque::new()),
            pop_lock: Mutex::new(()),
            push_lock: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Snapshot of the available relayers in pop order
    pub async fn list(&self) -> Vec<RelayerAccount> {
        self.relayers.read().await.iter().cloned().collect()
    }

    pub async fn get(&self, address: &Address) -> Option<RelayerAccount> {
        self.relayers
            .read()
            .await
            .iter()
            .find(|r| r.address == *address)
            .cloned()
    }

    pub async fn size(&self) -> usize {
        self.relayers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.relayers.read().await.is_empty()
    }

    /// Remove and return the best-ranked relayer. `None` means every relayer
    /// of the fleet is checked out.
    pub async fn pop(&self) -> Option<RelayerAccount> {
        let _guard = self.pop_lock.lock().await;
        let relayer = self.relayers.write().await.pop_front();
        if let Some(ref relayer) = relayer {
            debug!("Popped relayer {:?} on chain {}", relayer.address, self.chain_id);
        }
        relayer
    }

    /// Remove a specific relayer, if it is currently available.
    pub async fn take(&self, address: &Address) -> Option<RelayerAccount> {
        let _guard = self.pop_lock.lock().await;
        let mut relayers = self.relayers.write().await;
        let position = relayers.iter().position(|r| r.address == *address)?;
        relayers.remove(position)
    }

    /// Return a relayer to the pool and restore the ordering.
    pub async fn push(&self, relayer: RelayerAccount) -> RelayerResult<()> {
        if relayer.chain_id != self.chain_id {
            return Err(RelayerError::Internal(format!(
                "relayer {:?} belongs to chain {}, not {}",
                relayer.address, relayer.chain_id, self.chain_id
            )));
        }

        let _guard = self.push_lock.lock().await;
        let mut relayers = self.relayers.write().await;

        if let Some(existing) = relayers.iter_mut().find(|r| r.address == relayer.address) {
            warn!(
                "Relayer {:?} pushed while already queued on chain {}",
                relayer.address, self.chain_id
            );
            *existing = relayer;
        } else {
            relayers.push_back(relayer);
        }

        // Stable sort: equal ranks keep insertion order.
        let strategy = self.strategy;
        relayers
            .make_contiguous()
            .sort_by(|a, b| strategy.compare(a, b));
        Ok(())
    }

    /// Mutate a queued relayer in place and restore the ordering. Returns
    /// `false` when the relayer is checked out.
    pub async fn update<F>(&self, address: &Address, f: F) -> bool
    where
        F: FnOnce(&mut RelayerAccount),
    {
        let _guard = self.push_lock.lock().await;
        let mut relayers = self.relayers.write().await;
        let Some(relayer) = relayers.iter_mut().find(|r| r.address == *address) else {
            return false;
        };
        f(relayer);

        let strategy = self.strategy;
        relayers
            .make_contiguous()
            .sort_by(|a, b| strategy.compare(a, b));
        true
    }
}
