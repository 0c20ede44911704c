//! In-process request store, used when no database is configured

use super::{apply_update, TransactionStore};
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{TransactionRequest, TransactionStatus, TransactionUpdate};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryTransactionStore {
    store: DashMap<String, TransactionRequest>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn save(&self, request: &TransactionRequest) -> RelayerResult<()> {
        match self.store.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(RelayerError::Transaction(format!(
                "request {} already exists",
                request.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        update: TransactionUpdate,
    ) -> RelayerResult<TransactionRequest> {
        let mut entry = self
            .store
            .get_mut(id)
            .ok_or_else(|| RelayerError::TransactionNotFound {
                tx_id: id.to_string(),
            })?;

        apply_update(entry.value_mut(), status, update)?;
        Ok(entry.value().clone())
    }

    async fn get_by_id(&self, id: &str) -> RelayerResult<Option<TransactionRequest>> {
        Ok(self.store.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_unfinished(&self) -> RelayerResult<Vec<TransactionRequest>> {
        let mut unfinished: Vec<_> = self
            .store
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        unfinished.sort_by_key(|r| r.created_at);
        Ok(unfinished)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
