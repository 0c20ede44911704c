//! Durable storage of relay requests
//!
//! Handles:
//! - Saving newly accepted requests
//! - Status and field updates on every state machine transition
//! - Lookup by id for status queries
//! - Listing unfinished requests for restart recovery

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::InMemoryTransactionStore;

#[cfg(test)]
pub(crate) use memory::tests::FlakyStore;

use crate::error::{RelayerError, RelayerResult};
use crate::tx::{TransactionRequest, TransactionStatus, TransactionUpdate};

use async_trait::async_trait;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new request. Fails if the id is already taken.
    async fn save(&self, request: &TransactionRequest) -> RelayerResult<()>;

    /// Apply `update` and move to `status`. Terminal records are immutable.
    async fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        update: TransactionUpdate,
    ) -> RelayerResult<TransactionRequest>;

    async fn get_by_id(&self, id: &str) -> RelayerResult<Option<TransactionRequest>>;

    /// Requests that were not terminal when last written
    async fn list_unfinished(&self) -> RelayerResult<Vec<TransactionRequest>>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Check and apply an update to a loaded record
pub(crate) fn apply_update(
    request: &mut TransactionRequest,
    status: TransactionStatus,
    mut update: TransactionUpdate,
) -> RelayerResult<()> {
    let allowed = !request.status.is_terminal()
        && (request.status == status || request.status.can_transition_to(status));
    if !allowed {
        return Err(RelayerError::InvalidStateTransition {
            from: request.status.to_string(),
            to: status.to_string(),
        });
    }

    update.status = Some(status);
    request.apply(update);
    Ok(())
}
