//! Relayer selection strategies

use super::RelayerAccount;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ranking used by the relayer queue. The head of the ordering is popped first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    AscendingBalance,
    AscendingPendingCount,
    AscendingNonce,
}

impl SelectionStrategy {
    pub fn compare(&self, a: &RelayerAccount, b: &RelayerAccount) -> Ordering {
        match self {
            SelectionStrategy::AscendingBalance => a.balance.cmp(&b.balance),
            SelectionStrategy::AscendingPendingCount => a.pending_tx_count.cmp(&b.pending_tx_count),
            SelectionStrategy::AscendingNonce => a.nonce.cmp(&b.nonce),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::account::tests::test_account;
    use ethers::types::U256;

    fn relayer(index: u32, balance: u64, pending: u64, nonce: u64) -> RelayerAccount {
        let mut relayer = RelayerAccount::new(test_account(index), 137, Some(index));
        relayer.balance = U256::from(balance);
        relayer.pending_tx_count = pending;
        relayer.nonce = nonce;
        relayer
    }

    #[test]
    fn each_strategy_ranks_by_its_own_field() {
        let a = relayer(0, 10, 5, 1);
        let b = relayer(1, 20, 1, 0);

        assert_eq!(SelectionStrategy::AscendingBalance.compare(&a, &b), Ordering::Less);
        assert_eq!(
            SelectionStrategy::AscendingPendingCount.compare(&a, &b),
            Ordering::Greater
        );
        assert_eq!(SelectionStrategy::AscendingNonce.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn parses_from_config_names() {
        let strategy: SelectionStrategy = serde_json::from_str("\"ascending_nonce\"").unwrap();
        assert_eq!(strategy, SelectionStrategy::AscendingNonce);
    }
}
