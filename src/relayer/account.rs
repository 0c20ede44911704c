//! Relayer accounts: an address plus the key that signs for it

use crate::error::{RelayerError, RelayerResult};

use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, U256};
use serde::Serialize;
use std::fmt;

/// Signing identity. Holds no state beyond the key.
#[derive(Clone)]
pub struct Account {
    wallet: LocalWallet,
}

impl Account {
    /// Derive the account at `index` from a BIP-39 phrase
    pub fn from_mnemonic(phrase: &str, index: u32, chain_id: u64) -> RelayerResult<Self> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(phrase)
            .index(index)
            .and_then(|builder| builder.build())
            .map_err(|e| RelayerError::Signing(format!("derivation index {}: {}", index, e)))?;

        Ok(Self {
            wallet: wallet.with_chain_id(chain_id),
        })
    }

    pub fn from_private_key(key: &str, chain_id: u64) -> RelayerResult<Self> {
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Signing(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            wallet: wallet.with_chain_id(chain_id),
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub async fn sign_message(&self, message: &[u8]) -> RelayerResult<Signature> {
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| RelayerError::Signing(e.to_string()))
    }

    /// Sign `tx` and return the raw bytes ready for broadcast
    pub async fn sign_transaction(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| RelayerError::Signing(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .finish()
    }
}

/// A fleet member and the metadata the queue ranks it by.
#[derive(Debug, Clone, Serialize)]
pub struct RelayerAccount {
    pub address: Address,
    #[serde(skip)]
    pub account: Account,
    pub chain_id: u64,
    pub balance: U256,
    pub pending_tx_count: u64,
    pub nonce: u64,
    pub active: bool,
    /// Seed derivation index, `None` for accounts loaded from a raw key
    pub derivation_index: Option<u32>,
}

impl RelayerAccount {
    pub fn new(account: Account, chain_id: u64, derivation_index: Option<u32>) -> Self {
        Self {
            address: account.address(),
            account,
            chain_id,
            balance: U256::zero(),
            pending_tx_count: 0,
            nonce: 0,
            active: true,
            derivation_index,
        }
    }

    /// Lowercase `0x`-prefixed address, the form used in logs and records
    pub fn address_string(&self) -> String {
        format_address(&self.address)
    }
}

pub fn format_address(address: &Address) -> String {
    format!("{:?}", address)
}
