//! # Chain Providers
//!
//! The on-chain collaborator: receipts, balances, nonces and batched balance
//! lookups, plus a per-network registry of live providers.

pub mod json_rpc;

use crate::chain::{Amount, TransactionReceipt};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub use json_rpc::JsonRpcProvider;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider was torn down (network switch, RPC change). Transient.
    #[error("provider destroyed")]
    Destroyed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ProviderError::Destroyed)
    }
}

/// Returns `T::default()` for a destroyed provider and propagates every other error.
pub fn swallow_destroyed<T: Default>(result: Result<T, ProviderError>) -> Result<T, ProviderError> {
    match result {
        Err(ProviderError::Destroyed) => {
            log::debug!("Provider: call hit a destroyed provider, using default value");
            Ok(T::default())
        }
        other => other,
    }
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// `None` means the transaction is not mined yet.
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, ProviderError>;

    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<u64>, ProviderError>;

    /// Nonce of the next transaction from `address`, counting pool transactions.
    async fn get_transaction_count(&self, address: &str) -> Result<u64, ProviderError>;

    async fn get_balance(&self, address: &str) -> Result<Amount, ProviderError>;

    async fn erc20_balance_of(&self, token: &str, owner: &str) -> Result<Amount, ProviderError>;

    async fn erc20_decimals(&self, token: &str) -> Result<u8, ProviderError>;

    /// One round trip for many token balances. Tokens missing from the map
    /// could not be read.
    async fn batch_balances(
        &self,
        owner: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, Amount>, ProviderError>;
}

#[derive(Default)]
pub struct Providers {
    by_network: RwLock<HashMap<String, Arc<dyn ChainProvider>>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, network: &str, provider: Arc<dyn ChainProvider>) {
        log::info!("Provider: registered provider for {}", network);
        self.by_network
            .write()
            .insert(network.to_string(), provider);
    }

    pub fn remove(&self, network: &str) -> Option<Arc<dyn ChainProvider>> {
        self.by_network.write().remove(network)
    }

    pub fn get(&self, network: &str) -> Option<Arc<dyn ChainProvider>> {
        self.by_network.read().get(network).cloned()
    }

    pub fn networks(&self) -> Vec<String> {
        self.by_network.read().keys().cloned().collect()
    }
}
