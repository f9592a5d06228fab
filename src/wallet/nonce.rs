//! Next-nonce derivation for a wallet on one network.

use crate::errors::EngineResult;
use crate::provider::ChainProvider;
use crate::storage::KeyValueStore;
use crate::utils::constants::{storage_key, LAST_NONCE_KEY};
use anyhow::Context;
use std::sync::Arc;

pub struct NonceAllocator {
    kv: Arc<dyn KeyValueStore>,
}

fn nonce_key(address: &str, network: &str) -> String {
    storage_key(&[LAST_NONCE_KEY, &address.to_lowercase(), network])
}

impl NonceAllocator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        NonceAllocator { kv }
    }

    /// A custom nonce wins. Otherwise the larger of the node's pending count
    /// and the last nonce this wallet submitted plus one, so back-to-back
    /// submissions never reuse a nonce the node has not seen yet.
    pub async fn next_transaction_nonce(
        &self,
        provider: &dyn ChainProvider,
        address: &str,
        network: &str,
        custom_nonce: Option<u64>,
    ) -> EngineResult<u64> {
        if let Some(nonce) = custom_nonce {
            return Ok(nonce);
        }

        let chain_nonce = provider.get_transaction_count(address).await?;
        let next = match self.last_transaction_nonce(address, network)? {
            Some(last) => chain_nonce.max(last + 1),
            None => chain_nonce,
        };
        log::debug!(
            "Nonce: next nonce for {} on {} is {} (chain {})",
            address,
            network,
            next,
            chain_nonce
        );
        Ok(next)
    }

    pub fn last_transaction_nonce(
        &self,
        address: &str,
        network: &str,
    ) -> anyhow::Result<Option<u64>> {
        let stored = self.kv.get(&nonce_key(address, network))?;
        match stored {
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("Corrupt stored nonce {:?}", value)),
            None => Ok(None),
        }
    }

    pub fn store_last_transaction_nonce(
        &self,
        address: &str,
        network: &str,
        nonce: u64,
    ) -> anyhow::Result<()> {
        self.kv.set(&nonce_key(address, network), &nonce.to_string())
    }

    /// Called when a submission fails so its nonce can be reused.
    pub fn clear_last_transaction_nonce(&self, address: &str, network: &str) -> anyhow::Result<()> {
        self.kv.remove(&nonce_key(address, network))
    }
}
