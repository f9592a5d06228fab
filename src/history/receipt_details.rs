//! Timestamp and gas fee lookups for mined transactions, cached by txid.

use super::store::SavedTransactionStore;
use crate::chain::ReceiptDetails;
use crate::provider::Providers;
use crate::storage::KeyValueStore;
use crate::utils::constants::{storage_key, TX_RECEIPT_DETAILS_KEY};
use anyhow::{anyhow, Context};
use std::sync::Arc;

pub struct TransactionReceiptDetailsService {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<SavedTransactionStore>,
    providers: Arc<Providers>,
}

impl TransactionReceiptDetailsService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        store: Arc<SavedTransactionStore>,
        providers: Arc<Providers>,
    ) -> Self {
        TransactionReceiptDetailsService {
            kv,
            store,
            providers,
        }
    }

    fn cache_key(txid: &str) -> String {
        storage_key(&[TX_RECEIPT_DETAILS_KEY, &txid.to_lowercase()])
    }

    fn cached(&self, txid: &str) -> anyhow::Result<Option<ReceiptDetails>> {
        self.kv
            .get(&Self::cache_key(txid))?
            .map(|json| serde_json::from_str(&json).context("Corrupt receipt details cache"))
            .transpose()
    }

    fn store_cached(&self, txid: &str, details: &ReceiptDetails) -> anyhow::Result<()> {
        self.kv
            .set(&Self::cache_key(txid), &serde_json::to_string(details)?)
    }

    /// A completed saved transaction already carries both values.
    fn from_completed_transaction(
        &self,
        network: &str,
        txid: &str,
    ) -> anyhow::Result<Option<ReceiptDetails>> {
        let details = self.store.transaction(txid, network)?.and_then(|tx| {
            match (tx.timestamp, tx.public_execution_gas_fee) {
                (timestamp, Some(gas_fee)) if timestamp > 0 => Some(ReceiptDetails {
                    timestamp,
                    gas_fee,
                }),
                _ => None,
            }
        });
        Ok(details)
    }

    async fn lookup(&self, network: &str, txid: &str) -> anyhow::Result<ReceiptDetails> {
        if let Some(details) = self.cached(txid)? {
            return Ok(details);
        }

        if let Some(details) = self.from_completed_transaction(network, txid)? {
            self.store_cached(txid, &details)?;
            return Ok(details);
        }

        let provider = self
            .providers
            .get(network)
            .ok_or_else(|| anyhow!("No provider for network {}", network))?;
        let receipt = provider
            .get_transaction_receipt(txid)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "Transaction receipt not found for {} on network {}",
                    txid,
                    network
                )
            })?;
        let timestamp = provider
            .get_block_timestamp(receipt.block_number)
            .await?
            .ok_or_else(|| anyhow!("Block {} not found", receipt.block_number))?;

        let details = ReceiptDetails {
            timestamp,
            gas_fee: receipt.gas_fee(),
        };
        self.store_cached(txid, &details)?;
        Ok(details)
    }

    /// Failures are logged and read as "unknown".
    pub async fn transaction_receipt_details(
        &self,
        network: &str,
        txid: &str,
    ) -> Option<ReceiptDetails> {
        match self.lookup(network, txid).await {
            Ok(details) => Some(details),
            Err(e) => {
                log::warn!("History Sync: error getting transaction receipt: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Amount, TransactionStatus};
    use crate::storage::MemoryStore;
    use crate::testing::{mined_receipt, pending_tx, MockProvider};

    fn service(provider: Arc<MockProvider>) -> (TransactionReceiptDetailsService, Arc<SavedTransactionStore>) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = Arc::new(SavedTransactionStore::new(kv.clone()));
        let providers = Arc::new(Providers::new());
        providers.register("Ethereum", provider);
        (
            TransactionReceiptDetailsService::new(kv, store.clone(), providers),
            store,
        )
    }

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let provider = Arc::new(MockProvider::new());
        provider.set_receipt("0xaa", mined_receipt("0xaa", 42, true));
        provider.set_block_timestamp(42, 1_700_000_123);
        let (service, _) = service(provider.clone());

        let first = service
            .transaction_receipt_details("Ethereum", "0xaa")
            .await
            .unwrap();
        assert_eq!(first.timestamp, 1_700_000_123);
        assert_eq!(first.gas_fee, Amount::from(21_000u64 * 1_000_000_000));

        let second = service
            .transaction_receipt_details("Ethereum", "0xAA")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.receipt_calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_transaction_short_circuits() {
        let provider = Arc::new(MockProvider::new());
        let (service, store) = service(provider.clone());
        let mut tx = pending_tx("0xbb", "Ethereum", 1_650_000_000);
        tx.status = TransactionStatus::Completed;
        tx.public_execution_gas_fee = Some(Amount::from(7));
        store.add_transactions(vec![tx], "Ethereum").unwrap();

        let details = service
            .transaction_receipt_details("Ethereum", "0xbb")
            .await
            .unwrap();
        assert_eq!(details.timestamp, 1_650_000_000);
        assert_eq!(details.gas_fee, Amount::from(7));
        assert_eq!(provider.receipt_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_receipt_is_none() {
        let provider = Arc::new(MockProvider::new());
        let (service, _) = service(provider);
        assert!(service
            .transaction_receipt_details("Ethereum", "0xcc")
            .await
            .is_none());
        assert!(service
            .transaction_receipt_details("Polygon", "0xcc")
            .await
            .is_none());
    }
}
