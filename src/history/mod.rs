//! # Transaction History
//!
//! The local transaction ledger and its reconciliation against the privacy
//! engine's decrypted history.

pub mod receipt_details;
pub mod store;
pub mod sync;

use crate::chain::{Chain, HistoryItem};
use async_trait::async_trait;

pub use receipt_details::TransactionReceiptDetailsService;
pub use store::{SavedTransactionStore, ShieldCountdownTransaction, StatusUpdate, StoreEvent};
pub use sync::{
    HistorySyncEvent, HistorySyncStatus, NonSpendableTransaction, TransactionHistoryService,
    TransactionHistorySync,
};

/// Decrypted history feed of the privacy engine.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn wallet_transaction_history(
        &self,
        chain: &Chain,
        private_wallet_id: &str,
        starting_block: Option<u64>,
    ) -> anyhow::Result<Vec<HistoryItem>>;
}
