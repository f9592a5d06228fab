//! # Saved Transaction Store
//!
//! Durable per-network list of tracked transactions, persisted as one JSON
//! array per network. Every method is a full read-modify-write under the
//! store's write lock.

use crate::chain::{Amount, SavedTransaction, TokenAmount, TransactionStatus};
use crate::storage::KeyValueStore;
use crate::utils::constants::{
    storage_key, MISSING_TIMESTAMP_KEY, SAVED_TRANSACTIONS_KEY, SHIELD_COUNTDOWN_KEY,
};
use crate::wallet::NonceAllocator;
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The network's whole list was replaced.
    TransactionsSet { network: String, count: usize },
    TransactionUpdated {
        network: String,
        transaction: Box<SavedTransaction>,
    },
    MissingTimestampAdded { network: String, id: String },
    MissingTimestampRemoved { network: String, id: String },
    ShieldCountdownStored { network: String, id: String },
}

/// A mined shield still waiting on its privacy proof.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShieldCountdownTransaction {
    pub network_name: String,
    pub id: String,
    pub timestamp: u64,
}

/// Fields applied by `update_transaction_status`.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TransactionStatus,
    pub gas_fee: Option<Amount>,
    /// Replaces the stored message; `None` clears it.
    pub failed_error_message: Option<String>,
    pub cancelling: bool,
    pub updated_swap_buy_token_amount: Option<TokenAmount>,
}

impl StatusUpdate {
    pub fn new(status: TransactionStatus) -> Self {
        StatusUpdate {
            status,
            gas_fee: None,
            failed_error_message: None,
            cancelling: false,
            updated_swap_buy_token_amount: None,
        }
    }

    pub fn gas_fee(mut self, gas_fee: Option<Amount>) -> Self {
        self.gas_fee = gas_fee;
        self
    }

    pub fn failed(mut self, message: Option<String>) -> Self {
        self.failed_error_message = message;
        self
    }

    pub fn cancelling(mut self, cancelling: bool) -> Self {
        self.cancelling = cancelling;
        self
    }

    pub fn swap_buy_amount(mut self, amount: Option<TokenAmount>) -> Self {
        self.updated_swap_buy_token_amount = amount;
        self
    }
}

pub struct SavedTransactionStore {
    kv: Arc<dyn KeyValueStore>,
    nonces: NonceAllocator,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

fn transactions_key(network: &str) -> String {
    storage_key(&[SAVED_TRANSACTIONS_KEY, network])
}

fn missing_timestamp_key(network: &str) -> String {
    storage_key(&[MISSING_TIMESTAMP_KEY, network])
}

fn shield_countdown_key(network: &str) -> String {
    storage_key(&[SHIELD_COUNTDOWN_KEY, network])
}

impl SavedTransactionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        SavedTransactionStore {
            nonces: NonceAllocator::new(kv.clone()),
            kv,
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Newest first. Legacy relayer fields are migrated on read.
    pub fn fetch_transactions(&self, network: &str) -> anyhow::Result<Vec<SavedTransaction>> {
        let value = self
            .kv
            .get(&transactions_key(network))
            .context("Error fetching stored transactions")?;
        let mut transactions: Vec<SavedTransaction> = match value {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Corrupt saved transactions for {}", network))?,
            None => Vec::new(),
        };
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(transactions)
    }

    pub fn transaction(&self, tx_hash: &str, network: &str) -> anyhow::Result<Option<SavedTransaction>> {
        Ok(self
            .fetch_transactions(network)?
            .into_iter()
            .find(|tx| tx.matches_id(tx_hash)))
    }

    fn overwrite_all_transactions(
        &self,
        transactions: &[SavedTransaction],
        network: &str,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(transactions)?;
        self.kv
            .set(&transactions_key(network), &json)
            .context("Error storing transactions")
    }

    /// Prepends `transactions` and drops matching entries from the
    /// missing-timestamp list.
    pub fn add_transactions(
        &self,
        transactions: Vec<SavedTransaction>,
        network: &str,
    ) -> anyhow::Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }
        let added_ids: Vec<String> = transactions.iter().map(|tx| tx.id.clone()).collect();

        let count = {
            let _guard = self.write_lock.lock();
            let existing = self.fetch_transactions(network)?;
            let mut all = transactions;
            all.extend(existing);
            self.overwrite_all_transactions(&all, network)?;
            self.remove_missing_timestamp_transactions(&added_ids, network)?;
            all.len()
        };

        log::debug!("Tx Store: added {} transaction(s) on {}", added_ids.len(), network);
        self.publish(StoreEvent::TransactionsSet {
            network: network.to_string(),
            count,
        });
        Ok(())
    }

    /// Applies `f` to every record matching `tx_hash`. Nothing is written
    /// when no record matches.
    fn update_matching<F>(&self, tx_hash: &str, network: &str, mut f: F) -> anyhow::Result<usize>
    where
        F: FnMut(&mut SavedTransaction),
    {
        let updated = {
            let _guard = self.write_lock.lock();
            let mut transactions = self.fetch_transactions(network)?;
            let mut updated = Vec::new();
            for tx in transactions.iter_mut().filter(|tx| tx.matches_id(tx_hash)) {
                f(tx);
                updated.push(tx.clone());
            }
            if !updated.is_empty() {
                self.overwrite_all_transactions(&transactions, network)?;
            }
            updated
        };

        let count = updated.len();
        for transaction in updated {
            self.publish(StoreEvent::TransactionUpdated {
                network: network.to_string(),
                transaction: Box::new(transaction),
            });
        }
        Ok(count)
    }

    pub fn update_transaction_status(
        &self,
        tx_hash: &str,
        network: &str,
        update: StatusUpdate,
    ) -> anyhow::Result<()> {
        let matched = self.update_matching(tx_hash, network, |tx| {
            tx.status = update.status;
            tx.cancelling = update.cancelling;
            if let Some(gas_fee) = &update.gas_fee {
                tx.public_execution_gas_fee = Some(gas_fee.clone());
            }
            tx.failed_error_message = update.failed_error_message.clone();
            if let (Some(buy), Some(_)) =
                (&update.updated_swap_buy_token_amount, &tx.swap_buy_token_amount)
            {
                // Swaps to another wallet keep the quoted amount
                if tx.to_wallet_address.is_none() {
                    tx.swap_buy_token_amount = Some(buy.clone());
                }
                tx.confirmed_swap_value = true;
            }
        })?;
        if matched == 0 {
            log::debug!("Tx Store: no transaction {} on {} to update", tx_hash, network);
        }
        Ok(())
    }

    /// Marks the transaction failed (or timed out) and frees its nonce.
    pub fn update_transaction_as_failed(
        &self,
        tx_hash: &str,
        network: &str,
        wallet_address: &str,
        gas_fee: Option<Amount>,
        timed_out: bool,
        failed_error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let status = if timed_out {
            TransactionStatus::TimedOut
        } else {
            TransactionStatus::Failed
        };
        self.update_transaction_status(
            tx_hash,
            network,
            StatusUpdate::new(status)
                .gas_fee(gas_fee)
                .failed(failed_error_message),
        )?;
        self.nonces
            .clear_last_transaction_nonce(wallet_address, network)
    }

    pub fn update_transaction_found_by_sync(&self, tx_hash: &str, network: &str) -> anyhow::Result<()> {
        self.update_matching(tx_hash, network, |tx| tx.found_by_sync = true)?;
        Ok(())
    }

    /// Drops every record produced by history sync. Locally submitted records stay.
    pub fn clear_all_synced_transactions(&self, network: &str) -> anyhow::Result<usize> {
        let (remaining, removed) = {
            let _guard = self.write_lock.lock();
            let transactions = self.fetch_transactions(network)?;
            let before = transactions.len();
            let remaining: Vec<SavedTransaction> = transactions
                .into_iter()
                .filter(|tx| !tx.action.is_synced())
                .collect();
            self.overwrite_all_transactions(&remaining, network)?;
            (remaining.len(), before - remaining.len())
        };
        log::info!(
            "Tx Store: cleared {} synced transaction(s) on {}",
            removed,
            network
        );
        self.publish(StoreEvent::TransactionsSet {
            network: network.to_string(),
            count: remaining,
        });
        Ok(removed)
    }

    pub fn missing_timestamp_transactions(
        &self,
        network: &str,
    ) -> anyhow::Result<Vec<SavedTransaction>> {
        match self.kv.get(&missing_timestamp_key(network))? {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Corrupt missing-timestamp list for {}", network)),
            None => Ok(Vec::new()),
        }
    }

    /// Parks a synced transaction that could not be dated yet. Re-adding the
    /// same id replaces the earlier entry.
    pub fn add_missing_timestamp_transaction(
        &self,
        transaction: SavedTransaction,
        network: &str,
    ) -> anyhow::Result<()> {
        let id = transaction.id.clone();
        {
            let _guard = self.write_lock.lock();
            let mut list = self.missing_timestamp_transactions(network)?;
            list.retain(|tx| !tx.matches_id(&id));
            list.push(transaction);
            self.kv.set(
                &missing_timestamp_key(network),
                &serde_json::to_string(&list)?,
            )?;
        }
        self.publish(StoreEvent::MissingTimestampAdded {
            network: network.to_string(),
            id,
        });
        Ok(())
    }

    pub fn shield_countdown_transactions(
        &self,
        network: &str,
    ) -> anyhow::Result<Vec<ShieldCountdownTransaction>> {
        match self.kv.get(&shield_countdown_key(network))? {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Corrupt shield countdown list for {}", network)),
            None => Ok(Vec::new()),
        }
    }

    /// Records a shield whose funds wait on a privacy proof, replacing any
    /// entry with the same id.
    pub fn store_shield_countdown_transaction(
        &self,
        entry: ShieldCountdownTransaction,
    ) -> anyhow::Result<()> {
        let network = entry.network_name.clone();
        let id = entry.id.clone();
        {
            let _guard = self.write_lock.lock();
            let mut list = self.shield_countdown_transactions(&network)?;
            list.retain(|tx| !tx.id.eq_ignore_ascii_case(&id));
            list.push(entry);
            self.kv
                .set(&shield_countdown_key(&network), &serde_json::to_string(&list)?)
                .context("Error storing shield countdown")?;
        }
        self.publish(StoreEvent::ShieldCountdownStored { network, id });
        Ok(())
    }

    fn remove_missing_timestamp_transactions(
        &self,
        ids: &[String],
        network: &str,
    ) -> anyhow::Result<()> {
        let list = self.missing_timestamp_transactions(network)?;
        if list.is_empty() {
            return Ok(());
        }
        let (removed, kept): (Vec<SavedTransaction>, Vec<SavedTransaction>) = list
            .into_iter()
            .partition(|tx| ids.iter().any(|id| tx.matches_id(id)));
        if removed.is_empty() {
            return Ok(());
        }
        self.kv.set(
            &missing_timestamp_key(network),
            &serde_json::to_string(&kept)?,
        )?;
        for tx in removed {
            self.publish(StoreEvent::MissingTimestampRemoved {
                network: network.to_string(),
                id: tx.id,
            });
        }
        Ok(())
    }
}
