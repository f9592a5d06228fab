//! # History Synchronization
//!
//! `TransactionHistoryService` turns decrypted history items into saved
//! transactions. `TransactionHistorySync` drives it per network: fetching the
//! feed, keeping one apply phase per wallet, and running full resyncs when the
//! saved-transaction schema changes.

use super::receipt_details::TransactionReceiptDetailsService;
use super::store::SavedTransactionStore;
use super::HistorySource;
use crate::balances::PrivateBalanceRefresher;
use crate::chain::{
    BalanceBucket, HistoryItem, HistorySendNftAmount, HistoryTokenAmount, Network, NftAmount,
    SavedTransaction, Token, TokenAmount, TransactionAction, TransactionStatus,
};
use crate::provider::Providers;
use crate::storage::KeyValueStore;
use crate::utils::constants::{
    storage_key, MAX_TIMESTAMP_ARCHIVE_NODE_LOOP_LOOKUPS, SAVED_TRANSACTION_CURRENT_VERSION,
    SAVED_TRANSACTION_VERSION_KEY, TIMESTAMP_MISSING_VALUE,
};
use crate::wallet::{AvailableWallet, WalletRegistry};
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A synced transaction whose funds still wait on a privacy proof.
#[derive(Debug, Clone, PartialEq)]
pub struct NonSpendableTransaction {
    pub transaction: SavedTransaction,
    pub balance_bucket: BalanceBucket,
}

fn sent_nft_amount(send: &HistorySendNftAmount) -> NftAmount {
    NftAmount {
        nft_address: send.nft_address.clone(),
        nft_token_type: send.nft_token_type,
        token_sub_id: send.token_sub_id.clone(),
        amount: send.amount.clone(),
        recipient_address: Some(send.recipient_address.clone().unwrap_or_default()),
        sender_address: None,
        memo_text: send.memo_text.clone(),
    }
}

/// State shared by every item of one sync pass.
struct SyncPass<'a> {
    network: &'a str,
    available_wallets: &'a [AvailableWallet],
    token_cache: HashMap<String, Token>,
    missing_timestamp_lookups: usize,
}

impl<'a> SyncPass<'a> {
    fn new(network: &'a str, available_wallets: &'a [AvailableWallet]) -> Self {
        SyncPass {
            network,
            available_wallets,
            token_cache: HashMap::new(),
            missing_timestamp_lookups: 0,
        }
    }
}

pub struct TransactionHistoryService {
    store: Arc<SavedTransactionStore>,
    receipt_details: Arc<TransactionReceiptDetailsService>,
    providers: Arc<Providers>,
}

impl TransactionHistoryService {
    pub fn new(
        store: Arc<SavedTransactionStore>,
        receipt_details: Arc<TransactionReceiptDetailsService>,
        providers: Arc<Providers>,
    ) -> Self {
        TransactionHistoryService {
            store,
            receipt_details,
            providers,
        }
    }

    /// Reconciles `items` against the saved transactions of `network`.
    /// Returns how many new transactions were persisted.
    pub async fn sync_transactions(
        &self,
        network: &str,
        active_wallet: &AvailableWallet,
        available_wallets: &[AvailableWallet],
        items: &[HistoryItem],
    ) -> anyhow::Result<usize> {
        let saved = self.store.fetch_transactions(network)?;

        self.update_local_transactions_found_by_sync(items, &saved, network)?;

        let new_items: Vec<&HistoryItem> = items
            .iter()
            .filter(|item| !saved.iter().any(|tx| tx.matches_id(&item.txid)))
            .collect();

        let mut pass = SyncPass::new(network, available_wallets);
        let mut transactions = Vec::with_capacity(new_items.len());
        for item in new_items {
            match self
                .create_new_synced_transaction(&mut pass, active_wallet, item)
                .await
            {
                Ok(Some(tx)) => transactions.push(tx),
                Ok(None) => {}
                Err(e) => log::warn!("History Sync: cannot sync transaction {}: {:#}", item.txid, e),
            }
        }

        let count = transactions.len();
        if count > 0 {
            log::info!("History Sync: syncing {} new transaction(s) on {}", count, network);
        }
        self.store.add_transactions(transactions, network)?;
        Ok(count)
    }

    /// History items with any output still lacking a valid privacy proof.
    pub async fn non_poi_transactions(
        &self,
        network: &str,
        active_wallet: &AvailableWallet,
        available_wallets: &[AvailableWallet],
        items: &[HistoryItem],
    ) -> anyhow::Result<Vec<NonSpendableTransaction>> {
        let mut pass = SyncPass::new(network, available_wallets);
        let mut result = Vec::new();
        for item in items.iter().filter(|item| item.has_unproven_outputs()) {
            match self
                .create_new_synced_transaction(&mut pass, active_wallet, item)
                .await
            {
                Ok(Some(transaction)) => result.push(NonSpendableTransaction {
                    transaction,
                    balance_bucket: item.non_spendable_bucket(),
                }),
                Ok(None) => {}
                Err(e) => log::warn!("History Sync: cannot build transaction {}: {:#}", item.txid, e),
            }
        }
        Ok(result)
    }

    fn update_local_transactions_found_by_sync(
        &self,
        items: &[HistoryItem],
        saved: &[SavedTransaction],
        network: &str,
    ) -> anyhow::Result<()> {
        for tx in saved {
            if tx.found_by_sync || !tx.sent_via_broadcaster {
                continue;
            }
            if items.iter().any(|item| tx.matches_id(&item.txid)) {
                self.store.update_transaction_found_by_sync(&tx.id, network)?;
            }
        }
        Ok(())
    }

    /// Resolves a token by address: the pass cache, then the wallets' added
    /// tokens, then an on-chain decimals query.
    async fn resolve_token(&self, pass: &mut SyncPass<'_>, token_address: &str) -> anyhow::Result<Token> {
        let address = token_address.to_lowercase();
        if let Some(token) = pass.token_cache.get(&address) {
            return Ok(token.clone());
        }

        let added = pass
            .available_wallets
            .iter()
            .flat_map(|w| w.tokens_for_network(pass.network))
            .find(|t| t.matches_address(&address))
            .cloned();
        let token = match added {
            Some(token) => token,
            None => {
                let provider = self
                    .providers
                    .get(pass.network)
                    .ok_or_else(|| anyhow!("No provider for network {}", pass.network))?;
                let decimals = provider
                    .erc20_decimals(&address)
                    .await
                    .with_context(|| format!("Could not read decimals of {}", address))?;
                Token::address_only(&address, decimals)
            }
        };

        pass.token_cache.insert(address, token.clone());
        Ok(token)
    }

    async fn token_amount(
        &self,
        pass: &mut SyncPass<'_>,
        amount: &HistoryTokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        let token = self.resolve_token(pass, &amount.token_address).await?;
        Ok(TokenAmount::new(token, amount.amount.clone()))
    }

    /// Shield fees from receive lines followed by unshield fees. `None` when
    /// the item carries no fee at all.
    async fn fee_token_amounts(
        &self,
        pass: &mut SyncPass<'_>,
        item: &HistoryItem,
    ) -> anyhow::Result<Option<Vec<TokenAmount>>> {
        let mut fees = Vec::new();
        for receive in &item.receive_amounts {
            if let Some(fee) = &receive.shield_fee {
                let token = self.resolve_token(pass, &receive.token_address).await?;
                fees.push(TokenAmount::new(token, fee.clone()));
            }
        }
        for unshield in &item.unshield_amounts {
            if let Some(fee) = &unshield.unshield_fee {
                let token = self.resolve_token(pass, &unshield.token_address).await?;
                fees.push(TokenAmount::new(token, fee.clone()));
            }
        }
        Ok(if fees.is_empty() { None } else { Some(fees) })
    }

    /// Builds the saved record for one history item. `Ok(None)` means the item
    /// could not be dated and was parked on the missing-timestamp list.
    async fn create_new_synced_transaction(
        &self,
        pass: &mut SyncPass<'_>,
        active_wallet: &AvailableWallet,
        item: &HistoryItem,
    ) -> anyhow::Result<Option<SavedTransaction>> {
        let mut receive_amounts = Vec::with_capacity(item.receive_amounts.len());
        for receive in &item.receive_amounts {
            let token = self.resolve_token(pass, &receive.token_address).await?;
            let mut ta = TokenAmount::new(token, receive.amount.clone());
            ta.memo_text = receive.memo_text.clone();
            ta.sender_address = receive.sender_address.clone();
            receive_amounts.push(ta);
        }

        let mut transfer_amounts =
            Vec::with_capacity(item.transfer_amounts.len() + item.unshield_amounts.len());
        for send in &item.transfer_amounts {
            let token = self.resolve_token(pass, &send.token_address).await?;
            let mut ta = TokenAmount::new(token, send.amount.clone());
            ta.recipient_address = send.recipient_address.clone();
            ta.memo_text = send.memo_text.clone();
            transfer_amounts.push(ta);
        }
        for unshield in &item.unshield_amounts {
            let token = self.resolve_token(pass, &unshield.token_address).await?;
            let mut ta = TokenAmount::new(token, unshield.amount.clone());
            ta.recipient_address = unshield.recipient_address.clone();
            ta.memo_text = unshield.memo_text.clone();
            transfer_amounts.push(ta);
        }

        let wallet_address = active_wallet
            .private_address
            .clone()
            .unwrap_or_else(|| active_wallet.eth_address.clone());

        let receive_nft_amounts: Vec<NftAmount> = item
            .receive_nft_amounts
            .iter()
            .map(|receive| NftAmount {
                nft_address: receive.nft_address.clone(),
                nft_token_type: receive.nft_token_type,
                token_sub_id: receive.token_sub_id.clone(),
                amount: receive.amount.clone(),
                recipient_address: Some(wallet_address.clone()),
                sender_address: receive.sender_address.clone(),
                memo_text: receive.memo_text.clone(),
            })
            .collect();
        let transfer_nft_amounts: Vec<NftAmount> = item
            .transfer_nft_amounts
            .iter()
            .chain(item.unshield_nft_amounts.iter())
            .map(sent_nft_amount)
            .collect();

        let broadcaster_fee = match &item.broadcaster_fee_amount {
            Some(fee) => Some(self.token_amount(pass, fee).await?),
            None => None,
        };

        let memo_text = receive_amounts
            .iter()
            .chain(transfer_amounts.iter())
            .map(|ta| &ta.memo_text)
            .chain(
                receive_nft_amounts
                    .iter()
                    .chain(transfer_nft_amounts.iter())
                    .map(|nft| &nft.memo_text),
            )
            .find_map(Clone::clone);

        let fee_amounts = self.fee_token_amounts(pass, item).await?;

        let mut transaction = SavedTransaction::pending(
            &item.txid,
            pass.network,
            &wallet_address,
            TransactionAction::Synced,
            transfer_amounts,
            item.timestamp.unwrap_or(TIMESTAMP_MISSING_VALUE),
        );
        transaction.status = TransactionStatus::Completed;
        transaction.protocol_version = Some(item.protocol_version);
        transaction.synced_receive_token_amounts = receive_amounts;
        transaction.nft_amount_recipients = transfer_nft_amounts;
        transaction.synced_receive_nft_amount_recipients = receive_nft_amounts;
        transaction.sent_via_broadcaster = broadcaster_fee.is_some();
        transaction.broadcaster_fee_token_amount = broadcaster_fee;
        transaction.rail_fee_token_amounts = fee_amounts;
        transaction.is_private = true;
        transaction.synced_from_private_history = true;
        transaction.found_by_sync = true;
        transaction.synced_history_version = Some(item.version);
        transaction.synced_category = Some(item.category);
        transaction.memo_text = memo_text;

        if transaction.timestamp == TIMESTAMP_MISSING_VALUE
            && pass.missing_timestamp_lookups < MAX_TIMESTAMP_ARCHIVE_NODE_LOOP_LOOKUPS
        {
            pass.missing_timestamp_lookups += 1;
            if let Some(details) = self
                .receipt_details
                .transaction_receipt_details(pass.network, &item.txid)
                .await
            {
                transaction.timestamp = details.timestamp;
                transaction.public_execution_gas_fee = Some(details.gas_fee);
            }
        }

        if transaction.timestamp == TIMESTAMP_MISSING_VALUE {
            log::debug!("History Sync: add missing timestamp transaction {}", item.txid);
            self.store
                .add_missing_timestamp_transaction(transaction, pass.network)?;
            return Ok(None);
        }

        Ok(Some(transaction))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySyncStatus {
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySyncEvent {
    pub network: String,
    pub status: HistorySyncStatus,
}

type SyncKey = (String, String);

/// Per-(network, wallet) apply slot. A racing sync leaves its fetched items
/// here and the active applier picks them up before finishing.
type ApplySlots = HashMap<SyncKey, Option<Vec<HistoryItem>>>;

pub struct TransactionHistorySync {
    service: Arc<TransactionHistoryService>,
    store: Arc<SavedTransactionStore>,
    wallets: Arc<WalletRegistry>,
    kv: Arc<dyn KeyValueStore>,
    applying: Mutex<ApplySlots>,
    events: broadcast::Sender<HistorySyncEvent>,
}

impl TransactionHistorySync {
    pub fn new(
        service: Arc<TransactionHistoryService>,
        store: Arc<SavedTransactionStore>,
        wallets: Arc<WalletRegistry>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        TransactionHistorySync {
            service,
            store,
            wallets,
            kv,
            applying: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistorySyncEvent> {
        self.events.subscribe()
    }

    fn set_status(&self, network: &str, status: HistorySyncStatus) {
        let _ = self.events.send(HistorySyncEvent {
            network: network.to_string(),
            status,
        });
    }

    pub fn is_syncing(&self, network: &str, private_wallet_id: &str) -> bool {
        self.applying
            .lock()
            .contains_key(&(network.to_string(), private_wallet_id.to_string()))
    }

    /// Fetches the active wallet's history and applies it. A call racing an
    /// apply phase for the same wallet hands its items to that phase.
    async fn sync_transaction_history(
        &self,
        network: &Network,
        source: &dyn HistorySource,
    ) -> anyhow::Result<()> {
        let active = match self.wallets.active() {
            Some(active) => active,
            None => return Ok(()),
        };
        let private_wallet_id = match &active.private_wallet_id {
            Some(id) => id.clone(),
            None => {
                log::debug!("History Sync: active wallet {} has no private wallet", active.id);
                return Ok(());
            }
        };

        let mut items = source
            .wallet_transaction_history(&network.chain, &private_wallet_id, Some(0))
            .await?;

        let key = (network.name.clone(), private_wallet_id);
        {
            let mut applying = self.applying.lock();
            if let Some(slot) = applying.get_mut(&key) {
                log::debug!(
                    "History Sync: apply in progress for {}, queueing {} item(s)",
                    network.name,
                    items.len()
                );
                *slot = Some(items);
                return Ok(());
            }
            applying.insert(key.clone(), None);
        }

        let mut guard = ApplyGuard {
            slots: &self.applying,
            key: Some(key),
        };
        let available = self.wallets.available();
        loop {
            self.service
                .sync_transactions(&network.name, &active, &available, &items)
                .await?;
            match guard.take_queued() {
                Some(next) => items = next,
                None => break,
            }
        }
        Ok(())
    }

    pub async fn unsafe_sync_transaction_history(
        &self,
        network: &Network,
        source: &dyn HistorySource,
    ) -> anyhow::Result<()> {
        self.set_status(&network.name, HistorySyncStatus::Syncing);
        match self.sync_transaction_history(network, source).await {
            Ok(()) => {
                self.set_status(&network.name, HistorySyncStatus::Synced);
                Ok(())
            }
            Err(e) => {
                self.set_status(&network.name, HistorySyncStatus::Error);
                Err(e.context("Failed to sync transaction history"))
            }
        }
    }

    pub async fn safe_sync_transaction_history(&self, network: &Network, source: &dyn HistorySource) {
        if let Err(e) = self.unsafe_sync_transaction_history(network, source).await {
            log::error!("History Sync: failed to safe sync transaction history: {:#}", e);
        }
    }

    fn version_key(network: &str) -> String {
        storage_key(&[SAVED_TRANSACTION_VERSION_KEY, network])
    }

    /// Stored schema marker, `None` when absent or unreadable.
    pub fn saved_version(&self, network: &str) -> anyhow::Result<Option<u64>> {
        Ok(self
            .kv
            .get(&Self::version_key(network))?
            .and_then(|v| v.trim().parse::<u64>().ok()))
    }

    /// Clears synced transactions and rebuilds them from a full history
    /// fetch when the stored schema marker is missing or older than the
    /// current one, or when forced. Never fails outward.
    pub async fn resync_all_transactions_if_necessary(
        &self,
        network: &Network,
        source: &dyn HistorySource,
        balance_refresher: &dyn PrivateBalanceRefresher,
        force_update: bool,
    ) {
        let saved_version = match self.saved_version(&network.name) {
            Ok(version) => version,
            Err(e) => {
                log::error!("History Sync: failed to read version marker: {:#}", e);
                None
            }
        };
        let requires_update = force_update
            || saved_version.map_or(true, |v| v < SAVED_TRANSACTION_CURRENT_VERSION);
        if !requires_update {
            log::debug!(
                "History Sync: do not update tx history on {}: version {:?}",
                network.name,
                saved_version
            );
            return;
        }
        log::info!(
            "History Sync: update tx history on {}: version {:?}",
            network.name,
            saved_version
        );

        if let Err(e) = self.resync_all_transactions(network, source, balance_refresher).await {
            log::error!("History Sync: failed to resync all transactions: {:#}", e);
        }
    }

    async fn resync_all_transactions(
        &self,
        network: &Network,
        source: &dyn HistorySource,
        balance_refresher: &dyn PrivateBalanceRefresher,
    ) -> anyhow::Result<()> {
        self.store.clear_all_synced_transactions(&network.name)?;
        balance_refresher
            .refresh_private_balances(network, None)
            .await
            .context("Failed to refresh private balances")?;
        self.unsafe_sync_transaction_history(network, source).await?;
        self.kv.set(
            &Self::version_key(&network.name),
            &SAVED_TRANSACTION_CURRENT_VERSION.to_string(),
        )
    }
}

/// Releases the apply slot, including when the applying future is dropped.
struct ApplyGuard<'a> {
    slots: &'a Mutex<ApplySlots>,
    key: Option<SyncKey>,
}

impl ApplyGuard<'_> {
    /// Items queued by a racing caller. Releases the slot in the same
    /// critical section when nothing is queued.
    fn take_queued(&mut self) -> Option<Vec<HistoryItem>> {
        let key = self.key.as_ref()?;
        let mut slots = self.slots.lock();
        let queued = slots.get_mut(key).and_then(Option::take);
        if queued.is_none() {
            slots.remove(key);
            self.key = None;
        }
        queued
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.slots.lock().remove(&key);
        }
    }
}
