//! Fakes and fixtures shared by the unit tests.

use crate::balances::{BalanceRefresher, PrivateBalanceRefresher};
use crate::chain::{
    Amount, Chain, HistoryCategory, HistoryItem, Network, ProtocolVersion, ReceiptLog,
    SavedTransaction, TransactionAction, TransactionReceipt,
};
use crate::engine::{ExecutionErrorChecker, HistoryRescanTrigger};
use crate::history::HistorySource;
use crate::notify::{Notification, Notifier};
use crate::provider::{ChainProvider, ProviderError};
use crate::utils::constants::BASE_TOKEN_ADDRESS;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct MockState {
    transaction_count: u64,
    receipts: HashMap<String, TransactionReceipt>,
    block_timestamps: HashMap<u64, u64>,
    balances: HashMap<String, Amount>,
    decimals: HashMap<String, u8>,
    fail_batch: bool,
}

/// In-memory chain. Unknown receipts read as "not mined".
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    receipt_calls: AtomicU64,
    batch_calls: AtomicU64,
    balance_of_calls: AtomicU64,
    decimals_calls: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.state.lock().transaction_count = count;
    }

    pub fn set_receipt(&self, tx_hash: &str, receipt: TransactionReceipt) {
        self.state
            .lock()
            .receipts
            .insert(tx_hash.to_lowercase(), receipt);
    }

    pub fn set_block_timestamp(&self, block_number: u64, timestamp: u64) {
        self.state
            .lock()
            .block_timestamps
            .insert(block_number, timestamp);
    }

    /// `BASE_TOKEN_ADDRESS` sets the native balance.
    pub fn set_balance(&self, token: &str, amount: Amount) {
        self.state
            .lock()
            .balances
            .insert(token.to_lowercase(), amount);
    }

    pub fn set_decimals(&self, token: &str, decimals: u8) {
        self.state
            .lock()
            .decimals
            .insert(token.to_lowercase(), decimals);
    }

    pub fn fail_batch(&self, fail: bool) {
        self.state.lock().fail_batch = fail;
    }

    pub fn receipt_calls(&self) -> u64 {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn balance_of_calls(&self) -> u64 {
        self.balance_of_calls.load(Ordering::SeqCst)
    }

    pub fn decimals_calls(&self) -> u64 {
        self.decimals_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .receipts
            .get(&tx_hash.to_lowercase())
            .cloned())
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<u64>, ProviderError> {
        Ok(self.state.lock().block_timestamps.get(&block_number).copied())
    }

    async fn get_transaction_count(&self, _address: &str) -> Result<u64, ProviderError> {
        Ok(self.state.lock().transaction_count)
    }

    async fn get_balance(&self, _address: &str) -> Result<Amount, ProviderError> {
        Ok(self
            .state
            .lock()
            .balances
            .get(BASE_TOKEN_ADDRESS)
            .cloned()
            .unwrap_or_default())
    }

    async fn erc20_balance_of(&self, token: &str, _owner: &str) -> Result<Amount, ProviderError> {
        self.balance_of_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .balances
            .get(&token.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn erc20_decimals(&self, token: &str) -> Result<u8, ProviderError> {
        self.decimals_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .decimals
            .get(&token.to_lowercase())
            .copied()
            .ok_or_else(|| ProviderError::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            })
    }

    async fn batch_balances(
        &self,
        _owner: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, Amount>, ProviderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.fail_batch {
            return Err(ProviderError::Transport("batch rejected".to_string()));
        }
        Ok(tokens
            .iter()
            .filter_map(|token| {
                let key = token.to_lowercase();
                state.balances.get(&key).map(|a| (key, a.clone()))
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|n| n.message.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.received.lock().push(notification);
    }
}

#[derive(Default)]
pub struct FakeBalanceRefresher {
    public: AtomicU64,
    private: AtomicU64,
    fail_private: bool,
}

impl FakeBalanceRefresher {
    pub fn failing_private() -> Self {
        FakeBalanceRefresher {
            fail_private: true,
            ..Default::default()
        }
    }

    pub fn public_refreshes(&self) -> u64 {
        self.public.load(Ordering::SeqCst)
    }

    pub fn private_refreshes(&self) -> u64 {
        self.private.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceRefresher for FakeBalanceRefresher {
    async fn refresh_public_balances(&self, _network: &Network) -> anyhow::Result<()> {
        self.public.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PrivateBalanceRefresher for FakeBalanceRefresher {
    async fn refresh_private_balances(
        &self,
        _network: &Network,
        _wallet_ids: Option<&[String]>,
    ) -> anyhow::Result<()> {
        self.private.fetch_add(1, Ordering::SeqCst);
        if self.fail_private {
            anyhow::bail!("privacy engine scan failed");
        }
        Ok(())
    }
}

pub struct FakeHistorySource {
    items: Option<Vec<HistoryItem>>,
    fetches: AtomicU64,
}

impl FakeHistorySource {
    pub fn new(items: Vec<HistoryItem>) -> Self {
        FakeHistorySource {
            items: Some(items),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        FakeHistorySource {
            items: None,
            fetches: AtomicU64::new(0),
        }
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistorySource for FakeHistorySource {
    async fn wallet_transaction_history(
        &self,
        _chain: &Chain,
        _private_wallet_id: &str,
        _starting_block: Option<u64>,
    ) -> anyhow::Result<Vec<HistoryItem>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.items
            .clone()
            .ok_or_else(|| anyhow!("history scan unavailable"))
    }
}

#[derive(Default)]
pub struct FakeExecutionChecker {
    error: Mutex<Option<String>>,
    calls: AtomicU64,
}

impl FakeExecutionChecker {
    pub fn set_error(&self, error: Option<String>) {
        *self.error.lock() = error;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionErrorChecker for FakeExecutionChecker {
    async fn relay_adapt_transaction_error(
        &self,
        _version: ProtocolVersion,
        _logs: &[ReceiptLog],
    ) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.error.lock().clone())
    }
}

#[derive(Default)]
pub struct FakeRescanTrigger {
    failure: Mutex<Option<String>>,
    calls: AtomicU64,
}

impl FakeRescanTrigger {
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryRescanTrigger for FakeRescanTrigger {
    async fn rescan_history(&self, _chain: &Chain, _wallet_ids: Option<&[String]>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

pub fn test_network(name: &str) -> Network {
    Network::evm(name, name, 1)
}

/// A pending transfer from wallet `0xwallet`.
pub fn pending_tx(id: &str, network: &str, timestamp: u64) -> SavedTransaction {
    SavedTransaction::pending(
        id,
        network,
        "0xwallet",
        TransactionAction::Transfer,
        vec![],
        timestamp,
    )
}

/// Mined receipt paying 21000 gas at 1 gwei.
pub fn mined_receipt(tx_hash: &str, block_number: u64, status: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash.to_string(),
        block_number,
        status,
        gas_used: Amount::from(21_000),
        effective_gas_price: Amount::from(1_000_000_000),
        logs: vec![],
    }
}

pub fn history_item(txid: &str, timestamp: Option<u64>) -> HistoryItem {
    HistoryItem {
        txid: txid.to_string(),
        protocol_version: ProtocolVersion::V2PoseidonMerkle,
        block_number: Some(100),
        timestamp,
        version: 3,
        category: HistoryCategory::TransferReceiveERC20s,
        receive_amounts: vec![],
        transfer_amounts: vec![],
        unshield_amounts: vec![],
        change_amounts: vec![],
        receive_nft_amounts: vec![],
        transfer_nft_amounts: vec![],
        unshield_nft_amounts: vec![],
        broadcaster_fee_amount: None,
    }
}
