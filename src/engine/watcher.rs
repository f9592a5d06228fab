//! # Pending Transaction Watcher
//!
//! One poll loop per (network, tx hash). A round polls the receipt a fixed
//! number of times; a round that times out marks the transaction timed out and
//! starts another round while the transaction is inside the re-arm window.
//! Removing the watch entry cancels its token, which ends the loop without
//! side effects.

use crate::balances::BalanceRefresher;
use crate::chain::{
    find_token_transfer_amount, Chain, Network, ProtocolVersion, ReceiptLog, SavedTransaction,
    TransactionAction, TransactionReceipt, TransactionStatus,
};
use crate::errors::{EngineError, EngineResult};
use crate::history::{SavedTransactionStore, ShieldCountdownTransaction, StatusUpdate};
use crate::notify::{short_wallet_address, Notification, Notifier};
use crate::provider::{swallow_destroyed, Providers};
use crate::state::WatcherSettings;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Protocol-level success check for transactions routed through the relay
/// adapt contract. `Some(message)` means the call reverted internally.
#[async_trait]
pub trait ExecutionErrorChecker: Send + Sync {
    async fn relay_adapt_transaction_error(
        &self,
        version: ProtocolVersion,
        logs: &[ReceiptLog],
    ) -> anyhow::Result<Option<String>>;
}

#[async_trait]
pub trait HistoryRescanTrigger: Send + Sync {
    async fn rescan_history(&self, chain: &Chain, wallet_ids: Option<&[String]>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Another loop already owns this (network, hash).
    AlreadyWatching,
    Completed,
    Failed,
    /// The re-arm budget ran out while the transaction stayed unmined.
    Abandoned,
    /// The watch entry was removed from outside.
    Invalidated,
}

enum PollOutcome {
    Receipt(TransactionReceipt),
    TimedOut(EngineError),
    Invalidated,
}

struct Collaborators {
    checker: Arc<dyn ExecutionErrorChecker>,
    rescan: Arc<dyn HistoryRescanTrigger>,
}

struct WatchEntry {
    generation: u64,
    token: CancellationToken,
}

type WatchKey = (String, String);

fn watch_key(network: &str, tx_hash: &str) -> WatchKey {
    (network.to_string(), tx_hash.to_lowercase())
}

struct WatcherInner {
    settings: WatcherSettings,
    providers: Arc<Providers>,
    store: Arc<SavedTransactionStore>,
    balances: Arc<dyn BalanceRefresher>,
    notifier: Arc<dyn Notifier>,
    collaborators: RwLock<Option<Arc<Collaborators>>>,
    watches: Mutex<HashMap<WatchKey, WatchEntry>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct PendingTransactionWatcher {
    inner: Arc<WatcherInner>,
}

/// Removes the watch entry when its loop exits, unless a newer loop owns it.
struct EntryGuard<'a> {
    watches: &'a Mutex<HashMap<WatchKey, WatchEntry>>,
    key: WatchKey,
    generation: u64,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        let mut watches = self.watches.lock();
        if watches
            .get(&self.key)
            .map_or(false, |e| e.generation == self.generation)
        {
            watches.remove(&self.key);
        }
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn nonce_label(tx: &SavedTransaction) -> String {
    tx.nonce.map(|n| format!(" {}", n)).unwrap_or_default()
}

impl PendingTransactionWatcher {
    pub fn new(
        settings: WatcherSettings,
        providers: Arc<Providers>,
        store: Arc<SavedTransactionStore>,
        balances: Arc<dyn BalanceRefresher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        PendingTransactionWatcher {
            inner: Arc::new(WatcherInner {
                settings,
                providers,
                store,
                balances,
                notifier,
                collaborators: RwLock::new(None),
                watches: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Registers the collaborators. Watches fail until this has been called.
    pub fn start(
        &self,
        checker: Arc<dyn ExecutionErrorChecker>,
        rescan: Arc<dyn HistoryRescanTrigger>,
    ) {
        *self.inner.collaborators.write() = Some(Arc::new(Collaborators { checker, rescan }));
        log::info!("Tx Watcher: started");
    }

    pub fn is_started(&self) -> bool {
        self.inner.collaborators.read().is_some()
    }

    pub fn is_watching(&self, network: &str, tx_hash: &str) -> bool {
        self.inner
            .watches
            .lock()
            .contains_key(&watch_key(network, tx_hash))
    }

    pub fn watching_count(&self, network: &str) -> usize {
        self.inner
            .watches
            .lock()
            .keys()
            .filter(|(n, _)| n == network)
            .count()
    }

    /// Cancels every watch on `network`. In-flight polls end silently.
    pub fn stop_watching_network(&self, network: &str) {
        let mut watches = self.inner.watches.lock();
        let before = watches.len();
        watches.retain(|(n, _), entry| {
            if n == network {
                entry.token.cancel();
                false
            } else {
                true
            }
        });
        let removed = before - watches.len();
        if removed > 0 {
            log::debug!("Tx Watcher: stopped {} watch(es) on {}", removed, network);
        }
    }

    pub fn stop_watching(&self, network: &str, tx_hash: &str) -> bool {
        match self.inner.watches.lock().remove(&watch_key(network, tx_hash)) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Replaces all watches on `network` with one per pending transaction and
    /// per timed-out transaction still inside the re-arm window.
    pub fn watch_pending_transactions(
        &self,
        transactions: Vec<SavedTransaction>,
        network: &Network,
    ) -> Vec<JoinHandle<()>> {
        self.stop_watching_network(&network.name);

        let now = unix_now();
        let window = self.inner.settings.rearm_window_secs;
        transactions
            .into_iter()
            .filter(|tx| match tx.status {
                TransactionStatus::Pending => true,
                TransactionStatus::TimedOut => now.saturating_sub(tx.timestamp) < window,
                _ => false,
            })
            .map(|tx| {
                let watcher = self.clone();
                let network = network.clone();
                tokio::spawn(async move {
                    let tx_hash = tx.id.clone();
                    match watcher.watch_pending_transaction(&network, tx).await {
                        Ok(_) => {}
                        Err(e) if e.is_poll_failure() => {
                            log::warn!("Tx Watcher: gave up on {}: {}", tx_hash, e)
                        }
                        Err(e) => log::error!(
                            "Tx Watcher: error watching {}: {}",
                            tx_hash,
                            e.full_message()
                        ),
                    }
                })
            })
            .collect()
    }

    pub async fn load_transactions_and_watch_pending(
        &self,
        network: &Network,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let transactions = self.inner.store.fetch_transactions(&network.name)?;
        Ok(self.watch_pending_transactions(transactions, network))
    }

    /// Watches `tx` until it reaches a terminal state, the entry is removed,
    /// or the re-arm budget runs out.
    pub async fn watch_pending_transaction(
        &self,
        network: &Network,
        tx: SavedTransaction,
    ) -> EngineResult<WatchOutcome> {
        let collaborators = self
            .inner
            .collaborators
            .read()
            .clone()
            .ok_or(EngineError::WatcherNotStarted)?;

        let key = watch_key(&network.name, &tx.id);
        let (generation, token) = {
            let mut watches = self.inner.watches.lock();
            if watches.contains_key(&key) {
                log::debug!("Tx Watcher: already watching {}", tx.id);
                return Ok(WatchOutcome::AlreadyWatching);
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            let token = CancellationToken::new();
            watches.insert(
                key.clone(),
                WatchEntry {
                    generation,
                    token: token.clone(),
                },
            );
            (generation, token)
        };
        let _guard = EntryGuard {
            watches: &self.inner.watches,
            key: key.clone(),
            generation,
        };

        log::info!("Tx Watcher: watching {} on {}", tx.id, network.name);
        let mut rearms: u32 = 0;
        loop {
            let poll_token = token.child_token();
            match self.poll_receipt(&network.name, &tx.id, &poll_token).await {
                PollOutcome::Invalidated => {
                    log::debug!("Tx Watcher: poller was invalidated for {}", tx.id);
                    return Ok(WatchOutcome::Invalidated);
                }
                PollOutcome::Receipt(receipt) => {
                    return self
                        .handle_finished(network, &tx, &key, generation, receipt, &collaborators)
                        .await;
                }
                PollOutcome::TimedOut(err) => {
                    if !self.is_current(&key, generation) {
                        return Ok(WatchOutcome::Invalidated);
                    }
                    log::warn!("Tx Watcher: error watching pending transaction {}: {}", tx.id, err);

                    // Only the first round reports the timeout
                    if rearms == 0 && tx.status == TransactionStatus::Pending {
                        self.transaction_failed(network, &tx, true, None)?;
                    }

                    let age = unix_now().saturating_sub(tx.timestamp);
                    let budget_left = self
                        .inner
                        .settings
                        .max_rearms
                        .map_or(true, |max| rearms < max);
                    if age >= self.inner.settings.rearm_window_secs || !budget_left {
                        log::warn!(
                            "Tx Watcher: abandoning {} after {} re-arm(s), age {}s",
                            tx.id,
                            rearms,
                            age
                        );
                        return Ok(WatchOutcome::Abandoned);
                    }
                    rearms += 1;
                    log::debug!("Tx Watcher: retrying transaction watcher for {}", tx.id);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(WatchOutcome::Invalidated),
                        _ = tokio::time::sleep(self.inner.settings.retry_delay()) => {}
                    }
                }
            }
        }
    }

    fn is_current(&self, key: &WatchKey, generation: u64) -> bool {
        self.inner
            .watches
            .lock()
            .get(key)
            .map_or(false, |e| e.generation == generation)
    }

    fn remove_entry(&self, key: &WatchKey, generation: u64) {
        let mut watches = self.inner.watches.lock();
        if watches
            .get(key)
            .map_or(false, |e| e.generation == generation)
        {
            watches.remove(key);
        }
    }

    async fn fetch_receipt(
        &self,
        network: &str,
        tx_hash: &str,
    ) -> EngineResult<Option<TransactionReceipt>> {
        let provider = self
            .inner
            .providers
            .get(network)
            .ok_or_else(|| EngineError::MissingProvider(network.to_string()))?;
        Ok(swallow_destroyed(provider.get_transaction_receipt(tx_hash).await)?)
    }

    /// One watch round. Absent receipts and provider errors both read as
    /// "not mined yet".
    async fn poll_receipt(
        &self,
        network: &str,
        tx_hash: &str,
        poll: &CancellationToken,
    ) -> PollOutcome {
        let attempts = self.inner.settings.poll_attempts();
        let delay = self.inner.settings.retry_delay();

        for attempt in 1..=attempts {
            log::debug!("Tx Watcher: polling {} ({}/{})", tx_hash, attempt, attempts);
            let result = tokio::select! {
                biased;
                _ = poll.cancelled() => return PollOutcome::Invalidated,
                result = self.fetch_receipt(network, tx_hash) => result,
            };
            match result {
                Ok(Some(receipt)) => return PollOutcome::Receipt(receipt),
                Ok(None) => {}
                Err(e) => log::debug!("Tx Watcher: receipt poll for {} failed: {}", tx_hash, e),
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = poll.cancelled() => return PollOutcome::Invalidated,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        PollOutcome::TimedOut(EngineError::ReceiptTimeout { attempts })
    }

    async fn handle_finished(
        &self,
        network: &Network,
        tx: &SavedTransaction,
        key: &WatchKey,
        generation: u64,
        receipt: TransactionReceipt,
        collaborators: &Collaborators,
    ) -> EngineResult<WatchOutcome> {
        if !self.is_current(key, generation) {
            log::debug!("Tx Watcher: no longer watching {}", tx.id);
            return Ok(WatchOutcome::Invalidated);
        }
        self.remove_entry(key, generation);

        match self
            .apply_finished(network, tx, receipt, collaborators)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.full_message();
                log::error!("Tx Watcher: transaction watcher error for {}: {}", tx.id, message);
                if message.to_lowercase().contains("transaction failed") {
                    self.transaction_failed(network, tx, false, None)?;
                    return Ok(WatchOutcome::Failed);
                }
                Err(e)
            }
        }
    }

    async fn apply_finished(
        &self,
        network: &Network,
        tx: &SavedTransaction,
        receipt: TransactionReceipt,
        collaborators: &Collaborators,
    ) -> EngineResult<WatchOutcome> {
        if !receipt.status {
            log::warn!("Tx Watcher: transaction reverted: {}", tx.id);
            self.transaction_failed(network, tx, false, None)?;
            return Ok(WatchOutcome::Failed);
        }

        let updated_swap_buy = match (&tx.action, &tx.swap_buy_token_amount) {
            (TransactionAction::Swap, Some(estimate)) => {
                find_token_transfer_amount(&receipt, estimate, &tx.wallet_address, tx.is_private)
            }
            _ => None,
        };

        if tx.needs_relay_adapt_success_check {
            let error = collaborators
                .checker
                .relay_adapt_transaction_error(tx.protocol_version_or_default(), &receipt.logs)
                .await
                .map_err(|e| EngineError::collaborator("Relay adapt validation failed", e))?;
            if let Some(message) = error.filter(|m| !m.is_empty()) {
                log::warn!("Tx Watcher: {} succeeded but validation failed: {}", tx.id, message);
                self.transaction_failed(network, tx, false, Some(message))?;
                return Ok(WatchOutcome::Failed);
            }
        }

        let (balances, rescan) = tokio::join!(
            self.inner.balances.refresh_public_balances(network),
            collaborators.rescan.rescan_history(&network.chain, None),
        );
        balances.map_err(|e| EngineError::collaborator("Failed to refresh balances", e))?;
        rescan.map_err(|e| EngineError::collaborator("Failed to rescan history", e))?;

        let subtext = format!(
            "{} | {}",
            network.public_name,
            short_wallet_address(&tx.wallet_address)
        );
        let gas_fee = receipt.gas_fee();
        let store = &self.inner.store;

        if let (TransactionAction::Cancel, Some(original_id)) =
            (&tx.action, &tx.cancel_transaction_id)
        {
            self.inner.notifier.notify(
                Notification::error(format!("Transaction{} cancelled.", nonce_label(tx)))
                    .with_subtext(subtext)
                    .with_network(&network.name),
            );
            store.update_transaction_status(
                original_id,
                &network.name,
                StatusUpdate::new(TransactionStatus::Cancelled).gas_fee(Some(gas_fee.clone())),
            )?;
            store.update_transaction_status(
                &tx.id,
                &network.name,
                StatusUpdate::new(TransactionStatus::Completed)
                    .gas_fee(Some(gas_fee))
                    .swap_buy_amount(updated_swap_buy),
            )?;
            log::info!("Tx Watcher: {} cancelled {}", tx.id, original_id);
            return Ok(WatchOutcome::Completed);
        }

        let message = if tx.sent_via_broadcaster {
            format!("Success: {} through Broadcaster.", tx.action)
        } else {
            match tx.nonce {
                Some(nonce) => format!("Success: {} transaction: {}.", tx.action, nonce),
                None => format!("Success: {} transaction.", tx.action),
            }
        };
        self.inner.notifier.notify(
            Notification::success(message)
                .with_subtext(subtext)
                .with_network(&network.name),
        );

        if tx.action == TransactionAction::Shield && network.poi_required {
            self.inner.notifier.notify(
                Notification::info("Shielded funds are pending a privacy proof.")
                    .with_network(&network.name),
            );
            let countdown = ShieldCountdownTransaction {
                network_name: network.name.clone(),
                id: tx.id.clone(),
                timestamp: tx.timestamp,
            };
            if let Err(e) = store.store_shield_countdown_transaction(countdown) {
                log::warn!("Tx Watcher: failed to store shield countdown for {}: {:#}", tx.id, e);
            }
        }

        store.update_transaction_status(
            &tx.id,
            &network.name,
            StatusUpdate::new(TransactionStatus::Completed)
                .gas_fee(Some(gas_fee))
                .swap_buy_amount(updated_swap_buy),
        )?;
        log::info!("Tx Watcher: {} completed on {}", tx.id, network.name);
        Ok(WatchOutcome::Completed)
    }

    fn transaction_failed(
        &self,
        network: &Network,
        tx: &SavedTransaction,
        timed_out: bool,
        failed_error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let message = if timed_out {
            format!("Transaction{} timed out", nonce_label(tx))
        } else {
            format!("Transaction{} failed", nonce_label(tx))
        };
        self.inner.notifier.notify(
            Notification::error(message)
                .with_subtext(format!(
                    "{} | {}",
                    network.public_name,
                    short_wallet_address(&tx.wallet_address)
                ))
                .with_network(&network.name),
        );
        self.inner.store.update_transaction_as_failed(
            &tx.id,
            &network.name,
            &tx.wallet_address,
            None,
            timed_out,
            failed_error_message,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Amount, Token, TokenAmount};
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::testing::{
        mined_receipt, pending_tx, test_network, FakeBalanceRefresher, FakeExecutionChecker,
        FakeRescanTrigger, MockProvider, RecordingNotifier,
    };
    use crate::wallet::NonceAllocator;
    use std::time::Duration;

    struct Fixture {
        watcher: PendingTransactionWatcher,
        provider: Arc<MockProvider>,
        store: Arc<SavedTransactionStore>,
        kv: Arc<dyn KeyValueStore>,
        notifier: Arc<RecordingNotifier>,
        balances: Arc<FakeBalanceRefresher>,
        rescan: Arc<FakeRescanTrigger>,
        checker: Arc<FakeExecutionChecker>,
        network: Network,
    }

    fn fixture(settings: WatcherSettings) -> Fixture {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let providers = Arc::new(Providers::new());
        providers.register("Ethereum", provider.clone());
        let store = Arc::new(SavedTransactionStore::new(kv.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let balances = Arc::new(FakeBalanceRefresher::default());
        let watcher = PendingTransactionWatcher::new(
            settings,
            providers,
            store.clone(),
            balances.clone(),
            notifier.clone(),
        );
        let checker = Arc::new(FakeExecutionChecker::default());
        let rescan = Arc::new(FakeRescanTrigger::default());
        watcher.start(checker.clone(), rescan.clone());
        Fixture {
            watcher,
            provider,
            store,
            kv,
            notifier,
            balances,
            rescan,
            checker,
            network: test_network("Ethereum"),
        }
    }

    fn submitted(f: &Fixture, id: &str) -> SavedTransaction {
        let mut tx = pending_tx(id, "Ethereum", unix_now());
        tx.nonce = Some(3);
        f.store
            .add_transactions(vec![tx.clone()], "Ethereum")
            .unwrap();
        tx
    }

    fn status(f: &Fixture, id: &str) -> TransactionStatus {
        f.store.transaction(id, "Ethereum").unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_watch_requires_start() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let watcher = PendingTransactionWatcher::new(
            WatcherSettings::default(),
            Arc::new(Providers::new()),
            Arc::new(SavedTransactionStore::new(kv)),
            Arc::new(FakeBalanceRefresher::default()),
            Arc::new(RecordingNotifier::default()),
        );
        let result = watcher
            .watch_pending_transaction(&test_network("Ethereum"), pending_tx("0x1", "Ethereum", 1))
            .await;
        assert!(matches!(result, Err(EngineError::WatcherNotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_completes_transaction() {
        let f = fixture(WatcherSettings::default());
        let tx = submitted(&f, "0xaa");
        f.provider.set_receipt("0xaa", mined_receipt("0xaa", 10, true));

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Completed);

        let saved = f.store.transaction("0xaa", "Ethereum").unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Completed);
        assert_eq!(
            saved.public_execution_gas_fee,
            Some(Amount::from(21_000u64 * 1_000_000_000))
        );
        assert_eq!(f.balances.public_refreshes(), 1);
        assert_eq!(f.rescan.calls(), 1);
        assert_eq!(f.notifier.messages(), vec!["Success: Send transaction: 3."]);
        let sent = &f.notifier.notifications()[0];
        assert_eq!(sent.subtext.as_deref(), Some("Ethereum | 0xwallet"));
        assert_eq!(sent.network.as_deref(), Some("Ethereum"));
        assert!(!f.watcher.is_watching("Ethereum", "0xaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_watch_is_noop() {
        let f = fixture(WatcherSettings::default());
        let tx = submitted(&f, "0xbb");

        let watcher = f.watcher.clone();
        let network = f.network.clone();
        let first = tokio::spawn({
            let tx = tx.clone();
            async move { watcher.watch_pending_transaction(&network, tx).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.watcher.is_watching("Ethereum", "0xBB"));

        let second = f
            .watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(second, WatchOutcome::AlreadyWatching);
        assert_eq!(f.provider.receipt_calls(), 1);

        // Network switch ends the first loop silently
        f.watcher.stop_watching_network("Ethereum");
        assert_eq!(first.await.unwrap().unwrap(), WatchOutcome::Invalidated);
        assert_eq!(status(&f, "0xbb"), TransactionStatus::Pending);
        assert!(f.notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_times_out_after_forty_attempts() {
        let f = fixture(WatcherSettings {
            max_rearms: Some(0),
            ..WatcherSettings::default()
        });
        let nonces = NonceAllocator::new(f.kv.clone());
        nonces
            .store_last_transaction_nonce("0xwallet", "Ethereum", 3)
            .unwrap();
        let tx = submitted(&f, "0xcc");

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Abandoned);
        assert_eq!(f.provider.receipt_calls(), 40);
        assert_eq!(status(&f, "0xcc"), TransactionStatus::TimedOut);
        assert_eq!(f.notifier.messages(), vec!["Transaction 3 timed out"]);
        assert_eq!(nonces.last_transaction_nonce("0xwallet", "Ethereum").unwrap(), None);
        assert!(!f.watcher.is_watching("Ethereum", "0xcc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_still_polls_each_round() {
        let f = fixture(WatcherSettings {
            timeout_minutes: 0,
            max_rearms: Some(3),
            ..WatcherSettings::default()
        });
        let tx = submitted(&f, "0xcd");

        let watcher = f.watcher.clone();
        let network = f.network.clone();
        let handle = tokio::spawn(async move { watcher.watch_pending_transaction(&network, tx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.provider.receipt_calls() >= 1);
        assert!(f.watcher.is_watching("Ethereum", "0xcd"));

        f.provider.set_receipt("0xcd", mined_receipt("0xcd", 19, true));
        assert_eq!(handle.await.unwrap().unwrap(), WatchOutcome::Completed);
        assert_eq!(status(&f, "0xcd"), TransactionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_watch_rearms_until_mined() {
        let f = fixture(WatcherSettings::default());
        let tx = submitted(&f, "0xdd");

        let watcher = f.watcher.clone();
        let network = f.network.clone();
        let handle = tokio::spawn(async move { watcher.watch_pending_transaction(&network, tx).await });

        // First round takes 39 delays of 15s
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(status(&f, "0xdd"), TransactionStatus::TimedOut);
        assert!(f.watcher.is_watching("Ethereum", "0xdd"));

        f.provider.set_receipt("0xdd", mined_receipt("0xdd", 11, true));
        assert_eq!(handle.await.unwrap().unwrap(), WatchOutcome::Completed);
        assert_eq!(status(&f, "0xdd"), TransactionStatus::Completed);
        assert_eq!(
            f.notifier.messages(),
            vec!["Transaction 3 timed out", "Success: Send transaction: 3."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_receipt_fails_without_refresh() {
        let f = fixture(WatcherSettings::default());
        let tx = submitted(&f, "0xee");
        f.provider.set_receipt("0xee", mined_receipt("0xee", 12, false));

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Failed);
        assert_eq!(status(&f, "0xee"), TransactionStatus::Failed);
        assert_eq!(f.notifier.messages(), vec!["Transaction 3 failed"]);
        assert_eq!(f.balances.public_refreshes(), 0);
        assert_eq!(f.rescan.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_adapt_error_fails_successful_receipt() {
        let f = fixture(WatcherSettings::default());
        let mut tx = submitted(&f, "0xff");
        tx.needs_relay_adapt_success_check = true;
        f.provider.set_receipt("0xff", mined_receipt("0xff", 13, true));
        f.checker.set_error(Some("Unshield reverted".to_string()));

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Failed);
        let saved = f.store.transaction("0xff", "Ethereum").unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Failed);
        assert_eq!(saved.failed_error_message.as_deref(), Some("Unshield reverted"));
        assert_eq!(f.checker.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_collaborator_routes_to_failure() {
        let f = fixture(WatcherSettings::default());
        let tx = submitted(&f, "0xab");
        f.provider.set_receipt("0xab", mined_receipt("0xab", 14, true));
        f.rescan.fail_with("transaction failed during scan");

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, tx.clone())
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Failed);
        assert_eq!(status(&f, "0xab"), TransactionStatus::Failed);

        // Other errors surface to the caller
        let tx = submitted(&f, "0xac");
        f.provider.set_receipt("0xac", mined_receipt("0xac", 15, true));
        f.rescan.fail_with("engine offline");
        let result = f.watcher.watch_pending_transaction(&f.network, tx).await;
        assert!(matches!(result, Err(EngineError::Collaborator { .. })));
        assert_eq!(status(&f, "0xac"), TransactionStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_marks_original_cancelled() {
        let f = fixture(WatcherSettings::default());
        let mut original = submitted(&f, "0x0a");
        original.cancelling = true;
        let mut cancel = pending_tx("0x0b", "Ethereum", unix_now());
        cancel.action = TransactionAction::Cancel;
        cancel.nonce = Some(3);
        cancel.cancel_transaction_id = Some(original.id.clone());
        f.store
            .add_transactions(vec![cancel.clone()], "Ethereum")
            .unwrap();
        f.provider.set_receipt("0x0b", mined_receipt("0x0b", 16, true));

        let outcome = f
            .watcher
            .watch_pending_transaction(&f.network, cancel)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Completed);

        let original = f.store.transaction("0x0a", "Ethereum").unwrap().unwrap();
        let cancel = f.store.transaction("0x0b", "Ethereum").unwrap().unwrap();
        assert_eq!(original.status, TransactionStatus::Cancelled);
        assert_eq!(cancel.status, TransactionStatus::Completed);
        assert_eq!(original.public_execution_gas_fee, cancel.public_execution_gas_fee);
        assert_eq!(f.notifier.messages(), vec!["Transaction 3 cancelled."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shield_on_poi_network_sends_info() {
        let mut f = fixture(WatcherSettings::default());
        f.network.poi_required = true;
        let mut tx = submitted(&f, "0x5a");
        tx.action = TransactionAction::Shield;
        tx.sent_via_broadcaster = true;
        f.provider.set_receipt("0x5a", mined_receipt("0x5a", 17, true));

        f.watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        assert_eq!(
            f.notifier.messages(),
            vec![
                "Success: Shield through Broadcaster.",
                "Shielded funds are pending a privacy proof."
            ]
        );
        let countdown = f.store.shield_countdown_transactions("Ethereum").unwrap();
        assert_eq!(countdown.len(), 1);
        assert_eq!(countdown[0].id, "0x5a");
        assert_eq!(countdown[0].network_name, "Ethereum");
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_without_matching_transfer_keeps_quote() {
        let f = fixture(WatcherSettings::default());
        let mut tx = pending_tx("0x5b", "Ethereum", unix_now());
        tx.action = TransactionAction::Swap;
        tx.swap_buy_token_amount = Some(TokenAmount::new(
            Token::address_only("0xbuy", 18),
            Amount::from(100),
        ));
        f.store.add_transactions(vec![tx.clone()], "Ethereum").unwrap();
        f.provider.set_receipt("0x5b", mined_receipt("0x5b", 18, true));

        f.watcher
            .watch_pending_transaction(&f.network, tx)
            .await
            .unwrap();
        let saved = f.store.transaction("0x5b", "Ethereum").unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Completed);
        assert!(!saved.confirmed_swap_value);
        assert_eq!(saved.swap_buy_token_amount.unwrap().amount, Amount::from(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_pending_transactions_selects_eligible() {
        let f = fixture(WatcherSettings::default());
        let now = unix_now();
        let pending = pending_tx("0x01", "Ethereum", now);
        let mut recent_timeout = pending_tx("0x02", "Ethereum", now - 60);
        recent_timeout.status = TransactionStatus::TimedOut;
        let mut stale_timeout = pending_tx("0x03", "Ethereum", now - 2 * 86_400);
        stale_timeout.status = TransactionStatus::TimedOut;
        let mut done = pending_tx("0x04", "Ethereum", now);
        done.status = TransactionStatus::Completed;

        let handles = f.watcher.watch_pending_transactions(
            vec![pending, recent_timeout, stale_timeout, done],
            &f.network,
        );
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.watcher.watching_count("Ethereum"), 2);
        assert!(f.watcher.is_watching("Ethereum", "0x02"));

        // Re-arming replaces the previous watches
        let again = f
            .watcher
            .watch_pending_transactions(vec![pending_tx("0x05", "Ethereum", now)], &f.network);
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.watcher.watching_count("Ethereum"), 1);
        assert!(f.watcher.is_watching("Ethereum", "0x05"));

        f.watcher.stop_watching_network("Ethereum");
        for handle in again {
            handle.await.unwrap();
        }
        assert_eq!(f.watcher.watching_count("Ethereum"), 0);
    }
}
