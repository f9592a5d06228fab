//! # Engine
//!
//! Long-running pieces of the transaction lifecycle and the facade that wires
//! them to one set of stores and providers.

pub mod scheduler;
pub mod watcher;

pub use scheduler::BalanceUpdateScheduler;
pub use watcher::{
    ExecutionErrorChecker, HistoryRescanTrigger, PendingTransactionWatcher, WatchOutcome,
};

use crate::balances::{
    BalanceRefresher, BalanceStore, ChainBalanceRefresher, PrivateBalanceRefresher,
};
use crate::chain::{Network, SavedTransaction, TransactionAction, TransactionStatus};
use crate::errors::{EngineError, EngineResult};
use crate::history::{
    HistorySource, SavedTransactionStore, StatusUpdate, TransactionHistoryService,
    TransactionHistorySync, TransactionReceiptDetailsService,
};
use crate::notify::Notifier;
use crate::provider::Providers;
use crate::state::EngineSettings;
use crate::storage::KeyValueStore;
use crate::wallet::{NonceAllocator, WalletRegistry};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

type SchedulerKey = (String, String);

pub struct WalletEngine {
    settings: EngineSettings,
    providers: Arc<Providers>,
    wallets: Arc<WalletRegistry>,
    store: Arc<SavedTransactionStore>,
    nonces: NonceAllocator,
    balances: Arc<BalanceStore>,
    refresher: Arc<ChainBalanceRefresher>,
    receipt_details: Arc<TransactionReceiptDetailsService>,
    history: Arc<TransactionHistorySync>,
    watcher: PendingTransactionWatcher,
    schedulers: Mutex<HashMap<SchedulerKey, BalanceUpdateScheduler>>,
}

impl WalletEngine {
    pub fn new(
        settings: EngineSettings,
        kv: Arc<dyn KeyValueStore>,
        providers: Arc<Providers>,
        wallets: Arc<WalletRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let store = Arc::new(SavedTransactionStore::new(kv.clone()));
        let balances = Arc::new(BalanceStore::new(kv.clone()));
        let refresher = Arc::new(ChainBalanceRefresher::new(
            providers.clone(),
            wallets.clone(),
            balances.clone(),
        ));
        let receipt_details = Arc::new(TransactionReceiptDetailsService::new(
            kv.clone(),
            store.clone(),
            providers.clone(),
        ));
        let service = Arc::new(TransactionHistoryService::new(
            store.clone(),
            receipt_details.clone(),
            providers.clone(),
        ));
        let history = Arc::new(TransactionHistorySync::new(
            service,
            store.clone(),
            wallets.clone(),
            kv.clone(),
        ));
        let watcher = PendingTransactionWatcher::new(
            settings.watcher.clone(),
            providers.clone(),
            store.clone(),
            refresher.clone(),
            notifier,
        );

        WalletEngine {
            settings,
            providers,
            wallets,
            store,
            nonces: NonceAllocator::new(kv),
            balances,
            refresher,
            receipt_details,
            history,
            watcher,
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(
        &self,
        checker: Arc<dyn ExecutionErrorChecker>,
        rescan: Arc<dyn HistoryRescanTrigger>,
    ) {
        self.watcher.start(checker, rescan);
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn network(&self, name: &str) -> Option<Network> {
        self.settings.network(name)
    }

    pub fn providers(&self) -> &Arc<Providers> {
        &self.providers
    }

    pub fn wallets(&self) -> &Arc<WalletRegistry> {
        &self.wallets
    }

    pub fn store(&self) -> &Arc<SavedTransactionStore> {
        &self.store
    }

    pub fn balances(&self) -> &Arc<BalanceStore> {
        &self.balances
    }

    pub fn receipt_details(&self) -> &Arc<TransactionReceiptDetailsService> {
        &self.receipt_details
    }

    pub fn history(&self) -> &Arc<TransactionHistorySync> {
        &self.history
    }

    pub fn watcher(&self) -> &PendingTransactionWatcher {
        &self.watcher
    }

    pub fn nonces(&self) -> &NonceAllocator {
        &self.nonces
    }

    pub async fn next_transaction_nonce(
        &self,
        address: &str,
        network: &str,
        custom_nonce: Option<u64>,
    ) -> EngineResult<u64> {
        let provider = self
            .providers
            .get(network)
            .ok_or_else(|| EngineError::MissingProvider(network.to_string()))?;
        self.nonces
            .next_transaction_nonce(provider.as_ref(), address, network, custom_nonce)
            .await
    }

    /// Records a freshly broadcast transaction and watches it when pending.
    pub fn submit_transaction(
        &self,
        network: &Network,
        tx: SavedTransaction,
    ) -> anyhow::Result<Option<JoinHandle<()>>> {
        if let Some(nonce) = tx.nonce {
            self.nonces
                .store_last_transaction_nonce(&tx.wallet_address, &network.name, nonce)?;
        }
        self.store.add_transactions(vec![tx.clone()], &network.name)?;
        if tx.status != TransactionStatus::Pending {
            return Ok(None);
        }
        Ok(Some(self.spawn_watch(network, tx)))
    }

    /// Records a cancel replacement for `original_id` and flags the original
    /// as cancelling.
    pub fn submit_cancel(
        &self,
        network: &Network,
        original_id: &str,
        mut cancel: SavedTransaction,
    ) -> anyhow::Result<Option<JoinHandle<()>>> {
        let original = self
            .store
            .transaction(original_id, &network.name)?
            .ok_or_else(|| anyhow!("No transaction {} to cancel on {}", original_id, network.name))?;
        self.store.update_transaction_status(
            &original.id,
            &network.name,
            StatusUpdate::new(original.status).cancelling(true),
        )?;
        cancel.action = TransactionAction::Cancel;
        cancel.cancel_transaction_id = Some(original.id);
        self.submit_transaction(network, cancel)
    }

    fn spawn_watch(&self, network: &Network, tx: SavedTransaction) -> JoinHandle<()> {
        let watcher = self.watcher.clone();
        let network = network.clone();
        tokio::spawn(async move {
            let tx_hash = tx.id.clone();
            if let Err(e) = watcher.watch_pending_transaction(&network, tx).await {
                log::error!("Tx Watcher: error watching {}: {}", tx_hash, e.full_message());
            }
        })
    }

    /// Scheduler for one (wallet, network) session, created on first use.
    pub fn scheduler_for(&self, wallet_id: &str, network: &str) -> EngineResult<BalanceUpdateScheduler> {
        let key = (wallet_id.to_string(), network.to_string());
        let mut schedulers = self.schedulers.lock();
        if let Some(existing) = schedulers.get(&key) {
            return Ok(existing.clone());
        }
        let wallet = self
            .wallets
            .get(wallet_id)
            .ok_or_else(|| anyhow!("Unknown wallet {}", wallet_id))?;
        let scheduler = BalanceUpdateScheduler::new(
            network,
            wallet_id,
            &wallet.eth_address,
            self.providers.clone(),
            self.balances.clone(),
            self.settings.scheduler.clone(),
        );
        schedulers.insert(key, scheduler.clone());
        Ok(scheduler)
    }

    /// Entry point for incoming-transfer detection.
    pub fn token_transfer_detected(
        &self,
        wallet_id: &str,
        network: &str,
        token_address: &str,
    ) -> EngineResult<()> {
        self.scheduler_for(wallet_id, network)?.enqueue(token_address);
        Ok(())
    }

    fn destroy_schedulers(&self, network: &str) {
        let mut schedulers = self.schedulers.lock();
        schedulers.retain(|(_, n), scheduler| {
            if n == network {
                scheduler.destroy();
                false
            } else {
                true
            }
        });
    }

    /// Tears down watches and schedulers of `previous`, then restores cached
    /// balances and re-arms pending watches on `next`.
    pub async fn switch_network(
        &self,
        previous: Option<&Network>,
        next: &Network,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        if let Some(previous) = previous {
            self.watcher.stop_watching_network(&previous.name);
            self.destroy_schedulers(&previous.name);
        }
        if let Err(e) = self.balances.load_cached(&next.name) {
            log::warn!("Balances: failed to restore cache for {}: {:#}", next.name, e);
        }
        log::info!("Switched to network {}", next.name);
        self.watcher.load_transactions_and_watch_pending(next).await
    }

    pub async fn refresh_public_balances(&self, network: &Network) -> anyhow::Result<()> {
        self.refresher.refresh_public_balances(network).await
    }

    pub async fn sync_history(&self, network: &Network, source: &dyn HistorySource) {
        self.history
            .safe_sync_transaction_history(network, source)
            .await
    }

    /// `private_refresher` runs the full private balance rescan between the
    /// clear and the history pass.
    pub async fn resync_history_if_necessary(
        &self,
        network: &Network,
        source: &dyn HistorySource,
        private_refresher: &dyn PrivateBalanceRefresher,
        force_update: bool,
    ) {
        self.history
            .resync_all_transactions_if_necessary(
                network,
                source,
                private_refresher,
                force_update,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{
        mined_receipt, pending_tx, test_network, FakeBalanceRefresher, FakeExecutionChecker,
        FakeHistorySource, FakeRescanTrigger, MockProvider, RecordingNotifier,
    };
    use crate::utils::constants::SAVED_TRANSACTION_CURRENT_VERSION;
    use crate::wallet::AvailableWallet;
    use std::time::Duration;

    fn engine() -> (WalletEngine, Arc<MockProvider>, Arc<RecordingNotifier>) {
        let provider = Arc::new(MockProvider::new());
        let providers = Arc::new(Providers::new());
        providers.register("Ethereum", provider.clone());
        let wallets = Arc::new(WalletRegistry::new());
        wallets.upsert(AvailableWallet::new("w1", "0xwallet"));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = WalletEngine::new(
            EngineSettings::default(),
            Arc::new(MemoryStore::new()),
            providers,
            wallets,
            notifier.clone(),
        );
        engine.start(
            Arc::new(FakeExecutionChecker::default()),
            Arc::new(FakeRescanTrigger::default()),
        );
        (engine, provider, notifier)
    }

    fn unix_now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    #[tokio::test(start_paused = true)]
    async fn test_submitted_transaction_is_watched_to_completion() {
        let (engine, provider, _) = engine();
        let network = test_network("Ethereum");
        let mut tx = pending_tx("0xaa", "Ethereum", unix_now());
        tx.nonce = Some(4);
        provider.set_receipt("0xaa", mined_receipt("0xaa", 1, true));

        let handle = engine.submit_transaction(&network, tx).unwrap().unwrap();
        handle.await.unwrap();

        let saved = engine.store().transaction("0xaa", "Ethereum").unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Completed);
        assert_eq!(
            engine
                .nonces()
                .last_transaction_nonce("0xwallet", "Ethereum")
                .unwrap(),
            Some(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flags_original() {
        let (engine, _, _) = engine();
        let network = test_network("Ethereum");
        let original = pending_tx("0x01", "Ethereum", unix_now());
        engine.submit_transaction(&network, original).unwrap();

        engine
            .submit_cancel(&network, "0x01", pending_tx("0x02", "Ethereum", unix_now()))
            .unwrap();
        let original = engine.store().transaction("0x01", "Ethereum").unwrap().unwrap();
        assert!(original.cancelling);
        assert_eq!(original.status, TransactionStatus::Pending);
        let cancel = engine.store().transaction("0x02", "Ethereum").unwrap().unwrap();
        assert_eq!(cancel.action, TransactionAction::Cancel);
        assert_eq!(cancel.cancel_transaction_id.as_deref(), Some("0x01"));

        assert!(engine
            .submit_cancel(&network, "0x99", pending_tx("0x03", "Ethereum", 1))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_network_stops_previous_watches() {
        let (engine, _, notifier) = engine();
        let ethereum = test_network("Ethereum");
        let polygon = test_network("Polygon");
        let handle = engine
            .submit_transaction(&ethereum, pending_tx("0xee", "Ethereum", unix_now()))
            .unwrap()
            .unwrap();
        let scheduler = engine.scheduler_for("w1", "Ethereum").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.watcher().is_watching("Ethereum", "0xee"));

        let handles = engine.switch_network(Some(&ethereum), &polygon).await.unwrap();
        assert!(handles.is_empty());
        handle.await.unwrap();
        assert!(!engine.watcher().is_watching("Ethereum", "0xee"));
        assert!(scheduler.is_destroyed());
        assert!(notifier.messages().is_empty());

        // Switching back re-arms the pending transaction
        let handles = engine.switch_network(Some(&polygon), &ethereum).await.unwrap();
        assert_eq!(handles.len(), 1);
    }

    #[tokio::test]
    async fn test_forced_resync_runs_private_refresh_once() {
        let (engine, _, _) = engine();
        let network = test_network("Ethereum");
        let source = FakeHistorySource::new(vec![]);
        let private = FakeBalanceRefresher::default();

        engine
            .resync_history_if_necessary(&network, &source, &private, true)
            .await;
        assert_eq!(private.private_refreshes(), 1);
        assert_eq!(private.public_refreshes(), 0);
        assert_eq!(
            engine.history().saved_version("Ethereum").unwrap(),
            Some(SAVED_TRANSACTION_CURRENT_VERSION)
        );

        // Current marker, not forced
        engine
            .resync_history_if_necessary(&network, &source, &private, false)
            .await;
        assert_eq!(private.private_refreshes(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_is_shared_per_session() {
        let (engine, _, _) = engine();
        let a = engine.scheduler_for("w1", "Ethereum").unwrap();
        let b = engine.scheduler_for("w1", "Ethereum").unwrap();
        a.enqueue("0xaa");
        assert_eq!(b.pending_count(), 1);
        assert!(engine.scheduler_for("nobody", "Ethereum").is_err());
    }

    #[tokio::test]
    async fn test_nonce_needs_provider() {
        let (engine, provider, _) = engine();
        provider.set_transaction_count(11);
        assert_eq!(
            engine
                .next_transaction_nonce("0xwallet", "Ethereum", None)
                .await
                .unwrap(),
            11
        );
        assert!(matches!(
            engine.next_transaction_nonce("0xwallet", "Polygon", None).await,
            Err(EngineError::MissingProvider(_))
        ));
    }
}
