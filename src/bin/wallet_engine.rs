use async_trait::async_trait;
use shielded_wallet_engine::{
    chain::{Chain, ProtocolVersion, ReceiptLog},
    engine::{ExecutionErrorChecker, HistoryRescanTrigger},
    init_logging,
    notify::LogNotifier,
    provider::{JsonRpcProvider, Providers},
    state::EngineSettings,
    storage::Storage,
    wallet::WalletRegistry,
    WalletEngine,
};
use std::sync::Arc;

// Without a privacy engine attached no receipt carries a relay-adapt error.
struct NoRelayAdaptErrors;

#[async_trait]
impl ExecutionErrorChecker for NoRelayAdaptErrors {
    async fn relay_adapt_transaction_error(
        &self,
        _version: ProtocolVersion,
        _logs: &[ReceiptLog],
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

struct LoggedRescan;

#[async_trait]
impl HistoryRescanTrigger for LoggedRescan {
    async fn rescan_history(
        &self,
        chain: &Chain,
        wallet_ids: Option<&[String]>,
    ) -> anyhow::Result<()> {
        log::info!(
            "Rescan requested for chain {} ({} wallets)",
            chain.id,
            wallet_ids.map_or(0, |ids| ids.len())
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Settings file wins over the settings stored in the default database.
    let (settings, storage) = match std::env::args().nth(1) {
        Some(path) => {
            let settings = EngineSettings::from_file(&path)?;
            let storage = Storage::new(&settings.database_path)?;
            (settings, storage)
        }
        None => {
            let storage = Storage::new(EngineSettings::default().database_path)?;
            (EngineSettings::from_storage(&storage), storage)
        }
    };

    let _logger = init_logging(&settings)?;
    log::info!("Starting wallet engine...");

    let providers = Arc::new(Providers::new());
    for network in &settings.networks {
        providers.register(&network.name, Arc::new(JsonRpcProvider::new(&network.rpc_url)?));
    }

    let wallets = Arc::new(WalletRegistry::new());
    for wallet in &settings.wallets {
        wallets.upsert(wallet.clone());
    }

    let engine = WalletEngine::new(
        settings.clone(),
        Arc::new(storage),
        providers,
        wallets,
        Arc::new(LogNotifier),
    );
    engine.start(Arc::new(NoRelayAdaptErrors), Arc::new(LoggedRescan));

    let mut handles = Vec::new();
    for network in settings.networks.iter().map(|n| n.network()) {
        if let Err(e) = engine.balances().load_cached(&network.name) {
            log::warn!("Balances: failed to restore cache for {}: {:#}", network.name, e);
        }
        match engine
            .watcher()
            .load_transactions_and_watch_pending(&network)
            .await
        {
            Ok(watching) => {
                log::info!("Watching {} pending transactions on {}", watching.len(), network.name);
                handles.extend(watching);
            }
            Err(e) => log::error!("Failed to load transactions for {}: {:#}", network.name, e),
        }
        if let Err(e) = engine.refresh_public_balances(&network).await {
            log::warn!("Balances: refresh failed for {}: {:#}", network.name, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down wallet engine...");
    for network in &settings.networks {
        engine.watcher().stop_watching_network(&network.name);
    }
    futures::future::join_all(handles).await;

    Ok(())
}
