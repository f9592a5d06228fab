//! Full public balance refresh for the active wallet.

use super::{BalanceRefresher, BalanceStore, TokenBalances};
use crate::chain::Network;
use crate::provider::{swallow_destroyed, Providers};
use crate::utils::constants::BASE_TOKEN_ADDRESS;
use crate::wallet::WalletRegistry;
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ChainBalanceRefresher {
    providers: Arc<Providers>,
    wallets: Arc<WalletRegistry>,
    balances: Arc<BalanceStore>,
}

impl ChainBalanceRefresher {
    pub fn new(
        providers: Arc<Providers>,
        wallets: Arc<WalletRegistry>,
        balances: Arc<BalanceStore>,
    ) -> Self {
        ChainBalanceRefresher {
            providers,
            wallets,
            balances,
        }
    }
}

#[async_trait]
impl BalanceRefresher for ChainBalanceRefresher {
    async fn refresh_public_balances(&self, network: &Network) -> anyhow::Result<()> {
        let wallet = match self.wallets.active() {
            Some(wallet) => wallet,
            None => return Ok(()),
        };
        let provider = self
            .providers
            .get(&network.name)
            .ok_or_else(|| anyhow!("No provider for network {}", network.name))?;

        let mut updated = TokenBalances::new();
        let base = swallow_destroyed(provider.get_balance(&wallet.eth_address).await)?;
        updated.insert(BASE_TOKEN_ADDRESS.to_string(), base);

        let tokens: Vec<String> = wallet
            .tokens_for_network(&network.name)
            .iter()
            .filter(|t| !t.is_base_token)
            .map(|t| t.address.to_lowercase())
            .collect();
        if !tokens.is_empty() {
            let found =
                swallow_destroyed(provider.batch_balances(&wallet.eth_address, &tokens).await)?;
            updated.extend(found);
        }

        log::debug!(
            "Balances: refreshed {} public balance(s) for {} on {}",
            updated.len(),
            wallet.id,
            network.name
        );
        self.balances.update_public(&network.name, &wallet.id, updated)
    }
}
