//! # Wallets
//!
//! The wallets this engine tracks. Keys and private-address derivation belong
//! to the wallet engine; only identifiers and token lists are held here.

pub mod nonce;

use crate::chain::Token;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use nonce::NonceAllocator;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableWallet {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub eth_address: String,
    /// Id of the matching wallet inside the privacy engine
    #[serde(default)]
    pub private_wallet_id: Option<String>,
    #[serde(default)]
    pub private_address: Option<String>,
    #[serde(default)]
    pub is_view_only: bool,
    /// Tokens the user added, by network name
    #[serde(default)]
    pub added_tokens: HashMap<String, Vec<Token>>,
}

impl AvailableWallet {
    pub fn new(id: &str, eth_address: &str) -> Self {
        AvailableWallet {
            id: id.to_string(),
            name: None,
            eth_address: eth_address.to_string(),
            private_wallet_id: None,
            private_address: None,
            is_view_only: false,
            added_tokens: HashMap::new(),
        }
    }

    pub fn tokens_for_network(&self, network: &str) -> &[Token] {
        self.added_tokens
            .get(network)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_token(&mut self, network: &str, token: Token) {
        let tokens = self.added_tokens.entry(network.to_string()).or_default();
        if !tokens.iter().any(|t| t.matches_address(&token.address)) {
            tokens.push(token);
        }
    }

    /// Whether `address` is one of this wallet's own addresses.
    pub fn owns_address(&self, address: &str) -> bool {
        self.eth_address.eq_ignore_ascii_case(address)
            || self
                .private_address
                .as_deref()
                .map_or(false, |a| a.eq_ignore_ascii_case(address))
    }
}

#[derive(Default)]
struct RegistryState {
    active: Option<String>,
    available: Vec<AvailableWallet>,
}

#[derive(Default)]
pub struct WalletRegistry {
    state: RwLock<RegistryState>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a wallet. The first wallet added becomes active.
    pub fn upsert(&self, wallet: AvailableWallet) {
        let mut state = self.state.write();
        if state.active.is_none() {
            state.active = Some(wallet.id.clone());
        }
        match state.available.iter_mut().find(|w| w.id == wallet.id) {
            Some(existing) => *existing = wallet,
            None => state.available.push(wallet),
        }
    }

    pub fn set_active(&self, wallet_id: &str) -> bool {
        let mut state = self.state.write();
        if state.available.iter().any(|w| w.id == wallet_id) {
            state.active = Some(wallet_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<AvailableWallet> {
        let state = self.state.read();
        let id = state.active.as_ref()?;
        state.available.iter().find(|w| &w.id == id).cloned()
    }

    pub fn available(&self) -> Vec<AvailableWallet> {
        self.state.read().available.clone()
    }

    pub fn get(&self, wallet_id: &str) -> Option<AvailableWallet> {
        self.state
            .read()
            .available
            .iter()
            .find(|w| w.id == wallet_id)
            .cloned()
    }
}
