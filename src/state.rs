//! # Engine Settings
//!
//! Settings are read from a JSON file when one is given, otherwise from the
//! `engine_settings` entry of the settings table, otherwise defaults.

use crate::chain::Network;
use crate::storage::Storage;
use crate::utils::constants::{
    DEFAULT_BURST_WINDOW_MS, DEFAULT_LOG_DIRECTORY, DEFAULT_LOG_SPEC, DEFAULT_MAX_BATCH_SIZE,
    DEFAULT_MULTICALL_THRESHOLD, DEFAULT_TOKEN_COOLDOWN_MS, ENGINE_SETTINGS_KEY,
    RETRY_DELAY_SEC_GET_TX_FROM_HASH, TIMEOUT_MIN_WATCH_PENDING, TIMEOUT_SEC_WATCH_TX_EXPIRATION,
};
use crate::wallet::AvailableWallet;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherSettings {
    pub timeout_minutes: u64,
    pub retry_delay_secs: u64,
    /// Timed-out transactions younger than this keep being watched
    pub rearm_window_secs: u64,
    /// Extra watch rounds after the first timeout. `None` means until the window closes.
    pub max_rearms: Option<u32>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            timeout_minutes: TIMEOUT_MIN_WATCH_PENDING,
            retry_delay_secs: RETRY_DELAY_SEC_GET_TX_FROM_HASH,
            rearm_window_secs: TIMEOUT_SEC_WATCH_TX_EXPIRATION,
            max_rearms: None,
        }
    }
}

impl WatcherSettings {
    /// Receipt polls per watch round. A zero timeout still polls once.
    pub fn poll_attempts(&self) -> u64 {
        let delay = self.retry_delay_secs.max(1);
        ((60 * self.timeout_minutes + delay - 1) / delay).max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerOptions {
    pub burst_window_ms: u64,
    pub token_cooldown_ms: u64,
    pub multicall_threshold: usize,
    pub max_batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            burst_window_ms: DEFAULT_BURST_WINDOW_MS,
            token_cooldown_ms: DEFAULT_TOKEN_COOLDOWN_MS,
            multicall_threshold: DEFAULT_MULTICALL_THRESHOLD,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl SchedulerOptions {
    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn token_cooldown(&self) -> Duration {
        Duration::from_millis(self.token_cooldown_ms)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    pub name: String,
    pub public_name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default)]
    pub poi_required: bool,
    #[serde(default = "default_base_token_symbol")]
    pub base_token_symbol: String,
}

fn default_base_token_symbol() -> String {
    "ETH".to_string()
}

impl NetworkSettings {
    pub fn network(&self) -> Network {
        let mut network = Network::evm(&self.name, &self.public_name, self.chain_id);
        network.poi_required = self.poi_required;
        network.base_token_symbol = self.base_token_symbol.clone();
        network
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub log_spec: String,
    pub log_directory: PathBuf,
    pub database_path: PathBuf,
    pub networks: Vec<NetworkSettings>,
    /// Wallets tracked at startup. The first one is active.
    pub wallets: Vec<AvailableWallet>,
    pub watcher: WatcherSettings,
    pub scheduler: SchedulerOptions,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_spec: DEFAULT_LOG_SPEC.to_string(),
            log_directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
            database_path: PathBuf::from("wallet-engine.db"),
            networks: vec![NetworkSettings {
                name: "Ethereum".to_string(),
                public_name: "Ethereum".to_string(),
                chain_id: 1,
                rpc_url: "http://127.0.0.1:8545".to_string(),
                poi_required: true,
                base_token_symbol: default_base_token_symbol(),
            }],
            wallets: Vec::new(),
            watcher: WatcherSettings::default(),
            scheduler: SchedulerOptions::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    /// Settings from the settings table, or defaults when none are stored.
    pub fn from_storage(storage: &Storage) -> Self {
        match storage.get_setting(ENGINE_SETTINGS_KEY) {
            Ok(Some(json)) => serde_json::from_str::<EngineSettings>(&json).unwrap_or_else(|e| {
                log::warn!("Stored engine settings are invalid, using defaults: {}", e);
                EngineSettings::default()
            }),
            Ok(None) => EngineSettings::default(),
            Err(e) => {
                log::warn!("Failed to read engine settings: {:#}", e);
                EngineSettings::default()
            }
        }
    }

    pub fn save(&self, storage: &Storage) -> anyhow::Result<()> {
        storage.save_setting(ENGINE_SETTINGS_KEY, &serde_json::to_string(self)?)
    }

    pub fn network(&self, name: &str) -> Option<Network> {
        self.networks
            .iter()
            .find(|n| n.name == name)
            .map(NetworkSettings::network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_attempts() {
        let settings = WatcherSettings::default();
        assert_eq!(settings.poll_attempts(), 40);

        let uneven = WatcherSettings {
            timeout_minutes: 1,
            retry_delay_secs: 7,
            ..WatcherSettings::default()
        };
        assert_eq!(uneven.poll_attempts(), 9);

        let zero = WatcherSettings {
            timeout_minutes: 0,
            ..WatcherSettings::default()
        };
        assert_eq!(zero.poll_attempts(), 1);
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"logSpec": "debug", "scheduler": {"multicallThreshold": 5}}"#,
        )
        .unwrap();

        let settings = EngineSettings::from_file(&path).unwrap();
        assert_eq!(settings.log_spec, "debug");
        assert_eq!(settings.scheduler.multicall_threshold, 5);
        assert_eq!(settings.scheduler.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(settings.watcher, WatcherSettings::default());
        assert_eq!(settings.networks.len(), 1);
    }

    #[test]
    fn test_settings_round_trip_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("engine.db")).unwrap();
        assert_eq!(EngineSettings::from_storage(&storage), EngineSettings::default());

        let mut settings = EngineSettings::default();
        settings.watcher.max_rearms = Some(3);
        settings.save(&storage).unwrap();
        assert_eq!(EngineSettings::from_storage(&storage), settings);

        let network = settings.network("Ethereum").unwrap();
        assert!(network.poi_required);
        assert!(settings.network("Polygon").is_none());
    }
}
