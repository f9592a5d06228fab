//! # Balance State
//!
//! Public balances are `network -> wallet -> token -> amount`. Private balances
//! add two fixed axes, protocol version and balance bucket, stored as arrays
//! indexed by the enums so every slot always exists.
//!
//! Each successful update is mirrored into a single-slot cache per network so a
//! cold start can show the last known balances before the first refresh.

pub mod refresh;

use crate::chain::{Amount, BalanceBucket, Network, ProtocolVersion};
use crate::storage::KeyValueStore;
use crate::utils::constants::{storage_key, CACHED_BALANCES_KEY, CACHED_BALANCES_PRIVATE_KEY};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use refresh::ChainBalanceRefresher;

/// Pulls fresh public balances into the balance store.
#[async_trait]
pub trait BalanceRefresher: Send + Sync {
    /// Public balances of the active wallet on `network`.
    async fn refresh_public_balances(&self, network: &Network) -> anyhow::Result<()>;
}

/// Full private balance rescan, owned by the privacy engine. Balances land in
/// the store through its scan callbacks once the returned future resolves.
#[async_trait]
pub trait PrivateBalanceRefresher: Send + Sync {
    /// Private balances on `network`, for the given private wallets or all of them.
    async fn refresh_private_balances(
        &self,
        network: &Network,
        wallet_ids: Option<&[String]>,
    ) -> anyhow::Result<()>;
}

/// Token address (lowercase) to amount.
pub type TokenBalances = BTreeMap<String, Amount>;

/// Wallet id to public token balances, for one network.
pub type WalletTokenBalances = HashMap<String, TokenBalances>;

/// Wallet id to private balances, for one network.
pub type WalletPrivateBalances = HashMap<String, VersionedBalances>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(
    into = "BTreeMap<BalanceBucket, TokenBalances>",
    from = "BTreeMap<BalanceBucket, TokenBalances>"
)]
pub struct BucketBalances([TokenBalances; BalanceBucket::COUNT]);

impl BucketBalances {
    pub fn get(&self, bucket: BalanceBucket) -> &TokenBalances {
        &self.0[bucket.index()]
    }

    pub fn get_mut(&mut self, bucket: BalanceBucket) -> &mut TokenBalances {
        &mut self.0[bucket.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BalanceBucket, &TokenBalances)> {
        BalanceBucket::ALL.iter().map(move |b| (*b, self.get(*b)))
    }

    /// Sums the named buckets per token. Buckets are disjoint, so nothing is
    /// counted twice. A bucket listed twice in `filter` is still summed once.
    pub fn total(&self, filter: &[BalanceBucket]) -> TokenBalances {
        let mut included = [false; BalanceBucket::COUNT];
        for bucket in filter {
            included[bucket.index()] = true;
        }

        let mut totals = TokenBalances::new();
        for (bucket, balances) in self.iter() {
            if !included[bucket.index()] {
                continue;
            }
            for (token, amount) in balances {
                *totals.entry(token.clone()).or_default() += amount;
            }
        }
        totals
    }
}

impl From<BucketBalances> for BTreeMap<BalanceBucket, TokenBalances> {
    fn from(value: BucketBalances) -> Self {
        BalanceBucket::ALL
            .iter()
            .copied()
            .zip(value.0)
            .filter(|(_, balances)| !balances.is_empty())
            .collect()
    }
}

impl From<BTreeMap<BalanceBucket, TokenBalances>> for BucketBalances {
    fn from(value: BTreeMap<BalanceBucket, TokenBalances>) -> Self {
        let mut buckets = BucketBalances::default();
        for (bucket, balances) in value {
            *buckets.get_mut(bucket) = balances;
        }
        buckets
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(
    into = "BTreeMap<ProtocolVersion, BucketBalances>",
    from = "BTreeMap<ProtocolVersion, BucketBalances>"
)]
pub struct VersionedBalances([BucketBalances; ProtocolVersion::COUNT]);

impl VersionedBalances {
    pub fn get(&self, version: ProtocolVersion) -> &BucketBalances {
        &self.0[version.index()]
    }

    pub fn get_mut(&mut self, version: ProtocolVersion) -> &mut BucketBalances {
        &mut self.0[version.index()]
    }
}

impl From<VersionedBalances> for BTreeMap<ProtocolVersion, BucketBalances> {
    fn from(value: VersionedBalances) -> Self {
        ProtocolVersion::ALL.iter().copied().zip(value.0).collect()
    }
}

impl From<BTreeMap<ProtocolVersion, BucketBalances>> for VersionedBalances {
    fn from(value: BTreeMap<ProtocolVersion, BucketBalances>) -> Self {
        let mut versions = VersionedBalances::default();
        for (version, buckets) in value {
            *versions.get_mut(version) = buckets;
        }
        versions
    }
}

/// Balances for one wallet in the requested view.
///
/// Private: the sum of `bucket_filter` within `version` only. Public: a direct
/// lookup; version and buckets do not apply.
pub fn token_balances_for_wallet_and_state(
    wallet_id: &str,
    public_balances: &WalletTokenBalances,
    private_balances: &WalletPrivateBalances,
    is_private: bool,
    version: ProtocolVersion,
    bucket_filter: &[BalanceBucket],
) -> TokenBalances {
    if is_private {
        private_balances
            .get(wallet_id)
            .map(|versions| versions.get(version).total(bucket_filter))
            .unwrap_or_default()
    } else {
        public_balances.get(wallet_id).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct BalanceState {
    public: HashMap<String, WalletTokenBalances>,
    private: HashMap<String, WalletPrivateBalances>,
}

pub struct BalanceStore {
    state: Mutex<BalanceState>,
    kv: Arc<dyn KeyValueStore>,
}

impl BalanceStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        BalanceStore {
            state: Mutex::new(BalanceState::default()),
            kv,
        }
    }

    /// Overwrites the given tokens for one wallet. Other tokens are untouched.
    pub fn update_public(
        &self,
        network: &str,
        wallet_id: &str,
        updates: TokenBalances,
    ) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let network_balances = state.public.entry(network.to_string()).or_default();
            let wallet = network_balances.entry(wallet_id.to_string()).or_default();
            for (token, amount) in updates {
                wallet.insert(token.to_lowercase(), amount);
            }
            serde_json::to_string(network_balances)?
        };
        self.kv
            .set(&storage_key(&[CACHED_BALANCES_KEY, network]), &snapshot)
            .context("Failed to cache public balances")
    }

    /// Applies per-bucket updates within one protocol version. Buckets and
    /// versions absent from `updates` keep their current contents.
    pub fn update_private(
        &self,
        network: &str,
        wallet_id: &str,
        version: ProtocolVersion,
        updates: Vec<(BalanceBucket, TokenBalances)>,
    ) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let network_balances = state.private.entry(network.to_string()).or_default();
            let buckets = network_balances
                .entry(wallet_id.to_string())
                .or_default()
                .get_mut(version);
            for (bucket, balances) in updates {
                let slot = buckets.get_mut(bucket);
                for (token, amount) in balances {
                    slot.insert(token.to_lowercase(), amount);
                }
            }
            serde_json::to_string(network_balances)?
        };
        self.kv
            .set(&storage_key(&[CACHED_BALANCES_PRIVATE_KEY, network]), &snapshot)
            .context("Failed to cache private balances")
    }

    pub fn public_balances(&self, network: &str) -> WalletTokenBalances {
        self.state
            .lock()
            .public
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    pub fn private_balances(&self, network: &str) -> WalletPrivateBalances {
        self.state
            .lock()
            .private
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    pub fn token_balances(
        &self,
        network: &str,
        wallet_id: &str,
        is_private: bool,
        version: ProtocolVersion,
        bucket_filter: &[BalanceBucket],
    ) -> TokenBalances {
        let state = self.state.lock();
        let empty_public = WalletTokenBalances::new();
        let empty_private = WalletPrivateBalances::new();
        token_balances_for_wallet_and_state(
            wallet_id,
            state.public.get(network).unwrap_or(&empty_public),
            state.private.get(network).unwrap_or(&empty_private),
            is_private,
            version,
            bucket_filter,
        )
    }

    /// Restores the cached snapshot for `network`. Returns whether anything was found.
    pub fn load_cached(&self, network: &str) -> anyhow::Result<bool> {
        let public = self
            .kv
            .get(&storage_key(&[CACHED_BALANCES_KEY, network]))?
            .map(|json| serde_json::from_str::<WalletTokenBalances>(&json))
            .transpose()
            .context("Corrupt public balance cache")?;
        let private = self
            .kv
            .get(&storage_key(&[CACHED_BALANCES_PRIVATE_KEY, network]))?
            .map(|json| serde_json::from_str::<WalletPrivateBalances>(&json))
            .transpose()
            .context("Corrupt private balance cache")?;

        let found = public.is_some() || private.is_some();
        let mut state = self.state.lock();
        if let Some(public) = public {
            state.public.insert(network.to_string(), public);
        }
        if let Some(private) = private {
            state.private.insert(network.to_string(), private);
        }
        if found {
            log::info!("Balances: restored cached balances for {}", network);
        }
        Ok(found)
    }
}
