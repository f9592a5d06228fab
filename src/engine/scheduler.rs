//! # Balance Update Scheduler
//!
//! Debounces token balance refreshes for one (wallet, network) session.
//! Enqueued tokens collect for a burst window, then one flush refreshes every
//! token whose cooldown has passed. Flushes never overlap.

use crate::balances::{BalanceStore, TokenBalances};
use crate::provider::{ChainProvider, Providers};
use crate::state::SchedulerOptions;
use crate::utils::constants::BASE_TOKEN_ADDRESS;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct SchedulerState {
    pending: BTreeSet<String>,
    last_refreshed: HashMap<String, Instant>,
    timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

struct SchedulerInner {
    network: String,
    wallet_id: String,
    owner_address: String,
    providers: Arc<Providers>,
    balances: Arc<BalanceStore>,
    options: SchedulerOptions,
    state: Mutex<SchedulerState>,
    flush_lock: tokio::sync::Mutex<()>,
    flushes: AtomicU64,
}

#[derive(Clone)]
pub struct BalanceUpdateScheduler {
    inner: Arc<SchedulerInner>,
}

impl BalanceUpdateScheduler {
    pub fn new(
        network: &str,
        wallet_id: &str,
        owner_address: &str,
        providers: Arc<Providers>,
        balances: Arc<BalanceStore>,
        options: SchedulerOptions,
    ) -> Self {
        BalanceUpdateScheduler {
            inner: Arc::new(SchedulerInner {
                network: network.to_string(),
                wallet_id: wallet_id.to_string(),
                owner_address: owner_address.to_string(),
                providers,
                balances,
                options,
                state: Mutex::new(SchedulerState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    pub fn network(&self) -> &str {
        &self.inner.network
    }

    pub fn wallet_id(&self) -> &str {
        &self.inner.wallet_id
    }

    /// Queues a token for refresh. The base token is refreshed elsewhere and
    /// is ignored, as is everything after `destroy`.
    pub fn enqueue(&self, token_address: &str) {
        let token = token_address.to_lowercase();
        if token == BASE_TOKEN_ADDRESS {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.pending.insert(token);
        if state.timer.is_none() {
            state.timer = Some(self.inner.arm(self.inner.options.burst_window()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Completed flushes, for diagnostics.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.pending.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        log::debug!(
            "Balance Scheduler: destroyed for {} on {}",
            self.inner.wallet_id,
            self.inner.network
        );
    }
}

impl SchedulerInner {
    fn arm(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush().await;
        })
    }

    async fn flush(self: Arc<Self>) {
        let _flushing = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state.lock();
            state.timer = None;
            if state.destroyed {
                return;
            }
            let now = Instant::now();
            let cooldown = self.options.token_cooldown();
            let mut eligible: Vec<String> = state
                .pending
                .iter()
                .filter(|token| {
                    state
                        .last_refreshed
                        .get(*token)
                        .map_or(true, |at| now.duration_since(*at) >= cooldown)
                })
                .cloned()
                .collect();
            eligible.truncate(self.options.max_batch_size.max(1));
            for token in &eligible {
                state.pending.remove(token);
                state.last_refreshed.insert(token.clone(), now);
            }
            eligible
        };

        if !batch.is_empty() {
            log::debug!(
                "Balance Scheduler: refreshing {} token(s) for {} on {}",
                batch.len(),
                self.wallet_id,
                self.network
            );
            self.refresh(&batch).await;
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        if state.destroyed || state.pending.is_empty() || state.timer.is_some() {
            return;
        }
        let delay = if batch.is_empty() {
            self.remaining_cooldown(&state)
        } else {
            self.options.burst_window()
        };
        state.timer = Some(self.arm(delay));
    }

    /// Time until the first pending token leaves its cooldown.
    fn remaining_cooldown(&self, state: &SchedulerState) -> Duration {
        let now = Instant::now();
        let cooldown = self.options.token_cooldown();
        state
            .pending
            .iter()
            .filter_map(|token| state.last_refreshed.get(token))
            .map(|at| cooldown.saturating_sub(now.duration_since(*at)))
            .min()
            .unwrap_or_else(|| self.options.burst_window())
    }

    async fn refresh(&self, tokens: &[String]) {
        let provider = match self.providers.get(&self.network) {
            Some(provider) => provider,
            None => {
                log::warn!("Balance Scheduler: no provider for {}", self.network);
                return;
            }
        };

        let updated: TokenBalances = if tokens.len() >= self.options.multicall_threshold {
            match provider.batch_balances(&self.owner_address, tokens).await {
                Ok(found) => {
                    let missing = tokens.len().saturating_sub(found.len());
                    if missing > 0 {
                        log::debug!("Balance Scheduler: {} token(s) missing from batch", missing);
                    }
                    found.into_iter().collect()
                }
                Err(e) if e.is_destroyed() => return,
                Err(e) => {
                    log::warn!(
                        "Balance Scheduler: batched balance query failed, falling back: {}",
                        e
                    );
                    self.refresh_each(provider.as_ref(), tokens).await
                }
            }
        } else {
            self.refresh_each(provider.as_ref(), tokens).await
        };

        if updated.is_empty() {
            return;
        }
        if let Err(e) = self
            .balances
            .update_public(&self.network, &self.wallet_id, updated)
        {
            log::error!("Balance Scheduler: failed to store balances: {:#}", e);
        }
    }

    async fn refresh_each(&self, provider: &dyn ChainProvider, tokens: &[String]) -> TokenBalances {
        let mut updated = TokenBalances::new();
        for token in tokens {
            match provider.erc20_balance_of(token, &self.owner_address).await {
                Ok(amount) => {
                    updated.insert(token.clone(), amount);
                }
                Err(e) if e.is_destroyed() => break,
                Err(e) => log::warn!("Balance Scheduler: balance of {} failed: {}", token, e),
            }
        }
        updated
    }
}
