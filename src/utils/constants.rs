//! # Engine Constants
//!
//! All global constants used by the transaction lifecycle engine.

// ============================================================================
// Transaction Watcher
// ============================================================================

/// Poll budget for one watch round (minutes)
pub const TIMEOUT_MIN_WATCH_PENDING: u64 = 10;

/// Delay between receipt polls (seconds)
pub const RETRY_DELAY_SEC_GET_TX_FROM_HASH: u64 = 15;

/// Timed-out transactions younger than this are re-armed on load (seconds, 24 hours)
pub const TIMEOUT_SEC_WATCH_TX_EXPIRATION: u64 = 24 * 3600;

// ============================================================================
// Balance Update Scheduler
// ============================================================================

/// Collapse enqueue bursts within this window into one flush (milliseconds)
pub const DEFAULT_BURST_WINDOW_MS: u64 = 500;

/// Minimum time between two refreshes of the same token (milliseconds)
pub const DEFAULT_TOKEN_COOLDOWN_MS: u64 = 15_000;

/// Eligible token count at which one batched query replaces per-token queries
pub const DEFAULT_MULTICALL_THRESHOLD: usize = 3;

/// Maximum tokens refreshed by a single flush
pub const DEFAULT_MAX_BATCH_SIZE: usize = 25;

// ============================================================================
// History Synchronization
// ============================================================================

/// Schema version of synced transactions. Bump to force a full resync.
pub const SAVED_TRANSACTION_CURRENT_VERSION: u64 = 4;

/// Placeholder timestamp for history items the privacy engine could not date
pub const TIMESTAMP_MISSING_VALUE: u64 = 0;

/// Receipt-detail lookups allowed per sync pass to backfill missing timestamps
pub const MAX_TIMESTAMP_ARCHIVE_NODE_LOOP_LOOKUPS: usize = 10;

// ============================================================================
// Storage Keys
// ============================================================================

pub const SAVED_TRANSACTIONS_KEY: &str = "saved_transactions";
pub const LAST_NONCE_KEY: &str = "last_nonce";
pub const MISSING_TIMESTAMP_KEY: &str = "missing_timestamp";
pub const SAVED_TRANSACTION_VERSION_KEY: &str = "saved_transaction_version";
pub const CACHED_BALANCES_KEY: &str = "cached_balances";
pub const CACHED_BALANCES_PRIVATE_KEY: &str = "cached_balances_private";
pub const TX_RECEIPT_DETAILS_KEY: &str = "tx_receipt_details";
pub const ENGINE_SETTINGS_KEY: &str = "engine_settings";
pub const SHIELD_COUNTDOWN_KEY: &str = "shield_countdown";

// ============================================================================
// Tokens
// ============================================================================

/// Balance-map key used for the chain's native token
pub const BASE_TOKEN_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// keccak256("Transfer(address,address,uint256)")
pub const ERC20_TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `balanceOf(address)` selector
pub const ERC20_BALANCE_OF_SELECTOR: &str = "70a08231";

/// `decimals()` selector
pub const ERC20_DECIMALS_SELECTOR: &str = "313ce567";

// ============================================================================
// Logging
// ============================================================================

pub const DEFAULT_LOG_SPEC: &str = "info, shielded_wallet_engine=debug";
pub const DEFAULT_LOG_DIRECTORY: &str = "logs";
pub const LOG_BASENAME: &str = "wallet-engine";

/// Rotate log files at this size (10 MB)
pub const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated log files to keep
pub const LOG_KEEP_FILES: usize = 7;

/// Joins key segments with the separator used by every persisted key.
pub fn storage_key(parts: &[&str]) -> String {
    parts.join("|")
}
