//! # Wallet Data Structures
//!
//! Core types: amounts, saved transactions, receipts, private history items.

pub mod amount;
pub mod history;
pub mod network;
pub mod privacy;
pub mod receipt;
pub mod transaction;

pub use amount::*;
pub use history::*;
pub use network::*;
pub use privacy::*;
pub use receipt::*;
pub use transaction::*;
