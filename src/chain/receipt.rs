//! # Transaction Receipts
//!
//! Mined-transaction receipts, gas fee math and ERC-20 `Transfer` log decoding.

use super::amount::Amount;
use super::transaction::TokenAmount;
use crate::utils::constants::ERC20_TRANSFER_TOPIC;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    /// `true` when the transaction executed without reverting
    pub status: bool,
    pub gas_used: Amount,
    pub effective_gas_price: Amount,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

impl TransactionReceipt {
    pub fn gas_fee(&self) -> Amount {
        Amount::from(self.gas_used.as_biguint() * self.effective_gas_price.as_biguint())
    }
}

/// Timestamp and fee recovered for a mined transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptDetails {
    pub timestamp: u64,
    #[serde(rename = "gasFeeString")]
    pub gas_fee: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptTransfer {
    pub token_address: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Amount,
}

/// Last 20 bytes of a 32-byte topic, as a lowercase `0x` address.
fn topic_to_address(topic: &str) -> Option<String> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 || !digits.is_ascii() {
        return None;
    }
    Some(format!("0x{}", digits.get(24..)?.to_lowercase()))
}

/// Decodes every ERC-20 `Transfer` event in the receipt. NFT transfers
/// (value in a fourth topic) and malformed logs are skipped.
pub fn transfers_from_receipt(receipt: &TransactionReceipt) -> Vec<ReceiptTransfer> {
    receipt
        .logs
        .iter()
        .filter_map(|log| {
            if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(ERC20_TRANSFER_TOPIC) {
                return None;
            }
            let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
            if data.is_empty() || data.len() > 32 {
                return None;
            }
            Some(ReceiptTransfer {
                token_address: log.address.to_lowercase(),
                from_address: topic_to_address(&log.topics[1])?,
                to_address: topic_to_address(&log.topics[2])?,
                amount: Amount::from_be_bytes(&data),
            })
        })
        .collect()
}

/// Confirms the bought amount of a swap from the receipt's transfer logs.
///
/// Private swaps settle through a relay contract, so the transfer closest to
/// the quoted amount is taken. Public swaps total everything of that token
/// received by `wallet_address`.
pub fn find_token_transfer_amount(
    receipt: &TransactionReceipt,
    estimate: &TokenAmount,
    wallet_address: &str,
    is_private: bool,
) -> Option<TokenAmount> {
    let transfers: Vec<ReceiptTransfer> = transfers_from_receipt(receipt)
        .into_iter()
        .filter(|t| estimate.token.matches_address(&t.token_address))
        .collect();

    let amount = if is_private {
        transfers
            .iter()
            .min_by(|a, b| {
                a.amount
                    .abs_diff(&estimate.amount)
                    .cmp(&b.amount.abs_diff(&estimate.amount))
            })
            .map(|t| t.amount.clone())
    } else {
        let total: Amount = transfers
            .iter()
            .filter(|t| t.to_address.eq_ignore_ascii_case(wallet_address))
            .map(|t| t.amount.clone())
            .sum();
        if total.is_zero() {
            None
        } else {
            Some(total)
        }
    }?;

    Some(TokenAmount::new(estimate.token.clone(), amount))
}
