//! # Private History Items
//!
//! Decrypted history as reported by the privacy engine for one wallet.

use super::amount::{deserialize_magnitude, deserialize_optional_magnitude, Amount};
use super::privacy::{BalanceBucket, ProtocolVersion};
use super::transaction::NftTokenType;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HistoryCategory {
    ShieldERC20s,
    UnshieldERC20s,
    TransferSendERC20s,
    TransferReceiveERC20s,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTokenAmount {
    pub token_address: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReceiveAmount {
    pub token_address: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(default, deserialize_with = "deserialize_optional_magnitude")]
    pub shield_fee: Option<Amount>,
    #[serde(default)]
    pub memo_text: Option<String>,
    #[serde(default)]
    pub sender_address: Option<String>,
    #[serde(rename = "hasValidPOIForActiveLists")]
    pub has_valid_poi: bool,
    pub balance_bucket: BalanceBucket,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySendAmount {
    pub token_address: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(default)]
    pub recipient_address: Option<String>,
    #[serde(default)]
    pub memo_text: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUnshieldAmount {
    pub token_address: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(default)]
    pub recipient_address: Option<String>,
    #[serde(default)]
    pub memo_text: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_magnitude")]
    pub unshield_fee: Option<Amount>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChangeAmount {
    pub token_address: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(rename = "hasValidPOIForActiveLists")]
    pub has_valid_poi: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReceiveNftAmount {
    pub nft_address: String,
    pub nft_token_type: NftTokenType,
    #[serde(rename = "tokenSubID")]
    pub token_sub_id: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(default)]
    pub memo_text: Option<String>,
    #[serde(default)]
    pub sender_address: Option<String>,
    #[serde(rename = "hasValidPOIForActiveLists")]
    pub has_valid_poi: bool,
    pub balance_bucket: BalanceBucket,
}

/// NFT leaving the wallet, by private transfer or unshield.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySendNftAmount {
    pub nft_address: String,
    pub nft_token_type: NftTokenType,
    #[serde(rename = "tokenSubID")]
    pub token_sub_id: String,
    #[serde(deserialize_with = "deserialize_magnitude")]
    pub amount: Amount,
    #[serde(default)]
    pub recipient_address: Option<String>,
    #[serde(default)]
    pub memo_text: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub txid: String,
    #[serde(rename = "txidVersion")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// History schema version of the privacy engine
    pub version: u32,
    pub category: HistoryCategory,
    #[serde(default, rename = "receiveERC20Amounts")]
    pub receive_amounts: Vec<HistoryReceiveAmount>,
    #[serde(default, rename = "transferERC20Amounts")]
    pub transfer_amounts: Vec<HistorySendAmount>,
    #[serde(default, rename = "unshieldERC20Amounts")]
    pub unshield_amounts: Vec<HistoryUnshieldAmount>,
    #[serde(default, rename = "changeERC20Amounts")]
    pub change_amounts: Vec<HistoryChangeAmount>,
    #[serde(default, rename = "receiveNFTAmounts")]
    pub receive_nft_amounts: Vec<HistoryReceiveNftAmount>,
    #[serde(default, rename = "transferNFTAmounts")]
    pub transfer_nft_amounts: Vec<HistorySendNftAmount>,
    #[serde(default, rename = "unshieldNFTAmounts")]
    pub unshield_nft_amounts: Vec<HistorySendNftAmount>,
    #[serde(default, rename = "broadcasterFeeERC20Amount")]
    pub broadcaster_fee_amount: Option<HistoryTokenAmount>,
}

impl HistoryItem {
    /// True when any receive-type output still lacks a valid privacy proof.
    pub fn has_unproven_outputs(&self) -> bool {
        self.receive_amounts.iter().any(|r| !r.has_valid_poi)
            || self.receive_nft_amounts.iter().any(|r| !r.has_valid_poi)
            || self.change_amounts.iter().any(|c| !c.has_valid_poi)
    }

    /// Bucket the item's unproven funds currently sit in.
    pub fn non_spendable_bucket(&self) -> BalanceBucket {
        if self.change_amounts.iter().any(|c| !c.has_valid_poi) {
            return BalanceBucket::MissingInternalPOI;
        }
        BalanceBucket::ALL
            .iter()
            .copied()
            .filter(|bucket| bucket.is_non_spendable())
            .find(|bucket| {
                self.receive_amounts.iter().any(|r| r.balance_bucket == *bucket)
                    || self
                        .receive_nft_amounts
                        .iter()
                        .any(|r| r.balance_bucket == *bucket)
            })
            .unwrap_or(BalanceBucket::Spendable)
    }
}
