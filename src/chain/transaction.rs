//! # Saved Transactions
//!
//! Locally tracked transaction records and their token line items.

use super::amount::Amount;
use super::history::HistoryCategory;
use super::privacy::{BalanceBucket, ProtocolVersion};
use crate::utils::constants::BASE_TOKEN_ADDRESS;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TransactionAction {
    #[serde(alias = "send")]
    Transfer,
    Receive,
    Shield,
    Unshield,
    Swap,
    Approve,
    Cancel,
    Synced,
    SyncedIncoming,
    SyncedOutgoing,
}

impl TransactionAction {
    /// Actions produced by history sync. A full resync removes all of them.
    pub fn is_synced(self) -> bool {
        matches!(
            self,
            TransactionAction::Synced
                | TransactionAction::SyncedIncoming
                | TransactionAction::SyncedOutgoing
        )
    }
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionAction::Transfer => "Send",
            TransactionAction::Receive => "Receive",
            TransactionAction::Shield => "Shield",
            TransactionAction::Unshield => "Unshield",
            TransactionAction::Swap => "Swap",
            TransactionAction::Approve => "Approve",
            TransactionAction::Cancel => "Cancel",
            TransactionAction::Synced => "Synced",
            TransactionAction::SyncedIncoming => "Synced incoming",
            TransactionAction::SyncedOutgoing => "Synced outgoing",
        };
        f.write_str(label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub address: String,
    #[serde(default)]
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub is_base_token: bool,
    /// Resolved only from chain data, not from a wallet's added tokens
    #[serde(default)]
    pub is_address_only: bool,
}

impl Token {
    pub fn address_only(address: &str, decimals: u8) -> Self {
        Token {
            address: address.to_lowercase(),
            symbol: String::new(),
            decimals,
            is_base_token: false,
            is_address_only: true,
        }
    }

    /// Key under which this token's balance is stored.
    pub fn balance_key(&self) -> String {
        if self.is_base_token {
            BASE_TOKEN_ADDRESS.to_string()
        } else {
            self.address.to_lowercase()
        }
    }

    pub fn matches_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmount {
    pub token: Token,
    #[serde(rename = "amountString")]
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_text: Option<String>,
}

impl TokenAmount {
    pub fn new(token: Token, amount: Amount) -> Self {
        TokenAmount {
            token,
            amount,
            recipient_address: None,
            sender_address: None,
            memo_text: None,
        }
    }
}

/// NFT standard, encoded as the numeric tag the privacy engine uses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum NftTokenType {
    Erc721,
    Erc1155,
}

impl TryFrom<u8> for NftTokenType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NftTokenType::Erc721),
            2 => Ok(NftTokenType::Erc1155),
            other => Err(format!("unknown NFT token type {}", other)),
        }
    }
}

impl From<NftTokenType> for u8 {
    fn from(value: NftTokenType) -> u8 {
        match value {
            NftTokenType::Erc721 => 1,
            NftTokenType::Erc1155 => 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NftAmount {
    pub nft_address: String,
    pub nft_token_type: NftTokenType,
    #[serde(rename = "tokenSubID")]
    pub token_sub_id: String,
    #[serde(rename = "amountString")]
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_text: Option<String>,
}

/// A locally tracked transaction, keyed by its chain hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedTransaction {
    pub id: String,
    pub network: String,
    pub wallet_address: String,
    pub action: TransactionAction,
    pub status: TransactionStatus,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub token_amounts: Vec<TokenAmount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_receive_token_amounts: Vec<TokenAmount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nft_amount_recipients: Vec<NftAmount>,
    #[serde(
        default,
        rename = "syncedReceiveNFTAmountRecipients",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub synced_receive_nft_amount_recipients: Vec<NftAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rail_fee_token_amounts: Option<Vec<TokenAmount>>,
    #[serde(default, alias = "relayerFeeTokenAmount", skip_serializing_if = "Option::is_none")]
    pub broadcaster_fee_token_amount: Option<TokenAmount>,
    #[serde(default, alias = "relayerRailgunAddress", skip_serializing_if = "Option::is_none")]
    pub broadcaster_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    pub timestamp: u64,
    #[serde(default)]
    pub found_by_sync: bool,
    #[serde(default)]
    pub cancelling: bool,
    #[serde(default, rename = "cancelTransactionID", skip_serializing_if = "Option::is_none")]
    pub cancel_transaction_id: Option<String>,
    #[serde(default, alias = "sentViaRelayer")]
    pub sent_via_broadcaster: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_bucket: Option<BalanceBucket>,
    #[serde(default, rename = "txidVersion", skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<ProtocolVersion>,
    #[serde(default, rename = "publicExecutionGasFeeString", skip_serializing_if = "Option::is_none")]
    pub public_execution_gas_fee: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_wallet_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_sell_token_amount: Option<TokenAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_buy_token_amount: Option<TokenAmount>,
    #[serde(default)]
    pub confirmed_swap_value: bool,
    #[serde(default)]
    pub needs_relay_adapt_success_check: bool,
    #[serde(default)]
    pub synced_from_private_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_history_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_category: Option<HistoryCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_error_message: Option<String>,
}

impl SavedTransaction {
    /// A freshly submitted transaction awaiting its receipt.
    pub fn pending(
        id: &str,
        network: &str,
        wallet_address: &str,
        action: TransactionAction,
        token_amounts: Vec<TokenAmount>,
        timestamp: u64,
    ) -> Self {
        SavedTransaction {
            id: id.to_string(),
            network: network.to_string(),
            wallet_address: wallet_address.to_string(),
            action,
            status: TransactionStatus::Pending,
            is_private: false,
            token_amounts,
            synced_receive_token_amounts: Vec::new(),
            nft_amount_recipients: Vec::new(),
            synced_receive_nft_amount_recipients: Vec::new(),
            rail_fee_token_amounts: None,
            broadcaster_fee_token_amount: None,
            broadcaster_address: None,
            nonce: None,
            timestamp,
            found_by_sync: false,
            cancelling: false,
            cancel_transaction_id: None,
            sent_via_broadcaster: false,
            balance_bucket: None,
            protocol_version: None,
            public_execution_gas_fee: None,
            to_wallet_address: None,
            swap_sell_token_amount: None,
            swap_buy_token_amount: None,
            confirmed_swap_value: false,
            needs_relay_adapt_success_check: false,
            synced_from_private_history: false,
            synced_history_version: None,
            synced_category: None,
            memo_text: None,
            failed_error_message: None,
        }
    }

    pub fn protocol_version_or_default(&self) -> ProtocolVersion {
        self.protocol_version.unwrap_or_default()
    }

    pub fn first_token(&self) -> Option<&Token> {
        self.token_amounts.first().map(|ta| &ta.token)
    }

    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}
