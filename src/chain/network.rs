//! # Networks

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    /// 0 for EVM chains
    pub chain_type: u8,
    pub id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub public_name: String,
    pub chain: Chain,
    /// Whether shielded funds must clear a privacy proof before becoming spendable
    #[serde(default)]
    pub poi_required: bool,
    #[serde(default)]
    pub base_token_symbol: String,
}

impl Network {
    pub fn evm(name: &str, public_name: &str, chain_id: u64) -> Self {
        Network {
            name: name.to_string(),
            public_name: public_name.to_string(),
            chain: Chain {
                chain_type: 0,
                id: chain_id,
            },
            poi_required: false,
            base_token_symbol: "ETH".to_string(),
        }
    }
}
