//! # Privacy Protocol Axes
//!
//! Balance buckets and protocol versions. Both are closed enums so balance maps
//! can be fixed-size arrays indexed by them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutually exclusive partitions of a private balance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BalanceBucket {
    Spendable,
    ShieldPending,
    ShieldBlocked,
    ProofSubmitted,
    MissingInternalPOI,
    MissingExternalPOI,
    Spent,
}

impl BalanceBucket {
    pub const COUNT: usize = 7;

    pub const ALL: [BalanceBucket; BalanceBucket::COUNT] = [
        BalanceBucket::Spendable,
        BalanceBucket::ShieldPending,
        BalanceBucket::ShieldBlocked,
        BalanceBucket::ProofSubmitted,
        BalanceBucket::MissingInternalPOI,
        BalanceBucket::MissingExternalPOI,
        BalanceBucket::Spent,
    ];

    pub fn index(self) -> usize {
        match self {
            BalanceBucket::Spendable => 0,
            BalanceBucket::ShieldPending => 1,
            BalanceBucket::ShieldBlocked => 2,
            BalanceBucket::ProofSubmitted => 3,
            BalanceBucket::MissingInternalPOI => 4,
            BalanceBucket::MissingExternalPOI => 5,
            BalanceBucket::Spent => 6,
        }
    }

    /// Everything except Spendable and Spent is waiting on a privacy proof.
    pub fn is_non_spendable(self) -> bool {
        !matches!(self, BalanceBucket::Spendable | BalanceBucket::Spent)
    }
}

impl fmt::Display for BalanceBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Proof scheme securing a private balance. The two versions are never merged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVersion {
    #[serde(rename = "V2_PoseidonMerkle")]
    V2PoseidonMerkle,
    #[serde(rename = "V3_PoseidonMerkle")]
    V3PoseidonMerkle,
}

impl ProtocolVersion {
    pub const COUNT: usize = 2;

    pub const ALL: [ProtocolVersion; ProtocolVersion::COUNT] =
        [ProtocolVersion::V2PoseidonMerkle, ProtocolVersion::V3PoseidonMerkle];

    pub fn index(self) -> usize {
        match self {
            ProtocolVersion::V2PoseidonMerkle => 0,
            ProtocolVersion::V3PoseidonMerkle => 1,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V2PoseidonMerkle
    }
}
