//! # Token Amounts
//!
//! Arbitrary-precision non-negative integer amounts, serialized as decimal strings.
//! Signed feed amounts are read as magnitudes through [`deserialize_magnitude`].

use num_bigint::BigUint;
use num_traits::{Num, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

#[derive(Debug, thiserror::Error)]
#[error("invalid amount string: {0:?}")]
pub struct ParseAmountError(String);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigUint::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Parses a `0x`-prefixed hex quantity as returned by JSON-RPC nodes.
    /// An empty payload (`0x`) reads as zero.
    pub fn from_hex(value: &str) -> Result<Self, ParseAmountError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        if digits.is_empty() {
            return Ok(Amount::zero());
        }
        BigUint::from_str_radix(digits, 16)
            .map(Amount)
            .map_err(|_| ParseAmountError(value.to_string()))
    }

    /// Parses a decimal or hex string with an optional leading `-`, keeping
    /// only the magnitude.
    pub fn from_signed_str(value: &str) -> Result<Self, ParseAmountError> {
        let trimmed = value.trim();
        let magnitude = trimmed.strip_prefix('-').unwrap_or(trimmed);
        Amount::from_str(magnitude).map_err(|_| ParseAmountError(value.to_string()))
    }

    /// Reads a big-endian unsigned word, e.g. the data of an ERC-20 `Transfer` log.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Amount(BigUint::from_bytes_be(bytes))
    }

    pub fn saturating_sub(&self, other: &Amount) -> Amount {
        if self.0 > other.0 {
            Amount(&self.0 - &other.0)
        } else {
            Amount::zero()
        }
    }

    /// Absolute difference between two amounts.
    pub fn abs_diff(&self, other: &Amount) -> Amount {
        if self.0 >= other.0 {
            Amount(&self.0 - &other.0)
        } else {
            Amount(&other.0 - &self.0)
        }
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(BigUint::from(value))
    }
}

impl From<BigUint> for Amount {
    fn from(value: BigUint) -> Self {
        Amount(value)
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            return Amount::from_hex(trimmed);
        }
        BigUint::from_str(trimmed)
            .map(Amount)
            .map_err(|_| ParseAmountError(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(self.0 + &rhs.0)
    }
}

impl<'a> AddAssign<&'a Amount> for Amount {
    fn add_assign(&mut self, rhs: &'a Amount) {
        self.0 += &rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

struct AmountVisitor {
    signed: bool,
}

impl<'de> de::Visitor<'de> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a decimal amount string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        if self.signed {
            Amount::from_signed_str(v).map_err(E::custom)
        } else {
            Amount::from_str(v).map_err(E::custom)
        }
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        Ok(Amount::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        if v < 0 && !self.signed {
            return Err(E::invalid_value(de::Unexpected::Signed(v), &self));
        }
        Ok(Amount::from(v.unsigned_abs()))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor { signed: false })
    }
}

/// `deserialize_with` for history feed amounts, which may carry a sign. The
/// line item's kind already gives the direction, so only the magnitude is kept.
pub fn deserialize_magnitude<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
    deserializer.deserialize_any(AmountVisitor { signed: true })
}

/// Optional variant of [`deserialize_magnitude`] for fee fields.
pub fn deserialize_optional_magnitude<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Amount>, D::Error> {
    #[derive(Deserialize)]
    struct Signed(#[serde(deserialize_with = "deserialize_magnitude")] Amount);

    Ok(Option::<Signed>::deserialize(deserializer)?.map(|Signed(amount)| amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_serializes_as_decimal_string() {
        let amount = Amount::from_str("340282366920938463463374607431768211456").unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_amount_hex_and_empty_payload() {
        assert_eq!(Amount::from_hex("0x0de0b6b3a7640000").unwrap(), Amount::from(10u64.pow(18)));
        assert!(Amount::from_hex("0x").unwrap().is_zero());
        assert!(Amount::from_str("-5").is_err());
    }

    #[test]
    fn test_signed_feed_amounts_keep_magnitude() {
        #[derive(Deserialize)]
        struct Line {
            #[serde(deserialize_with = "deserialize_magnitude")]
            amount: Amount,
            #[serde(default, deserialize_with = "deserialize_optional_magnitude")]
            fee: Option<Amount>,
        }

        let line: Line = serde_json::from_str(r#"{"amount":"-150","fee":"-3"}"#).unwrap();
        assert_eq!(line.amount, Amount::from(150));
        assert_eq!(line.fee, Some(Amount::from(3)));

        let line: Line = serde_json::from_str(r#"{"amount":-7,"fee":null}"#).unwrap();
        assert_eq!(line.amount, Amount::from(7));
        assert_eq!(line.fee, None);

        let line: Line = serde_json::from_str(r#"{"amount":"42"}"#).unwrap();
        assert_eq!(line.amount, Amount::from(42));
        assert_eq!(line.fee, None);

        assert!(serde_json::from_str::<Line>(r#"{"amount":"--1"}"#).is_err());
        // Balance amounts stay unsigned
        assert!(serde_json::from_str::<Amount>("-7").is_err());
        assert!(serde_json::from_str::<Amount>(r#""-7""#).is_err());
    }

    #[test]
    fn test_amount_saturating_sub_and_abs_diff() {
        let a = Amount::from(10);
        let b = Amount::from(15);
        assert!(a.saturating_sub(&b).is_zero());
        assert_eq!(b.saturating_sub(&a), Amount::from(5));
        assert_eq!(a.abs_diff(&b), Amount::from(5));
    }
}
