//! Validated primitive types for domain entities.
//!
//! Three newtypes carry the indexer's core quantities between the wire
//! format and the database: [`EthAddress`] for the 20-byte accounts in
//! `Transfer` topics, [`TokenAmount`] for the raw uint256 value word, and
//! [`BlockNumber`] for chain heights. Each validates at the boundary it
//! crosses (log decode, NUMERIC column, BIGINT column) so the rest of the
//! pipeline never re-checks.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ETHEREUM ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// A 20-byte account or contract address, as persisted in BYTEA columns.
///
/// `Transfer` logs carry their addresses left-padded to 32 bytes in
/// topics 1 and 2; [`Self::from_log_topic`] is the decode path that
/// strips that padding. The zero address never names a real account: a
/// zero sender marks a mint, a zero recipient a burn.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EthAddress([u8; 20]);

impl EthAddress {
    /// The zero address, the mint/burn sentinel.
    pub const ZERO: Self = Self([0; 20]);

    /// Wrap raw address bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Extract the address from an indexed log topic.
    ///
    /// Topics store addresses in the low 20 bytes of the 32-byte word;
    /// the high 12 bytes are zero padding.
    #[must_use]
    pub fn from_log_topic(word: B256) -> Self {
        let mut bytes = [0_u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Self(bytes)
    }

    /// Rehydrate from a database BYTEA value.
    ///
    /// # Errors
    /// Returns [`InvalidAddress::BadLength`] unless the value is exactly
    /// 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidAddress> {
        match <[u8; 20]>::try_from(bytes) {
            Ok(array) => Ok(Self(array)),
            Err(_) => Err(InvalidAddress::BadLength(bytes.len())),
        }
    }

    /// Parse a hex representation, `0x`-prefixed or bare.
    ///
    /// # Errors
    /// Returns [`InvalidAddress`] for non-hex input or any length other
    /// than 40 nibbles.
    pub fn from_hex(text: &str) -> Result<Self, InvalidAddress> {
        let nibbles = text.strip_prefix("0x").unwrap_or(text);
        let bytes = hex::decode(nibbles)
            .map_err(|e| InvalidAddress::BadHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// The raw bytes, for BYTEA binding.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this is the mint/burn sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthAddress({self})")
    }
}

impl From<Address> for EthAddress {
    fn from(address: Address) -> Self {
        Self(*address.0)
    }
}

impl From<EthAddress> for Address {
    fn from(address: EthAddress) -> Self {
        Self::from(address.0)
    }
}

impl From<EthAddress> for String {
    fn from(address: EthAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for EthAddress {
    type Error = InvalidAddress;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::from_hex(&text)
    }
}

/// Error for invalid Ethereum addresses.
#[derive(Debug, Clone, Error)]
pub enum InvalidAddress {
    /// The value was not exactly 20 bytes.
    #[error("expected 20 address bytes, found {0}")]
    BadLength(usize),
    /// The text was not valid hex.
    #[error("address is not valid hex: {0}")]
    BadHex(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN AMOUNT
// ═══════════════════════════════════════════════════════════════════════════════

/// A raw ERC-20 transfer amount: the uint256 data word, unscaled.
///
/// Amounts persist to NUMERIC(78, 0) exactly as they appear on the wire;
/// the invariant is therefore "non-negative integer", and both
/// constructors enforce it. Applying a token's decimals is a display
/// concern handled by [`Self::scaled`], never by storage.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAmount(BigDecimal);

impl TokenAmount {
    /// The zero amount.
    #[must_use]
    pub fn zero() -> Self {
        Self(0.into())
    }

    /// Validate an arbitrary decimal as a raw amount.
    ///
    /// # Errors
    /// Rejects negative values and values with a fractional part; raw
    /// token units are whole numbers by construction.
    pub fn new(value: BigDecimal) -> Result<Self, InvalidAmount> {
        if value < BigDecimal::from(0) {
            return Err(InvalidAmount::Negative);
        }
        if !value.is_integer() {
            return Err(InvalidAmount::Fractional);
        }
        Ok(Self(value))
    }

    /// Parse a decimal string (the serde and test entry point).
    ///
    /// # Errors
    /// See [`Self::new`]; unparseable text is [`InvalidAmount::Unparseable`].
    pub fn parse(text: &str) -> Result<Self, InvalidAmount> {
        BigDecimal::from_str(text)
            .map_err(|_| InvalidAmount::Unparseable)
            .and_then(Self::new)
    }

    /// Decode the 32-byte data word of a `Transfer` log.
    ///
    /// Infallible: every uint256 is a valid amount.
    #[must_use]
    pub fn from_u256(word: U256) -> Self {
        // Route through the decimal string; U256 has no direct BigDecimal
        // bridge.
        Self(word.to_string().parse().unwrap_or_default())
    }

    /// Back to a uint256, saturating at `U256::MAX`.
    ///
    /// Only lossy for values that never came from a real log (hand-edited
    /// rows wider than 256 bits).
    #[must_use]
    pub fn to_u256(&self) -> U256 {
        U256::from_str(&self.0.with_scale(0).to_string()).unwrap_or(U256::MAX)
    }

    /// Human-readable value under the token's decimals.
    #[must_use]
    pub fn scaled(&self, decimals: u8) -> BigDecimal {
        &self.0 / BigDecimal::from(10_u64.pow(u32::from(decimals.min(18))))
    }

    /// Whether this is the zero amount.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == BigDecimal::from(0)
    }

    /// Bind-ready NUMERIC value.
    ///
    /// `sqlx` bundles its own `BigDecimal` vintage, so the decimal string
    /// is the interchange between the two types.
    #[must_use]
    pub fn to_bigdecimal(&self) -> sqlx::types::BigDecimal {
        self.0.to_string().parse().unwrap_or_default()
    }

    /// Rehydrate from a NUMERIC column.
    ///
    /// The schema constrains the column to non-negative integers, so a
    /// value that fails validation here is corrupt; it degrades to zero
    /// rather than poisoning the row.
    #[must_use]
    pub fn from_bigdecimal(value: &sqlx::types::BigDecimal) -> Self {
        Self::parse(&value.to_string()).unwrap_or_else(|_| Self::zero())
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenAmount({self})")
    }
}

impl Default for TokenAmount {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<U256> for TokenAmount {
    fn from(word: U256) -> Self {
        Self::from_u256(word)
    }
}

impl From<TokenAmount> for String {
    fn from(amount: TokenAmount) -> Self {
        amount.to_string()
    }
}

impl TryFrom<String> for TokenAmount {
    type Error = InvalidAmount;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text)
    }
}

/// Error for invalid token amounts.
#[derive(Debug, Clone, Copy, Error)]
pub enum InvalidAmount {
    /// Raw amounts are unsigned.
    #[error("raw token amounts cannot be negative")]
    Negative,
    /// Raw amounts are whole uint256 values.
    #[error("raw token amounts cannot have a fractional part")]
    Fractional,
    /// The text was not a decimal number at all.
    #[error("not a decimal number")]
    Unparseable,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK NUMBER
// ═══════════════════════════════════════════════════════════════════════════════

/// A chain height.
///
/// Arithmetic on heights saturates toward genesis: walking below block 0
/// (reorg walk-backs, the watchdog's safety margin) pins at 0 instead of
/// wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockNumber(u64);

impl BlockNumber {
    /// Wrap a height.
    #[must_use]
    pub const fn new(height: u64) -> Self {
        Self(height)
    }

    /// The raw height.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The child height.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The parent height (genesis is its own parent).
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Walk `depth` blocks toward genesis, pinning at 0.
    ///
    /// This is the watchdog's `head - safety_margin` and the guard's
    /// reorg walk-back step.
    #[must_use]
    pub const fn back(&self, depth: u64) -> Self {
        Self(self.0.saturating_sub(depth))
    }

    /// How far this height is ahead of `other`; 0 when it is not.
    #[must_use]
    pub const fn distance_from(&self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl From<u64> for BlockNumber {
    fn from(height: u64) -> Self {
        Self(height)
    }
}

impl From<BlockNumber> for u64 {
    fn from(number: BlockNumber) -> Self {
        number.0
    }
}

/// BIGINT binding for the `blocks.number` and checkpoint columns.
impl From<BlockNumber> for i64 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(number: BlockNumber) -> Self {
        number.0 as Self
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    mod eth_address_tests {
        use super::*;

        #[test]
        fn log_topic_decoding_strips_the_padding() {
            // An address topic is 12 zero bytes then the 20 address bytes,
            // exactly what alloy's into_word produces
            let sender = Address::from([0xAB; 20]);
            let topic = B256::from(sender.into_word());

            let decoded = EthAddress::from_log_topic(topic);
            assert_eq!(decoded, sender.into());
            assert_eq!(decoded.as_bytes(), &[0xAB; 20]);
        }

        #[test]
        fn zero_topic_decodes_to_the_mint_sentinel() {
            let decoded = EthAddress::from_log_topic(B256::ZERO);
            assert!(decoded.is_zero());
            assert_eq!(decoded, EthAddress::ZERO);
        }

        #[test]
        fn database_bytes_round_trip() {
            let address = EthAddress::new([0x42; 20]);
            let rehydrated = EthAddress::from_slice(address.as_bytes()).unwrap();
            assert_eq!(rehydrated, address);
        }

        #[test]
        fn truncated_column_value_is_rejected() {
            let err = EthAddress::from_slice(&[0x42; 19]).unwrap_err();
            assert!(matches!(err, InvalidAddress::BadLength(19)));
        }

        #[test]
        fn serde_uses_the_hex_string_form() {
            let address = EthAddress::new([0x0F; 20]);
            let json = serde_json::to_string(&address).unwrap();
            assert_eq!(json, "\"0x0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f\"");

            let back: EthAddress = serde_json::from_str(&json).unwrap();
            assert_eq!(back, address);
        }

        #[test]
        fn hex_parsing_accepts_bare_and_prefixed() {
            let bare = EthAddress::from_hex("00000000000000000000000000000000000000ff").unwrap();
            let prefixed =
                EthAddress::from_hex("0x00000000000000000000000000000000000000ff").unwrap();
            assert_eq!(bare, prefixed);
        }

        #[test]
        fn hex_parsing_rejects_garbage() {
            assert!(EthAddress::from_hex("0xnot-an-address").is_err());
            assert!(EthAddress::from_hex("0x1234").is_err());
        }
    }

    mod token_amount_tests {
        use super::*;

        #[test]
        fn data_word_round_trips_at_full_width() {
            let word = U256::MAX;
            let amount = TokenAmount::from_u256(word);
            assert_eq!(amount.to_u256(), word);
            // 78 decimal digits, matching the NUMERIC(78, 0) column
            assert_eq!(amount.to_string().len(), 78);
        }

        #[test]
        fn amounts_are_whole_numbers() {
            assert!(TokenAmount::parse("1000").is_ok());
            assert!(matches!(
                TokenAmount::parse("1.5"),
                Err(InvalidAmount::Fractional)
            ));
            assert!(matches!(
                TokenAmount::parse("-3"),
                Err(InvalidAmount::Negative)
            ));
            assert!(matches!(
                TokenAmount::parse("wei"),
                Err(InvalidAmount::Unparseable)
            ));
        }

        #[test]
        fn numeric_column_round_trip() {
            let amount = TokenAmount::from_u256(U256::from(123_456_789_u64));
            let column = amount.to_bigdecimal();
            assert_eq!(TokenAmount::from_bigdecimal(&column), amount);
        }

        #[test]
        fn corrupt_column_value_degrades_to_zero() {
            let negative: sqlx::types::BigDecimal = "-5".parse().unwrap();
            assert!(TokenAmount::from_bigdecimal(&negative).is_zero());
        }

        #[test]
        fn scaling_is_display_only() {
            // 1.5 tokens of an 18-decimal asset, stored raw
            let amount = TokenAmount::from_u256(U256::from(1_500_000_000_000_000_000_u128));
            assert_eq!(amount.scaled(18).to_string(), "1.5");
            // Storage itself stays unscaled
            assert_eq!(amount.to_string(), "1500000000000000000");
        }

        #[test]
        fn ordering_follows_magnitude() {
            let small = TokenAmount::parse("100").unwrap();
            let large = TokenAmount::parse("200").unwrap();
            assert!(small < large);
            assert!(TokenAmount::zero() < small);
        }
    }

    mod block_number_tests {
        use super::*;

        #[test]
        fn child_and_parent_heights() {
            let height = BlockNumber::new(100);
            assert_eq!(height.next().value(), 101);
            assert_eq!(height.prev().value(), 99);
        }

        #[test]
        fn genesis_is_its_own_parent() {
            assert_eq!(BlockNumber::new(0).prev().value(), 0);
        }

        #[test]
        fn walk_back_pins_at_genesis() {
            // The watchdog's head - safety_margin computation
            let head = BlockNumber::new(29_948);
            assert_eq!(head.back(6).value(), 29_942);
            // A shallow chain cannot be walked below genesis
            assert_eq!(BlockNumber::new(3).back(128).value(), 0);
        }

        #[test]
        fn gap_measurement_is_one_sided() {
            let cursor = BlockNumber::new(240);
            let head = BlockNumber::new(29_948);
            assert_eq!(head.distance_from(cursor), 29_708);
            assert_eq!(cursor.distance_from(head), 0);
        }

        #[test]
        fn bigint_binding_preserves_the_height() {
            let column: i64 = BlockNumber::new(18_000_000).into();
            assert_eq!(column, 18_000_000);
        }
    }
}
