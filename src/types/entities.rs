//! Persisted entities backing the relational schema.
//!
//! These structs map 1:1 onto the `blocks`, `transfers`, `sync_checkpoints`
//! and `token_metadata` tables. Conversions to and from database rows live
//! in the store layer; the entities themselves are storage-agnostic.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::primitives::{BlockNumber, EthAddress, TokenAmount};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted block header.
///
/// Invariant: for any two stored blocks where `b1.number = b2.number - 1`,
/// `b1.hash == b2.parent_hash` (hash-chain linearity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block height (unique).
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp (seconds since epoch, as reported by the chain).
    pub timestamp: DateTime<Utc>,
    /// Wall-clock time this row was persisted.
    pub processed_at: DateTime<Utc>,
}

impl BlockRecord {
    /// Whether `child` extends this block.
    #[must_use]
    pub fn is_parent_of(&self, child: &Self) -> bool {
        child.number == self.number.next() && child.parent_hash == self.hash
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER
// ═══════════════════════════════════════════════════════════════════════════════

/// Activity classification for an indexed log.
///
/// Only `Transfer` is produced today; other values are reserved for
/// future decoders (approvals, mints, burns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    /// ERC-20 `Transfer(address,address,uint256)`.
    #[default]
    Transfer,
}

impl ActivityType {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = InvalidActivityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSFER" => Ok(Self::Transfer),
            other => Err(InvalidActivityType(other.to_string())),
        }
    }
}

/// Error for unknown activity type strings.
#[derive(Debug, Clone, Error)]
#[error("unknown activity type: {0}")]
pub struct InvalidActivityType(pub String);

/// A persisted ERC-20 transfer.
///
/// Unique key: `(block_number, log_index)`. Rows cascade-delete with
/// their block during reorg rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Block the emitting log was included in.
    pub block_number: BlockNumber,
    /// Transaction hash that emitted the log.
    pub tx_hash: B256,
    /// Index of the log within the block.
    pub log_index: u64,
    /// Sender address (topic1).
    pub from: EthAddress,
    /// Recipient address (topic2).
    pub to: EthAddress,
    /// Raw transfer amount (uint256, unscaled).
    pub amount: TokenAmount,
    /// Emitting token contract.
    pub token_address: EthAddress,
    /// Token symbol, when known from the metadata cache.
    pub symbol: Option<String>,
    /// Activity classification.
    pub activity_type: ActivityType,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKPOINT
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync checkpoint for a chain.
///
/// Invariant: `last_synced_block == max(blocks.number)` after every
/// successful commit, and no transfer row references a block above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Chain this checkpoint belongs to.
    pub chain_id: u64,
    /// Highest block for which all data is guaranteed persisted.
    pub last_synced_block: BlockNumber,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN METADATA
// ═══════════════════════════════════════════════════════════════════════════════

/// Cached ERC-20 token metadata.
///
/// Eventually consistent; refreshed from chain on cache miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// Token contract address.
    pub address: EthAddress,
    /// Token symbol (e.g. "USDC").
    pub symbol: String,
    /// Token decimals.
    pub decimals: u8,
    /// Full token name.
    pub name: String,
    /// Last refresh time.
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
