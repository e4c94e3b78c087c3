//! In-flight pipeline data.
//!
//! [`BlockData`] is the unit of work flowing from the fetcher through the
//! sequencer to the processor. [`DecodedTransfer`] is a decoded ERC-20
//! `Transfer` log before persistence. [`HealingEvent`] and [`SystemState`]
//! are surfaced to external observers via the orchestrator.

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::primitives::{BlockNumber, EthAddress, TokenAmount};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// A fetched block together with its matching logs.
///
/// The fetcher fills the header fields for every block it emits; a
/// headerless value only arises when the chain stopped answering for a
/// height mid-flight, and the processor refuses to persist it.
#[derive(Debug, Clone)]
pub struct BlockData {
    /// Block height.
    pub number: BlockNumber,
    /// Block hash; `None` when the header could not be fetched.
    pub hash: Option<B256>,
    /// Parent hash; `None` when the header could not be fetched.
    pub parent_hash: Option<B256>,
    /// Block timestamp; `None` when the header could not be fetched.
    pub timestamp: Option<DateTime<Utc>>,
    /// Matching `Transfer` logs, ascending by log index.
    pub logs: Vec<Log>,
}

impl BlockData {
    /// A headerless placeholder for a block.
    #[must_use]
    pub const fn stub(number: BlockNumber) -> Self {
        Self {
            number,
            hash: None,
            parent_hash: None,
            timestamp: None,
            logs: Vec::new(),
        }
    }

    /// Whether the header is missing.
    #[must_use]
    pub const fn is_stub(&self) -> bool {
        self.hash.is_none()
    }

    /// A block that carries logs but lost its header is malformed and
    /// must abort the batch it belongs to.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        self.hash.is_none() && !self.logs.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODED TRANSFER
// ═══════════════════════════════════════════════════════════════════════════════

/// A decoded ERC-20 `Transfer` log, pre-persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    /// Block the log was included in.
    pub block_number: BlockNumber,
    /// Emitting transaction.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// Sender (topic1).
    pub from: EthAddress,
    /// Recipient (topic2).
    pub to: EthAddress,
    /// Raw amount (data word).
    pub amount: TokenAmount,
    /// Emitting token contract.
    pub token_address: EthAddress,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYSTEM STATE & HEALING EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse state of the whole pipeline as published in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    /// Boot sequence in progress.
    #[default]
    Starting,
    /// Catching up to the chain head.
    Syncing,
    /// Within one batch of the head.
    Live,
    /// Adaptive pacing has parked the fetcher at the heartbeat rate.
    EcoSleep,
    /// A structural fault requires operator attention.
    Fault,
}

/// Emitted on the healing channel after a watchdog force alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingEvent {
    /// Why the alignment fired.
    pub trigger_reason: HealingReason,
    /// Persisted checkpoint observed before alignment.
    pub db_cursor: BlockNumber,
    /// On-chain head observed before alignment.
    pub chain_head: BlockNumber,
    /// `chain_head - db_cursor` at trigger time.
    pub gap: u64,
    /// Whether the alignment transaction committed.
    pub success: bool,
}

/// Trigger classification for healing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealingReason {
    /// Sequencer idle past the stall threshold with a large head gap.
    SequencerStall,
    /// Persisted checkpoint ahead of the chain head (local chain reset).
    CursorAheadOfHead,
}

impl std::fmt::Display for HealingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequencerStall => f.write_str("sequencer_stall"),
            Self::CursorAheadOfHead => f.write_str("cursor_ahead_of_head"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
