//! Layered error types for the transfer indexer.
//!
//! This module provides a hierarchical error system:
//!
//! - [`InfraError`] - Infrastructure errors (database, RPC, decoding)
//! - [`AppError`] - Application-level errors combining infra faults with
//!   the structural faults of the ingestion pipeline (reorgs, overflow,
//!   configuration)
//!
//! # Error Philosophy
//!
//! - Transient faults (RPC timeouts, serialization failures) are absorbed
//!   by their owning component and retried; they surface only after the
//!   owner exhausts its budget.
//! - Structural faults (deep reorg, buffer overflow, chain-id mismatch)
//!   escalate via the orchestrator snapshot; observers see state
//!   transitions, not raw errors.
//! - The `Result` type alias uses `AppError` for application code.

use thiserror::Error;

use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// INFRASTRUCTURE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Infrastructure-level errors from external systems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// RPC error (Ethereum node communication).
    #[error("RPC error: {0}")]
    Rpc(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Every endpoint in the pool failed for one call.
    #[error("all RPC endpoints failed: {0}")]
    AllEndpointsFailed(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Log decoding error.
    #[error("log decoding error: {0}")]
    LogDecoding(String),

    /// Timeout waiting for operation.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPLICATION ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Application-level errors combining infrastructure and pipeline faults.
///
/// This is the primary error type used throughout the application.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// Infrastructure error.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// Shallow chain reorganization detected; recovered by the guard.
    #[error("chain reorg detected at block {0}")]
    ReorgDetected(BlockNumber),

    /// Reorg deeper than the configured walk-back bound.
    #[error("reorg at block {detected_at} exceeds max depth {max_depth}; operator action required")]
    DeepReorg {
        /// Block where the divergence was noticed.
        detected_at: BlockNumber,
        /// Configured walk-back bound.
        max_depth: u64,
    },

    /// Sequencer buffer exceeded capacity; signifies a scheduling bug.
    #[error("sequencer buffer overflow: {buffered} blocks buffered waiting for {expected}")]
    BufferOverflow {
        /// Buffered block count at overflow.
        buffered: usize,
        /// The block the sequencer was waiting for.
        expected: BlockNumber,
    },

    /// RPC node reports a different chain than configured.
    #[error("chain id mismatch: configured {configured}, node reports {actual}")]
    ChainIdMismatch {
        /// Chain id from configuration.
        configured: u64,
        /// Chain id reported by the node.
        actual: u64,
    },

    /// Persisted checkpoint is ahead of the chain head on a production chain.
    #[error("checkpoint {checkpoint} is ahead of chain head {head} beyond drift tolerance")]
    CursorAheadOfHead {
        /// Persisted checkpoint.
        checkpoint: BlockNumber,
        /// Observed chain head.
        head: BlockNumber,
    },

    /// A batch exhausted its commit retries and was dead-lettered.
    #[error("batch [{from}, {to}] dead-lettered after {attempts} attempts")]
    BatchDeadLettered {
        /// First block of the batch.
        from: BlockNumber,
        /// Last block of the batch.
        to: BlockNumber,
        /// Attempts made.
        attempts: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Initialization error.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Operation observed cancellation at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// Graceful shutdown requested.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl AppError {
    /// Whether this fault is structural: it cannot be retried away and
    /// must surface through the snapshot as `SystemState::Fault`.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DeepReorg { .. }
                | Self::BufferOverflow { .. }
                | Self::ChainIdMismatch { .. }
                | Self::CursorAheadOfHead { .. }
                | Self::Config(_)
                | Self::Initialization(_)
        )
    }
}

/// Type alias for application Results.
pub type Result<T> = std::result::Result<T, AppError>;

// ═══════════════════════════════════════════════════════════════════════════════
// CONVENIENCE CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════════

impl From<crate::types::primitives::InvalidAddress> for InfraError {
    fn from(err: crate::types::primitives::InvalidAddress) -> Self {
        Self::LogDecoding(err.to_string())
    }
}

impl From<crate::types::primitives::InvalidAmount> for InfraError {
    fn from(err: crate::types::primitives::InvalidAmount) -> Self {
        Self::LogDecoding(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Infra(InfraError::Database(err))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_from_infra() {
        let infra = InfraError::Timeout("eth_getLogs".into());
        let app: AppError = infra.into();
        assert!(matches!(app, AppError::Infra(InfraError::Timeout(_))));
        assert!(!app.is_structural());
    }

    #[test]
    fn structural_faults_are_classified() {
        let err = AppError::ChainIdMismatch {
            configured: 11_155_111,
            actual: 1,
        };
        assert!(err.is_structural());

        let err = AppError::DeepReorg {
            detected_at: BlockNumber::new(500),
            max_depth: 128,
        };
        assert!(err.is_structural());

        assert!(!AppError::ReorgDetected(BlockNumber::new(5)).is_structural());
    }

    #[test]
    fn overflow_display_names_expected_block() {
        let err = AppError::BufferOverflow {
            buffered: 1000,
            expected: BlockNumber::new(42),
        };
        assert!(err.to_string().contains("42"));
    }
}
