//! Repository port for transactional persistence.
//!
//! The repository exclusively owns persisted state; every other component
//! holds read snapshots. All multi-row operations run inside serializable
//! transactions.

use alloy::primitives::B256;
use async_trait::async_trait;

use crate::error::Result;
use crate::types::entities::{BlockRecord, Checkpoint, TokenMetadata, TransferRecord};
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Port for the relational store.
///
/// # Atomicity Contract
///
/// After a successful [`Repository::commit_batch`], for every block `b` in
/// the batch: `b`'s row exists, all of `b`'s transfers exist, and the
/// checkpoint is `>= b.number`. No observer can see a state where some but
/// not all of these hold.
///
/// # Privileged Operations
///
/// [`Repository::prune_future_data`] and [`Repository::force_checkpoint`]
/// rewrite history and are reserved for the consistency guard and the
/// deadlock watchdog. Nothing else may call them.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a single block row.
    ///
    /// `ON CONFLICT (number) DO NOTHING` semantics; the caller is
    /// responsible for hash verification when the row already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_block(&self, block: &BlockRecord) -> Result<()>;

    /// Insert a single transfer row.
    ///
    /// `ON CONFLICT (block_number, log_index) DO NOTHING` semantics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_transfer(&self, transfer: &TransferRecord) -> Result<()>;

    /// Commit a contiguous batch atomically: block rows, transfer rows and
    /// the checkpoint advance in one serializable transaction.
    ///
    /// Transfers must arrive in ascending `(block_number, log_index)` order.
    /// The checkpoint is set to the highest block number in `blocks`.
    ///
    /// # Errors
    ///
    /// - [`crate::error::AppError::ReorgDetected`] when an existing block row
    ///   at the same height carries a different hash
    /// - Database errors (serialization failures are retryable by the caller)
    async fn commit_batch(
        &self,
        chain_id: u64,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
    ) -> Result<()>;

    /// Highest persisted block number, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn latest_block_number(&self) -> Result<Option<BlockNumber>>;

    /// Fetch a block row by height.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRecord>>;

    /// Hash of the block at `number`, if persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn block_hash_at(&self, number: BlockNumber) -> Result<Option<B256>>;

    /// The `limit` highest blocks, descending by number.
    ///
    /// Used by the startup linearity walk and the read-only query surface.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn latest_blocks(&self, limit: u32) -> Result<Vec<BlockRecord>>;

    /// The `limit` most recent transfers, descending by
    /// `(block_number, log_index)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn latest_transfers(&self, limit: u32) -> Result<Vec<TransferRecord>>;

    /// Total persisted transfer count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn transfer_count(&self) -> Result<u64>;

    /// Current checkpoint for a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>>;

    /// Advance the checkpoint. Monotonic: a value below the current
    /// checkpoint is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn update_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()>;

    /// Overwrite the checkpoint, allowing rewinds.
    ///
    /// Privileged: deadlock watchdog only.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn force_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()>;

    /// Delete every block above `keep` (transfers cascade) and rewind the
    /// checkpoint to `keep`, all in a single transaction.
    ///
    /// Privileged: consistency guard and deadlock watchdog only.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    async fn prune_future_data(&self, chain_id: u64, keep: BlockNumber) -> Result<u64>;

    /// Upsert token metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_token_metadata(&self, metadata: &TokenMetadata) -> Result<()>;

    /// Load the full metadata cache (boot warm-up).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn load_all_metadata(&self) -> Result<Vec<TokenMetadata>>;
}
