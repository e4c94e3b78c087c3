//! In-memory repository with the transactional semantics of the Postgres
//! adapter, for pipeline tests.
//!
//! Single-mutex state makes every multi-row operation trivially atomic:
//! either the whole commit lands or (on injected failure) nothing does.
//! Failure injection lets tests exercise the processor's retry and
//! dead-letter paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{AppError, InfraError, Result};
use crate::ports::Repository;
use crate::types::entities::{BlockRecord, Checkpoint, TokenMetadata, TransferRecord};
use crate::types::primitives::{BlockNumber, EthAddress};

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<u64, BlockRecord>,
    transfers: BTreeMap<(u64, u64), TransferRecord>,
    checkpoints: HashMap<u64, Checkpoint>,
    metadata: HashMap<EthAddress, TokenMetadata>,
}

/// In-memory [`Repository`] implementation.
#[derive(Debug, Default, Clone)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
    fail_next_commits: Arc<AtomicU32>,
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to [`Repository::commit_batch`] fail with a
    /// database error, leaving state untouched.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    /// Number of persisted block rows.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// All persisted blocks, ascending by number.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockRecord> {
        self.inner.lock().blocks.values().cloned().collect()
    }

    /// All persisted transfers, ascending by `(block_number, log_index)`.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.inner.lock().transfers.values().cloned().collect()
    }

    fn upsert_checkpoint(inner: &mut Inner, chain_id: u64, number: BlockNumber, monotonic: bool) {
        let entry = inner.checkpoints.entry(chain_id).or_insert(Checkpoint {
            chain_id,
            last_synced_block: number,
            updated_at: Utc::now(),
        });
        entry.last_synced_block = if monotonic {
            entry.last_synced_block.max(number)
        } else {
            number
        };
        entry.updated_at = Utc::now();
    }

    fn insert_block(inner: &mut Inner, block: &BlockRecord) -> Result<()> {
        if let Some(existing) = inner.blocks.get(&block.number.value()) {
            if existing.hash == block.hash {
                return Ok(());
            }
            return Err(AppError::ReorgDetected(block.number));
        }
        inner.blocks.insert(block.number.value(), block.clone());
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_block(&self, block: &BlockRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::insert_block(&mut inner, block)
    }

    async fn save_transfer(&self, transfer: &TransferRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .transfers
            .entry((transfer.block_number.value(), transfer.log_index))
            .or_insert_with(|| transfer.clone());
        Ok(())
    }

    async fn commit_batch(
        &self,
        chain_id: u64,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
    ) -> Result<()> {
        let remaining = self.fail_next_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_commits.store(remaining - 1, Ordering::SeqCst);
            return Err(InfraError::Internal("injected commit failure".into()).into());
        }

        let Some(max_number) = blocks.iter().map(|b| b.number).max() else {
            return Ok(());
        };

        let mut inner = self.inner.lock();

        // Validate before mutating so a reorg error leaves no partial state
        for block in blocks {
            if let Some(existing) = inner.blocks.get(&block.number.value()) {
                if existing.hash != block.hash {
                    return Err(AppError::ReorgDetected(block.number));
                }
            }
        }

        for block in blocks {
            Self::insert_block(&mut inner, block)?;
        }
        for transfer in transfers {
            inner
                .transfers
                .entry((transfer.block_number.value(), transfer.log_index))
                .or_insert_with(|| transfer.clone());
        }
        Self::upsert_checkpoint(&mut inner, chain_id, max_number, true);
        Ok(())
    }

    async fn latest_block_number(&self) -> Result<Option<BlockNumber>> {
        let inner = self.inner.lock();
        Ok(inner
            .blocks
            .keys()
            .next_back()
            .map(|n| BlockNumber::new(*n)))
    }

    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRecord>> {
        let inner = self.inner.lock();
        Ok(inner.blocks.get(&number.value()).cloned())
    }

    async fn block_hash_at(&self, number: BlockNumber) -> Result<Option<B256>> {
        let inner = self.inner.lock();
        Ok(inner.blocks.get(&number.value()).map(|b| b.hash))
    }

    async fn latest_blocks(&self, limit: u32) -> Result<Vec<BlockRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .blocks
            .values()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn latest_transfers(&self, limit: u32) -> Result<Vec<TransferRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .transfers
            .values()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn transfer_count(&self) -> Result<u64> {
        Ok(self.inner.lock().transfers.len() as u64)
    }

    async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.get(&chain_id).copied())
    }

    async fn update_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::upsert_checkpoint(&mut inner, chain_id, number, true);
        Ok(())
    }

    async fn force_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::upsert_checkpoint(&mut inner, chain_id, number, false);
        Ok(())
    }

    async fn prune_future_data(&self, chain_id: u64, keep: BlockNumber) -> Result<u64> {
        let mut inner = self.inner.lock();
        let doomed: Vec<u64> = inner
            .blocks
            .range(keep.value() + 1..)
            .map(|(n, _)| *n)
            .collect();
        for number in &doomed {
            inner.blocks.remove(number);
        }
        // Transfers cascade with their block
        inner
            .transfers
            .retain(|(block, _), _| *block <= keep.value());
        Self::upsert_checkpoint(&mut inner, chain_id, keep, false);
        Ok(doomed.len() as u64)
    }

    async fn save_token_metadata(&self, metadata: &TokenMetadata) -> Result<()> {
        self.inner
            .lock()
            .metadata
            .insert(metadata.address, metadata.clone());
        Ok(())
    }

    async fn load_all_metadata(&self) -> Result<Vec<TokenMetadata>> {
        Ok(self.inner.lock().metadata.values().cloned().collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
