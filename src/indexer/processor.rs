//! Batch decoding and atomic persistence.
//!
//! The processor receives batches of in-order, verified [`BlockData`] from
//! the sequencer and turns each batch into exactly one serializable
//! transaction: block rows, decoded transfer rows, and the checkpoint
//! advance commit together or not at all.
//!
//! # Failure handling
//!
//! - Ill-formed **logs** (wrong topic count, data size != 32) are skipped
//!   with a warning; they never abort a batch.
//! - An ill-formed **block** (missing header) aborts the whole batch.
//! - Commit failures retry with exponential backoff; an exhausted batch
//!   moves to the dead-letter queue and the consistency guard is invoked.
//! - A hash conflict on an existing row is a reorg signal, not a retry.
//!
//! # Enrichment
//!
//! Symbols come from the token metadata cache. A miss schedules an async
//! fetch but never blocks the commit; the symbol stays `NULL` until a
//! later transfer of the same token finds the cache warm.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::rpc::types::Log;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::consistency::GuardSignal;
use super::lazy::ActivityTracker;
use super::orchestrator::Orchestrator;
use crate::abi::TRANSFER_TOPIC;
use crate::error::{AppError, Result};
use crate::ports::Repository;
use crate::store::TokenMetadataService;
use crate::types::entities::{ActivityType, BlockRecord, TransferRecord};
use crate::types::events::BlockData;
use crate::types::primitives::{BlockNumber, EthAddress, TokenAmount};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Base delay for commit retries; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the exponential backoff.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════════════
// DEAD LETTERS
// ═══════════════════════════════════════════════════════════════════════════════

/// A batch that exhausted its commit retries.
#[derive(Debug)]
pub struct DeadLetterBatch {
    /// First block of the batch.
    pub from: BlockNumber,
    /// Last block of the batch.
    pub to: BlockNumber,
    /// Commit attempts made.
    pub attempts: u32,
    /// The raw batch, kept for operator replay.
    pub blocks: Vec<BlockData>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns ordered batches into atomic commits.
pub struct Processor {
    repo: Arc<dyn Repository>,
    metadata: Arc<TokenMetadataService>,
    orchestrator: Arc<Orchestrator>,
    activity: Arc<ActivityTracker>,
    chain_id: u64,
    retry_limit: u32,
    dead_letter: Mutex<VecDeque<DeadLetterBatch>>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("chain_id", &self.chain_id)
            .field("retry_limit", &self.retry_limit)
            .field("dead_letters", &self.dead_letter.lock().len())
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        metadata: Arc<TokenMetadataService>,
        orchestrator: Arc<Orchestrator>,
        activity: Arc<ActivityTracker>,
        chain_id: u64,
        retry_limit: u32,
    ) -> Self {
        Self {
            repo,
            metadata,
            orchestrator,
            activity,
            chain_id,
            retry_limit: retry_limit.max(1),
            dead_letter: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of dead-lettered batches awaiting operator replay.
    #[must_use]
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.lock().len()
    }

    /// Consume batches until cancelled or the channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error only for channel wiring faults; data faults are
    /// absorbed (retried, dead-lettered, or signalled to the guard).
    pub async fn run(
        &self,
        mut batch_rx: mpsc::Receiver<Vec<BlockData>>,
        guard_tx: mpsc::Sender<GuardSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let batch = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                received = batch_rx.recv() => match received {
                    Some(batch) => batch,
                    None => return Ok(()),
                },
            };

            if batch.is_empty() {
                continue;
            }

            match self.process_batch(batch, &cancel).await {
                Ok(()) => {}
                Err(AppError::ReorgDetected(number)) => {
                    warn!(block = %number, "Commit hit a hash conflict, signalling reorg");
                    let _ = guard_tx
                        .send(GuardSignal::ReorgAt {
                            number,
                            parent_hash: alloy::primitives::B256::ZERO,
                        })
                        .await;
                }
                Err(AppError::BatchDeadLettered { from, to, .. }) => {
                    let _ = guard_tx.send(GuardSignal::CommitFailure { from, to }).await;
                }
                Err(AppError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Process one batch end to end.
    #[instrument(skip(self, batch, cancel), fields(len = batch.len()))]
    async fn process_batch(&self, batch: Vec<BlockData>, cancel: &CancellationToken) -> Result<()> {
        let from = batch[0].number;
        let to = batch[batch.len() - 1].number;

        // A block that lost its header cannot be persisted without
        // breaking the chain; the whole batch aborts.
        if batch.iter().any(|b| b.hash.is_none()) {
            warn!(%from, %to, "Batch contains a headerless block, dead-lettering");
            return self.dead_letter_batch(batch, 0);
        }

        // Enforce contiguity against the authoritative cursor. Stale
        // batches show up after guard or watchdog resets; drop them and
        // let the refetch replace them.
        let checkpoint = self
            .repo
            .checkpoint(self.chain_id)
            .await?
            .map(|c| c.last_synced_block);
        if let Some(cursor) = checkpoint {
            if from.value() <= cursor.value() {
                debug!(%from, %cursor, "Dropping already-committed batch");
                return Ok(());
            }
            if from.value() > cursor.value() + 1 {
                warn!(%from, %cursor, "Dropping non-contiguous batch");
                return Ok(());
            }
        }

        let (blocks, transfers) = self.build_records(&batch);
        let transfer_count = transfers.len() as u64;

        self.commit_with_retry(batch, &blocks, &transfers, cancel)
            .await?;

        metrics::counter!("blocks_committed").increment(blocks.len() as u64);
        metrics::counter!("transfers_committed").increment(transfer_count);
        self.orchestrator.set_synced_cursor(to);
        if transfer_count > 0 {
            self.orchestrator.add_transfers(transfer_count);
        }
        self.activity.notify_block_processed();

        info!(%from, %to, transfers = transfer_count, "Batch committed");
        Ok(())
    }

    /// Decode the batch into persistable rows.
    fn build_records(&self, batch: &[BlockData]) -> (Vec<BlockRecord>, Vec<TransferRecord>) {
        let now = Utc::now();
        let mut blocks = Vec::with_capacity(batch.len());
        let mut transfers = Vec::new();

        for data in batch {
            let (Some(hash), Some(parent_hash), Some(timestamp)) =
                (data.hash, data.parent_hash, data.timestamp)
            else {
                continue;
            };
            blocks.push(BlockRecord {
                number: data.number,
                hash,
                parent_hash,
                timestamp,
                processed_at: now,
            });

            for log in &data.logs {
                let Some(decoded) = decode_transfer(data.number, log) else {
                    continue;
                };
                let symbol = self.metadata.lookup_symbol(decoded.token_address);
                transfers.push(TransferRecord {
                    block_number: decoded.block_number,
                    tx_hash: decoded.tx_hash,
                    log_index: decoded.log_index,
                    from: decoded.from,
                    to: decoded.to,
                    amount: decoded.amount,
                    token_address: decoded.token_address,
                    symbol,
                    activity_type: ActivityType::Transfer,
                });
            }
        }

        // Ascending (block_number, log_index) within the transaction
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        (blocks, transfers)
    }

    async fn commit_with_retry(
        &self,
        batch: Vec<BlockData>,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self
                .repo
                .commit_batch(self.chain_id, blocks, transfers)
                .await
            {
                Ok(()) => return Ok(()),
                Err(AppError::ReorgDetected(number)) => {
                    return Err(AppError::ReorgDetected(number));
                }
                Err(e) if attempt < self.retry_limit => {
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(2_u32.saturating_pow(attempt - 1))
                        .min(RETRY_MAX_DELAY);
                    warn!(attempt, error = %e, ?delay, "Commit failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(AppError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(attempts = attempt, error = %e, "Commit retries exhausted");
                    return self.dead_letter_batch(batch, attempt);
                }
            }
        }
    }

    fn dead_letter_batch(&self, batch: Vec<BlockData>, attempts: u32) -> Result<()> {
        let from = batch[0].number;
        let to = batch[batch.len() - 1].number;
        self.dead_letter.lock().push_back(DeadLetterBatch {
            from,
            to,
            attempts,
            blocks: batch,
        });
        metrics::counter!("batches_dead_lettered").increment(1);
        Err(AppError::BatchDeadLettered { from, to, attempts })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOG DECODING
// ═══════════════════════════════════════════════════════════════════════════════

/// Decode an ERC-20 `Transfer` log.
///
/// Returns `None` (after a warning) for ill-formed logs: wrong topic0,
/// wrong topic count, or data that is not exactly one 32-byte word.
#[must_use]
pub fn decode_transfer(
    block_number: BlockNumber,
    log: &Log,
) -> Option<crate::types::events::DecodedTransfer> {
    let topics = log.inner.data.topics();

    match topics.first() {
        Some(topic0) if *topic0 == TRANSFER_TOPIC => {}
        _ => {
            debug!(%block_number, "Skipping log with foreign topic0");
            return None;
        }
    }

    if topics.len() != 3 {
        warn!(
            %block_number,
            topics = topics.len(),
            "Skipping malformed Transfer log: wrong topic count"
        );
        return None;
    }

    let data = &log.inner.data.data;
    if data.len() != 32 {
        warn!(
            %block_number,
            data_len = data.len(),
            "Skipping malformed Transfer log: bad data size"
        );
        return None;
    }

    let Some(tx_hash) = log.transaction_hash else {
        warn!(%block_number, "Skipping Transfer log without transaction hash");
        return None;
    };
    let Some(log_index) = log.log_index else {
        warn!(%block_number, "Skipping Transfer log without log index");
        return None;
    };

    let from = EthAddress::from_log_topic(topics[1]);
    let to = EthAddress::from_log_topic(topics[2]);
    let amount = TokenAmount::from_u256(U256::from_be_slice(data));

    Some(crate::types::events::DecodedTransfer {
        block_number,
        tx_hash,
        log_index,
        from,
        to,
        amount,
        token_address: log.address().into(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
