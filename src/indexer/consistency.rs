//! Hash-chain linearity checking and reorg recovery.
//!
//! # Startup
//!
//! Before ingestion starts, the guard walks the highest persisted blocks
//! and verifies parent-hash linearity, deleting the tail above the first
//! consistent link. An empty database with a non-zero start block gets a
//! *parent anchor*: the block just below the start is fetched and stored
//! so the first indexed block's parent check has something to chain to.
//! Local-chain resets (checkpoint ahead of the chain head) are repaired on
//! dev chains and are a fault on production chains.
//!
//! # Runtime
//!
//! On a parent-hash mismatch at block `n`:
//!
//! ```text
//! 1. pause the fetcher
//! 2. walk back from n until chain(n-k).parent_hash == stored(n-k-1)
//! 3. delete persisted blocks >= n-k, rewind the checkpoint (one txn)
//! 4. clear the sequencer buffer, reset expected to n-k
//! 5. resume the fetcher
//! ```
//!
//! A walk past the configured bound escalates to a deep-reorg fault:
//! ingestion stops and the snapshot surfaces `Fault`.

use std::sync::Arc;

use alloy::primitives::B256;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::fetcher::Fetcher;
use super::orchestrator::Orchestrator;
use super::sequencer::Sequencer;
use crate::error::{AppError, Result};
use crate::ports::Repository;
use crate::rpc::RpcPool;
use crate::types::entities::BlockRecord;
use crate::types::events::SystemState;
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNALS
// ═══════════════════════════════════════════════════════════════════════════════

/// Faults routed to the guard by the sequencer and the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardSignal {
    /// Parent-hash mismatch observed at `number`.
    ReorgAt {
        /// Block where the divergence was noticed.
        number: BlockNumber,
        /// The divergent parent hash reported by the chain.
        parent_hash: B256,
    },
    /// A batch exhausted its commit retries.
    CommitFailure {
        /// First block of the dead-lettered batch.
        from: BlockNumber,
        /// Last block of the dead-lettered batch.
        to: BlockNumber,
    },
}

/// Outcome of a handled reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgStats {
    /// Block where the divergence was noticed.
    pub detected_at: BlockNumber,
    /// Last common block; everything above it was deleted.
    pub fork_point: BlockNumber,
    /// Blocks rolled back.
    pub depth: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSISTENCY GUARD
// ═══════════════════════════════════════════════════════════════════════════════

/// Reorg-aware consistency guard.
pub struct ConsistencyGuard {
    repo: Arc<dyn Repository>,
    pool: Arc<RpcPool>,
    fetcher: Arc<Fetcher>,
    sequencer: Arc<Sequencer>,
    orchestrator: Arc<Orchestrator>,
    chain_id: u64,
    startup_depth: u64,
    max_depth: u64,
    dev_chain: bool,
    strict_height_check: bool,
    drift_tolerance: u64,
}

impl std::fmt::Debug for ConsistencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyGuard")
            .field("chain_id", &self.chain_id)
            .field("startup_depth", &self.startup_depth)
            .field("max_depth", &self.max_depth)
            .field("dev_chain", &self.dev_chain)
            .finish_non_exhaustive()
    }
}

impl ConsistencyGuard {
    /// Create the guard.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<RpcPool>,
        fetcher: Arc<Fetcher>,
        sequencer: Arc<Sequencer>,
        orchestrator: Arc<Orchestrator>,
        chain_id: u64,
        startup_depth: u64,
        max_depth: u64,
        dev_chain: bool,
        strict_height_check: bool,
        drift_tolerance: u64,
    ) -> Self {
        Self {
            repo,
            pool,
            fetcher,
            sequencer,
            orchestrator,
            chain_id,
            startup_depth,
            max_depth: max_depth.max(1),
            dev_chain,
            strict_height_check,
            drift_tolerance,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Startup
    // ───────────────────────────────────────────────────────────────────────────

    /// Run the full startup sequence: drift repair, linearity repair,
    /// parent anchoring. Returns the block ingestion should resume from.
    ///
    /// # Errors
    ///
    /// - [`AppError::CursorAheadOfHead`] on production chains whose
    ///   checkpoint leads the head beyond the drift tolerance
    /// - Database or RPC errors
    #[instrument(skip(self, cancel), fields(start = %start_block))]
    pub async fn startup_check(
        &self,
        start_block: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<BlockNumber> {
        self.repair_drift(cancel).await?;
        self.repair_linearity().await?;
        self.ensure_parent_anchor(start_block, cancel).await?;

        let resume = match self.repo.checkpoint(self.chain_id).await? {
            Some(checkpoint) => checkpoint.last_synced_block.next(),
            None => start_block,
        };
        info!(resume = %resume, "Startup consistency check complete");
        Ok(resume)
    }

    /// Repair a checkpoint that leads the chain head (local chain reset).
    async fn repair_drift(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(checkpoint) = self.repo.checkpoint(self.chain_id).await? else {
            return Ok(());
        };
        let head = BlockNumber::new(self.pool.latest_block_number(cancel).await?);
        let drift = checkpoint.last_synced_block.distance_from(head);
        if drift <= self.drift_tolerance {
            return Ok(());
        }

        if self.dev_chain || !self.strict_height_check {
            warn!(
                checkpoint = %checkpoint.last_synced_block,
                %head,
                drift,
                "Checkpoint leads the chain head, pruning future data"
            );
            self.repo.prune_future_data(self.chain_id, head).await?;
            return Ok(());
        }

        error!(
            checkpoint = %checkpoint.last_synced_block,
            %head,
            drift,
            "Checkpoint leads the chain head on a production chain"
        );
        self.orchestrator.set_system_state(SystemState::Fault);
        Err(AppError::CursorAheadOfHead {
            checkpoint: checkpoint.last_synced_block,
            head,
        })
    }

    /// Verify parent-hash linearity over the highest persisted blocks,
    /// deleting the tail above the first broken link.
    async fn repair_linearity(&self) -> Result<()> {
        let depth = u32::try_from(self.startup_depth).unwrap_or(u32::MAX);
        let mut recent: Vec<BlockRecord> = self.repo.latest_blocks(depth).await?;
        if recent.len() < 2 {
            return Ok(());
        }
        recent.reverse(); // ascending

        for pair in recent.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            if child.number != parent.number.next() {
                continue;
            }
            if child.parent_hash != parent.hash {
                warn!(
                    parent = %parent.number,
                    child = %child.number,
                    "Linearity violation in persisted tail, repairing"
                );
                let deleted = self
                    .repo
                    .prune_future_data(self.chain_id, parent.number)
                    .await?;
                info!(deleted, keep = %parent.number, "Persisted tail repaired");
                return Ok(());
            }
        }

        debug!(checked = recent.len(), "Persisted tail is linear");
        Ok(())
    }

    /// Insert the synthetic predecessor block when starting fresh above
    /// genesis, so the first indexed block's parent check succeeds.
    async fn ensure_parent_anchor(
        &self,
        start_block: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if start_block.value() == 0 {
            return Ok(());
        }
        if self.repo.latest_block_number().await?.is_some() {
            return Ok(());
        }

        let anchor_number = start_block.prev();
        let header = self
            .pool
            .header_by_number(cancel, anchor_number)
            .await?
            .ok_or_else(|| {
                AppError::Initialization(format!("anchor block {anchor_number} not found on chain"))
            })?;

        let anchor = BlockRecord {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            processed_at: chrono::Utc::now(),
        };
        self.repo.save_block(&anchor).await?;
        self.repo
            .update_checkpoint(self.chain_id, anchor_number)
            .await?;

        info!(anchor = %anchor_number, "Parent anchor inserted");
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Runtime
    // ───────────────────────────────────────────────────────────────────────────

    /// Listen for guard signals until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::DeepReorg`] when a reorg exceeds the walk-back
    /// bound; ingestion must stop.
    pub async fn run(
        &self,
        mut guard_rx: mpsc::Receiver<GuardSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let signal = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                received = guard_rx.recv() => match received {
                    Some(signal) => signal,
                    None => return Ok(()),
                },
            };

            match signal {
                GuardSignal::ReorgAt { number, .. } => {
                    let stats = self.handle_reorg(number, &cancel).await?;
                    metrics::counter!("reorgs_handled").increment(1);
                    info!(
                        fork_point = %stats.fork_point,
                        depth = stats.depth,
                        "Reorg recovered"
                    );
                }
                GuardSignal::CommitFailure { from, to } => {
                    warn!(%from, %to, "Recovering from dead-lettered batch");
                    self.recover_from_commit_failure().await?;
                }
            }
        }
    }

    /// Walk back from the divergence, rewind persisted state, and realign
    /// the sequencer.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::DeepReorg`] past the walk-back bound; the
    /// fetcher stays paused and the snapshot faults.
    #[instrument(skip(self, cancel), fields(detected_at = %detected_at))]
    pub async fn handle_reorg(
        &self,
        detected_at: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<ReorgStats> {
        warn!("Handling chain reorganization");
        self.fetcher.pause();

        for depth in 1..=self.max_depth {
            let candidate = detected_at.back(depth);
            if candidate.value() == 0 {
                break;
            }

            let Some(chain_header) = self.pool.header_by_number(cancel, candidate).await? else {
                debug!(candidate = %candidate, "Chain header missing during walk-back");
                continue;
            };
            let Some(stored_parent) = self.repo.block_hash_at(candidate.prev()).await? else {
                // Below our persisted history; cannot verify further
                break;
            };

            if chain_header.parent_hash == stored_parent {
                let fork_point = candidate.prev();
                self.repo
                    .prune_future_data(self.chain_id, fork_point)
                    .await?;
                self.sequencer.clear_buffer();
                self.sequencer.reset_expected_block(candidate);
                self.orchestrator.set_synced_cursor(fork_point);
                self.fetcher.resume();

                return Ok(ReorgStats {
                    detected_at,
                    fork_point,
                    depth: detected_at.distance_from(fork_point),
                });
            }
        }

        error!(
            max_depth = self.max_depth,
            "Reorg exceeds walk-back bound, stopping ingestion"
        );
        self.orchestrator.set_system_state(SystemState::Fault);
        Err(AppError::DeepReorg {
            detected_at,
            max_depth: self.max_depth,
        })
    }

    /// After a dead-lettered batch: re-verify the persisted tail and point
    /// the sequencer back at the authoritative cursor so the lost range is
    /// refetched.
    async fn recover_from_commit_failure(&self) -> Result<()> {
        self.fetcher.pause();
        self.repair_linearity().await?;

        let resume = self
            .repo
            .checkpoint(self.chain_id)
            .await?
            .map_or(BlockNumber::new(0), |c| c.last_synced_block.next());
        self.sequencer.clear_buffer();
        self.sequencer.reset_expected_block(resume);
        self.fetcher.resume();

        info!(resume = %resume, "Sequencer realigned after commit failure");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
