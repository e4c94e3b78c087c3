//! Second-order state audit for development chains.
//!
//! Reorg resolution assumes the chain cooperates; a local dev chain that
//! was reset, mined thousands of blocks while the indexer slept, or had
//! its database swapped underneath it can leave the three cursors torn
//! apart beyond the sequencer's own ability to recover:
//!
//! - `H` - current on-chain head
//! - `S` - sequencer's expected block
//! - `D` - persisted checkpoint
//!
//! The watchdog audits the three every tick. A stalled sequencer combined
//! with a huge head gap triggers a three-step force alignment: overwrite
//! the checkpoint to `H - safety_margin`, reset the sequencer just above
//! it, resume the fetcher, and tell observers via the healing channel.
//!
//! **Never enabled on production chains** - there, reorg resolution is the
//! authoritative mechanism and a forced cursor jump would silently skip
//! history.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::fetcher::Fetcher;
use super::orchestrator::Orchestrator;
use super::sequencer::Sequencer;
use crate::config::WatchdogSettings;
use crate::error::Result;
use crate::ports::Repository;
use crate::rpc::RpcPool;
use crate::types::events::{HealingEvent, HealingReason};
use crate::types::primitives::BlockNumber;

/// Healing-event channel capacity.
const HEALING_CHANNEL_CAPACITY: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// DEADLOCK WATCHDOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodic auditor that force-aligns torn cursors on dev chains.
pub struct DeadlockWatchdog {
    repo: Arc<dyn Repository>,
    pool: Arc<RpcPool>,
    sequencer: Arc<Sequencer>,
    fetcher: Arc<Fetcher>,
    orchestrator: Arc<Orchestrator>,
    settings: WatchdogSettings,
    chain_id: u64,
    healing_tx: broadcast::Sender<HealingEvent>,
    failures: AtomicU32,
}

impl std::fmt::Debug for DeadlockWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockWatchdog")
            .field("chain_id", &self.chain_id)
            .field("settings", &self.settings)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeadlockWatchdog {
    /// Create the watchdog.
    ///
    /// The caller is responsible for only constructing one on dev chains
    /// or with the demo-mode flag set ([`crate::config::Settings::watchdog_enabled`]).
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<RpcPool>,
        sequencer: Arc<Sequencer>,
        fetcher: Arc<Fetcher>,
        orchestrator: Arc<Orchestrator>,
        settings: WatchdogSettings,
        chain_id: u64,
    ) -> Self {
        let (healing_tx, _) = broadcast::channel(HEALING_CHANNEL_CAPACITY);
        Self {
            repo,
            pool,
            sequencer,
            fetcher,
            orchestrator,
            settings,
            chain_id,
            healing_tx,
            failures: AtomicU32::new(0),
        }
    }

    /// Subscribe to healing events.
    #[must_use]
    pub fn subscribe_healing(&self) -> broadcast::Receiver<HealingEvent> {
        self.healing_tx.subscribe()
    }

    /// Alignment attempts that failed (retried on the next tick).
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Audit loop; ticks until cancelled.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.settings.check_interval_secs,
            "Deadlock watchdog armed"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.audit(&cancel).await {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    failures = self.failure_count(),
                    "Watchdog audit failed, retrying next tick"
                );
            }
        }
    }

    /// One audit pass over the three cursors.
    ///
    /// # Errors
    ///
    /// Propagates RPC/database failures; the run loop counts and retries.
    pub async fn audit(&self, cancel: &CancellationToken) -> Result<()> {
        let head = BlockNumber::new(self.pool.latest_block_number(cancel).await?);
        let cursor = self
            .repo
            .checkpoint(self.chain_id)
            .await?
            .map_or(BlockNumber::new(0), |c| c.last_synced_block);
        let expected = self.sequencer.expected_block();
        let idle = self.sequencer.idle_time();

        debug!(
            head = %head,
            cursor = %cursor,
            expected = %expected,
            idle_secs = idle.as_secs(),
            "Watchdog audit"
        );

        // Local chain reset: the cursor leads the head
        if cursor.value() > head.value() {
            return self
                .force_align(head, cursor, HealingReason::CursorAheadOfHead)
                .await;
        }

        let gap = head.distance_from(cursor);
        if idle > self.settings.stall_threshold() && gap > self.settings.gap_threshold {
            return self
                .force_align(head, cursor, HealingReason::SequencerStall)
                .await;
        }

        Ok(())
    }

    /// Three-step force alignment.
    async fn force_align(
        &self,
        head: BlockNumber,
        cursor: BlockNumber,
        reason: HealingReason,
    ) -> Result<()> {
        let target = head.back(self.settings.safety_margin);
        let gap = head.distance_from(cursor);

        warn!(
            %reason,
            head = %head,
            cursor = %cursor,
            target = %target,
            gap,
            "Space-time tear detected, force-aligning cursors"
        );

        // Step 1: rewrite persisted state. A cursor ahead of the head also
        // has phantom blocks to drop; a stall just moves the checkpoint.
        let result = match reason {
            HealingReason::CursorAheadOfHead => self
                .repo
                .prune_future_data(self.chain_id, target)
                .await
                .map(|_| ()),
            HealingReason::SequencerStall => {
                self.repo.force_checkpoint(self.chain_id, target).await
            }
        };

        let success = result.is_ok();
        if success {
            // Step 2: realign the in-memory sequencer
            self.sequencer.clear_buffer();
            self.sequencer.reset_expected_block(target.next());
            self.orchestrator.set_synced_cursor(target);

            // Step 3: wake the pipeline
            self.fetcher.resume();
            metrics::counter!("watchdog_alignments").increment(1);
            info!(target = %target, "Force alignment complete");
        }

        let _ = self.healing_tx.send(HealingEvent {
            trigger_reason: reason,
            db_cursor: cursor,
            chain_head: head,
            gap,
            success,
        });

        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
