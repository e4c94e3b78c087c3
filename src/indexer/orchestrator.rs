//! Shared pipeline snapshot and broadcast.
//!
//! The orchestrator is the one place where the pipeline's observable state
//! converges. Each field has exactly one writer (the head-follow loop
//! writes heights, the processor writes the cursor and transfer totals,
//! the tick task writes queue depths); readers take a copy under a short
//! read lock or subscribe to the broadcast channel.
//!
//! External collaborators (API layer, dashboards) only ever see this
//! snapshot, never component internals.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::events::SystemState;
use crate::types::primitives::BlockNumber;

/// Broadcast buffer for snapshot subscribers. Slow subscribers drop old
/// snapshots rather than backpressuring the pipeline.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Highest block number observed on chain.
    pub latest_height: u64,
    /// Persisted checkpoint.
    pub synced_cursor: u64,
    /// Upper bound of the currently scheduled range.
    pub target_height: u64,
    /// Total transfers persisted since genesis.
    pub transfers_total: u64,
    /// Whether adaptive pacing is in its eco floor.
    pub is_eco_mode: bool,
    /// Pending entries in the fetch jobs channel.
    pub jobs_depth: usize,
    /// Pending entries in the results channel.
    pub results_depth: usize,
    /// Blocks kept below the head during forced alignment.
    pub safety_buffer: u64,
    /// Coarse pipeline state.
    pub system_state: SystemState,
    /// Time of the last field update.
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    fn initial(safety_buffer: u64) -> Self {
        Self {
            latest_height: 0,
            synced_cursor: 0,
            target_height: 0,
            transfers_total: 0,
            is_eco_mode: false,
            jobs_depth: 0,
            results_depth: 0,
            safety_buffer,
            system_state: SystemState::Starting,
            updated_at: Utc::now(),
        }
    }

    /// Blocks between the chain head and the persisted cursor.
    #[must_use]
    pub const fn sync_lag(&self) -> u64 {
        self.latest_height.saturating_sub(self.synced_cursor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-writer-per-field, multi-reader snapshot owner.
#[derive(Debug)]
pub struct Orchestrator {
    snapshot: RwLock<Snapshot>,
    tx: broadcast::Sender<Snapshot>,
}

impl Orchestrator {
    /// Create an orchestrator with the configured safety buffer.
    #[must_use]
    pub fn new(safety_buffer: u64) -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            snapshot: RwLock::new(Snapshot::initial(safety_buffer)),
            tx,
        }
    }

    /// Copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        *self.snapshot.read()
    }

    /// Subscribe to snapshot updates.
    ///
    /// Every mutation publishes a fresh copy; lagging subscribers skip
    /// intermediate states.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Update the observed chain head (head-follow loop).
    pub fn update_chain_head(&self, head: BlockNumber) {
        self.mutate(|s| s.latest_height = head.value());
    }

    /// Update the scheduling target (head-follow loop).
    pub fn set_target_height(&self, target: BlockNumber) {
        self.mutate(|s| s.target_height = target.value());
    }

    /// Update the persisted cursor (processor).
    pub fn set_synced_cursor(&self, cursor: BlockNumber) {
        self.mutate(|s| s.synced_cursor = cursor.value());
        metrics::gauge!("sync_lag").set({
            let s = self.snapshot();
            #[allow(clippy::cast_precision_loss)]
            let lag = s.sync_lag() as f64;
            lag
        });
    }

    /// Add to the running transfer total (processor).
    pub fn add_transfers(&self, count: u64) {
        self.mutate(|s| s.transfers_total += count);
    }

    /// Set the absolute transfer total (boot reconciliation).
    pub fn set_transfers_total(&self, total: u64) {
        self.mutate(|s| s.transfers_total = total);
    }

    /// Flag eco pacing (lazy manager).
    pub fn set_eco_mode(&self, eco: bool) {
        self.mutate(|s| s.is_eco_mode = eco);
    }

    /// Update channel depths (tick task).
    pub fn set_queue_depths(&self, jobs: usize, results: usize) {
        self.mutate(|s| {
            s.jobs_depth = jobs;
            s.results_depth = results;
        });
    }

    /// Transition the coarse system state.
    ///
    /// `Fault` is terminal: once faulted, only a restart clears it.
    pub fn set_system_state(&self, state: SystemState) {
        self.mutate(|s| {
            if s.system_state != SystemState::Fault {
                s.system_state = state;
            }
        });
    }

    /// Current system state.
    #[must_use]
    pub fn system_state(&self) -> SystemState {
        self.snapshot.read().system_state
    }

    fn mutate(&self, f: impl FnOnce(&mut Snapshot)) {
        let updated = {
            let mut snapshot = self.snapshot.write();
            f(&mut snapshot);
            snapshot.updated_at = Utc::now();
            *snapshot
        };
        // Receivers may not exist yet; that's fine
        let _ = self.tx.send(updated);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
