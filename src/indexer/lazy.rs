//! Adaptive pacing: turns quota usage and activity signals into the
//! fetcher's throughput limit.
//!
//! # Activity sources
//!
//! Activity is dual-sourced: user-interaction heartbeats arriving from
//! external collaborators, and block-processed events from the processor.
//! Either keeps the pipeline out of EcoSleep; only when **both** have been
//! silent past the idle timeout does the manager drop the fetcher to the
//! quota meter's eco recommendation.
//!
//! # States
//!
//! | State | Users | Blocks | Throughput |
//! |-------|-------|--------|------------|
//! | `Active` | recent | recent | quota recommendation |
//! | `Watching` | silent | recent | quota recommendation |
//! | `Idle` | recent | silent | quota recommendation |
//! | `EcoSleep` | silent | silent | eco floor (non-zero) |
//! | `AlwaysActive` | — | — | full rate, no quota enforcement |
//!
//! `AlwaysActive` is forced on local development chains (or via config)
//! and is the only configuration permitted to bypass quota controls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::fetcher::Fetcher;
use super::orchestrator::Orchestrator;
use crate::rpc::QuotaMeter;
use crate::types::events::SystemState;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// How often the manager re-evaluates pacing.
const EVALUATE_INTERVAL: Duration = Duration::from_secs(10);

/// Eco fraction of the full rate when sleeping.
const ECO_SLEEP_FRACTION: f64 = 0.1;

// ═══════════════════════════════════════════════════════════════════════════════
// ACTIVITY TRACKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared last-seen instants for the two activity sources.
///
/// The processor stamps block activity on every commit; the external
/// surface stamps user activity through
/// [`ActivityTracker::notify_user_activity`].
#[derive(Debug)]
pub struct ActivityTracker {
    last_user: RwLock<Instant>,
    last_block: RwLock<Instant>,
}

impl ActivityTracker {
    /// Create a tracker; both sources start "recent" so a fresh boot is
    /// active.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_user: RwLock::new(now),
            last_block: RwLock::new(now),
        }
    }

    /// Record a user-interaction heartbeat.
    pub fn notify_user_activity(&self) {
        *self.last_user.write() = Instant::now();
    }

    /// Record a committed batch.
    pub fn notify_block_processed(&self) {
        *self.last_block.write() = Instant::now();
    }

    /// Silence on the user source.
    #[must_use]
    pub fn user_idle(&self) -> Duration {
        self.last_user.read().elapsed()
    }

    /// Silence on the block source.
    #[must_use]
    pub fn block_idle(&self) -> Duration {
        self.last_block.read().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACTIVITY STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Pacing state of the lazy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// Both sources recent.
    Active,
    /// Users recent, chain quiet.
    Idle,
    /// Chain active, no users.
    Watching,
    /// Both sources silent past the idle timeout.
    EcoSleep,
    /// Dev-chain override: full rate, no transitions.
    AlwaysActive,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Idle => f.write_str("idle"),
            Self::Watching => f.write_str("watching"),
            Self::EcoSleep => f.write_str("eco_sleep"),
            Self::AlwaysActive => f.write_str("always_active"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAZY MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives the fetcher's throughput from quota usage and activity.
pub struct LazyManager {
    tracker: Arc<ActivityTracker>,
    quota: Arc<QuotaMeter>,
    fetcher: Arc<Fetcher>,
    orchestrator: Arc<Orchestrator>,
    max_rps: f64,
    idle_timeout: Duration,
    always_active: bool,
    state: RwLock<ActivityState>,
}

impl std::fmt::Debug for LazyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyManager")
            .field("state", &*self.state.read())
            .field("max_rps", &self.max_rps)
            .field("always_active", &self.always_active)
            .finish_non_exhaustive()
    }
}

impl LazyManager {
    /// Create the manager.
    ///
    /// `always_active` comes from dev-chain detection or the explicit
    /// config override.
    #[must_use]
    pub fn new(
        tracker: Arc<ActivityTracker>,
        quota: Arc<QuotaMeter>,
        fetcher: Arc<Fetcher>,
        orchestrator: Arc<Orchestrator>,
        max_rps: f64,
        idle_timeout: Duration,
        always_active: bool,
    ) -> Self {
        let state = if always_active {
            ActivityState::AlwaysActive
        } else {
            ActivityState::Active
        };
        Self {
            tracker,
            quota,
            fetcher,
            orchestrator,
            max_rps,
            idle_timeout,
            always_active,
            state: RwLock::new(state),
        }
    }

    /// Current pacing state.
    #[must_use]
    pub fn state(&self) -> ActivityState {
        *self.state.read()
    }

    /// Re-evaluate pacing once and push the resulting throughput to the
    /// fetcher. Factored out of [`Self::run`] for tests.
    pub fn evaluate(&self) {
        let next = self.next_state();
        let throughput = match next {
            ActivityState::AlwaysActive => self.max_rps,
            ActivityState::EcoSleep => (self.max_rps * ECO_SLEEP_FRACTION).max(0.1),
            ActivityState::Active | ActivityState::Idle | ActivityState::Watching => {
                self.quota.recommended_rps(self.max_rps)
            }
        };

        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            info!(from = %previous, to = %next, throughput, "Pacing state changed");
        } else {
            debug!(state = %next, throughput, "Pacing evaluated");
        }

        self.fetcher.set_throughput_limit(throughput);
        let eco = next == ActivityState::EcoSleep;
        self.orchestrator.set_eco_mode(eco);
        if eco {
            self.orchestrator.set_system_state(SystemState::EcoSleep);
        }
    }

    fn next_state(&self) -> ActivityState {
        if self.always_active {
            return ActivityState::AlwaysActive;
        }
        let users_silent = self.tracker.user_idle() > self.idle_timeout;
        let blocks_silent = self.tracker.block_idle() > self.idle_timeout;
        match (users_silent, blocks_silent) {
            (false, false) => ActivityState::Active,
            (false, true) => ActivityState::Idle,
            (true, false) => ActivityState::Watching,
            (true, true) => ActivityState::EcoSleep,
        }
    }

    /// Periodic evaluation loop.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(EVALUATE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.evaluate(),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
