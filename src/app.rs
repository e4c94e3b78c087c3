//! Application composition root.
//!
//! Builds the pipeline from [`Settings`], runs the startup sequence
//! (chain-id verification, migrations, consistency checks), spawns every
//! long-lived task, and supervises them until shutdown or a structural
//! fault.
//!
//! Components accept their collaborators explicitly; this module is the
//! only place that knows the whole object graph.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::indexer::{
    ActivityTracker, ConsistencyGuard, DeadlockWatchdog, Fetcher, LazyManager, Orchestrator,
    Processor, Sequencer,
};
use crate::ports::{Repository, SystemClock};
use crate::rpc::{QuotaMeter, RpcPool};
use crate::store::{PostgresRepository, TokenMetadataService};
use crate::types::events::SystemState;
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Head polling interval for the scheduling loop.
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot tick interval (queue depths, coarse state).
const SNAPSHOT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Batch channel capacity between sequencer and processor.
const BATCH_CHANNEL_CAPACITY: usize = 4;

/// Guard signal channel capacity.
const GUARD_CHANNEL_CAPACITY: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// RUN
// ═══════════════════════════════════════════════════════════════════════════════

/// Run the indexer until cancellation or a structural fault.
///
/// # Errors
///
/// Returns startup faults (chain-id mismatch, unreachable services) and
/// structural pipeline faults (deep reorg, sequencer overflow).
#[allow(clippy::too_many_lines)]
pub async fn run(
    settings: Settings,
    from_block_override: Option<u64>,
    cancel: CancellationToken,
) -> Result<()> {
    settings
        .validate()
        .map_err(|errors| AppError::Config(errors.join("; ")))?;

    let chain_id = settings.chain.chain_id;
    let dev_chain = settings.is_dev_chain();

    // ── Chain access ──────────────────────────────────────────────────────────
    let quota = Arc::new(QuotaMeter::new(
        Arc::new(SystemClock::new()),
        settings.quota.limit,
        settings.quota.window(),
        settings.quota.balanced_threshold,
        settings.quota.eco_threshold,
    ));
    let pool = Arc::new(RpcPool::connect(&settings.chain, &settings.rpc, Arc::clone(&quota)).await?);

    // Startup invariant: the node must serve the configured chain.
    // Continuing against the wrong network would contaminate the database.
    let reported = pool.chain_id(&cancel).await?;
    if reported != chain_id {
        error!(configured = chain_id, actual = reported, "Chain id mismatch");
        return Err(AppError::ChainIdMismatch {
            configured: chain_id,
            actual: reported,
        });
    }
    info!(chain_id, dev_chain, "Chain verified");

    // ── Persistence ───────────────────────────────────────────────────────────
    let repo = Arc::new(PostgresRepository::connect(&settings.database).await?);
    repo.run_migrations().await?;
    let repo: Arc<dyn Repository> = repo;

    // ── Components ────────────────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(settings.watchdog.safety_margin));
    orchestrator.set_system_state(SystemState::Starting);

    let tracker = Arc::new(ActivityTracker::new());
    let metadata = Arc::new(TokenMetadataService::new(
        Arc::clone(&pool),
        Arc::clone(&repo),
        cancel.clone(),
    ));
    let warmed = metadata.warm_up().await?;
    debug!(warmed, "Token metadata warmed");

    let watch_list = settings
        .tokens
        .effective_watch_list()
        .map_err(AppError::Config)?;
    let (fetcher, results_rx) = Fetcher::new(
        Arc::clone(&pool),
        watch_list,
        settings.fetch.concurrency,
    );
    let fetcher = Arc::new(fetcher);

    let head = BlockNumber::new(pool.latest_block_number(&cancel).await?);
    orchestrator.update_chain_head(head);
    let start_block = from_block_override.map_or_else(
        || BlockNumber::new(settings.chain.start_block.resolve(head.value())),
        BlockNumber::new,
    );

    let sequencer = Arc::new(Sequencer::new(
        start_block,
        settings.fetch.sequencer_capacity,
        settings.fetch.checkpoint_batch_size,
    ));

    let guard = Arc::new(ConsistencyGuard::new(
        Arc::clone(&repo),
        Arc::clone(&pool),
        Arc::clone(&fetcher),
        Arc::clone(&sequencer),
        Arc::clone(&orchestrator),
        chain_id,
        settings.reorg.startup_check_depth,
        settings.reorg.max_reorg_depth,
        dev_chain,
        settings.chain.strict_height_check,
        settings.chain.drift_tolerance,
    ));

    // ── Startup consistency ───────────────────────────────────────────────────
    let resume = guard.startup_check(start_block, &cancel).await?;
    sequencer.reset_expected_block(resume);
    orchestrator.set_synced_cursor(resume.prev());
    orchestrator.set_transfers_total(repo.transfer_count().await?);
    orchestrator.set_system_state(SystemState::Syncing);
    info!(start = %resume, head = %head, "Startup complete, ingestion begins");

    let processor = Arc::new(Processor::new(
        Arc::clone(&repo),
        metadata,
        Arc::clone(&orchestrator),
        Arc::clone(&tracker),
        chain_id,
        settings.fetch.retry_queue_size,
    ));

    let always_active = settings.lazy.force_always_active || dev_chain;
    let lazy = Arc::new(LazyManager::new(
        Arc::clone(&tracker),
        Arc::clone(&quota),
        Arc::clone(&fetcher),
        Arc::clone(&orchestrator),
        settings.rpc.rate_limit,
        settings.lazy.idle_timeout(),
        always_active,
    ));
    lazy.evaluate();

    // ── Channels ──────────────────────────────────────────────────────────────
    let (batch_tx, batch_rx) = tokio::sync::mpsc::channel(BATCH_CHANNEL_CAPACITY);
    let (guard_tx, guard_rx) = tokio::sync::mpsc::channel(GUARD_CHANNEL_CAPACITY);

    // ── Tasks ─────────────────────────────────────────────────────────────────
    let mut infallible: Vec<JoinHandle<()>> = Vec::new();

    infallible.extend(fetcher.spawn_workers(&cancel));
    infallible.push(pool.spawn_probe(settings.rpc.probe_interval(), cancel.clone()));
    infallible.push({
        let lazy = Arc::clone(&lazy);
        let cancel = cancel.clone();
        tokio::spawn(async move { lazy.run(cancel).await })
    });
    infallible.push(spawn_snapshot_tick(
        Arc::clone(&orchestrator),
        Arc::clone(&fetcher),
        settings.fetch.checkpoint_batch_size as u64,
        cancel.clone(),
    ));

    if settings.watchdog_enabled() {
        let watchdog = Arc::new(DeadlockWatchdog::new(
            Arc::clone(&repo),
            Arc::clone(&pool),
            Arc::clone(&sequencer),
            Arc::clone(&fetcher),
            Arc::clone(&orchestrator),
            settings.watchdog.clone(),
            chain_id,
        ));
        let cancel = cancel.clone();
        infallible.push(tokio::spawn(async move { watchdog.run(cancel).await }));
    } else {
        debug!("Deadlock watchdog disabled (production chain)");
    }

    let mut sequencer_task = {
        let sequencer = Arc::clone(&sequencer);
        let guard_tx = guard_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sequencer.run(results_rx, batch_tx, guard_tx, cancel).await })
    };
    let mut processor_task = {
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(batch_rx, guard_tx, cancel).await })
    };
    let mut guard_task = {
        let guard = Arc::clone(&guard);
        let cancel = cancel.clone();
        tokio::spawn(async move { guard.run(guard_rx, cancel).await })
    };
    let mut schedule_task = {
        let pool = Arc::clone(&pool);
        let fetcher = Arc::clone(&fetcher);
        let sequencer = Arc::clone(&sequencer);
        let orchestrator = Arc::clone(&orchestrator);
        let max_sync_batch = settings.fetch.max_sync_batch;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            head_follow_loop(pool, fetcher, sequencer, orchestrator, max_sync_batch, cancel).await
        })
    };

    // ── Supervision ───────────────────────────────────────────────────────────
    let outcome = tokio::select! {
        () = cancel.cancelled() => Ok(()),
        joined = &mut sequencer_task => flatten("sequencer", joined),
        joined = &mut processor_task => flatten("processor", joined),
        joined = &mut guard_task => flatten("guard", joined),
        joined = &mut schedule_task => flatten("scheduler", joined),
    };

    if let Err(e) = &outcome {
        if e.is_structural() {
            orchestrator.set_system_state(SystemState::Fault);
        }
        error!(error = %e, "Pipeline task failed, shutting down");
    } else {
        info!("Shutdown requested, draining tasks");
    }

    cancel.cancel();
    for handle in [sequencer_task, processor_task, guard_task, schedule_task] {
        let _ = handle.await;
    }
    for handle in infallible {
        let _ = handle.await;
    }

    info!("Indexer stopped");
    outcome
}

fn flatten(task: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(AppError::Initialization(format!("{task} task panicked: {e}"))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEDULING LOOP
// ═══════════════════════════════════════════════════════════════════════════════

/// Follow the chain head and feed the fetcher.
///
/// The local cursor advances only on successful enqueue; privileged
/// sequencer resets (reorg rollback, watchdog alignment) bump the
/// sequencer generation, which re-derives the cursor from the new
/// expected block.
async fn head_follow_loop(
    pool: Arc<RpcPool>,
    fetcher: Arc<Fetcher>,
    sequencer: Arc<Sequencer>,
    orchestrator: Arc<Orchestrator>,
    max_sync_batch: u64,
    cancel: CancellationToken,
) -> Result<()> {
    // First block not yet handed to the fetcher
    let mut next = sequencer.expected_block();
    let mut generation = sequencer.generation();
    let mut ticker = tokio::time::interval(HEAD_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let head = match pool.latest_block_number(&cancel).await {
            Ok(head) => BlockNumber::new(head),
            Err(AppError::Cancelled) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Head poll failed");
                continue;
            }
        };
        orchestrator.update_chain_head(head);

        // A privileged reset moved the cursor underneath us
        let current_generation = sequencer.generation();
        if current_generation != generation {
            generation = current_generation;
            next = sequencer.expected_block();
            debug!(next = %next, "Scheduling cursor re-derived after reset");
        }

        if head < next {
            continue;
        }
        let target = BlockNumber::new(
            head.value()
                .min(next.value().saturating_add(max_sync_batch - 1)),
        );

        match fetcher.schedule(next, target, &cancel).await {
            Ok(()) => {
                orchestrator.set_target_height(target);
                next = target.next();
            }
            Err(AppError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT TICK
// ═══════════════════════════════════════════════════════════════════════════════

/// Regenerate derived snapshot fields every tick.
fn spawn_snapshot_tick(
    orchestrator: Arc<Orchestrator>,
    fetcher: Arc<Fetcher>,
    live_threshold: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            orchestrator.set_queue_depths(fetcher.jobs_depth(), fetcher.results_depth());

            let snapshot = orchestrator.snapshot();
            match snapshot.system_state {
                SystemState::Fault | SystemState::Starting => {}
                SystemState::EcoSleep if snapshot.is_eco_mode => {}
                SystemState::EcoSleep | SystemState::Syncing | SystemState::Live => {
                    let state = if snapshot.sync_lag() <= live_threshold {
                        SystemState::Live
                    } else {
                        SystemState::Syncing
                    };
                    orchestrator.set_system_state(state);
                }
            }
        }
    })
}
