//! Concurrent block-plus-logs retrieval with backpressure and pacing.
//!
//! The fetcher owns two bounded channels: `jobs` (block-number requests)
//! and `results` (completed [`BlockData`]). A fixed set of workers pulls
//! numbers from `jobs`, fetches the block's matching logs and header, and
//! pushes the result onto `results` for the sequencer.
//!
//! # Retrieval strategy (quota economy)
//!
//! 1. `eth_getLogs` for exactly block `n`, filtered to the Transfer
//!    topic and the watched token addresses.
//! 2. With a watch-list, the header request is the only other call; the
//!    transaction-bearing block body is never fetched, which is where the
//!    bandwidth saving comes from.
//! 3. Without a watch-list, fall back to the full `eth_getBlockByNumber`.
//!
//! Every block gets a header so empty blocks still persist and the
//! hash-chain stays verifiable end to end.
//!
//! # Pacing
//!
//! Two limits apply to each worker: the pool's own token buckets, and a
//! fetcher-level throughput limiter the lazy manager rewrites from the
//! quota meter's recommendation.
//!
//! # Pause
//!
//! The consistency guard pauses workers during reorg rollback via a watch
//! flag checked between jobs.

use std::sync::Arc;

use alloy::primitives::Address;
use alloy::rpc::types::Filter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::TRANSFER_TOPIC;
use crate::error::{AppError, InfraError, Result};
use crate::rpc::{DirectLimiter, RpcPool, build_limiter};
use crate::types::events::BlockData;
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Header fetch retries within a single fetch attempt.
///
/// A missing header usually means the endpoint lags the head by a block;
/// it resolves within a poll interval.
const HEADER_RETRIES: u32 = 3;

/// Delay between header retries and failed fetch attempts.
const HEADER_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// Default throughput until the lazy manager writes its first value.
const DEFAULT_THROUGHPUT_RPS: f64 = 10.0;

// ═══════════════════════════════════════════════════════════════════════════════
// FETCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Concurrent block fetcher.
pub struct Fetcher {
    pool: Arc<RpcPool>,
    watch_list: Vec<Address>,
    concurrency: usize,
    jobs_tx: mpsc::Sender<u64>,
    jobs_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u64>>>,
    results_tx: mpsc::Sender<BlockData>,
    pause_tx: watch::Sender<bool>,
    throughput: parking_lot::RwLock<Arc<DirectLimiter>>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("concurrency", &self.concurrency)
            .field("watch_list", &self.watch_list.len())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create the fetcher and its bounded channels.
    ///
    /// Channel capacity is `concurrency * 2` on both sides, so a stalled
    /// consumer backpressures the scheduler rather than growing queues.
    ///
    /// Returns the fetcher and the results receiver for the sequencer.
    #[must_use]
    pub fn new(
        pool: Arc<RpcPool>,
        watch_list: Vec<Address>,
        concurrency: usize,
    ) -> (Self, mpsc::Receiver<BlockData>) {
        let concurrency = concurrency.max(1);
        let capacity = concurrency * 2;
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let (results_tx, results_rx) = mpsc::channel(capacity);
        let (pause_tx, _) = watch::channel(false);

        let fetcher = Self {
            pool,
            watch_list,
            concurrency,
            jobs_tx,
            jobs_rx: Arc::new(tokio::sync::Mutex::new(jobs_rx)),
            results_tx,
            pause_tx,
            throughput: parking_lot::RwLock::new(build_limiter(
                DEFAULT_THROUGHPUT_RPS,
                u32::try_from(capacity).unwrap_or(8),
            )),
        };
        (fetcher, results_rx)
    }

    /// Enqueue every block in `[from, to]`, blocking when the jobs channel
    /// is full (backpressure). The caller advances its cursor only when
    /// this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when the token fires mid-schedule; blocks
    /// already enqueued stay enqueued.
    #[instrument(skip(self, cancel), fields(from = %from, to = %to))]
    pub async fn schedule(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for number in from.value()..=to.value() {
            tokio::select! {
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                sent = self.jobs_tx.send(number) => {
                    sent.map_err(|_| InfraError::Internal("jobs channel closed".into()))?;
                }
            }
        }
        debug!("Scheduled block range");
        Ok(())
    }

    /// Pause workers between jobs (guard use).
    pub fn pause(&self) {
        info!("Fetcher paused");
        let _ = self.pause_tx.send(true);
    }

    /// Resume paused workers.
    pub fn resume(&self) {
        info!("Fetcher resumed");
        let _ = self.pause_tx.send(false);
    }

    /// Whether workers are currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Rewrite the fetcher-level throughput limit (lazy manager use).
    pub fn set_throughput_limit(&self, rps: f64) {
        debug!(rps, "Fetcher throughput updated");
        let burst = u32::try_from(self.concurrency).unwrap_or(4);
        *self.throughput.write() = build_limiter(rps, burst.max(1));
    }

    /// Pending jobs (scheduled but not yet picked up).
    #[must_use]
    pub fn jobs_depth(&self) -> usize {
        self.jobs_tx.max_capacity() - self.jobs_tx.capacity()
    }

    /// Completed blocks waiting for the sequencer.
    #[must_use]
    pub fn results_depth(&self) -> usize {
        self.results_tx.max_capacity() - self.results_tx.capacity()
    }

    /// Spawn the worker tasks.
    pub fn spawn_workers(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker_id| {
                let fetcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    fetcher.worker_loop(worker_id, cancel).await;
                })
            })
            .collect()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Worker internals
    // ───────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, cancel), fields(worker = worker_id))]
    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        debug!("Fetch worker started");
        'jobs: loop {
            if self.wait_if_paused(&cancel).await.is_err() {
                break;
            }

            let number = {
                let mut jobs = self.jobs_rx.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    job = jobs.recv() => match job {
                        Some(number) => number,
                        None => break,
                    },
                }
            };

            // The worker owns this block until it is fetched: retrying in
            // place (instead of re-enqueueing) keeps the jobs channel free
            // for the scheduler and cannot deadlock a full queue.
            let data = loop {
                if self.wait_if_paused(&cancel).await.is_err() {
                    break 'jobs;
                }
                if self.throttle(&cancel).await.is_err() {
                    break 'jobs;
                }
                match self.fetch_block(BlockNumber::new(number), &cancel).await {
                    Ok(Some(data)) => break data,
                    Ok(None) => {
                        debug!(number, "Header unavailable, retrying");
                    }
                    Err(AppError::Cancelled) => break 'jobs,
                    Err(e) => {
                        // The pool already rotated endpoints for this call
                        warn!(number, error = %e, "Block fetch failed, retrying");
                    }
                }
                tokio::select! {
                    () = cancel.cancelled() => break 'jobs,
                    () = tokio::time::sleep(HEADER_RETRY_DELAY) => {}
                }
            };

            if self.results_tx.send(data).await.is_err() {
                break;
            }
        }
        debug!("Fetch worker stopped");
    }

    /// Block while the pause flag is set. Errors only on cancellation.
    async fn wait_if_paused(&self, cancel: &CancellationToken) -> Result<()> {
        let mut pause_rx = self.pause_tx.subscribe();
        tokio::select! {
            () = cancel.cancelled() => Err(AppError::Cancelled),
            result = pause_rx.wait_for(|paused| !paused) => {
                result.map(|_| ()).map_err(|_| AppError::Cancelled)
            }
        }
    }

    /// Acquire a fetcher-level throughput token.
    async fn throttle(&self, cancel: &CancellationToken) -> Result<()> {
        let limiter = Arc::clone(&self.throughput.read());
        tokio::select! {
            () = cancel.cancelled() => Err(AppError::Cancelled),
            () = limiter.until_ready() => Ok(()),
        }
    }

    /// Fetch one block's matching logs and header.
    ///
    /// Returns `Ok(None)` when the header is not yet available.
    async fn fetch_block(
        &self,
        number: BlockNumber,
        cancel: &CancellationToken,
    ) -> Result<Option<BlockData>> {
        let mut filter = Filter::new()
            .from_block(number.value())
            .to_block(number.value())
            .event_signature(TRANSFER_TOPIC);
        if !self.watch_list.is_empty() {
            filter = filter.address(self.watch_list.clone());
        }

        let mut logs = self.pool.logs(cancel, &filter).await?;
        logs.sort_by_key(|log| log.log_index);

        let header = if self.watch_list.is_empty() {
            // No watch-list: full-block fallback
            self.header_with_retry(number, cancel, true).await?
        } else {
            self.header_with_retry(number, cancel, false).await?
        };

        let Some(header) = header else {
            return Ok(None);
        };

        Ok(Some(BlockData {
            number,
            hash: Some(header.hash),
            parent_hash: Some(header.parent_hash),
            timestamp: Some(header.timestamp),
            logs,
        }))
    }

    async fn header_with_retry(
        &self,
        number: BlockNumber,
        cancel: &CancellationToken,
        full: bool,
    ) -> Result<Option<crate::rpc::BlockHeaderData>> {
        for attempt in 0..=HEADER_RETRIES {
            let header = if full {
                self.pool.block_by_number(cancel, number).await?
            } else {
                self.pool.header_by_number(cancel, number).await?
            };
            if header.is_some() {
                return Ok(header);
            }
            if attempt < HEADER_RETRIES {
                tokio::select! {
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                    () = tokio::time::sleep(HEADER_RETRY_DELAY) => {}
                }
            }
        }
        Ok(None)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use alloy::primitives::B256;
    use alloy::rpc::types::Log;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::RpcSettings;
    use crate::ports::FakeClock;
    use crate::rpc::{BlockHeaderData, EvmRpc, QuotaMeter, RpcError};

    /// Scripted chain: headers for a range, logs per block.
    #[derive(Debug, Default)]
    struct ScriptedChain {
        headers: Mutex<HashMap<u64, BlockHeaderData>>,
        logs: Mutex<HashMap<u64, Vec<Log>>>,
    }

    impl ScriptedChain {
        fn with_blocks(range: std::ops::RangeInclusive<u64>) -> Arc<Self> {
            let chain = Self::default();
            {
                let mut headers = chain.headers.lock();
                for number in range {
                    headers.insert(
                        number,
                        BlockHeaderData {
                            number: BlockNumber::new(number),
                            hash: B256::from([u8::try_from(number % 256).unwrap(); 32]),
                            parent_hash: B256::from([
                                u8::try_from(number.saturating_sub(1) % 256).unwrap();
                                32
                            ]),
                            timestamp: chrono::Utc::now(),
                        },
                    );
                }
            }
            Arc::new(chain)
        }

        fn put_log(&self, number: u64, log: Log) {
            self.logs.lock().entry(number).or_default().push(log);
        }
    }

    #[async_trait]
    impl EvmRpc for ScriptedChain {
        async fn latest_block_number(&self) -> std::result::Result<u64, RpcError> {
            Ok(self.headers.lock().keys().max().copied().unwrap_or(0))
        }

        async fn chain_id(&self) -> std::result::Result<u64, RpcError> {
            Ok(31_337)
        }

        async fn header_by_number(
            &self,
            number: BlockNumber,
        ) -> std::result::Result<Option<BlockHeaderData>, RpcError> {
            Ok(self.headers.lock().get(&number.value()).copied())
        }

        async fn block_by_number(
            &self,
            number: BlockNumber,
        ) -> std::result::Result<Option<BlockHeaderData>, RpcError> {
            self.header_by_number(number).await
        }

        async fn logs(&self, filter: &Filter) -> std::result::Result<Vec<Log>, RpcError> {
            let from = filter
                .get_from_block()
                .ok_or_else(|| RpcError::BadResponse("missing from_block".into()))?;
            Ok(self.logs.lock().get(&from).cloned().unwrap_or_default())
        }

        async fn token_metadata(
            &self,
            _token: Address,
        ) -> std::result::Result<Option<(String, u8, String)>, RpcError> {
            Ok(None)
        }
    }

    fn pool_over(chain: &Arc<ScriptedChain>) -> Arc<RpcPool> {
        let settings = RpcSettings {
            rate_limit: 1000.0,
            burst: 1000,
            request_timeout_ms: 1000,
            probe_interval_ms: 10_000,
            unhealthy_after_failures: 3,
        };
        let quota = Arc::new(QuotaMeter::new(
            Arc::new(FakeClock::epoch()),
            10_000,
            Duration::from_secs(60),
            0.50,
            0.80,
        ));
        Arc::new(RpcPool::new(
            vec![("http://node0.test".into(), Arc::clone(chain) as _)],
            quota,
            &settings,
        ))
    }

    fn transfer_log(number: u64, log_index: u64) -> Log {
        Log {
            block_number: Some(number),
            log_index: Some(log_index),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetches_scheduled_range_with_headers() {
        let chain = ScriptedChain::with_blocks(100..=105);
        chain.put_log(103, transfer_log(103, 0));

        let (fetcher, mut results_rx) = Fetcher::new(pool_over(&chain), Vec::new(), 2);
        let fetcher = Arc::new(fetcher);
        fetcher.set_throughput_limit(1000.0);
        let cancel = CancellationToken::new();
        let workers = fetcher.spawn_workers(&cancel);

        fetcher
            .schedule(BlockNumber::new(100), BlockNumber::new(105), &cancel)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            let data = results_rx.recv().await.unwrap();
            assert!(data.hash.is_some(), "every block carries a header");
            if data.number.value() == 103 {
                assert_eq!(data.logs.len(), 1);
            } else {
                assert!(data.logs.is_empty());
            }
            seen.push(data.number.value());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![100, 101, 102, 103, 104, 105]);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn watched_filter_narrows_addresses() {
        let chain = ScriptedChain::with_blocks(10..=10);
        let watched = vec![Address::from([0x42; 20])];

        let (fetcher, mut results_rx) = Fetcher::new(pool_over(&chain), watched, 1);
        let fetcher = Arc::new(fetcher);
        fetcher.set_throughput_limit(1000.0);
        let cancel = CancellationToken::new();
        let workers = fetcher.spawn_workers(&cancel);

        fetcher
            .schedule(BlockNumber::new(10), BlockNumber::new(10), &cancel)
            .await
            .unwrap();

        let data = results_rx.recv().await.unwrap();
        assert_eq!(data.number.value(), 10);
        assert!(data.logs.is_empty());
        assert!(data.hash.is_some());

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn paused_workers_hold_jobs() {
        let chain = ScriptedChain::with_blocks(0..=10);
        let (fetcher, mut results_rx) = Fetcher::new(pool_over(&chain), Vec::new(), 1);
        let fetcher = Arc::new(fetcher);
        fetcher.set_throughput_limit(1000.0);
        fetcher.pause();

        let cancel = CancellationToken::new();
        let workers = fetcher.spawn_workers(&cancel);

        fetcher
            .schedule(BlockNumber::new(0), BlockNumber::new(1), &cancel)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(results_rx.try_recv().is_err(), "paused worker emits nothing");

        fetcher.resume();
        assert!(results_rx.recv().await.is_some());

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn schedule_observes_cancellation() {
        let chain = ScriptedChain::with_blocks(0..=0);
        // No workers: the 2-slot jobs channel fills and schedule blocks
        let (fetcher, _results_rx) = Fetcher::new(pool_over(&chain), Vec::new(), 1);
        let fetcher = Arc::new(fetcher);
        let cancel = CancellationToken::new();

        let schedule = {
            let fetcher = Arc::clone(&fetcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fetcher
                    .schedule(BlockNumber::new(0), BlockNumber::new(100), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = schedule.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn depths_reflect_queued_work() {
        let chain = ScriptedChain::with_blocks(0..=0);
        let (fetcher, _results_rx) = Fetcher::new(pool_over(&chain), Vec::new(), 2);
        let fetcher = Arc::new(fetcher);
        let cancel = CancellationToken::new();

        assert_eq!(fetcher.jobs_depth(), 0);
        fetcher
            .schedule(BlockNumber::new(0), BlockNumber::new(2), &cancel)
            .await
            .unwrap();
        assert_eq!(fetcher.jobs_depth(), 3);
    }
}
