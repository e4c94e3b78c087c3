//! Shared fixtures for integration tests.
//!
//! [`MockChain`] scripts an EVM endpoint: headers keyed by number, logs
//! keyed by block, both rewritable mid-test to simulate reorgs.
//! [`Pipeline`] wires the real components (pool, fetcher, sequencer,
//! processor, guard) over a [`MemoryRepository`].

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, LogData};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tokenflow_indexer::abi::TRANSFER_TOPIC;
use tokenflow_indexer::config::RpcSettings;
use tokenflow_indexer::indexer::{
    ActivityTracker, ConsistencyGuard, Fetcher, Orchestrator, Processor, Sequencer,
};
use tokenflow_indexer::ports::{Repository, SystemClock};
use tokenflow_indexer::rpc::{BlockHeaderData, EvmRpc, QuotaMeter, RpcError, RpcPool};
use tokenflow_indexer::store::{MemoryRepository, TokenMetadataService};
use tokenflow_indexer::types::primitives::BlockNumber;

pub const TEST_CHAIN_ID: u64 = 31_337;

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Deterministic hash for a block number on the canonical mock chain.
pub fn hash_of(number: u64) -> B256 {
    let mut bytes = [0_u8; 32];
    bytes[0] = 0xC0;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

/// Scriptable mock endpoint.
#[derive(Debug, Default)]
pub struct MockChain {
    headers: Mutex<BTreeMap<u64, BlockHeaderData>>,
    logs: Mutex<HashMap<u64, Vec<Log>>>,
    chain_id: Mutex<u64>,
}

impl MockChain {
    /// A linear chain over `range` with hashes derived from the numbers.
    pub fn linear(range: std::ops::RangeInclusive<u64>) -> Arc<Self> {
        let chain = Arc::new(Self::default());
        *chain.chain_id.lock() = TEST_CHAIN_ID;
        for number in range {
            chain.set_header(number, hash_of(number), hash_of(number.wrapping_sub(1)));
        }
        chain
    }

    pub fn set_chain_id(&self, id: u64) {
        *self.chain_id.lock() = id;
    }

    pub fn set_header(&self, number: u64, hash: B256, parent_hash: B256) {
        self.headers.lock().insert(
            number,
            BlockHeaderData {
                number: BlockNumber::new(number),
                hash,
                parent_hash,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn head(&self) -> u64 {
        self.headers.lock().keys().next_back().copied().unwrap_or(0)
    }

    /// Extend the canonical chain by one block.
    pub fn mine(&self) -> u64 {
        let next = self.head() + 1;
        self.set_header(next, hash_of(next), hash_of(next - 1));
        next
    }

    pub fn header_hash(&self, number: u64) -> Option<B256> {
        self.headers.lock().get(&number).map(|h| h.hash)
    }

    /// Attach a well-formed Transfer log to a block.
    pub fn add_transfer(
        &self,
        block: u64,
        log_index: u64,
        token: Address,
        from: Address,
        to: Address,
        amount: u64,
    ) {
        self.logs
            .lock()
            .entry(block)
            .or_default()
            .push(transfer_log(block, log_index, token, from, to, amount));
    }

    /// Drop all logs above `keep` (reorg simulation).
    pub fn clear_logs_above(&self, keep: u64) {
        self.logs.lock().retain(|block, _| *block <= keep);
    }
}

#[async_trait]
impl EvmRpc for MockChain {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head())
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(*self.chain_id.lock())
    }

    async fn header_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>, RpcError> {
        Ok(self.headers.lock().get(&number.value()).copied())
    }

    async fn block_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>, RpcError> {
        self.header_by_number(number).await
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let from = filter
            .get_from_block()
            .ok_or_else(|| RpcError::BadResponse("missing from_block".into()))?;
        let to = filter.get_to_block().unwrap_or(from);
        let logs = self.logs.lock();
        let mut out = Vec::new();
        for number in from..=to {
            if let Some(block_logs) = logs.get(&number) {
                out.extend(block_logs.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn token_metadata(
        &self,
        _token: Address,
    ) -> Result<Option<(String, u8, String)>, RpcError> {
        Ok(Some(("TST".into(), 18, "Test Token".into())))
    }
}

/// Build a well-formed ERC-20 Transfer log.
pub fn transfer_log(
    block: u64,
    log_index: u64,
    token: Address,
    from: Address,
    to: Address,
    amount: u64,
) -> Log {
    let mut word = [0_u8; 32];
    word[24..].copy_from_slice(&amount.to_be_bytes());
    let data = LogData::new_unchecked(
        vec![
            TRANSFER_TOPIC,
            B256::from(from.into_word()),
            B256::from(to.into_word()),
        ],
        Bytes::copy_from_slice(&word),
    );
    Log {
        inner: alloy::primitives::Log {
            address: token,
            data,
        },
        block_hash: Some(hash_of(block)),
        block_number: Some(block),
        block_timestamp: None,
        transaction_hash: Some(B256::from([0xAB; 32])),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

/// The fully wired pipeline over a mock chain and an in-memory store.
pub struct Pipeline {
    pub chain: Arc<MockChain>,
    pub pool: Arc<RpcPool>,
    pub repo: Arc<MemoryRepository>,
    pub fetcher: Arc<Fetcher>,
    pub sequencer: Arc<Sequencer>,
    pub processor: Arc<Processor>,
    pub guard: Arc<ConsistencyGuard>,
    pub orchestrator: Arc<Orchestrator>,
    pub cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Wire the pipeline. `watch_list` narrows the log filter; `start` is
    /// the first block to index.
    pub async fn start(chain: Arc<MockChain>, watch_list: Vec<Address>, start: u64) -> Self {
        let quota = Arc::new(QuotaMeter::new(
            Arc::new(SystemClock::new()),
            100_000,
            Duration::from_secs(60),
            0.50,
            0.80,
        ));
        let pool = Arc::new(RpcPool::new(
            vec![("http://mock.test".into(), Arc::clone(&chain) as Arc<dyn EvmRpc>)],
            quota,
            &RpcSettings {
                rate_limit: 100_000.0,
                burst: 100_000,
                request_timeout_ms: 2000,
                probe_interval_ms: 10_000,
                unhealthy_after_failures: 3,
            },
        ));
        let repo = Arc::new(MemoryRepository::new());
        let repo_dyn: Arc<dyn Repository> = Arc::clone(&repo) as Arc<dyn Repository>;
        let cancel = CancellationToken::new();

        let orchestrator = Arc::new(Orchestrator::new(6));
        let tracker = Arc::new(ActivityTracker::new());
        let metadata = Arc::new(TokenMetadataService::new(
            Arc::clone(&pool),
            Arc::clone(&repo_dyn),
            cancel.clone(),
        ));

        let (fetcher, results_rx) = Fetcher::new(Arc::clone(&pool), watch_list, 4);
        let fetcher = Arc::new(fetcher);
        fetcher.set_throughput_limit(100_000.0);

        let sequencer = Arc::new(Sequencer::new(BlockNumber::new(start), 1000, 10));
        let processor = Arc::new(Processor::new(
            Arc::clone(&repo_dyn),
            metadata,
            Arc::clone(&orchestrator),
            tracker,
            TEST_CHAIN_ID,
            3,
        ));
        let guard = Arc::new(ConsistencyGuard::new(
            Arc::clone(&repo_dyn),
            Arc::clone(&pool),
            Arc::clone(&fetcher),
            Arc::clone(&sequencer),
            Arc::clone(&orchestrator),
            TEST_CHAIN_ID,
            6,
            128,
            true,
            true,
            12,
        ));

        let resume = guard
            .startup_check(BlockNumber::new(start), &cancel)
            .await
            .expect("startup check");
        sequencer.reset_expected_block(resume);

        let (batch_tx, batch_rx) = tokio::sync::mpsc::channel(4);
        let (guard_tx, guard_rx) = tokio::sync::mpsc::channel(16);

        let mut handles = fetcher.spawn_workers(&cancel);
        // Miniature head-follow loop: schedules up to the mock head and
        // re-derives its cursor after privileged sequencer resets, exactly
        // like the production scheduler.
        handles.push({
            let chain = Arc::clone(&chain);
            let fetcher = Arc::clone(&fetcher);
            let sequencer = Arc::clone(&sequencer);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut next = sequencer.expected_block();
                let mut generation = sequencer.generation();
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(10)) => {}
                    }
                    let head = chain.head();
                    if sequencer.generation() != generation {
                        generation = sequencer.generation();
                        next = sequencer.expected_block();
                    }
                    if head < next.value() {
                        continue;
                    }
                    let target = BlockNumber::new(head.min(next.value() + 63));
                    if fetcher.schedule(next, target, &cancel).await.is_err() {
                        break;
                    }
                    next = target.next();
                }
            })
        });
        handles.push({
            let sequencer = Arc::clone(&sequencer);
            let guard_tx = guard_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = sequencer.run(results_rx, batch_tx, guard_tx, cancel).await;
            })
        });
        handles.push({
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = processor.run(batch_rx, guard_tx, cancel).await;
            })
        });
        handles.push({
            let guard = Arc::clone(&guard);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = guard.run(guard_rx, cancel).await;
            })
        });

        Self {
            chain,
            pool,
            repo,
            fetcher,
            sequencer,
            processor,
            guard,
            orchestrator,
            cancel,
            handles,
        }
    }

    /// Schedule `[from, to]` through the fetcher.
    pub async fn schedule(&self, from: u64, to: u64) {
        self.fetcher
            .schedule(BlockNumber::new(from), BlockNumber::new(to), &self.cancel)
            .await
            .expect("schedule");
    }

    /// Poll until the checkpoint reaches `target` or the timeout expires.
    pub async fn wait_for_checkpoint(&self, target: u64, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let checkpoint = self
                .repo
                .checkpoint(TEST_CHAIN_ID)
                .await
                .expect("checkpoint query")
                .map_or(0, |c| c.last_synced_block.value());
            if checkpoint >= target {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "checkpoint stuck at {checkpoint}, wanted {target}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Assert parent-hash linearity over all persisted blocks (P1).
    pub fn assert_linear(&self) {
        let blocks = self.repo.blocks();
        for pair in blocks.windows(2) {
            if pair[1].number.value() == pair[0].number.value() + 1 {
                assert_eq!(
                    pair[1].parent_hash, pair[0].hash,
                    "linearity broken between {} and {}",
                    pair[0].number, pair[1].number
                );
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
