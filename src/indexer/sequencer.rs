//! Out-of-order buffer with strict monotonic emission.
//!
//! Fetch workers complete blocks in whatever order the network allows; the
//! sequencer buffers them by number and releases contiguous runs starting
//! at the expected-next cursor. Downstream (the processor) therefore sees
//! blocks in strictly increasing, contiguous order.
//!
//! ```text
//! results: 104 102 100 103 101      batches: [100 101 102 103 104]
//!            │   │   │   │   │  ──▶
//!            └───┴───┴───┴───┴── buffer keyed by number, drained from E
//! ```
//!
//! # Overflow
//!
//! A buffer that reaches capacity means the expected block is never going
//! to arrive (a scheduling gap upstream). That is a bug, not load: the
//! sequencer surfaces a fatal overflow instead of silently dropping.
//!
//! # Reorg trigger
//!
//! Before a block joins a batch, its parent hash is checked against the
//! last emitted hash. A mismatch raises a guard signal and stops emission
//! until the guard resets the cursor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use alloy::primitives::B256;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::consistency::GuardSignal;
use crate::error::{AppError, InfraError, Result};
use crate::types::events::BlockData;
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// SEQUENCER
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of the last block handed downstream.
#[derive(Debug, Clone, Copy)]
struct LastEmitted {
    number: u64,
    /// `None` when the block carried no header.
    hash: Option<B256>,
}

/// Reordering buffer between fetch workers and the processor.
#[derive(Debug)]
pub struct Sequencer {
    expected: RwLock<u64>,
    last_emitted: RwLock<Option<LastEmitted>>,
    last_emit_at: RwLock<Instant>,
    /// Bumped on every privileged reset so schedulers can detect cursor
    /// rewrites and re-derive their position.
    generation: AtomicU64,
    buffer: Mutex<BTreeMap<u64, BlockData>>,
    capacity: usize,
    batch_size: usize,
}

impl Sequencer {
    /// Create a sequencer expecting `start_block` first.
    #[must_use]
    pub fn new(start_block: BlockNumber, capacity: usize, batch_size: usize) -> Self {
        Self {
            expected: RwLock::new(start_block.value()),
            last_emitted: RwLock::new(None),
            last_emit_at: RwLock::new(Instant::now()),
            generation: AtomicU64::new(0),
            buffer: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// The block the sequencer will emit next.
    #[must_use]
    pub fn expected_block(&self) -> BlockNumber {
        BlockNumber::new(*self.expected.read())
    }

    /// Time since the last emission.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_emit_at.read().elapsed()
    }

    /// Current buffered block count.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Reset-generation counter; changes whenever a privileged reset ran.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Privileged: move the expected cursor.
    ///
    /// Reserved for the consistency guard and the deadlock watchdog.
    pub fn reset_expected_block(&self, block: BlockNumber) {
        info!(expected = %block, "Sequencer cursor reset");
        *self.expected.write() = block.value();
        *self.last_emitted.write() = None;
        *self.last_emit_at.write() = Instant::now();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Privileged: drop every buffered block.
    ///
    /// Reserved for the consistency guard and the deadlock watchdog.
    pub fn clear_buffer(&self) {
        let dropped = {
            let mut buffer = self.buffer.lock();
            let len = buffer.len();
            buffer.clear();
            len
        };
        if dropped > 0 {
            info!(dropped, "Sequencer buffer cleared");
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Consume fetch results and emit ordered batches until cancelled or
    /// the results channel closes.
    ///
    /// # Errors
    ///
    /// - [`AppError::BufferOverflow`] when the buffer fills without the
    ///   expected block arriving
    /// - Channel errors when the processor side is gone
    pub async fn run(
        &self,
        mut results_rx: mpsc::Receiver<BlockData>,
        batch_tx: mpsc::Sender<Vec<BlockData>>,
        guard_tx: mpsc::Sender<GuardSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let data = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                received = results_rx.recv() => match received {
                    Some(data) => data,
                    None => return Ok(()),
                },
            };

            if let Some(overflow) = self.insert(data) {
                return Err(overflow);
            }

            let (batches, reorg) = self.drain();

            for batch in batches {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    sent = batch_tx.send(batch) => {
                        sent.map_err(|_| {
                            InfraError::Internal("processor channel closed".into())
                        })?;
                    }
                }
            }

            if let Some(signal) = reorg {
                guard_tx
                    .send(signal)
                    .await
                    .map_err(|_| InfraError::Internal("guard channel closed".into()))?;
            }
        }
    }

    /// Buffer a block; returns the fatal overflow error when capacity is hit.
    fn insert(&self, data: BlockData) -> Option<AppError> {
        let expected = *self.expected.read();
        let number = data.number.value();

        if number < expected {
            // Leftover from before a cursor reset
            debug!(number, expected, "Dropping stale block");
            return None;
        }

        let mut buffer = self.buffer.lock();
        buffer.insert(number, data);
        // Overflow only counts when the buffer is stuck: capacity reached
        // while the expected block is still missing.
        if buffer.len() >= self.capacity && !buffer.contains_key(&expected) {
            return Some(AppError::BufferOverflow {
                buffered: buffer.len(),
                expected: BlockNumber::new(expected),
            });
        }
        None
    }

    /// Pull contiguous runs out of the buffer. Returns the completed
    /// batches and, when a parent-hash mismatch interrupted emission, the
    /// guard signal to raise.
    fn drain(&self) -> (Vec<Vec<BlockData>>, Option<GuardSignal>) {
        let mut batches = Vec::new();
        let mut batch: Vec<BlockData> = Vec::new();
        let mut reorg = None;

        loop {
            let mut expected = self.expected.write();
            let mut buffer = self.buffer.lock();
            let Some(data) = buffer.remove(&*expected) else {
                break;
            };

            if let Some(mismatch) = self.chain_break(&data) {
                warn!(
                    number = %data.number,
                    "Parent hash mismatch, raising reorg"
                );
                // The mismatching block is dropped; it will be refetched
                // after the guard rewinds the cursor.
                reorg = Some(mismatch);
                break;
            }

            *self.last_emitted.write() = Some(LastEmitted {
                number: data.number.value(),
                hash: data.hash,
            });
            *self.last_emit_at.write() = Instant::now();
            *expected += 1;
            drop(buffer);
            drop(expected);

            batch.push(data);
            if batch.len() == self.batch_size {
                batches.push(std::mem::take(&mut batch));
            }
        }

        if !batch.is_empty() {
            batches.push(batch);
        }
        (batches, reorg)
    }

    /// Detect a hash-chain break between the last emitted block and `next`.
    ///
    /// Only checkable when both sides carry a hash and the numbers are
    /// adjacent; headerless placeholders pass through unchecked.
    fn chain_break(&self, next: &BlockData) -> Option<GuardSignal> {
        let last = (*self.last_emitted.read())?;
        let last_hash = last.hash?;
        let parent_hash = next.parent_hash?;
        if next.number.value() == last.number + 1 && parent_hash != last_hash {
            return Some(GuardSignal::ReorgAt {
                number: next.number,
                parent_hash,
            });
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
