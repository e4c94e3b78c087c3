//! The ingestion and ordering pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            INDEXER PIPELINE                              │
//! │                                                                          │
//! │  RpcPool ──▶ Fetcher ──results──▶ Sequencer ──batches──▶ Processor       │
//! │     ▲           ▲                     │                      │           │
//! │     │        pacing                reorg│  commit-failure    │           │
//! │  QuotaMeter ◀── LazyManager           ▼                      ▼           │
//! │                              ConsistencyGuard ◀──────────────┘           │
//! │                                                                          │
//! │  DeadlockWatchdog ── audits (head, expected, cursor), dev chains only    │
//! │  Orchestrator ── shared snapshot, broadcast to external observers        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks reach the processor in strictly increasing, contiguous order;
//! each batch commits atomically with its checkpoint advance. The guard
//! rewinds persisted state on reorgs; the watchdog repairs space-time
//! tears on development chains; the lazy manager paces the fetcher from
//! the quota meter's sliding-window usage.

mod consistency;
mod fetcher;
mod lazy;
mod orchestrator;
mod processor;
mod sequencer;
mod watchdog;

pub use consistency::{ConsistencyGuard, GuardSignal, ReorgStats};
pub use fetcher::Fetcher;
pub use lazy::{ActivityState, ActivityTracker, LazyManager};
pub use orchestrator::{Orchestrator, Snapshot};
pub use processor::{DeadLetterBatch, Processor, decode_transfer};
pub use sequencer::Sequencer;
pub use watchdog::DeadlockWatchdog;
