//! Tokenflow Indexer
//!
//! Indexes an EVM-compatible chain into PostgreSQL so downstream
//! consumers (dashboards, APIs, WebSocket feeds) can query recent blocks
//! and a filtered stream of ERC-20 `Transfer` events with low latency and
//! strong ordering guarantees.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        INGESTION CORE                           │
//! │  ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌────────────┐  │
//! │  │ RPC Pool │──▶│ Fetcher  │──▶│ Sequencer │──▶│ Processor  │  │
//! │  └──────────┘   └──────────┘   └───────────┘   └─────┬──────┘  │
//! │       ▲               ▲              │               │         │
//! │  QuotaMeter      LazyManager   ConsistencyGuard   Repository   │
//! │                                                                 │
//! │  DeadlockWatchdog (dev chains) · Orchestrator (snapshot)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Blocks reach the processor in strictly increasing, contiguous order
//! - Every batch commits atomically with its checkpoint advance
//! - A persisted checkpoint `N` means every block `<= N` is present
//! - Parent-hash linearity holds across the persisted chain; reorgs are
//!   rewound to the fork point and replayed
//!
//! # Modules
//!
//! - [`types`] - Domain types (primitives, entities, pipeline data)
//! - [`error`] - Layered error types
//! - [`config`] - Configuration loading and validation
//! - [`abi`] - ERC-20 ABI bindings
//! - [`rpc`] - Endpoint pool, rate limiting, quota metering
//! - [`indexer`] - The pipeline (fetcher, sequencer, processor, guard,
//!   lazy manager, watchdog, orchestrator)
//! - [`ports`] - Trait seams for storage and time
//! - [`store`] - PostgreSQL adapter, metadata cache, test stores
//! - [`app`] - Composition root
//!
//! # Getting Started
//!
//! ```bash
//! # Set up environment
//! cp .env.example .env
//! # Edit .env with your configuration
//!
//! # Run migrations
//! tokenflow-indexer migrate
//!
//! # Start the indexer
//! tokenflow-indexer run
//! ```

pub mod abi;
pub mod app;
pub mod config;
pub mod error;
pub mod indexer;
pub mod ports;
pub mod rpc;
pub mod store;
pub mod types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string
#[must_use]
pub const fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().starts_with("0."));
    }
}
