//! Domain types for the transfer indexer.
//!
//! Organized into:
//! - [`primitives`] - Validated newtypes (addresses, amounts, block numbers)
//! - [`entities`] - Persisted entities (blocks, transfers, checkpoints, metadata)
//! - [`events`] - In-flight pipeline data (fetched blocks, decoded transfers,
//!   healing events, system state)

pub mod entities;
pub mod events;
pub mod primitives;

pub use entities::{ActivityType, BlockRecord, Checkpoint, TokenMetadata, TransferRecord};
pub use events::{BlockData, DecodedTransfer, HealingEvent, SystemState};
pub use primitives::{BlockNumber, EthAddress, TokenAmount};
