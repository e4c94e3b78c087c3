//! Data persistence adapters.
//!
//! - [`PostgresRepository`] - production store over SQLx/PostgreSQL
//! - [`MemoryRepository`] - in-memory store with the same transactional
//!   semantics, for pipeline tests (behind `test-utils`)
//! - [`TokenMetadataService`] - moka-backed token metadata cache with
//!   asynchronous chain refresh and database write-behind

mod metadata;
mod postgres;

#[cfg(any(test, feature = "test-utils"))]
mod memory;

pub use metadata::TokenMetadataService;
pub use postgres::PostgresRepository;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryRepository;
