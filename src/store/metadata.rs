//! Token metadata cache with asynchronous chain refresh.
//!
//! Symbol enrichment must never block a batch commit: the processor asks
//! the cache, takes whatever is there, and a miss schedules a background
//! fetch whose result lands in later transfers. The cache is warmed from
//! the database at boot and written behind on every successful fetch.
//!
//! # TTL Strategy
//!
//! | Cache | TTL | Max Size | Rationale |
//! |-------|-----|----------|-----------|
//! | Metadata | 1 h | 10,000 | Token metadata is near-immutable |
//!
//! A dashmap of in-flight addresses deduplicates concurrent misses for the
//! same token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use moka::sync::Cache as MokaCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::ports::Repository;
use crate::rpc::RpcPool;
use crate::types::entities::TokenMetadata;
use crate::types::primitives::EthAddress;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata cache TTL. Token metadata rarely changes.
const METADATA_TTL: Duration = Duration::from_secs(3600);

/// Metadata cache max capacity.
const METADATA_MAX_CAPACITY: u64 = 10_000;

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN METADATA SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Eventually-consistent token metadata cache.
pub struct TokenMetadataService {
    cache: MokaCache<EthAddress, TokenMetadata>,
    in_flight: DashMap<EthAddress, ()>,
    pool: Arc<RpcPool>,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TokenMetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMetadataService")
            .field("cached", &self.cache.entry_count())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl TokenMetadataService {
    /// Create the service.
    #[must_use]
    pub fn new(pool: Arc<RpcPool>, repo: Arc<dyn Repository>, cancel: CancellationToken) -> Self {
        Self {
            cache: MokaCache::builder()
                .time_to_live(METADATA_TTL)
                .max_capacity(METADATA_MAX_CAPACITY)
                .build(),
            in_flight: DashMap::new(),
            pool,
            repo,
            cancel,
        }
    }

    /// Warm the cache from persisted metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<usize> {
        let all = self.repo.load_all_metadata().await?;
        let count = all.len();
        for metadata in all {
            self.cache.insert(metadata.address, metadata);
        }
        debug!(count, "Metadata cache warmed");
        Ok(count)
    }

    /// Symbol for a token, if cached. Never blocks; a miss schedules an
    /// asynchronous refresh.
    #[must_use]
    pub fn lookup_symbol(self: &Arc<Self>, token: EthAddress) -> Option<String> {
        if let Some(metadata) = self.cache.get(&token) {
            return Some(metadata.symbol);
        }
        self.schedule_fetch(token);
        None
    }

    /// Full cached metadata for a token, if present.
    #[must_use]
    pub fn get(&self, token: EthAddress) -> Option<TokenMetadata> {
        self.cache.get(&token)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }

    /// Schedule a background metadata fetch unless one is already running
    /// for this token.
    fn schedule_fetch(self: &Arc<Self>, token: EthAddress) {
        if self.in_flight.insert(token, ()).is_some() {
            return;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.fetch_and_store(token).await;
            service.in_flight.remove(&token);
        });
    }

    async fn fetch_and_store(&self, token: EthAddress) {
        let result = self.pool.token_metadata(&self.cancel, token.into()).await;

        match result {
            Ok(Some((symbol, decimals, name))) => {
                let metadata = TokenMetadata {
                    address: token,
                    symbol,
                    decimals,
                    name,
                    updated_at: Utc::now(),
                };
                self.cache.insert(token, metadata.clone());
                if let Err(e) = self.repo.save_token_metadata(&metadata).await {
                    warn!(token = %token, error = %e, "Failed to persist token metadata");
                }
                debug!(token = %token, symbol = %metadata.symbol, "Token metadata refreshed");
            }
            Ok(None) => {
                debug!(token = %token, "Token does not expose metadata");
            }
            Err(e) => {
                debug!(token = %token, error = %e, "Token metadata fetch failed");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
