//! Multi-endpoint RPC pool with health tracking, failover and rate limiting.
//!
//! The pool keeps an ordered list of endpoints. Calls round-robin over the
//! currently healthy ones; a transport/429/5xx failure moves on to the next
//! endpoint, up to pool-size retries, after which the call surfaces
//! `AllEndpointsFailed`. Endpoints that fail repeatedly are benched until a
//! background probe sees a successful `eth_blockNumber` from them.
//!
//! Every outbound call first acquires a token from the pool-wide limiter
//! AND the endpoint's limiter (token-bucket semantics via `governor`), then
//! records itself into the quota meter. Cancellation during a limiter wait
//! returns without consuming a token.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use alloy::rpc::types::{Filter, Log};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::endpoint::{AlloyEndpoint, BlockHeaderData, EvmRpc, RpcError};
use super::quota::QuotaMeter;
use crate::config::{ChainSettings, RpcSettings};
use crate::error::{AppError, InfraError, Result};
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// LIMITERS
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build a token-bucket limiter for a (possibly fractional) request rate.
pub(crate) fn build_limiter(rps: f64, burst: u32) -> Arc<DirectLimiter> {
    let period = Duration::from_secs_f64(1.0 / rps.max(0.001));
    let burst = NonZeroU32::new(burst.max(1)).map_or(NonZeroU32::MIN, |b| b);
    let quota = Quota::with_period(period)
        .map_or_else(|| Quota::per_second(NonZeroU32::MIN), |q| q)
        .allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Exponential moving average weight for latency samples.
const LATENCY_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
struct EndpointState {
    healthy: bool,
    consecutive_failures: u32,
    latency_ema_ms: f64,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            latency_ema_ms: 0.0,
        }
    }
}

struct PoolEndpoint {
    url: String,
    client: Arc<dyn EvmRpc>,
    limiter: RwLock<Arc<DirectLimiter>>,
    state: RwLock<EndpointState>,
}

impl std::fmt::Debug for PoolEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEndpoint")
            .field("url", &self.url)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

/// Health snapshot of one endpoint, for logging and the status surface.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Endpoint URL.
    pub url: String,
    /// Whether the endpoint is in rotation.
    pub healthy: bool,
    /// Consecutive failures recorded.
    pub consecutive_failures: u32,
    /// Moving latency estimate in milliseconds.
    pub latency_ms: f64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RPC POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregate chain client over an ordered endpoint list.
pub struct RpcPool {
    endpoints: Vec<Arc<PoolEndpoint>>,
    pool_limiter: RwLock<Arc<DirectLimiter>>,
    quota: Arc<QuotaMeter>,
    cursor: AtomicUsize,
    unhealthy_after: u32,
}

impl std::fmt::Debug for RpcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPool")
            .field("endpoints", &self.endpoints)
            .field("unhealthy_after", &self.unhealthy_after)
            .finish_non_exhaustive()
    }
}

impl RpcPool {
    /// Build a pool from pre-constructed clients.
    ///
    /// Exposed so tests can inject mock endpoints; production code uses
    /// [`Self::connect`].
    #[must_use]
    pub fn new(
        clients: Vec<(String, Arc<dyn EvmRpc>)>,
        quota: Arc<QuotaMeter>,
        settings: &RpcSettings,
    ) -> Self {
        let endpoints = clients
            .into_iter()
            .map(|(url, client)| {
                Arc::new(PoolEndpoint {
                    url,
                    client,
                    limiter: RwLock::new(build_limiter(settings.rate_limit, settings.burst)),
                    state: RwLock::new(EndpointState::default()),
                })
            })
            .collect();

        Self {
            endpoints,
            pool_limiter: RwLock::new(build_limiter(settings.rate_limit, settings.burst)),
            quota,
            cursor: AtomicUsize::new(0),
            unhealthy_after: settings.unhealthy_after_failures.max(1),
        }
    }

    /// Connect every configured endpoint and build the pool.
    ///
    /// Endpoints that fail to connect are skipped with a warning; an empty
    /// result is an initialization error.
    ///
    /// # Errors
    ///
    /// Returns an error when no endpoint could be connected.
    pub async fn connect(
        chain: &ChainSettings,
        settings: &RpcSettings,
        quota: Arc<QuotaMeter>,
    ) -> Result<Self> {
        let mut clients: Vec<(String, Arc<dyn EvmRpc>)> = Vec::new();
        for url in &chain.rpc_urls {
            match AlloyEndpoint::connect(url, settings.request_timeout()).await {
                Ok(endpoint) => clients.push((url.clone(), Arc::new(endpoint))),
                Err(e) => warn!(url, error = %e, "Failed to connect endpoint, skipping"),
            }
        }

        if clients.is_empty() {
            return Err(AppError::Initialization(
                "no RPC endpoint could be connected".into(),
            ));
        }

        info!(count = clients.len(), "RPC pool connected");
        Ok(Self::new(clients, quota, settings))
    }

    /// Number of endpoints currently in rotation.
    #[must_use]
    pub fn healthy_node_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|ep| ep.state.read().healthy)
            .count()
    }

    /// Health snapshot of every endpoint.
    #[must_use]
    pub fn status(&self) -> Vec<PoolStatus> {
        self.endpoints
            .iter()
            .map(|ep| {
                let state = *ep.state.read();
                PoolStatus {
                    url: ep.url.clone(),
                    healthy: state.healthy,
                    consecutive_failures: state.consecutive_failures,
                    latency_ms: state.latency_ema_ms,
                }
            })
            .collect()
    }

    /// Replace the pool-wide and per-endpoint token buckets.
    pub fn set_rate_limit(&self, rps: f64, burst: u32) {
        debug!(rps, burst, "Pool rate limit updated");
        *self.pool_limiter.write() = build_limiter(rps, burst);
        for endpoint in &self.endpoints {
            *endpoint.limiter.write() = build_limiter(rps, burst);
        }
    }

    /// The quota meter fed by this pool.
    #[must_use]
    pub fn quota(&self) -> &Arc<QuotaMeter> {
        &self.quota
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Aggregate chain calls
    // ───────────────────────────────────────────────────────────────────────────

    /// `eth_blockNumber` via the healthiest rotation.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` on token cancellation, `AllEndpointsFailed`
    /// after a full failed rotation.
    pub async fn latest_block_number(&self, cancel: &CancellationToken) -> Result<u64> {
        self.execute(cancel, |client| async move {
            client.latest_block_number().await
        })
        .await
    }

    /// `eth_chainId`.
    ///
    /// # Errors
    ///
    /// See [`Self::latest_block_number`].
    pub async fn chain_id(&self, cancel: &CancellationToken) -> Result<u64> {
        self.execute(cancel, |client| async move { client.chain_id().await })
            .await
    }

    /// Header fields for a block (transaction hashes variant).
    ///
    /// # Errors
    ///
    /// See [`Self::latest_block_number`].
    pub async fn header_by_number(
        &self,
        cancel: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>> {
        self.execute(cancel, move |client| async move {
            client.header_by_number(number).await
        })
        .await
    }

    /// Full block fetch (used when no watch-list narrows the filter).
    ///
    /// # Errors
    ///
    /// See [`Self::latest_block_number`].
    pub async fn block_by_number(
        &self,
        cancel: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>> {
        self.execute(cancel, move |client| async move {
            client.block_by_number(number).await
        })
        .await
    }

    /// `eth_getLogs`.
    ///
    /// # Errors
    ///
    /// See [`Self::latest_block_number`].
    pub async fn logs(&self, cancel: &CancellationToken, filter: &Filter) -> Result<Vec<Log>> {
        self.execute(cancel, |client| {
            let filter = filter.clone();
            async move { client.logs(&filter).await }
        })
        .await
    }

    /// ERC-20 metadata (`symbol`, `decimals`, `name`) for a token contract.
    ///
    /// # Errors
    ///
    /// See [`Self::latest_block_number`].
    pub async fn token_metadata(
        &self,
        cancel: &CancellationToken,
        token: alloy::primitives::Address,
    ) -> Result<Option<(String, u8, String)>> {
        self.execute(cancel, move |client| async move {
            client.token_metadata(token).await
        })
        .await
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────────────

    async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn EvmRpc>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RpcError>>,
    {
        // Initial attempt plus up to pool-size retries on the next
        // endpoints; a single-endpoint pool retries itself once.
        let attempts = self.endpoints.len() + 1;
        let mut last_error: Option<RpcError> = None;

        for _ in 0..attempts {
            let Some(endpoint) = self.next_healthy() else {
                break;
            };

            self.acquire_tokens(&endpoint, cancel).await?;
            self.quota.record();

            let started = Instant::now();
            match op(Arc::clone(&endpoint.client)).await {
                Ok(value) => {
                    self.mark_success(&endpoint, started.elapsed());
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    metrics::counter!("rpc_errors").increment(1);
                    self.mark_failure(&endpoint);
                    debug!(url = %endpoint.url, error = %err, "Endpoint call failed, rotating");
                    last_error = Some(err);
                }
                Err(err) => {
                    return Err(InfraError::Rpc(Box::new(err)).into());
                }
            }
        }

        let detail = last_error.map_or_else(|| "no healthy endpoints".into(), |e| e.to_string());
        Err(InfraError::AllEndpointsFailed(detail).into())
    }

    /// Acquire the pool-wide and per-endpoint tokens, observing cancellation.
    async fn acquire_tokens(
        &self,
        endpoint: &PoolEndpoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pool_limiter = Arc::clone(&self.pool_limiter.read());
        tokio::select! {
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            () = pool_limiter.until_ready() => {}
        }
        let endpoint_limiter = Arc::clone(&endpoint.limiter.read());
        tokio::select! {
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            () = endpoint_limiter.until_ready() => {}
        }
        Ok(())
    }

    /// Next healthy endpoint in round-robin order, if any.
    fn next_healthy(&self) -> Option<Arc<PoolEndpoint>> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|i| &self.endpoints[(start + i) % len])
            .find(|ep| ep.state.read().healthy)
            .map(Arc::clone)
    }

    fn mark_success(&self, endpoint: &PoolEndpoint, latency: Duration) {
        let mut state = endpoint.state.write();
        let sample = latency.as_secs_f64() * 1000.0;
        state.latency_ema_ms = if state.latency_ema_ms == 0.0 {
            sample
        } else {
            state
                .latency_ema_ms
                .mul_add(1.0 - LATENCY_EMA_ALPHA, sample * LATENCY_EMA_ALPHA)
        };
        if !state.healthy {
            info!(url = %endpoint.url, "Endpoint restored to rotation");
        }
        state.healthy = true;
        state.consecutive_failures = 0;
    }

    fn mark_failure(&self, endpoint: &PoolEndpoint) {
        let mut state = endpoint.state.write();
        state.consecutive_failures += 1;
        if state.healthy && state.consecutive_failures >= self.unhealthy_after {
            warn!(
                url = %endpoint.url,
                failures = state.consecutive_failures,
                "Endpoint marked unhealthy"
            );
            state.healthy = false;
        }
    }

    /// Spawn the background probe that revives benched endpoints on their
    /// first successful `eth_blockNumber`.
    #[instrument(skip_all)]
    pub fn spawn_probe(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for endpoint in &pool.endpoints {
                    if endpoint.state.read().healthy {
                        continue;
                    }
                    pool.quota.record();
                    match endpoint.client.latest_block_number().await {
                        Ok(head) => {
                            debug!(url = %endpoint.url, head, "Probe succeeded");
                            pool.mark_success(endpoint, Duration::ZERO);
                        }
                        Err(err) => {
                            debug!(url = %endpoint.url, error = %err, "Probe failed");
                        }
                    }
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
