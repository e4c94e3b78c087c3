//! Single-endpoint chain access.
//!
//! [`EvmRpc`] abstracts the minimal JSON-RPC surface the pipeline needs so
//! the pool (and every test) can run against mocks. [`AlloyEndpoint`] is
//! the production adapter over an `alloy` provider, connected via HTTP or
//! WebSocket depending on the URL scheme.

use std::fmt;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::network::Ethereum;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::timeout;

use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Classified endpoint error.
///
/// The pool retries retryable kinds on the next endpoint; everything else
/// surfaces immediately.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Connection-level failure (DNS, TLS, socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// Call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 429 from the endpoint.
    #[error("rate limited by endpoint")]
    RateLimited,

    /// HTTP 5xx or JSON-RPC server error.
    #[error("server error: {0}")]
    Server(String),

    /// Cancellation observed while waiting.
    #[error("cancelled")]
    Cancelled,

    /// Response present but not usable (missing block, bad shape).
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl RpcError {
    /// Whether the pool should retry this call on another endpoint.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited | Self::Server(_)
        )
    }

    /// Classify an alloy transport error by its rendering.
    ///
    /// Alloy flattens HTTP status and JSON-RPC errors into one transport
    /// error type; the status code survives in the message.
    pub(crate) fn classify(err: &dyn fmt::Display) -> Self {
        let text = err.to_string();
        if text.contains("429") || text.contains("Too Many Requests") {
            return Self::RateLimited;
        }
        if text.contains("500")
            || text.contains("502")
            || text.contains("503")
            || text.contains("504")
        {
            return Self::Server(text);
        }
        Self::Transport(text)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEADER DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// The header fields the pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderData {
    /// Block height.
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVM RPC PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal JSON-RPC surface of one endpoint.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// `eth_blockNumber`.
    async fn latest_block_number(&self) -> Result<u64, RpcError>;

    /// `eth_chainId`.
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// `eth_getBlockByNumber` with transaction hashes only.
    ///
    /// Returns `None` when the block does not exist (yet).
    async fn header_by_number(&self, number: BlockNumber)
    -> Result<Option<BlockHeaderData>, RpcError>;

    /// `eth_getBlockByNumber` with full transaction bodies.
    ///
    /// The pipeline only consumes header fields, but the full variant is
    /// issued when no watch-list narrows the log filter.
    async fn block_by_number(&self, number: BlockNumber)
    -> Result<Option<BlockHeaderData>, RpcError>;

    /// `eth_getLogs`.
    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;

    /// ERC-20 metadata via `eth_call` (`symbol()`, `decimals()`, `name()`).
    ///
    /// Returns `None` when the contract does not answer the metadata
    /// interface (non-standard tokens).
    async fn token_metadata(
        &self,
        token: Address,
    ) -> Result<Option<(String, u8, String)>, RpcError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// ALLOY ADAPTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Production endpoint over an alloy provider.
#[derive(Clone)]
pub struct AlloyEndpoint {
    url: String,
    provider: DynProvider<Ethereum>,
    request_timeout: Duration,
}

impl fmt::Debug for AlloyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlloyEndpoint")
            .field("url", &self.url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl AlloyEndpoint {
    /// Connect to an endpoint, choosing transport from the URL scheme.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the URL is invalid or the
    /// WebSocket handshake fails.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, RpcError> {
        let provider: DynProvider<Ethereum> =
            if url.starts_with("ws://") || url.starts_with("wss://") {
                let ws = ProviderBuilder::new()
                    .connect_ws(WsConnect::new(url))
                    .await
                    .map_err(|e| RpcError::classify(&e))?;
                DynProvider::new(ws)
            } else {
                let parsed = url
                    .parse()
                    .map_err(|e| RpcError::Transport(format!("invalid url {url}: {e}")))?;
                DynProvider::new(ProviderBuilder::new().connect_http(parsed))
            };

        Ok(Self {
            url: url.to_string(),
            provider,
            request_timeout,
        })
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: std::future::Future<Output = Result<T, RpcError>> + Send,
    {
        timeout(self.request_timeout, fut)
            .await
            .map_err(|_| RpcError::Timeout(self.request_timeout))?
    }

    fn header_from_block(block: &alloy::rpc::types::Block) -> Result<BlockHeaderData, RpcError> {
        // Block timestamps stay within i64 until year ~292 billion
        #[allow(clippy::cast_possible_wrap)]
        let timestamp = DateTime::<Utc>::from_timestamp(block.header.timestamp as i64, 0)
            .ok_or_else(|| {
                RpcError::BadResponse(format!("invalid timestamp {}", block.header.timestamp))
            })?;

        Ok(BlockHeaderData {
            number: BlockNumber::new(block.header.number),
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp,
        })
    }
}

#[async_trait]
impl EvmRpc for AlloyEndpoint {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        self.with_deadline(async {
            self.provider
                .get_block_number()
                .await
                .map_err(|e| RpcError::classify(&e))
        })
        .await
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.with_deadline(async {
            self.provider
                .get_chain_id()
                .await
                .map_err(|e| RpcError::classify(&e))
        })
        .await
    }

    async fn header_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>, RpcError> {
        self.with_deadline(async {
            let block = self
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number.value()))
                .await
                .map_err(|e| RpcError::classify(&e))?;

            block.as_ref().map(Self::header_from_block).transpose()
        })
        .await
    }

    async fn block_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeaderData>, RpcError> {
        self.with_deadline(async {
            let block = self
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number.value()))
                .full()
                .await
                .map_err(|e| RpcError::classify(&e))?;

            block.as_ref().map(Self::header_from_block).transpose()
        })
        .await
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.with_deadline(async {
            self.provider
                .get_logs(filter)
                .await
                .map_err(|e| RpcError::classify(&e))
        })
        .await
    }

    async fn token_metadata(
        &self,
        token: Address,
    ) -> Result<Option<(String, u8, String)>, RpcError> {
        let contract = crate::abi::IERC20::new(token, self.provider.clone());
        self.with_deadline(async {
            // Non-standard tokens revert on these getters; treat any call
            // failure as "no metadata" rather than an endpoint fault.
            let symbol = contract.symbol().call().await;
            let decimals = contract.decimals().call().await;
            let name = contract.name().call().await;
            match (symbol, decimals, name) {
                (Ok(symbol), Ok(decimals), Ok(name)) => Ok(Some((symbol, decimals, name))),
                _ => Ok(None),
            }
        })
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
