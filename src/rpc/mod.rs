//! Chain access layer: endpoints, pooling, and quota accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            RpcPool                                  │
//! │                                                                     │
//! │   round-robin over healthy endpoints, retry across the pool         │
//! │                                                                     │
//! │   ┌────────────────┐   ┌────────────────┐   ┌────────────────┐     │
//! │   │  Endpoint #0   │   │  Endpoint #1   │   │  Endpoint #2   │     │
//! │   │  (http, ws)    │   │  limiter       │   │  health state  │     │
//! │   └────────────────┘   └────────────────┘   └────────────────┘     │
//! │                                                                     │
//! │   pool-wide token bucket ──▶ every outbound call                    │
//! │   QuotaMeter ◀── timestamp of every call that acquired a token      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pool presents one aggregate interface; callers never select an
//! endpoint. The quota meter converts the sliding-window usage into a
//! recommended request rate which the lazy manager applies downstream.

mod endpoint;
mod pool;
mod quota;

pub use endpoint::{AlloyEndpoint, BlockHeaderData, EvmRpc, RpcError};
pub use pool::{PoolStatus, RpcPool};
pub use quota::{QuotaMeter, QuotaMode};

pub(crate) use pool::{DirectLimiter, build_limiter};
