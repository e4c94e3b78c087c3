//! Configuration loading and validation for the transfer indexer.
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (highest)
//! 2. Environment-specific file (e.g., `development.toml`)
//! 3. Default file (`default.toml`)
//!
//! # Example
//!
//! ```ignore
//! use tokenflow_indexer::config::Settings;
//!
//! let settings = Settings::load("development")?;
//! println!("chain id: {}", settings.chain.chain_id);
//! ```

mod settings;

pub use settings::{
    ChainSettings, DatabaseSettings, FetchSettings, LazySettings, LoggingSettings, QuotaSettings,
    ReorgSettings, RpcSettings, Settings, StartBlock, TokenFilterMode, TokenSettings,
    WatchdogSettings,
};
