//! Settings structs and loading logic.
//!
//! All settings have sensible defaults and can be overridden via
//! environment variables or configuration files.

use std::path::Path;
use std::time::Duration;

use alloy::primitives::Address;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Chain ids treated as local development chains (Anvil/Hardhat, legacy Ganache).
const DEV_CHAIN_IDS: &[u64] = &[31_337, 1_337];

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Target chain identity and height policy.
    pub chain: ChainSettings,
    /// RPC pool configuration.
    pub rpc: RpcSettings,
    /// Fetch pipeline configuration.
    pub fetch: FetchSettings,
    /// Token filtering configuration.
    pub tokens: TokenSettings,
    /// Quota meter configuration.
    pub quota: QuotaSettings,
    /// Lazy manager configuration.
    pub lazy: LazySettings,
    /// Deadlock watchdog configuration.
    pub watchdog: WatchdogSettings,
    /// Reorg handling configuration.
    pub reorg: ReorgSettings,
    /// Database configuration.
    pub database: DatabaseSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from configuration files and environment variables.
    ///
    /// Files are loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (if exists)
    /// 3. Environment variables with `INDEXER_` prefix
    ///
    /// # Arguments
    /// * `environment` - Environment name (e.g., "development", "production")
    ///
    /// # Errors
    /// Returns `ConfigError` if configuration is invalid or cannot be loaded.
    pub fn load(environment: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("chain.chain_id", 1)?
            .set_default("chain.rpc_urls", vec!["http://localhost:8545"])?
            .set_default("chain.start_block", "latest")?
            .set_default("chain.strict_height_check", true)?
            .set_default("chain.drift_tolerance", 12)?
            .set_default("rpc.rate_limit", 15.0)?
            .set_default("rpc.burst", 30)?
            .set_default("rpc.request_timeout_ms", 10_000)?
            .set_default("rpc.probe_interval_ms", 10_000)?
            .set_default("rpc.unhealthy_after_failures", 3)?
            .set_default("fetch.concurrency", 4)?
            .set_default("fetch.max_sync_batch", 200)?
            .set_default("fetch.checkpoint_batch_size", 10)?
            .set_default("fetch.retry_queue_size", 5)?
            .set_default("fetch.sequencer_capacity", 1000)?
            .set_default("tokens.watched_addresses", Vec::<String>::new())?
            .set_default("tokens.filter_mode", "all")?
            .set_default("quota.limit", 300)?
            .set_default("quota.window_secs", 60)?
            .set_default("quota.balanced_threshold", 0.50)?
            .set_default("quota.eco_threshold", 0.80)?
            .set_default("lazy.idle_timeout_secs", 300)?
            .set_default("lazy.force_always_active", false)?
            .set_default("watchdog.check_interval_secs", 30)?
            .set_default("watchdog.stall_threshold_secs", 120)?
            .set_default("watchdog.gap_threshold", 100)?
            .set_default("watchdog.safety_margin", 6)?
            .set_default("watchdog.demo_mode", false)?
            .set_default("reorg.startup_check_depth", 6)?
            .set_default("reorg.max_reorg_depth", 128)?
            .set_default("database.url", "postgres://localhost/tokenflow")?
            .set_default("database.max_connections", 25)?
            .set_default("database.min_connections", 1)?
            .set_default("database.connect_timeout_ms", 5000)?
            .set_default("database.idle_timeout_ms", 600_000)?
            .set_default("database.statement_timeout_ms", 15_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // Load default configuration file
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            // Load environment-specific file
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            // Override with environment variables (INDEXER_ prefix)
            .add_source(
                Environment::with_prefix("INDEXER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load settings from a specific file path.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    /// Validate settings and return any validation errors.
    ///
    /// # Errors
    /// Returns a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.chain.chain_id == 0 {
            errors.push("chain.chain_id must be non-zero".into());
        }
        if self.chain.rpc_urls.is_empty() {
            errors.push("chain.rpc_urls cannot be empty".into());
        }
        if self.rpc.rate_limit <= 0.0 {
            errors.push("rpc.rate_limit must be positive".into());
        }
        if self.rpc.burst == 0 {
            errors.push("rpc.burst must be non-zero".into());
        }
        if self.fetch.concurrency == 0 {
            errors.push("fetch.concurrency must be non-zero".into());
        }
        if self.fetch.max_sync_batch == 0 {
            errors.push("fetch.max_sync_batch must be non-zero".into());
        }
        if self.fetch.checkpoint_batch_size == 0 {
            errors.push("fetch.checkpoint_batch_size must be non-zero".into());
        }
        if self.fetch.sequencer_capacity == 0 {
            errors.push("fetch.sequencer_capacity must be non-zero".into());
        }
        if self.tokens.filter_mode == TokenFilterMode::Whitelist
            && self.tokens.watched_addresses.is_empty()
        {
            errors.push("tokens.watched_addresses cannot be empty in whitelist mode".into());
        }
        if let Err(e) = self.tokens.parse_watched() {
            errors.push(format!("tokens.watched_addresses: {e}"));
        }
        if self.quota.limit == 0 {
            errors.push("quota.limit must be non-zero".into());
        }
        if self.quota.window_secs == 0 {
            errors.push("quota.window_secs must be non-zero".into());
        }
        if !(0.0..=1.0).contains(&self.quota.balanced_threshold)
            || !(0.0..=1.0).contains(&self.quota.eco_threshold)
        {
            errors.push("quota thresholds must be within [0, 1]".into());
        }
        if self.quota.balanced_threshold >= self.quota.eco_threshold {
            errors.push("quota.balanced_threshold must be below quota.eco_threshold".into());
        }
        if self.reorg.max_reorg_depth == 0 {
            errors.push("reorg.max_reorg_depth must be non-zero".into());
        }
        if self.database.url.is_empty() {
            errors.push("database.url cannot be empty".into());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be non-zero".into());
        }
        if self.database.min_connections > self.database.max_connections {
            errors.push("database.min_connections cannot exceed max_connections".into());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Whether the target is a local development chain.
    ///
    /// Detected by chain id (Anvil/Hardhat/Ganache defaults) or by every
    /// RPC URL pointing at a loopback host. Dev chains unlock the deadlock
    /// watchdog and the always-active pacing override.
    #[must_use]
    pub fn is_dev_chain(&self) -> bool {
        if DEV_CHAIN_IDS.contains(&self.chain.chain_id) {
            return true;
        }
        !self.chain.rpc_urls.is_empty()
            && self
                .chain
                .rpc_urls
                .iter()
                .all(|url| url.contains("localhost") || url.contains("127.0.0.1"))
    }

    /// Whether the deadlock watchdog may run at all.
    #[must_use]
    pub fn watchdog_enabled(&self) -> bool {
        self.is_dev_chain() || self.watchdog.demo_mode
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Starting block for a fresh index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StartBlock {
    /// Explicit block height.
    Number(u64),
    /// Named position; only "latest" is recognized.
    Named(StartBlockTag),
}

/// Named start positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartBlockTag {
    /// Begin at the chain head observed at boot.
    Latest,
}

impl StartBlock {
    /// Resolve against the observed chain head.
    #[must_use]
    pub const fn resolve(&self, head: u64) -> u64 {
        match self {
            Self::Number(n) => *n,
            Self::Named(StartBlockTag::Latest) => head,
        }
    }
}

impl Default for StartBlock {
    fn default() -> Self {
        Self::Named(StartBlockTag::Latest)
    }
}

/// Target chain identity and height policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    /// Expected chain id; the node-reported id must match at boot.
    pub chain_id: u64,
    /// Ordered RPC endpoint URLs (http(s):// or ws(s)://).
    pub rpc_urls: Vec<String>,
    /// Where to begin when no checkpoint exists.
    #[serde(default)]
    pub start_block: StartBlock,
    /// Fault (rather than repair) when the checkpoint leads the head on
    /// a production chain.
    pub strict_height_check: bool,
    /// Blocks of checkpoint-ahead-of-head drift tolerated before repair
    /// or fault.
    pub drift_tolerance: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RPC
// ═══════════════════════════════════════════════════════════════════════════════

/// RPC pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    /// Pool-wide request budget in requests per second.
    pub rate_limit: f64,
    /// Token-bucket burst capacity.
    pub burst: u32,
    /// Per-call deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Interval between health probes of unhealthy endpoints.
    pub probe_interval_ms: u64,
    /// Consecutive failures before an endpoint is marked unhealthy.
    pub unhealthy_after_failures: u32,
}

impl RpcSettings {
    /// Get the per-call deadline as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the probe interval as a `Duration`.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FETCH PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetch pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSettings {
    /// Number of concurrent fetch workers.
    pub concurrency: usize,
    /// Maximum blocks scheduled per head-follow iteration.
    pub max_sync_batch: u64,
    /// Maximum contiguous blocks committed in one transaction.
    pub checkpoint_batch_size: usize,
    /// Commit retries before a batch is dead-lettered.
    pub retry_queue_size: u32,
    /// Sequencer buffer capacity; overflow is fatal.
    pub sequencer_capacity: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKENS
// ═══════════════════════════════════════════════════════════════════════════════

/// Token filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFilterMode {
    /// Only index transfers of the watched tokens.
    Whitelist,
    /// Index every ERC-20 transfer.
    All,
}

/// Token filtering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSettings {
    /// Watched token contract addresses (hex strings).
    pub watched_addresses: Vec<String>,
    /// Whether the watch-list restricts indexing.
    pub filter_mode: TokenFilterMode,
}

impl TokenSettings {
    /// Parse the watched addresses into alloy types.
    ///
    /// # Errors
    /// Returns the first unparseable address.
    pub fn parse_watched(&self) -> Result<Vec<Address>, String> {
        self.watched_addresses
            .iter()
            .map(|s| s.parse::<Address>().map_err(|e| format!("{s}: {e}")))
            .collect()
    }

    /// Effective watch-list: empty when filtering is disabled.
    ///
    /// # Errors
    /// Returns the first unparseable address.
    pub fn effective_watch_list(&self) -> Result<Vec<Address>, String> {
        match self.filter_mode {
            TokenFilterMode::Whitelist => self.parse_watched(),
            TokenFilterMode::All => Ok(Vec::new()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QUOTA
// ═══════════════════════════════════════════════════════════════════════════════

/// Quota meter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaSettings {
    /// Request quota per window.
    pub limit: usize,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Usage fraction at which pacing starts scaling down.
    pub balanced_threshold: f64,
    /// Usage fraction at which pacing clamps to the eco floor.
    pub eco_threshold: f64,
}

impl QuotaSettings {
    /// Get the window as a `Duration`.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAZY MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Lazy manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LazySettings {
    /// Silence (on both activity sources) before EcoSleep is allowed.
    pub idle_timeout_secs: u64,
    /// Force AlwaysActive regardless of chain detection.
    pub force_always_active: bool,
}

impl LazySettings {
    /// Get the idle timeout as a `Duration`.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WATCHDOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Deadlock watchdog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSettings {
    /// Audit tick interval in seconds.
    pub check_interval_secs: u64,
    /// Sequencer idle time that counts as a stall.
    pub stall_threshold_secs: u64,
    /// Head-to-checkpoint gap that counts as a tear.
    pub gap_threshold: u64,
    /// Blocks kept below the head when force-aligning.
    pub safety_margin: u64,
    /// Enable the watchdog outside dev chains (demos only).
    pub demo_mode: bool,
}

impl WatchdogSettings {
    /// Get the check interval as a `Duration`.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Get the stall threshold as a `Duration`.
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REORG
// ═══════════════════════════════════════════════════════════════════════════════

/// Reorg handling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReorgSettings {
    /// Blocks walked for the startup linearity check.
    pub startup_check_depth: u64,
    /// Runtime walk-back bound; beyond this, the reorg is fatal.
    pub max_reorg_depth: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATABASE
// ═══════════════════════════════════════════════════════════════════════════════

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum connections in the pool.
    pub max_connections: u32,
    /// Minimum connections to maintain.
    pub min_connections: u32,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle connection timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Per-statement deadline in milliseconds.
    pub statement_timeout_ms: u64,
}

impl DatabaseSettings {
    /// Get the connection timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the idle timeout as a `Duration`.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Get the statement deadline as a `Duration`.
    #[must_use]
    pub const fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOGGING
// ═══════════════════════════════════════════════════════════════════════════════

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (e.g., "info", "tokenflow_indexer=debug").
    pub level: String,
    /// Output format: "json" or "pretty".
    pub format: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            chain: ChainSettings {
                chain_id: 1,
                rpc_urls: vec!["https://eth.example.com".into()],
                start_block: StartBlock::Number(100),
                strict_height_check: true,
                drift_tolerance: 12,
            },
            rpc: RpcSettings {
                rate_limit: 15.0,
                burst: 30,
                request_timeout_ms: 10_000,
                probe_interval_ms: 10_000,
                unhealthy_after_failures: 3,
            },
            fetch: FetchSettings {
                concurrency: 4,
                max_sync_batch: 200,
                checkpoint_batch_size: 10,
                retry_queue_size: 5,
                sequencer_capacity: 1000,
            },
            tokens: TokenSettings {
                watched_addresses: vec![],
                filter_mode: TokenFilterMode::All,
            },
            quota: QuotaSettings {
                limit: 300,
                window_secs: 60,
                balanced_threshold: 0.50,
                eco_threshold: 0.80,
            },
            lazy: LazySettings {
                idle_timeout_secs: 300,
                force_always_active: false,
            },
            watchdog: WatchdogSettings {
                check_interval_secs: 30,
                stall_threshold_secs: 120,
                gap_threshold: 100,
                safety_margin: 6,
                demo_mode: false,
            },
            reorg: ReorgSettings {
                startup_check_depth: 6,
                max_reorg_depth: 128,
            },
            database: DatabaseSettings {
                url: "postgres://localhost/tokenflow".into(),
                max_connections: 25,
                min_connections: 1,
                connect_timeout_ms: 5000,
                idle_timeout_ms: 600_000,
                statement_timeout_ms: 15_000,
            },
            logging: LoggingSettings {
                level: "info".into(),
                format: "json".into(),
            },
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn whitelist_mode_requires_addresses() {
        let mut settings = base_settings();
        settings.tokens.filter_mode = TokenFilterMode::Whitelist;
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("watched_addresses")));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut settings = base_settings();
        settings.quota.balanced_threshold = 0.9;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bad_watched_address_is_reported() {
        let mut settings = base_settings();
        settings.tokens.watched_addresses = vec!["not-an-address".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn dev_chain_by_id() {
        let mut settings = base_settings();
        settings.chain.chain_id = 31_337;
        assert!(settings.is_dev_chain());
        assert!(settings.watchdog_enabled());
    }

    #[test]
    fn dev_chain_by_loopback_urls() {
        let mut settings = base_settings();
        settings.chain.rpc_urls = vec!["http://127.0.0.1:8545".into()];
        assert!(settings.is_dev_chain());
    }

    #[test]
    fn mainnet_is_not_dev() {
        let settings = base_settings();
        assert!(!settings.is_dev_chain());
        assert!(!settings.watchdog_enabled());
    }

    #[test]
    fn demo_mode_enables_watchdog_on_production() {
        let mut settings = base_settings();
        settings.watchdog.demo_mode = true;
        assert!(settings.watchdog_enabled());
    }

    #[test]
    fn start_block_resolution() {
        assert_eq!(StartBlock::Number(42).resolve(1000), 42);
        assert_eq!(StartBlock::Named(StartBlockTag::Latest).resolve(1000), 1000);
    }

    #[test]
    fn effective_watch_list_empty_in_all_mode() {
        let tokens = TokenSettings {
            watched_addresses: vec!["0x1234567890123456789012345678901234567890".into()],
            filter_mode: TokenFilterMode::All,
        };
        assert!(tokens.effective_watch_list().unwrap().is_empty());
    }
}
