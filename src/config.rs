use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// HTTP JSON-RPC endpoint used for reads and transaction submission
    pub rpc_url: String,
    /// WebSocket endpoint for log subscriptions (polling only when absent)
    #[serde(default)]
    pub ws_url: Option<String>,
    pub chain_id: u64,
    /// Game contract address
    pub contract_address: String,
    /// Hex private key of the local player (falls back to AGENT_PRIVATE_KEY)
    #[serde(default)]
    pub private_key: Option<String>,
    /// Per-call RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Move timeout used when the contract reports none (seconds)
    #[serde(default = "default_move_timeout_secs")]
    pub default_move_timeout_secs: u64,
}

fn default_rpc_timeout_ms() -> u64 {
    15_000
}

fn default_move_timeout_secs() -> u64 {
    600
}

impl LedgerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    /// Base URL of the decryption / input-proof relayer
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_relayer_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per call for retryable oracle failures
    #[serde(default = "default_relayer_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts, doubled each retry
    #[serde(default = "default_relayer_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_relayer_timeout_ms() -> u64 {
    30_000
}

fn default_relayer_attempts() -> u32 {
    4
}

fn default_relayer_backoff_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL, or `memory://` for a process-local store
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler loop tick (ms)
    pub tick_ms: u64,
    /// Revisit interval for waiting phases (ms)
    pub poll_interval_ms: u64,
    /// Revisit interval while a transaction awaits confirmation (ms)
    pub confirm_poll_ms: u64,
    /// Maximum concurrent game steps
    pub max_workers: usize,
    /// Upper bound for one state-machine step (secs)
    pub step_timeout_secs: u64,
    /// Consecutive transient failures before a game is shown as `Error`
    pub max_transient_retries: u32,
    /// Base and cap of the retry backoff for games in `Error` (ms)
    pub error_backoff_ms: u64,
    pub max_error_backoff_ms: u64,
    /// Cancel an own open game after waiting this long for an opponent (secs)
    pub opponent_wait_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            poll_interval_ms: 10_000,
            confirm_poll_ms: 2_000,
            max_workers: 8,
            step_timeout_secs: 120,
            max_transient_retries: 3,
            error_backoff_ms: 2_000,
            max_error_backoff_ms: 120_000,
            opponent_wait_timeout_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Exponential backoff for the n-th consecutive failure, capped.
    pub fn error_backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        let ms = self
            .error_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_error_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Poll interval used while the subscription is down (ms)
    pub poll_interval_ms: u64,
    /// Maximum block span per `get_logs` request
    pub max_block_range: u64,
    /// Delay before re-subscribing after a dropped subscription (ms)
    pub reconnect_delay_ms: u64,
    /// Block to start from when no cursor exists (defaults to head)
    pub start_block: Option<u64>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 4_000,
            max_block_range: 2_000,
            reconnect_delay_ms: 3_000,
            start_block: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Adopt and join open games created by other players
    pub auto_join: bool,
    /// Upper bound on concurrently active games
    pub max_active_games: usize,
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_join: false,
            max_active_games: 16,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// A pending transaction the node does not know is only declared dropped
    /// after this many seconds
    pub dropped_grace_secs: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            dropped_grace_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("AGENT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // AGENT_LEDGER__RPC_URL, AGENT_SCHEDULER__MAX_WORKERS, ...
            .add_source(
                Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Local configuration against a development chain and in-memory store
    pub fn local_default() -> Self {
        Self {
            ledger: LedgerConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                ws_url: Some("ws://127.0.0.1:8545".to_string()),
                chain_id: 31337,
                contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
                private_key: None,
                rpc_timeout_ms: default_rpc_timeout_ms(),
                default_move_timeout_secs: default_move_timeout_secs(),
            },
            relayer: RelayerConfig {
                url: "http://127.0.0.1:3000".to_string(),
                api_key: None,
                timeout_ms: default_relayer_timeout_ms(),
                max_attempts: default_relayer_attempts(),
                backoff_ms: default_relayer_backoff_ms(),
            },
            database: DatabaseConfig {
                url: "memory://".to_string(),
                max_connections: 5,
            },
            scheduler: SchedulerConfig::default(),
            watcher: WatcherConfig::default(),
            discovery: DiscoveryConfig::default(),
            markers: MarkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ledger.contract_address.parse::<alloy::primitives::Address>().is_err() {
            errors.push(format!(
                "ledger.contract_address is not a valid address: {}",
                self.ledger.contract_address
            ));
        }

        if url::Url::parse(&self.ledger.rpc_url).is_err() {
            errors.push(format!("ledger.rpc_url is not a valid URL: {}", self.ledger.rpc_url));
        }

        if let Some(ws) = &self.ledger.ws_url {
            if url::Url::parse(ws).is_err() {
                errors.push(format!("ledger.ws_url is not a valid URL: {}", ws));
            }
        }

        if url::Url::parse(&self.relayer.url).is_err() {
            errors.push(format!("relayer.url is not a valid URL: {}", self.relayer.url));
        }

        if self.relayer.max_attempts == 0 {
            errors.push("relayer.max_attempts must be at least 1".to_string());
        }

        if self.scheduler.max_workers == 0 {
            errors.push("scheduler.max_workers must be at least 1".to_string());
        }

        if self.scheduler.max_transient_retries == 0 {
            errors.push("scheduler.max_transient_retries must be at least 1".to_string());
        }

        if self.scheduler.confirm_poll_ms > self.scheduler.poll_interval_ms {
            errors.push(
                "scheduler.confirm_poll_ms should not exceed scheduler.poll_interval_ms".to_string(),
            );
        }

        if self.watcher.max_block_range == 0 {
            errors.push("watcher.max_block_range must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
