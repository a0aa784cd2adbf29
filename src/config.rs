use std::env;
use std::time::Duration;

/// Runtime configuration, read once at startup. No module pulls env vars on
/// its own; everything flows from here.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the upstream trade feed.
    pub upstream_ws_url: String,
    /// HTTP endpoint returning `{ "solPrice": <number> }`.
    pub sol_price_url: String,
    /// JSON-RPC endpoint used by the balance oracle.
    pub rpc_url: String,
    /// Supervisor start-retry cap, also the feed reconnect cap.
    pub max_retries: usize,
    /// Exponential-backoff base for start retries and reconnects.
    pub base_retry_delay: Duration,
    /// Per-stream event buffer capacity.
    pub channel_capacity: usize,
    /// Deadline applied to every persistence and oracle call.
    pub op_timeout: Duration,
}

pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{0} is not a valid number")]
    NotANumber(&'static str),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            upstream_ws_url: require("UPSTREAM_WS_URL")?,
            sol_price_url: require("SOL_PRICE_URL")?,
            rpc_url: require("RPC_URL")?,
            max_retries: parse_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            base_retry_delay: Duration::from_millis(parse_or(
                "BASE_RETRY_DELAY_MS",
                DEFAULT_BASE_RETRY_DELAY_MS,
            )?),
            channel_capacity: parse_or("CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
            op_timeout: Duration::from_millis(parse_or(
                "DEFAULT_OP_TIMEOUT_MS",
                DEFAULT_OP_TIMEOUT_MS,
            )?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_ws_url: String::new(),
            sol_price_url: String::new(),
            rpc_url: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_RETRY_DELAY_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
        }
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::NotANumber(key)),
        Err(_) => Ok(default),
    }
}
