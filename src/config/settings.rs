use crate::error::GatewayError;
use std::env;
use std::time::Duration;

/// Default header field carrying the API key (TronGrid convention).
pub const DEFAULT_KEY_NAME: &str = "TRON-PRO-API-KEY";

/// Engine configuration.
///
/// `rps` is the number the caller hands us; the effective in-flight bound
/// is `rps - 1`, leaving one slot of headroom against the gateway's own
/// accounting. Per-key limits are independent from the global bound: a key
/// can be busy (`key_rps` reached) without being exhausted (`key_limit`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Target endpoint, e.g. `https://api.trongrid.io`
    pub host: String,
    /// Initial set of API keys
    pub keys: Vec<String>,
    /// Client-wide concurrency bound (effective bound is `rps - 1`)
    pub rps: usize,
    /// Per-key concurrent allocation bound
    pub key_rps: u32,
    /// Per-key daily usage ceiling
    pub key_limit: u64,
    /// Header field name used to carry a key
    pub key_name: String,
    /// Attach per-attempt timing breakdowns to responses
    pub timing: bool,
    /// Send periodic PINGs on idle sessions
    pub keep_alive: bool,
    /// Connect attempts per session establishment
    pub connect_attempts: u32,
    /// Delay between connect attempts
    pub connect_retry_delay: Duration,
    /// Interval between keep-alive PINGs
    pub keep_alive_interval: Duration,
}

impl Config {
    pub fn new(host: impl Into<String>) -> Self {
        Config {
            host: host.into(),
            keys: Vec::new(),
            rps: 80,
            key_rps: 12,
            key_limit: 33_000,
            key_name: DEFAULT_KEY_NAME.to_string(),
            timing: false,
            keep_alive: false,
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(100),
            keep_alive_interval: Duration::from_secs(10),
        }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_rps(mut self, rps: usize) -> Self {
        self.rps = rps;
        self
    }

    pub fn with_key_rps(mut self, key_rps: u32) -> Self {
        self.key_rps = key_rps;
        self
    }

    pub fn with_key_limit(mut self, key_limit: u64) -> Self {
        self.key_limit = key_limit;
        self
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    pub fn with_timing(mut self, timing: bool) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Effective in-flight bound for the scheduler.
    pub fn effective_rps(&self) -> usize {
        self.rps.saturating_sub(1).max(1)
    }

    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "https://api.trongrid.io".to_string());
        let mut config = Config::new(host);
        config.keys = env::var("GATEWAY_KEYS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(rps) = env::var("GATEWAY_RPS").ok().and_then(|v| v.parse().ok()) {
            config.rps = rps;
        }
        if let Some(key_rps) = env::var("GATEWAY_KEY_RPS").ok().and_then(|v| v.parse().ok()) {
            config.key_rps = key_rps;
        }
        if let Some(key_limit) = env::var("GATEWAY_KEY_LIMIT").ok().and_then(|v| v.parse().ok()) {
            config.key_limit = key_limit;
        }
        if let Ok(key_name) = env::var("GATEWAY_KEY_NAME") {
            config.key_name = key_name;
        }
        config.timing = env::var("GATEWAY_TIMING")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        config.keep_alive = env::var("GATEWAY_KEEP_ALIVE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        config
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.host.is_empty() {
            return Err(GatewayError::Config("host cannot be empty".to_string()));
        }
        if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            return Err(GatewayError::Config(format!(
                "host must be an http(s) URL, got '{}'",
                self.host
            )));
        }
        if self.rps == 0 {
            return Err(GatewayError::Config("rps must be positive".to_string()));
        }
        if self.key_rps == 0 {
            return Err(GatewayError::Config("key_rps must be positive".to_string()));
        }
        Ok(())
    }
}
