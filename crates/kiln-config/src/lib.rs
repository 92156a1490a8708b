#![warn(missing_docs)]

//! # kiln-config
//!
//! Configuration loading for the Kiln execution broker.
//!
//! Settings come from an optional TOML file (with `${ENV_VAR}` expansion)
//! overridden by environment variables. Every knob has a default, so a bare
//! process with no file and no environment starts with sane values.
//!
//! ## Example
//!
//! ```toml
//! data_root = "/var/lib/kiln"
//!
//! [execution]
//! max_concurrent = 10
//! queue_wait_secs = 60
//!
//! [rate_limit]
//! points = 100
//! window_secs = 60
//! block_secs = 300
//!
//! [redis]
//! host = "127.0.0.1"
//! port = 6379
//! password = "${REDIS_PASSWORD}"
//! db = 0
//!
//! [sessions]
//! timeout_hours = 24
//! cleanup_interval_minutes = 60
//! max_per_client = 10
//!
//! [vscode]
//! host = "127.0.0.1"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KilnConfig {
    /// Root directory for base and session workspaces.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Execution engine settings.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Admission rate-limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Durable metadata tier settings. Absent means no durable tier.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Session lifecycle settings.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Web-IDE helper settings.
    #[serde(default)]
    pub vscode: VscodeConfig,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./kiln-data")
}

/// Execution engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum executions in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long a request may wait for an execution slot.
    #[serde(default = "default_queue_wait_secs")]
    pub queue_wait_secs: u64,

    /// Dispatch smoothing: tasks admitted per second at burst.
    #[serde(default = "default_dispatch_burst")]
    pub dispatch_burst_per_sec: u64,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_queue_wait_secs() -> u64 {
    60
}
fn default_dispatch_burst() -> u64 {
    50
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_wait_secs: default_queue_wait_secs(),
            dispatch_burst_per_sec: default_dispatch_burst(),
        }
    }
}

impl ExecutionConfig {
    /// Queue wait budget as a [`Duration`].
    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_secs)
    }
}

/// Admission rate-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Points available per window.
    #[serde(default = "default_rl_points")]
    pub points: u64,

    /// Refill window in seconds.
    #[serde(default = "default_rl_window")]
    pub window_secs: u64,

    /// Block duration after exhaustion, in seconds.
    #[serde(default = "default_rl_block")]
    pub block_secs: u64,
}

fn default_rl_points() -> u64 {
    100
}
fn default_rl_window() -> u64 {
    60
}
fn default_rl_block() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: default_rl_points(),
            window_secs: default_rl_window(),
            block_secs: default_rl_block(),
        }
    }
}

/// Durable metadata tier settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host.
    pub host: String,

    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,

    /// Database index.
    #[serde(default)]
    pub db: i64,

    /// Maximum pooled connections.
    #[serde(default = "default_redis_pool")]
    pub pool_size: usize,

    /// Pool acquire timeout in seconds.
    #[serde(default = "default_redis_acquire")]
    pub acquire_timeout_secs: u64,
}

fn default_redis_port() -> u16 {
    6379
}
fn default_redis_pool() -> usize {
    8
}
fn default_redis_acquire() -> u64 {
    5
}

impl RedisConfig {
    /// Render the connection URL, embedding the password when present.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle sessions older than this are expired.
    #[serde(default = "default_session_timeout_hours")]
    pub timeout_hours: u64,

    /// Interval between cleanup sweeps.
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,

    /// Maximum live sessions per owning client.
    #[serde(default = "default_max_per_client")]
    pub max_per_client: usize,
}

fn default_session_timeout_hours() -> u64 {
    24
}
fn default_cleanup_interval_minutes() -> u64 {
    60
}
fn default_max_per_client() -> usize {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_hours: default_session_timeout_hours(),
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
            max_per_client: default_max_per_client(),
        }
    }
}

impl SessionConfig {
    /// Session idle timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_hours * 3600)
    }

    /// Cleanup sweep interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }
}

/// Web-IDE helper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VscodeConfig {
    /// Host rendered into endpoint URLs.
    #[serde(default = "default_vscode_host")]
    pub host: String,
}

fn default_vscode_host() -> String {
    "127.0.0.1".into()
}

impl Default for VscodeConfig {
    fn default() -> Self {
        Self {
            host: default_vscode_host(),
        }
    }
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            execution: ExecutionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            redis: None,
            sessions: SessionConfig::default(),
            vscode: VscodeConfig::default(),
        }
    }
}

impl KilnConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: KilnConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path, expanding `${ENV_VAR}` references.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&expand_env_vars(&content))
    }

    /// Build a config from environment variables alone.
    ///
    /// Recognized variables: `KILN_DATA_ROOT`, `MAX_CONCURRENT_EXECUTIONS`,
    /// `RATE_LIMIT_POINTS`, `RATE_LIMIT_WINDOW_SECS`, `RATE_LIMIT_BLOCK_SECS`,
    /// `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`,
    /// `SESSION_TIMEOUT_HOURS`, `CLEANUP_INTERVAL_MINUTES`,
    /// `MAX_SESSIONS_PER_CLIENT`, `VSCODE_HOST`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Apply environment overrides on top of this config.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        self.apply_env_map(&vars)?;
        self.validate()?;
        Ok(self)
    }

    fn from_env_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_map(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_map(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(
            vars: &HashMap<String, String>,
            key: &str,
        ) -> Result<Option<T>, ConfigError> {
            match vars.get(key) {
                Some(raw) => raw
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{raw}'"))),
                None => Ok(None),
            }
        }

        if let Some(root) = vars.get("KILN_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Some(v) = parse(vars, "MAX_CONCURRENT_EXECUTIONS")? {
            self.execution.max_concurrent = v;
        }
        if let Some(v) = parse(vars, "RATE_LIMIT_POINTS")? {
            self.rate_limit.points = v;
        }
        if let Some(v) = parse(vars, "RATE_LIMIT_WINDOW_SECS")? {
            self.rate_limit.window_secs = v;
        }
        if let Some(v) = parse(vars, "RATE_LIMIT_BLOCK_SECS")? {
            self.rate_limit.block_secs = v;
        }
        if let Some(host) = vars.get("REDIS_HOST") {
            let mut redis = self.redis.take().unwrap_or(RedisConfig {
                host: host.clone(),
                port: default_redis_port(),
                password: None,
                db: 0,
                pool_size: default_redis_pool(),
                acquire_timeout_secs: default_redis_acquire(),
            });
            redis.host = host.clone();
            redis.port = parse(vars, "REDIS_PORT")?.unwrap_or(redis.port);
            redis.password = vars.get("REDIS_PASSWORD").cloned().or(redis.password);
            redis.db = parse(vars, "REDIS_DB")?.unwrap_or(redis.db);
            self.redis = Some(redis);
        }
        if let Some(v) = parse(vars, "SESSION_TIMEOUT_HOURS")? {
            self.sessions.timeout_hours = v;
        }
        if let Some(v) = parse(vars, "CLEANUP_INTERVAL_MINUTES")? {
            self.sessions.cleanup_interval_minutes = v;
        }
        if let Some(v) = parse(vars, "MAX_SESSIONS_PER_CLIENT")? {
            self.sessions.max_per_client = v;
        }
        if let Some(host) = vars.get("VSCODE_HOST") {
            self.vscode.host = host.clone();
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_concurrent must be at least 1".into(),
            ));
        }
        if self.rate_limit.points == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.points must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be at least 1".into(),
            ));
        }
        if self.sessions.max_per_client == 0 {
            return Err(ConfigError::Invalid(
                "sessions.max_per_client must be at least 1".into(),
            ));
        }
        if let Some(redis) = &self.redis {
            if redis.host.is_empty() {
                return Err(ConfigError::Invalid("redis.host must not be empty".into()));
            }
            if redis.pool_size == 0 {
                return Err(ConfigError::Invalid(
                    "redis.pool_size must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
