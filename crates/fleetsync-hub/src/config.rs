use fleetsync_core::interval::DEFAULT_ALLOWED_INTERVALS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the sync core. Every section and field is optional in the
/// TOML file; omitted values take the defaults below.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub allow_remote: bool,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
    pub aggregation: AggregationConfig,
    pub retry: RetryConfig,
    pub rollout: RolloutConfig,
    pub intervals: IntervalConfig,
    pub logging: LoggingConfig,
    pub tokens: Vec<TokenEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub initial_interval_secs: u64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
    pub success_window: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 3,
            max_interval_secs: 120,
            initial_interval_secs: 3,
            increase_factor: 2.0,
            decrease_factor: 0.5,
            success_window: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 5_000 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AggregationConfig {
    pub describe_batch_size: usize,
    pub max_concurrency: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            describe_batch_size: 10,
            max_concurrency: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RolloutConfig {
    pub stuck_timeout_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            stuck_timeout_secs: 600,
        }
    }
}

impl RolloutConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IntervalConfig {
    pub allowed: Vec<u64>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_INTERVALS.to_vec(),
        }
    }
}

/// Log level and file placement. The command line and environment override
/// `level` and `dir`; a missing `dir` means stdout only.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub dir: Option<String>,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            dir: None,
            file_name: "fleetsync-hub.log".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenEntry {
    pub token: String,
    pub identity: String,
    pub organization: String,
}

impl HubConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let throttle = &self.throttle;
        if throttle.min_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "throttle.min_interval_secs must be positive".to_string(),
            ));
        }
        if throttle.min_interval_secs > throttle.max_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "throttle.min_interval_secs ({}) exceeds max_interval_secs ({})",
                throttle.min_interval_secs, throttle.max_interval_secs
            )));
        }
        if !(throttle.increase_factor > 1.0) {
            return Err(ConfigError::Invalid(
                "throttle.increase_factor must be greater than 1".to_string(),
            ));
        }
        if !(throttle.decrease_factor > 0.0 && throttle.decrease_factor < 1.0) {
            return Err(ConfigError::Invalid(
                "throttle.decrease_factor must be between 0 and 1".to_string(),
            ));
        }
        if throttle.success_window == 0 {
            return Err(ConfigError::Invalid(
                "throttle.success_window must be positive".to_string(),
            ));
        }
        if self.aggregation.describe_batch_size == 0 || self.aggregation.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "aggregation batch size and concurrency must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.intervals.allowed.is_empty() || self.intervals.allowed.contains(&0) {
            return Err(ConfigError::Invalid(
                "intervals.allowed must list positive seconds".to_string(),
            ));
        }
        let file_name = self.logging.file_name.trim();
        if file_name.is_empty() || file_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(
                "logging.file_name must be a bare file name".to_string(),
            ));
        }
        Ok(())
    }
}
