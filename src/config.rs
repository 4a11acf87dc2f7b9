//! Gateway configuration
//!
//! Loaded at start-up, failing fast on anything malformed. An optional TOML
//! file named by `GATEWAY_CONFIG_FILE` is read first; environment variables
//! override it:
//!
//! ## Service
//! - `APP_NAME`: name reported by `GET /` (default: messaging-gateway)
//! - `LOG_LEVEL`: error|warn|info|debug|trace (default: info)
//! - `LOG_FORMAT`: pretty|json (default: pretty)
//! - `HTTP_PORT`: listen port (default: 3000)
//!
//! ## Redis
//! - `REDIS_HOST` / `REDIS_PORT` (default: 127.0.0.1:6379)
//! - `REDIS_MAX_RETRIES_PER_REQUEST`: reconnect attempts per command (default: 3)
//! - `REDIS_COMMAND_TIMEOUT_MS`: per-command timeout (default: 5000)
//! - `REDIS_STREAM_PREFIX_FOR_LINE`: stream name prefix (default: line)
//! - `REDIS_GROUP_NAME_FOR_LINE`: consumer group (default: line-webhook)
//!
//! ## Reaper
//! - `CLEANER_CONSUMER`: identity stale entries are claimed under (default: cleaner)
//! - `CLEANER_MIN_IDLE_TIME_MS`: idle time before an entry is discarded (default: 1 day)
//! - `CLEANER_BATCH_SIZE`: entries claimed per stream per sweep (default: 100)
//! - `CLEANER_INTERVAL_MS`: time between sweeps (default: 60000)

use crate::observability::{LogConfig, LogFormat, LogLevel};
use crate::queue::reaper::{MAX_BATCH_SIZE, MIN_INTERVAL};
use crate::queue::ReaperConfig;
use crate::store::RedisStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE_ENV: &str = "GATEWAY_CONFIG_FILE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment[{key}] has invalid value {value:?}: {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub max_retries_per_request: usize,
    pub command_timeout_ms: u64,
    pub stream_prefix_for_line: String,
    pub group_name_for_line: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            host: "127.0.0.1".to_string(),
            port: 6379,
            max_retries_per_request: 3,
            command_timeout_ms: 5_000,
            stream_prefix_for_line: "line".to_string(),
            group_name_for_line: "line-webhook".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerSettings {
    pub consumer: String,
    pub min_idle_time_ms: u64,
    pub batch_size: usize,
    pub interval_ms: u64,
}

impl Default for CleanerSettings {
    fn default() -> Self {
        CleanerSettings {
            consumer: "cleaner".to_string(),
            min_idle_time_ms: 24 * 60 * 60 * 1_000,
            batch_size: 100,
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub app_name: String,
    pub http_port: u16,
    pub log: LogConfig,
    pub redis: RedisSettings,
    pub cleaner: CleanerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            app_name: "messaging-gateway".to_string(),
            http_port: 3000,
            log: LogConfig::default(),
            redis: RedisSettings::default(),
            cleaner: CleanerSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => Self::from_toml_file(Path::new(&path))?,
            None => GatewayConfig::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        override_string(lookup, "APP_NAME", &mut self.app_name);
        override_parsed::<LogLevel>(lookup, "LOG_LEVEL", &mut self.log.level)?;
        override_parsed::<LogFormat>(lookup, "LOG_FORMAT", &mut self.log.format)?;
        override_parsed(lookup, "HTTP_PORT", &mut self.http_port)?;

        let redis = &mut self.redis;
        override_string(lookup, "REDIS_HOST", &mut redis.host);
        override_parsed(lookup, "REDIS_PORT", &mut redis.port)?;
        override_parsed(
            lookup,
            "REDIS_MAX_RETRIES_PER_REQUEST",
            &mut redis.max_retries_per_request,
        )?;
        override_parsed(lookup, "REDIS_COMMAND_TIMEOUT_MS", &mut redis.command_timeout_ms)?;
        override_string(
            lookup,
            "REDIS_STREAM_PREFIX_FOR_LINE",
            &mut redis.stream_prefix_for_line,
        );
        override_string(lookup, "REDIS_GROUP_NAME_FOR_LINE", &mut redis.group_name_for_line);

        let cleaner = &mut self.cleaner;
        override_string(lookup, "CLEANER_CONSUMER", &mut cleaner.consumer);
        override_parsed(lookup, "CLEANER_MIN_IDLE_TIME_MS", &mut cleaner.min_idle_time_ms)?;
        override_parsed(lookup, "CLEANER_BATCH_SIZE", &mut cleaner.batch_size)?;
        override_parsed(lookup, "CLEANER_INTERVAL_MS", &mut cleaner.interval_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_empty = [
            ("redis.host", &self.redis.host),
            ("redis.stream_prefix_for_line", &self.redis.stream_prefix_for_line),
            ("redis.group_name_for_line", &self.redis.group_name_for_line),
            ("cleaner.consumer", &self.cleaner.consumer),
        ];
        for (name, value) in non_empty {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }
        if self.redis.stream_prefix_for_line.contains(['*', '?', '[', ']']) {
            return Err(ConfigError::Invalid(
                "redis.stream_prefix_for_line must not contain glob characters".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.cleaner.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "cleaner.batch_size must be in 1..={}",
                MAX_BATCH_SIZE
            )));
        }
        if self.cleaner_interval() < MIN_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "cleaner.interval_ms must be at least {}",
                MIN_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner.interval_ms)
    }

    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.redis.host.clone(),
            port: self.redis.port,
            max_retries_per_request: self.redis.max_retries_per_request,
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            stream_prefix: self.redis.stream_prefix_for_line.clone(),
            group: self.redis.group_name_for_line.clone(),
            consumer: self.cleaner.consumer.clone(),
            min_idle: Duration::from_millis(self.cleaner.min_idle_time_ms),
            batch_size: self.cleaner.batch_size,
            interval: self.cleaner_interval(),
        }
    }
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(());
    };
    *target = value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    Ok(())
}
