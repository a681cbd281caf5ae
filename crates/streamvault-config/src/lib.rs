// streamvault-config - Runtime configuration for a storage node
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from STREAMVAULT_CONFIG env var
// 3. Config file contents from STREAMVAULT_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.streamvault.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bucket: BucketConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub resend: ResendConfig,
}

/// Node identity and logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// How often the binary logs accumulator health, 0 disables it
    pub metrics_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "streamvault-node".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unsupported log format: {}. Supported: text, json", s),
        }
    }
}

/// Write-path retry policy for messages whose bucket is not yet known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub write_retry_interval_ms: u64,
    /// Unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_write_retries: Option<u32>,
}

impl StorageConfig {
    pub fn write_retry_interval(&self) -> Duration {
        Duration::from_millis(self.write_retry_interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_retry_interval_ms: 500,
            max_write_retries: None,
        }
    }
}

/// Bucket rollover thresholds and maintenance cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub max_bucket_bytes: u64,
    pub max_bucket_records: u64,
    /// A bucket stops taking writes at this share of either limit
    pub almost_full_percent: u8,
    pub keep_alive_secs: u64,
    pub check_full_interval_ms: u64,
    pub store_interval_ms: u64,
}

impl BucketConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn check_full_interval(&self) -> Duration {
        Duration::from_millis(self.check_full_interval_ms)
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_millis(self.store_interval_ms)
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_bucket_bytes: 100 * 1024 * 1024,
            max_bucket_records: 500_000,
            almost_full_percent: 70,
            keep_alive_secs: 60,
            check_full_interval_ms: 1_000,
            store_interval_ms: 500,
        }
    }
}

/// Batch accumulator thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_bytes: usize,
    pub max_records: usize,
    pub close_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
}

impl BatchConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 8_000 * 300,
            max_records: 8_000,
            close_timeout_ms: 1_000,
            max_retries: 64,
            retry_interval_ms: 1_000,
        }
    }
}

/// Read-path limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_resend_last: u64,
    pub last_bucket_window: usize,
    pub throttle_rows: usize,
    pub page_size: usize,
    pub channel_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_resend_last: 10_000,
            last_bucket_window: 100,
            throttle_rows: 1_000,
            page_size: 5_000,
            channel_capacity: 256,
        }
    }
}

/// Resend proxy timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    pub neighbor_timeout_ms: u64,
    pub tracker_timeout_ms: u64,
    pub max_neighbor_tries: usize,
}

impl ResendConfig {
    pub fn neighbor_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_timeout_ms)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_millis(self.tracker_timeout_ms)
    }
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            neighbor_timeout_ms: 20_000,
            tracker_timeout_ms: 20_000,
            max_neighbor_tries: 3,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load from an explicit file (CLI `--config`), then apply env overrides
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Like `load`, but a broken default config file falls back to defaults
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Build from inline TOML plus a custom environment source
    pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<Self> {
        sources::load_with_env(inline_config, env)
    }

    /// File sections replace the defaults they name
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.node = other.node;
        self.storage = other.storage;
        self.bucket = other.bucket;
        self.batch = other.batch;
        self.query = other.query;
        self.resend = other.resend;
    }

    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
