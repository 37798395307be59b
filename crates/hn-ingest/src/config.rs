//! Ingestion configuration
//!
//! Defaults can be overridden from the environment (`HN_*`), and the CLI
//! overrides both. Components take narrower views ([`FetcherConfig`],
//! [`WriterConfig`]) so each can be built on its own.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::checkpoint::DEFAULT_CHECKPOINT_PATH;
use crate::error::{IngestError, Result};
use crate::writer::{PartitionStyle, WriterConfig};

// ============================================================================
// Defaults
// ============================================================================

/// Public Hacker News Firebase API
pub const DEFAULT_API_BASE_URL: &str = "https://hacker-news.firebaseio.com/v0";
pub const DEFAULT_CONCURRENCY: usize = 35;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_BUFFER_ROWS: usize = 50_000;
pub const DEFAULT_OUTPUT_DIR: &str = "data/items";

/// Settings for one ingestion process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub api_base_url: String,

    /// Ceiling on in-flight requests
    pub concurrency: usize,

    pub request_timeout_secs: u64,

    /// Retries after the first attempt for transient failures
    pub max_retries: u32,

    /// Backoff before retry `n` is `n` times this
    pub retry_base_delay_ms: u64,

    /// Ids per fetch/flush/checkpoint cycle
    pub batch_size: usize,

    /// Rows buffered before the writer flushes on its own
    pub buffer_rows: usize,

    pub row_group_size: usize,

    pub output_dir: PathBuf,
    pub checkpoint_path: PathBuf,

    /// Layout for archives that have no checkpoint yet
    pub default_partition_style: PartitionStyle,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_rows: DEFAULT_BUFFER_ROWS,
            row_group_size: crate::schema::DEFAULT_ROW_GROUP_SIZE,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            default_partition_style: PartitionStyle::Flat,
        }
    }
}

/// Parse `key` if set, otherwise return `default`
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| IngestError::config(format!("invalid {key} '{raw}': {e}"))),
        _ => Ok(default),
    }
}

impl IngestConfig {
    /// Load configuration from `HN_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            api_base_url: env_or("HN_API_BASE_URL", defaults.api_base_url)?,
            concurrency: env_or("HN_CONCURRENCY", defaults.concurrency)?,
            request_timeout_secs: env_or("HN_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            max_retries: env_or("HN_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: env_or("HN_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            batch_size: env_or("HN_BATCH_SIZE", defaults.batch_size)?,
            buffer_rows: env_or("HN_BUFFER_ROWS", defaults.buffer_rows)?,
            row_group_size: env_or("HN_ROW_GROUP_SIZE", defaults.row_group_size)?,
            output_dir: env_or("HN_OUTPUT_DIR", defaults.output_dir)?,
            checkpoint_path: env_or("HN_CHECKPOINT_PATH", defaults.checkpoint_path)?,
            default_partition_style: env_or("HN_PARTITION_STYLE", defaults.default_partition_style)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(IngestError::config("HN_API_BASE_URL must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(IngestError::config("concurrency must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestError::config("HN_REQUEST_TIMEOUT_SECS must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }
        if self.buffer_rows == 0 {
            return Err(IngestError::config("HN_BUFFER_ROWS must be greater than 0"));
        }
        if self.row_group_size == 0 {
            return Err(IngestError::config("HN_ROW_GROUP_SIZE must be greater than 0"));
        }
        Ok(())
    }

    pub fn fetcher(&self) -> FetcherConfig {
        FetcherConfig {
            base_url: self.api_base_url.trim_end_matches('/').to_string(),
            concurrency: self.concurrency,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    /// Writer settings for the given layout
    pub fn writer(&self, partition_style: PartitionStyle) -> WriterConfig {
        WriterConfig {
            output_dir: self.output_dir.clone(),
            partition_style,
            buffer_rows: self.buffer_rows,
            row_group_size: self.row_group_size,
        }
    }
}

/// Remote fetcher settings
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Base URL without trailing slash
    pub base_url: String,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl FetcherConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..IngestConfig::default().fetcher()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        IngestConfig::default().fetcher()
    }
}
