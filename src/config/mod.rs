use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::policy::DiscardPolicy;
use crate::storage::JournalConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bucket_count: usize,
    pub queue_limit: usize,
    pub discard_policy: DiscardPolicy,
    pub qos0_memory_divisor: u64,
    pub max_memory_bytes: u64,
    pub close_retries: u32,
    pub close_retry_interval_ms: u64,
    pub fsync_every_n: usize,
    pub cleanup_interval_ms: u64,
    pub writer_threads: usize,
    pub compaction_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("client-queue-data"),
            bucket_count: 64,
            queue_limit: 1000,
            discard_policy: DiscardPolicy::Discard,
            qos0_memory_divisor: 4,
            max_memory_bytes: 1 << 30,
            close_retries: 5,
            close_retry_interval_ms: 100,
            fsync_every_n: 64,
            cleanup_interval_ms: 4_000,
            writer_threads: 4,
            compaction_threshold: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub bucket_count: Option<usize>,
    pub queue_limit: Option<usize>,
    pub discard_policy: Option<DiscardPolicy>,
    pub qos0_memory_divisor: Option<u64>,
    pub max_memory_bytes: Option<u64>,
    pub close_retries: Option<u32>,
    pub close_retry_interval_ms: Option<u64>,
    pub fsync_every_n: Option<usize>,
    pub cleanup_interval_ms: Option<u64>,
    pub writer_threads: Option<usize>,
    pub compaction_threshold: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: FileConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a custom variable lookup.
    pub fn load_with_env<F>(path: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let effective_path = path.map(|s| s.to_string()).or_else(|| lookup("CLIENT_QUEUE_CONFIG"));

        let file_cfg = if let Some(p) = effective_path {
            Self::load_file(p)?
        } else {
            FileConfig::default()
        };

        // File defaults.
        let defaults = Config::default();
        let mut cfg = Config {
            data_dir: file_cfg.data_dir.unwrap_or(defaults.data_dir),
            bucket_count: file_cfg.bucket_count.unwrap_or(defaults.bucket_count),
            queue_limit: file_cfg.queue_limit.unwrap_or(defaults.queue_limit),
            discard_policy: file_cfg.discard_policy.unwrap_or(defaults.discard_policy),
            qos0_memory_divisor: file_cfg
                .qos0_memory_divisor
                .unwrap_or(defaults.qos0_memory_divisor),
            max_memory_bytes: file_cfg.max_memory_bytes.unwrap_or(defaults.max_memory_bytes),
            close_retries: file_cfg.close_retries.unwrap_or(defaults.close_retries),
            close_retry_interval_ms: file_cfg
                .close_retry_interval_ms
                .unwrap_or(defaults.close_retry_interval_ms),
            fsync_every_n: file_cfg.fsync_every_n.unwrap_or(defaults.fsync_every_n),
            cleanup_interval_ms: file_cfg
                .cleanup_interval_ms
                .unwrap_or(defaults.cleanup_interval_ms),
            writer_threads: file_cfg.writer_threads.unwrap_or(defaults.writer_threads),
            compaction_threshold: file_cfg
                .compaction_threshold
                .unwrap_or(defaults.compaction_threshold),
        };

        // Env overrides.
        if let Some(v) = lookup("CLIENT_QUEUE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "CLIENT_QUEUE_BUCKET_COUNT", &mut cfg.bucket_count)?;
        override_parsed(&lookup, "CLIENT_QUEUE_QUEUE_LIMIT", &mut cfg.queue_limit)?;
        override_parsed(&lookup, "CLIENT_QUEUE_DISCARD_POLICY", &mut cfg.discard_policy)?;
        override_parsed(
            &lookup,
            "CLIENT_QUEUE_QOS0_MEMORY_DIVISOR",
            &mut cfg.qos0_memory_divisor,
        )?;
        override_parsed(&lookup, "CLIENT_QUEUE_MAX_MEMORY_BYTES", &mut cfg.max_memory_bytes)?;
        override_parsed(&lookup, "CLIENT_QUEUE_CLOSE_RETRIES", &mut cfg.close_retries)?;
        override_parsed(
            &lookup,
            "CLIENT_QUEUE_CLOSE_RETRY_INTERVAL_MS",
            &mut cfg.close_retry_interval_ms,
        )?;
        override_parsed(&lookup, "CLIENT_QUEUE_FSYNC_EVERY_N", &mut cfg.fsync_every_n)?;
        override_parsed(
            &lookup,
            "CLIENT_QUEUE_CLEANUP_INTERVAL_MS",
            &mut cfg.cleanup_interval_ms,
        )?;
        override_parsed(&lookup, "CLIENT_QUEUE_WRITER_THREADS", &mut cfg.writer_threads)?;
        override_parsed(
            &lookup,
            "CLIENT_QUEUE_COMPACTION_THRESHOLD",
            &mut cfg.compaction_threshold,
        )?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_count == 0 {
            return Err(ConfigError::Invalid("bucket_count must be > 0".to_string()));
        }
        if self.qos0_memory_divisor == 0 {
            return Err(ConfigError::Invalid(
                "qos0_memory_divisor must be > 0".to_string(),
            ));
        }
        if self.writer_threads == 0 {
            return Err(ConfigError::Invalid("writer_threads must be > 0".to_string()));
        }
        Ok(())
    }

    /// Global byte budget for queued QoS 0 messages.
    pub fn qos0_memory_limit(&self) -> u64 {
        self.max_memory_bytes / self.qos0_memory_divisor.max(1)
    }

    pub fn close_retry_interval(&self) -> Duration {
        Duration::from_millis(self.close_retry_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            fsync_every_n: (self.fsync_every_n > 0).then_some(self.fsync_every_n),
            fsync_interval: None,
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(v) = lookup(key) {
        *target = v
            .trim()
            .parse()
            .map_err(|e| ConfigError::Parse(format!("{key}: {e}")))?;
    }
    Ok(())
}
