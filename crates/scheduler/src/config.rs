//! Pipeline configuration: worker count, polling and spill threshold.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_SPILL_THRESHOLD;
use crate::worker::num_cpus;
use crate::{ChannelConfig, ConfigError, WorkerPoolConfig};

/// Settings for a [`TaskPool`](crate::TaskPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads executing tasks
    pub num_workers: usize,
    /// How long an idle worker sleeps before re-checking for work
    pub poll_interval_ms: u64,
    /// Items a channel holds in memory before spilling
    pub spill_threshold: usize,
    /// Parent directory for the spill store opened by `TaskPool::open`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval_ms: 10,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            backing_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_spill_threshold(mut self, items: usize) -> Self {
        self.spill_threshold = items;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backing_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.backing_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Worker thread settings derived from this configuration.
    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
    }

    /// Channel settings derived from this configuration.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.spill_threshold)
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `OUTCORE_WORKERS`: worker thread count (default: logical CPUs)
    /// - `OUTCORE_SPILL_THRESHOLD`: items per channel before spilling (default: 65536)
    /// - `OUTCORE_POLL_INTERVAL_MS`: idle worker poll interval (default: 10)
    /// - `OUTCORE_BACKING_DIR`: parent directory for spill files
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>("OUTCORE_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError::InvalidValue("OUTCORE_WORKERS".to_string()));
            }
            config.num_workers = workers;
        }
        if let Some(threshold) = env_parse::<usize>("OUTCORE_SPILL_THRESHOLD")? {
            config.spill_threshold = threshold;
        }
        if let Some(interval) = env_parse::<u64>("OUTCORE_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = interval;
        }
        if let Ok(val) = std::env::var("OUTCORE_BACKING_DIR") {
            config.backing_dir = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// num_workers = 8
    /// poll_interval_ms = 10
    /// spill_threshold = 65536
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        if config.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers".to_string()));
        }
        Ok(config)
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}
