//! Cache configuration for the memory budget and the spill store.
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically. Sizes are held in bytes. Environment variables
//! take megabytes; files take either `<key>_mb` or `<key>_bytes`, and sizes
//! that are not a whole number of megabytes are saved with the `_bytes` key.

use std::fs;
use std::path::{Path, PathBuf};

use outcore_storage::{BackingStoreConfig, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Configuration for the resource cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CacheConfigFile", into = "CacheConfigFile")]
pub struct CacheConfig {
    /// Resident-byte budget
    pub memory_budget: u64,
    /// Size of each backing chunk file in bytes
    pub chunk_size: u64,
    /// Parent directory for spill files (OS temp dir when unset)
    pub backing_dir: Option<PathBuf>,
    /// Maximum bytes of spill files
    pub disk_quota: Option<u64>,
}

/// On-disk shape of [`CacheConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CacheConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_budget_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_budget_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backing_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_quota_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_quota_bytes: Option<u64>,
}

impl TryFrom<CacheConfigFile> for CacheConfig {
    type Error = ConfigError;

    fn try_from(file: CacheConfigFile) -> Result<Self, Self::Error> {
        let defaults = CacheConfig::default();
        let memory_budget = size_field("memory_budget", file.memory_budget_mb, file.memory_budget_bytes)?;
        let chunk_size = size_field("chunk_size", file.chunk_size_mb, file.chunk_size_bytes)?;
        Ok(Self {
            memory_budget: memory_budget.unwrap_or(defaults.memory_budget),
            chunk_size: chunk_size.map_or(defaults.chunk_size, |bytes| bytes.max(1)),
            backing_dir: file.backing_dir,
            disk_quota: size_field("disk_quota", file.disk_quota_mb, file.disk_quota_bytes)?,
        })
    }
}

impl From<CacheConfig> for CacheConfigFile {
    fn from(config: CacheConfig) -> Self {
        let (memory_budget_mb, memory_budget_bytes) = split_size(Some(config.memory_budget));
        let (chunk_size_mb, chunk_size_bytes) = split_size(Some(config.chunk_size));
        let (disk_quota_mb, disk_quota_bytes) = split_size(config.disk_quota);
        Self {
            memory_budget_mb,
            memory_budget_bytes,
            chunk_size_mb,
            chunk_size_bytes,
            backing_dir: config.backing_dir,
            disk_quota_mb,
            disk_quota_bytes,
        }
    }
}

/// Resolve a size given as `<key>_mb` or `<key>_bytes`, but not both.
fn size_field(key: &str, mb: Option<u64>, bytes: Option<u64>) -> Result<Option<u64>, ConfigError> {
    match (mb, bytes) {
        (Some(_), Some(_)) => Err(ConfigError::InvalidValue(key.to_string())),
        (Some(mb), None) => mb_to_bytes(&format!("{key}_mb"), mb).map(Some),
        (None, bytes) => Ok(bytes),
    }
}

/// Whole megabytes go to the `_mb` key, anything else to `_bytes`.
fn split_size(bytes: Option<u64>) -> (Option<u64>, Option<u64>) {
    match bytes {
        Some(bytes) if bytes % MB == 0 => (Some(bytes / MB), None),
        bytes => (None, bytes),
    }
}

fn mb_to_bytes(key: &str, mb: u64) -> Result<u64, ConfigError> {
    mb.checked_mul(MB).ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget: 256 * MB,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backing_dir: None,
            disk_quota: None,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with a memory budget in bytes.
    pub fn new(memory_budget: u64) -> Self {
        Self { memory_budget, ..Default::default() }
    }

    /// Sets the memory budget in megabytes, saturating at `u64::MAX` bytes.
    pub fn with_budget_mb(mut self, mb: u64) -> Self {
        self.memory_budget = mb.saturating_mul(MB);
        self
    }

    /// Sets the chunk size in bytes.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Sets the spill directory.
    pub fn with_backing_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.backing_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the disk quota in bytes.
    pub fn with_disk_quota(mut self, bytes: u64) -> Self {
        self.disk_quota = Some(bytes);
        self
    }

    /// Returns the backing store settings derived from this configuration.
    pub fn store_config(&self) -> BackingStoreConfig {
        BackingStoreConfig {
            chunk_size: self.chunk_size,
            directory: self.backing_dir.clone(),
            disk_quota: self.disk_quota,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `OUTCORE_MEMORY_BUDGET_MB`: memory budget in MB (default: 256)
    /// - `OUTCORE_CHUNK_SIZE_MB`: backing chunk size in MB (default: 64)
    /// - `OUTCORE_BACKING_DIR`: parent directory for spill files
    /// - `OUTCORE_DISK_QUOTA_MB`: maximum spill bytes in MB
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_u64("OUTCORE_MEMORY_BUDGET_MB")? {
            config.memory_budget = mb_to_bytes("OUTCORE_MEMORY_BUDGET_MB", mb)?;
        }
        if let Some(mb) = env_u64("OUTCORE_CHUNK_SIZE_MB")? {
            config.chunk_size = mb_to_bytes("OUTCORE_CHUNK_SIZE_MB", mb)?.max(1);
        }
        if let Ok(val) = std::env::var("OUTCORE_BACKING_DIR") {
            config.backing_dir = Some(PathBuf::from(val));
        }
        if let Some(mb) = env_u64("OUTCORE_DISK_QUOTA_MB")? {
            config.disk_quota = Some(mb_to_bytes("OUTCORE_DISK_QUOTA_MB", mb)?);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// memory_budget_mb = 256
    /// chunk_size_mb = 64
    /// backing_dir = "/path/to/scratch"
    /// disk_quota_mb = 4096
    /// ```
    ///
    /// Any size may be given in bytes instead, e.g. `chunk_size_bytes = 65536`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: CacheConfigFile = toml::from_str(toml_str)?;
        Self::try_from(file)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Returns the memory budget in megabytes.
    pub fn memory_budget_mb(&self) -> u64 {
        self.memory_budget / MB
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unable to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
