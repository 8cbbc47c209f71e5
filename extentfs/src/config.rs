use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_EXTENT_SIZE: u64 = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_IO: u64 = 64 * 1024 * 1024; // 64MB
pub const DEFAULT_SYNC_FETCH_LIMIT: u64 = 64 * 1024; // 64KB
pub const DEFAULT_RETRY_WARN_THRESHOLD: u64 = 64;
pub const DEFAULT_READ_AHEAD_GRANULARITY: u64 = 64 * 1024; // 64KB
pub const DEFAULT_CACHE_CAPACITY: u64 = 256 * 1024 * 1024; // 256MB

/// Runs kept inline before a run list spills to the heap.
pub const MAX_STACK_IO_RUNS: usize = 16;

const DEFAULT_CONFIG_PATHS: &[&str] = &["extentfs.yml", "extentfs.yaml", "/etc/extentfs/config.yml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub read: ReadConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Population granularity. Missing ranges are widened to this alignment before
    /// they are fetched, so one remote round trip fills a whole extent.
    pub extent_size: u64,
    /// Requests longer than this are rejected before any work begins.
    pub max_io: u64,
    /// Claimed ranges up to this many bytes are fetched inline by the requesting
    /// reader; larger ones are handed to background tasks.
    pub sync_fetch_limit: u64,
    /// A warning is logged every time one request loops this many times waiting
    /// for population.
    pub retry_warn_threshold: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            extent_size: DEFAULT_EXTENT_SIZE,
            max_io: DEFAULT_MAX_IO,
            sync_fetch_limit: DEFAULT_SYNC_FETCH_LIMIT,
            retry_warn_threshold: DEFAULT_RETRY_WARN_THRESHOLD,
        }
    }
}

impl ReadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extent_size(self, extent_size: u64) -> Self {
        Self {
            extent_size,
            ..self
        }
    }

    pub fn max_io(self, max_io: u64) -> Self {
        Self { max_io, ..self }
    }

    pub fn sync_fetch_limit(self, sync_fetch_limit: u64) -> Self {
        Self {
            sync_fetch_limit,
            ..self
        }
    }

    pub fn retry_warn_threshold(self, retry_warn_threshold: u64) -> Self {
        Self {
            retry_warn_threshold,
            ..self
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, cached reads go straight to the extent path.
    pub enabled: bool,
    pub read_ahead_granularity: u64,
    /// Byte budget of the page cache.
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_ahead_granularity: DEFAULT_READ_AHEAD_GRANULARITY,
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    pub fn read_ahead_granularity(self, read_ahead_granularity: u64) -> Self {
        Self {
            read_ahead_granularity,
            ..self
        }
    }

    pub fn capacity(self, capacity: u64) -> Self {
        Self { capacity, ..self }
    }
}

impl Config {
    pub fn read_config(self, read: ReadConfig) -> Self {
        Self { read, ..self }
    }

    pub fn cache_config(self, cache: CacheConfig) -> Self {
        Self { cache, ..self }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Loads the first config file found in the default search path, or the
    /// built-in defaults when none exists.
    pub fn from_default_path() -> Result<Self, ConfigError> {
        for candidate in DEFAULT_CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.is_file() {
                return Self::from_file(path);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("read.extent_size", self.read.extent_size),
            ("read.max_io", self.read.max_io),
            ("read.retry_warn_threshold", self.read.retry_warn_threshold),
            ("cache.read_ahead_granularity", self.cache.read_ahead_granularity),
            ("cache.capacity", self.cache.capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
