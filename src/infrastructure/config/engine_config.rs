//! Engine configuration records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::entities::ExecutionOrder;
use crate::domain::ports::Credential;

const DEFAULT_NAMESPACE: &str = "default";
const ONE_WEEK_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// Cache configuration.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheConfig {
    /// Decompress images read back from disk.
    #[serde(default = "default_true")]
    pub should_decompress_images: bool,

    /// Mark cache files as excluded from backups where the platform supports it.
    #[serde(default = "default_true")]
    pub should_disable_backup: bool,

    /// Keep decoded images in the memory store.
    #[serde(default = "default_true")]
    pub should_cache_images_in_memory: bool,

    /// Maximum age of a disk entry in seconds. 0 disables age eviction.
    #[serde(default = "default_max_cache_age")]
    pub max_cache_age: u64,

    /// Maximum disk cache size in bytes. 0 = unlimited.
    #[serde(default)]
    pub max_cache_size: u64,

    /// Maximum total pixel cost of the memory store. 0 = unlimited.
    #[serde(default)]
    pub max_memory_cost: u64,

    /// Maximum number of images in the memory store. 0 = unlimited.
    #[serde(default)]
    pub max_memory_count: usize,

    /// Cache namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Overrides the platform cache directory.
    #[serde(default)]
    pub disk_root: Option<PathBuf>,
}

impl ImageCacheConfig {
    /// Maximum entry age, or `None` when age eviction is disabled.
    #[must_use]
    pub const fn max_age(&self) -> Option<Duration> {
        if self.max_cache_age == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_cache_age))
        }
    }

    /// Returns the directory the namespace directory is created under.
    #[must_use]
    pub fn effective_disk_root(&self) -> PathBuf {
        self.disk_root.clone().unwrap_or_else(default_disk_root)
    }

    /// Config rooted at `dir`, for tests and embedded hosts.
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_root: Some(dir.into()),
            ..Self::default()
        }
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            should_decompress_images: true,
            should_disable_backup: true,
            should_cache_images_in_memory: true,
            max_cache_age: ONE_WEEK_SECS,
            max_cache_size: 0,
            max_memory_cost: 0,
            max_memory_count: 0,
            namespace: default_namespace(),
            disk_root: None,
        }
    }
}

/// Downloader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Maximum number of downloads running at once.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_download_timeout")]
    pub download_timeout: u64,

    /// Dispatch order of queued downloads.
    #[serde(default)]
    pub execution_order: ExecutionOrder,

    /// Decompress downloaded images before delivering them.
    #[serde(default = "default_true")]
    pub should_decompress_images: bool,

    /// Basic-auth user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
}

impl DownloaderConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    /// Credential built from `username`/`password`, if a user is set.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.username.as_ref().map(|user| Credential {
            user: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_timeout: default_download_timeout(),
            execution_order: ExecutionOrder::default(),
            should_decompress_images: true,
            username: None,
            password: None,
        }
    }
}

/// Prefetcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetcherConfig {
    /// Maximum number of prefetch loads in flight.
    #[serde(default = "default_prefetch_concurrency")]
    pub max_concurrent_downloads: usize,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_prefetch_concurrency(),
        }
    }
}

/// Whole-engine configuration as read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: ImageCacheConfig,

    #[serde(default)]
    pub downloader: DownloaderConfig,

    #[serde(default)]
    pub prefetcher: PrefetcherConfig,
}

impl EngineConfig {
    /// Parses a TOML document. Missing sections and fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::TomlDe` on malformed input.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the configuration from `path`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Platform cache directory, falling back to the temp directory.
#[must_use]
pub fn default_disk_root() -> PathBuf {
    BaseDirs::new().map_or_else(
        || std::env::temp_dir().join("webimage"),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

const fn default_max_cache_age() -> u64 {
    ONE_WEEK_SECS
}

const fn default_max_concurrent_downloads() -> usize {
    6
}

const fn default_download_timeout() -> u64 {
    15
}

const fn default_prefetch_concurrency() -> usize {
    3
}
