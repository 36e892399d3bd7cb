//! Engine configuration.

pub mod engine_config;

pub use engine_config::{
    ConfigError, DownloaderConfig, EngineConfig, ImageCacheConfig, PrefetcherConfig,
    default_disk_root,
};
