//! Infrastructure layer with the cache, codec and download adapters.

/// Memory and disk caches.
pub mod cache;
/// Image codecs.
pub mod codec;
/// Engine configuration.
pub mod config;
/// HTTP downloading.
pub mod download;

pub use cache::{CacheStats, DiskImageCache, ImageCache, MemoryImageCache};
pub use codec::{CodecRegistry, RasterCodec};
pub use config::{DownloaderConfig, EngineConfig, ImageCacheConfig, PrefetcherConfig};
pub use download::{DownloadToken, ImageDownloader, SessionConfig};
