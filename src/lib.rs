//! webimage - Asynchronous image fetch-and-cache engine.
//!
//! Loads images by URL through a two-tier cache (decoded images in memory,
//! original bytes on disk), falling back to a bounded, deduplicating HTTP
//! downloader and writing downloads back into the cache.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the manager and prefetcher.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the cache, codec and download adapters.
pub mod infrastructure;

pub use application::{ImageLoadedEvent, ImageManager, ImagePrefetcher, LoadHandle};
pub use domain::{CacheKey, CacheType, DecodedImage, ImageError, ImageOptions, LoadedImage};
pub use infrastructure::{EngineConfig, ImageCache, ImageDownloader};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "webimage";
