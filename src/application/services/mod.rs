//! Orchestration services built on the cache and the downloader.

pub mod image_manager;
pub mod prefetcher;

pub use image_manager::{
    CacheKeyFilter, ImageLoadedEvent, ImageManager, LoadCompletion, LoadHandle,
};
pub use prefetcher::{
    ImagePrefetcher, PrefetchCompletion, PrefetchProgress, PrefetcherObserver,
};
