//! Load and download option records.

use serde::{Deserialize, Serialize};

/// Options accepted by the image manager for a single load.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Retry a URL even if it is blacklisted after an earlier failure.
    pub retry_failed: bool,
    /// Queue the download behind normal-priority work.
    pub low_priority: bool,
    /// Keep the downloaded image in memory only, never on disk.
    pub cache_memory_only: bool,
    /// Deliver partial images while the download progresses.
    pub progressive_download: bool,
    /// Deliver the cached image, then download again to refresh the cache.
    pub refresh_cached: bool,
    /// Ask the host for extra run time when the process is backgrounded.
    pub continue_in_background: bool,
    /// Send and store cookies for this request.
    pub handle_cookies: bool,
    /// Accept untrusted TLS certificates.
    pub allow_invalid_ssl_certificates: bool,
    /// Move the download to the head of the queue.
    pub high_priority: bool,
    /// Downsample very large images during decompression.
    pub scale_down_large_images: bool,
}

/// Options understood by the downloader.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderOptions {
    /// Queue behind normal-priority work.
    pub low_priority: bool,
    /// Deliver partial images while bytes arrive.
    pub progressive_download: bool,
    /// Let the HTTP layer use its own response cache.
    pub use_url_cache: bool,
    /// Treat a response served from the HTTP layer's cache as "no image".
    pub ignore_cached_response: bool,
    /// Ask the host for extra run time when backgrounded.
    pub continue_in_background: bool,
    /// Send and store cookies.
    pub handle_cookies: bool,
    /// Accept untrusted TLS certificates.
    pub allow_invalid_ssl_certificates: bool,
    /// Insert at the head of the queue.
    pub high_priority: bool,
    /// Downsample very large images during decompression.
    pub scale_down_large_images: bool,
}

impl From<ImageOptions> for DownloaderOptions {
    fn from(options: ImageOptions) -> Self {
        Self {
            low_priority: options.low_priority,
            progressive_download: options.progressive_download,
            use_url_cache: options.refresh_cached,
            ignore_cached_response: options.refresh_cached,
            continue_in_background: options.continue_in_background,
            handle_cookies: options.handle_cookies,
            allow_invalid_ssl_certificates: options.allow_invalid_ssl_certificates,
            high_priority: options.high_priority,
            scale_down_large_images: options.scale_down_large_images,
        }
    }
}

/// Dispatch order for downloads that have not started yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// First queued, first started.
    #[default]
    Fifo,
    /// Most recently queued starts first.
    Lifo,
}

impl std::fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Lifo => write!(f, "lifo"),
        }
    }
}
