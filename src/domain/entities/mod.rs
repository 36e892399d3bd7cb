//! Domain entity definitions.

mod image;
mod options;

pub use image::{CacheKey, CacheType, DecodedImage, ImageFormat, LoadedImage};
pub use options::{DownloaderOptions, ExecutionOrder, ImageOptions};
