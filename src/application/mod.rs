//! Application layer with the loading services.

/// Manager and prefetcher.
pub mod services;

pub use services::{ImageLoadedEvent, ImageManager, ImagePrefetcher, LoadHandle};
