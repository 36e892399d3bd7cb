//! Image caching: memory LRU, disk store and the facade combining them.

pub mod disk_cache;
pub mod image_cache;
pub mod io_queue;
pub mod memory_cache;

pub use disk_cache::{DiskEntry, DiskImageCache, SweepReport};
pub use image_cache::{CacheLookup, CacheQuery, ImageCache};
pub use io_queue::SerialExecutor;
pub use memory_cache::{CacheStats, MemoryImageCache};
