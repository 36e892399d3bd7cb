//! Two-tier image cache: decoded images in memory, original bytes on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, mpsc as std_mpsc};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, CacheType, DecodedImage};
use crate::domain::ports::{Cancellable, DecompressOptions};
use crate::infrastructure::codec::CodecRegistry;
use crate::infrastructure::config::ImageCacheConfig;

use super::disk_cache::{DiskImageCache, SweepReport};
use super::io_queue::SerialExecutor;
use super::memory_cache::{CacheStats, MemoryImageCache};

/// Outcome of a cache lookup: image, original bytes (disk hits only) and source.
pub type CacheLookup = (Option<DecodedImage>, Option<Bytes>, CacheType);

/// Handle for a pending disk lookup. Cancelling it before the disk job runs
/// suppresses the callback.
#[derive(Debug, Clone, Default)]
pub struct CacheQuery {
    token: Option<CancellationToken>,
}

impl CacheQuery {
    /// A query that already completed.
    #[must_use]
    pub const fn completed() -> Self {
        Self { token: None }
    }

    /// Returns true if the query was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl Cancellable for CacheQuery {
    fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}

struct CacheInner {
    config: ImageCacheConfig,
    memory: MemoryImageCache,
    disk: DiskImageCache,
    codecs: Arc<CodecRegistry>,
}

impl CacheInner {
    fn decompress_options(&self) -> Option<DecompressOptions> {
        self.config
            .should_decompress_images
            .then_some(DecompressOptions::default())
    }

    fn load_from_disk(&self, key: &CacheKey) -> Option<(DecodedImage, Bytes)> {
        let bytes = self.disk.load_bytes(key)?;
        match self
            .codecs
            .decode_for_key(&bytes, key, self.decompress_options())
        {
            Ok(image) => {
                if self.config.should_cache_images_in_memory {
                    self.memory.put(key.clone(), image.clone());
                }
                Some((image, bytes))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode cached image");
                None
            }
        }
    }
}

/// Two-tier cache for decoded images.
///
/// Memory reads are synchronous. Disk mutations are serialized on one I/O
/// thread. Callbacks for disk work fire in order on a separate completion
/// thread, so they may call back into the cache.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
    io: SerialExecutor,
    completions: SerialExecutor,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Creates a cache from `config`, decoding with `codecs`.
    #[must_use]
    pub fn new(config: ImageCacheConfig, codecs: Arc<CodecRegistry>) -> Self {
        let disk = DiskImageCache::new(
            &config.effective_disk_root(),
            &config.namespace,
            config.should_disable_backup,
        );
        let memory = MemoryImageCache::new(config.max_memory_cost, config.max_memory_count);
        let io = SerialExecutor::spawn(&format!("webimage-io-{}", config.namespace));
        let completions =
            SerialExecutor::spawn(&format!("webimage-callbacks-{}", config.namespace));
        debug!(namespace = %config.namespace, "Created image cache");
        Self {
            inner: Arc::new(CacheInner {
                config,
                memory,
                disk,
                codecs,
            }),
            io,
            completions,
        }
    }

    /// Process-wide cache with the default configuration.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<ImageCache> = OnceLock::new();
        SHARED.get_or_init(|| {
            Self::new(
                ImageCacheConfig::default(),
                Arc::clone(CodecRegistry::shared()),
            )
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ImageCacheConfig {
        &self.inner.config
    }

    /// Codecs used to decode and encode entries.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    /// Memory store statistics.
    #[must_use]
    pub fn memory_stats(&self) -> CacheStats {
        self.inner.memory.stats()
    }

    // Blocks the caller until `job` has run on the I/O thread. Runs inline
    // when already there.
    fn run_on_io<T: Send + 'static>(
        &self,
        job: impl FnOnce(&CacheInner) -> T + Send + 'static,
    ) -> Option<T> {
        if self.io.is_current() {
            return Some(job(&self.inner));
        }
        let (tx, rx) = std_mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);
        self.io.execute(move || {
            let _ = tx.send(job(&inner));
        });
        rx.recv().ok()
    }

    // Runs `job` on the I/O thread, then hands its result to `done` on the
    // completion thread.
    fn on_io_then<T: Send + 'static>(
        &self,
        job: impl FnOnce(&CacheInner) -> T + Send + 'static,
        done: impl FnOnce(T) + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        let completions = self.completions.clone();
        self.io.execute(move || {
            let result = job(&inner);
            completions.execute(move || done(result));
        });
    }

    /// Looks `key` up in memory, then on disk.
    ///
    /// A memory hit calls `done` before returning. Otherwise `done` runs on
    /// the completion thread once the disk lookup finishes, unless the
    /// returned handle was cancelled first.
    pub fn query_cache(
        &self,
        key: &CacheKey,
        done: impl FnOnce(Option<DecodedImage>, Option<Bytes>, CacheType) + Send + 'static,
    ) -> CacheQuery {
        if key.is_empty() {
            done(None, None, CacheType::None);
            return CacheQuery::completed();
        }

        if let Some(image) = self.inner.memory.get(key) {
            done(Some(image), None, CacheType::Memory);
            return CacheQuery::completed();
        }

        let token = CancellationToken::new();
        let query = CacheQuery {
            token: Some(token.clone()),
        };
        let inner = Arc::clone(&self.inner);
        let completions = self.completions.clone();
        let key = key.clone();
        self.io.execute(move || {
            if token.is_cancelled() {
                trace!(key = %key, "Cache query cancelled before disk lookup");
                return;
            }
            let found = inner.load_from_disk(&key);
            completions.execute(move || {
                if token.is_cancelled() {
                    trace!(key = %key, "Cache query cancelled after disk lookup");
                    return;
                }
                match found {
                    Some((image, bytes)) => done(Some(image), Some(bytes), CacheType::Disk),
                    None => done(None, None, CacheType::None),
                }
            });
        });
        query
    }

    /// Awaitable form of [`query_cache`](Self::query_cache).
    pub async fn query_cache_async(&self, key: &CacheKey) -> CacheLookup {
        let (tx, rx) = oneshot::channel();
        self.query_cache(key, move |image, data, source| {
            let _ = tx.send((image, data, source));
        });
        rx.await.unwrap_or((None, None, CacheType::None))
    }

    /// Inserts `image` into memory and, when `to_disk` is set, writes `data`
    /// (or an encoding of `image` when absent) to disk. `done` fires after
    /// the disk write, or right away for memory-only stores.
    pub fn store(
        &self,
        image: DecodedImage,
        data: Option<Bytes>,
        key: &CacheKey,
        to_disk: bool,
        done: impl FnOnce() + Send + 'static,
    ) {
        if key.is_empty() {
            done();
            return;
        }
        if self.inner.config.should_cache_images_in_memory {
            self.inner.memory.put(key.clone(), image.clone());
        }
        if !to_disk {
            done();
            return;
        }

        let inner = Arc::clone(&self.inner);
        let completions = self.completions.clone();
        let key = key.clone();
        self.io.execute(move || {
            let bytes = match data {
                Some(bytes) => Ok(bytes),
                None => inner.codecs.encode(&image, image.format()),
            };
            if let Err(e) = bytes.and_then(|bytes| inner.disk.store(&key, &bytes)) {
                warn!(key = %key, error = %e, "Disk write failed, image kept in memory only");
            }
            completions.execute(done);
        });
    }

    /// Writes raw bytes to disk, waiting for the write to finish.
    pub fn store_bytes_to_disk(&self, bytes: Bytes, key: &CacheKey) {
        let key = key.clone();
        let stored = self.run_on_io(move |inner| inner.disk.store(&key, &bytes));
        if let Some(Err(e)) = stored {
            warn!(error = %e, "Disk write failed");
        }
    }

    /// Memory lookup only.
    #[must_use]
    pub fn image_from_memory_cache(&self, key: &CacheKey) -> Option<DecodedImage> {
        self.inner.memory.get(key)
    }

    /// Disk lookup on the calling thread. A hit is copied into memory.
    #[must_use]
    pub fn image_from_disk_cache(&self, key: &CacheKey) -> Option<DecodedImage> {
        self.inner.load_from_disk(key).map(|(image, _)| image)
    }

    /// Memory lookup, then disk lookup on the calling thread.
    #[must_use]
    pub fn image_from_cache(&self, key: &CacheKey) -> Option<DecodedImage> {
        self.image_from_memory_cache(key)
            .or_else(|| self.image_from_disk_cache(key))
    }

    /// Checks the disk for `key` on the I/O thread.
    pub fn disk_image_exists(&self, key: &CacheKey, done: impl FnOnce(bool) + Send + 'static) {
        let key = key.clone();
        self.on_io_then(move |inner| inner.disk.exists(&key), done);
    }

    /// Removes `key` from memory and, when `from_disk` is set, from disk.
    pub fn remove(&self, key: &CacheKey, from_disk: bool, done: impl FnOnce() + Send + 'static) {
        self.inner.memory.remove(key);
        if !from_disk {
            done();
            return;
        }
        let key = key.clone();
        self.on_io_then(move |inner| inner.disk.remove(&key), |()| done());
    }

    /// Drops every decoded image.
    pub fn clear_memory(&self) {
        self.inner.memory.purge_all();
    }

    /// Deletes and recreates the disk namespace.
    pub fn clear_disk(&self, done: impl FnOnce() + Send + 'static) {
        self.on_io_then(
            |inner| {
                if let Err(e) = inner.disk.clear() {
                    warn!(error = %e, "Failed to clear disk cache");
                }
            },
            |()| done(),
        );
    }

    /// Runs the age and size sweep on the I/O thread.
    pub fn delete_old_files(&self, done: impl FnOnce(SweepReport) + Send + 'static) {
        self.on_io_then(
            |inner| {
                inner
                    .disk
                    .sweep_expired(inner.config.max_age(), inner.config.max_cache_size)
            },
            done,
        );
    }

    /// Memory-pressure hook.
    pub fn handle_memory_warning(&self) {
        debug!("Memory warning, purging decoded images");
        self.clear_memory();
    }

    /// App-background hook: frees memory and sweeps the disk.
    pub fn handle_app_background(&self) {
        self.clear_memory();
        self.delete_old_files(|report| {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                "Background disk sweep finished"
            );
        });
    }

    /// Bytes used on disk. Waits behind pending I/O.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.run_on_io(|inner| inner.disk.total_size())
            .unwrap_or_default()
    }

    /// Number of files on disk. Waits behind pending I/O.
    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.run_on_io(|inner| inner.disk.count()).unwrap_or_default()
    }

    /// Computes `(file_count, total_bytes)` on the I/O thread.
    pub fn calculate_size(&self, done: impl FnOnce(usize, u64) + Send + 'static) {
        self.on_io_then(
            |inner| {
                let entries = inner.disk.entries();
                (entries.len(), entries.iter().map(|e| e.size).sum())
            },
            |(count, bytes)| done(count, bytes),
        );
    }

    /// Adds a pre-populated directory searched after the writable one.
    pub fn add_read_only_cache_path(&self, path: impl Into<PathBuf>) {
        self.inner.disk.add_read_only_path(path);
    }

    /// Path of `key` under `root`.
    #[must_use]
    pub fn cache_path_for_key(key: &CacheKey, root: &Path) -> PathBuf {
        DiskImageCache::cache_path_for_key(key, root)
    }

    /// Path of `key` under the writable directory.
    #[must_use]
    pub fn default_cache_path_for_key(&self, key: &CacheKey) -> PathBuf {
        self.inner.disk.default_cache_path_for_key(key)
    }

    /// Changes the memory cost limit (0 = unlimited).
    pub fn set_max_memory_cost(&self, max_cost: u64) {
        self.inner.memory.set_max_cost(max_cost);
    }

    /// Changes the memory count limit (0 = unlimited).
    pub fn set_max_memory_count(&self, max_count: usize) {
        self.inner.memory.set_max_count(max_count);
    }

    /// Resolves once every disk job queued before the call has finished
    /// and its callback has run.
    pub async fn wait_for_pending_writes(&self) {
        self.io.barrier().await;
        self.completions.barrier().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageFormat;
    use crate::infrastructure::codec::raster_codec::fixtures::png_bytes;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_cache() -> (ImageCache, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = ImageCacheConfig {
            namespace: "test".to_string(),
            ..ImageCacheConfig::in_dir(temp.path())
        };
        let cache = ImageCache::new(config, Arc::new(CodecRegistry::with_defaults()));
        (cache, temp)
    }

    fn decoded(data: &[u8]) -> DecodedImage {
        CodecRegistry::with_defaults().decode(data).unwrap()
    }

    #[tokio::test]
    async fn test_memory_hit_is_synchronous() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/a.png");
        cache.store(decoded(&png_bytes(2, 2)), None, &key, false, || {});

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        cache.query_cache(&key, move |image, data, source| {
            *sink.lock() = Some((image.is_some(), data.is_some(), source));
        });

        assert_eq!(*seen.lock(), Some((true, false, CacheType::Memory)));
        assert_eq!(cache.disk_count(), 0);
    }

    #[tokio::test]
    async fn test_disk_hit_decodes_and_fills_memory() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/b.png");
        let bytes = png_bytes(10, 10);
        cache.store_bytes_to_disk(bytes.clone(), &key);

        let (image, data, source) = cache.query_cache_async(&key).await;

        assert_eq!(source, CacheType::Disk);
        assert_eq!(data, Some(bytes.clone()));
        let image = image.unwrap();
        assert!(image.same_pixels(&decoded(&bytes)));
        assert!(cache.image_from_memory_cache(&key).is_some());
    }

    #[tokio::test]
    async fn test_store_then_forced_memory_miss_reads_disk() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/c.png");
        let bytes = png_bytes(6, 4);
        let image = decoded(&bytes);

        cache.store(image.clone(), Some(bytes.clone()), &key, true, || {});
        cache.wait_for_pending_writes().await;
        cache.clear_memory();

        let (from_disk, data, source) = cache.query_cache_async(&key).await;
        assert_eq!(source, CacheType::Disk);
        assert_eq!(data.as_ref(), Some(&bytes));
        assert!(from_disk.unwrap().same_pixels(&image));
    }

    #[tokio::test]
    async fn test_store_without_bytes_encodes() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("generated");
        let image = DecodedImage::new(image::DynamicImage::new_rgba8(3, 3), ImageFormat::Undefined);

        cache.store(image, None, &key, true, || {});
        cache.wait_for_pending_writes().await;

        let path = cache.default_cache_path_for_key(&key);
        let written = std::fs::read(path).unwrap();
        assert_eq!(ImageFormat::sniff(&written), ImageFormat::Png);
    }

    #[tokio::test]
    async fn test_store_completion_fires_after_disk_write() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/d.png");
        let path = cache.default_cache_path_for_key(&key);
        let (tx, rx) = oneshot::channel();

        cache.store(
            decoded(&png_bytes(2, 2)),
            Some(png_bytes(2, 2)),
            &key,
            true,
            move || {
                let _ = tx.send(path.exists());
            },
        );

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_miss_reports_none() {
        let (cache, _temp) = create_test_cache();
        let lookup = cache.query_cache_async(&CacheKey::new("missing")).await;
        assert!(matches!(lookup, (None, None, CacheType::None)));
    }

    #[tokio::test]
    async fn test_cancelled_query_never_calls_back() {
        let (cache, _temp) = create_test_cache();
        let called = Arc::new(Mutex::new(false));

        // Hold the I/O thread so the lookup is still queued when cancelled.
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        cache.io.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        let flag = Arc::clone(&called);
        let query = cache.query_cache(&CacheKey::new("k"), move |_, _, _| {
            *flag.lock() = true;
        });
        query.cancel();
        assert!(query.is_cancelled());
        release_tx.send(()).unwrap();
        cache.wait_for_pending_writes().await;

        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_remove_from_memory_and_disk() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/e.png");
        cache.store(decoded(&png_bytes(2, 2)), Some(png_bytes(2, 2)), &key, true, || {});

        let (tx, rx) = oneshot::channel();
        cache.remove(&key, true, move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert!(cache.image_from_cache(&key).is_none());
        assert_eq!(cache.disk_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_disabled_skips_memory_store() {
        let temp = TempDir::new().unwrap();
        let config = ImageCacheConfig {
            should_cache_images_in_memory: false,
            ..ImageCacheConfig::in_dir(temp.path())
        };
        let cache = ImageCache::new(config, Arc::new(CodecRegistry::with_defaults()));
        let key = CacheKey::new("k");

        cache.store(decoded(&png_bytes(2, 2)), Some(png_bytes(2, 2)), &key, true, || {});
        cache.wait_for_pending_writes().await;

        assert!(cache.image_from_memory_cache(&key).is_none());
        let (_, _, source) = cache.query_cache_async(&key).await;
        assert_eq!(source, CacheType::Disk);
        assert!(cache.image_from_memory_cache(&key).is_none());
    }

    #[tokio::test]
    async fn test_size_accounting_and_clear() {
        let (cache, _temp) = create_test_cache();
        cache.store_bytes_to_disk(Bytes::from_static(b"12345"), &CacheKey::new("a"));
        cache.store_bytes_to_disk(Bytes::from_static(b"678"), &CacheKey::new("b"));

        assert_eq!(cache.total_size(), 8);
        assert_eq!(cache.disk_count(), 2);

        let (tx, rx) = oneshot::channel();
        cache.calculate_size(move |count, bytes| {
            let _ = tx.send((count, bytes));
        });
        assert_eq!(rx.await.unwrap(), (2, 8));

        let (tx, rx) = oneshot::channel();
        cache.clear_disk(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(cache.disk_count(), 0);
    }

    #[tokio::test]
    async fn test_disk_image_exists() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("present");
        cache.store_bytes_to_disk(png_bytes(1, 1), &key);

        let (tx, rx) = oneshot::channel();
        cache.disk_image_exists(&key, move |exists| {
            let _ = tx.send(exists);
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_callbacks_may_call_sync_queries() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("http://x/f.png");
        let bytes = png_bytes(2, 2);
        cache.store_bytes_to_disk(bytes.clone(), &key);
        cache.clear_memory();

        let (tx, rx) = oneshot::channel();
        let inner = cache.clone();
        cache.query_cache(&key, move |_, _, source| {
            let _ = tx.send((source, inner.disk_count(), inner.total_size()));
        });
        let answer = tokio::time::timeout(Duration::from_secs(3), rx).await;

        let (source, count, size) = answer.unwrap().unwrap();
        assert_eq!(source, CacheType::Disk);
        assert_eq!(count, 1);
        assert_eq!(size, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_store_callback_may_write_to_disk() {
        let (cache, _temp) = create_test_cache();
        let first = CacheKey::new("first");
        let second = CacheKey::new("second");

        let (tx, rx) = oneshot::channel();
        let inner = cache.clone();
        cache.store(
            decoded(&png_bytes(2, 2)),
            Some(png_bytes(2, 2)),
            &first,
            true,
            move || {
                inner.store_bytes_to_disk(png_bytes(1, 1), &second);
                let _ = tx.send(inner.disk_count());
            },
        );
        let answer = tokio::time::timeout(Duration::from_secs(3), rx).await;

        assert_eq!(answer.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_queries_run_inline_on_io_thread() {
        let (cache, _temp) = create_test_cache();
        cache.store_bytes_to_disk(Bytes::from_static(b"abc"), &CacheKey::new("a"));

        let (tx, rx) = oneshot::channel();
        let inner = cache.clone();
        cache.io.execute(move || {
            let _ = tx.send((inner.disk_count(), inner.total_size()));
        });
        let answer = tokio::time::timeout(Duration::from_secs(3), rx).await;

        assert_eq!(answer.unwrap().unwrap(), (1, 3));
    }

    #[tokio::test]
    async fn test_memory_warning_purges() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("k");
        cache.store(decoded(&png_bytes(2, 2)), None, &key, false, || {});

        cache.handle_memory_warning();
        assert!(cache.image_from_memory_cache(&key).is_none());
    }
}
