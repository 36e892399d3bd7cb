//! Image loading orchestrator.
//!
//! Resolves a URL through the cache first, then the downloader, writing
//! downloads back into the cache before reporting them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::domain::entities::{
    CacheKey, CacheType, DecodedImage, DownloaderOptions, ImageOptions, LoadedImage,
};
use crate::domain::errors::ImageError;
use crate::domain::ports::{Cancellable, PostDownloadTransformer, ShouldDownloadDecider};
use crate::infrastructure::cache::{CacheQuery, ImageCache};
use crate::infrastructure::download::{
    CompletionCallback, DownloadToken, DownloadUpdate, ImageDownloader, ProgressCallback,
};

/// Maps a URL to the key used by both cache tiers.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Receives every delivery for one load.
pub type LoadCompletion = Arc<dyn Fn(ImageLoadedEvent) + Send + Sync>;

/// Message sent when an image load delivers something.
#[derive(Debug, Clone)]
pub struct ImageLoadedEvent {
    /// The URL as passed to the manager.
    pub url: String,
    /// The image, if one was found or downloaded.
    pub image: Option<LoadedImage>,
    /// Why the load failed.
    pub error: Option<ImageError>,
    /// False only for progressive previews.
    pub finished: bool,
}

impl ImageLoadedEvent {
    fn failed(url: &str, error: ImageError) -> Self {
        Self {
            url: url.to_string(),
            image: None,
            error: Some(error),
            finished: true,
        }
    }

    /// Which tier served the image; `None` for downloads and failures.
    #[must_use]
    pub fn source(&self) -> CacheType {
        self.image.as_ref().map_or(CacheType::None, |i| i.source)
    }

    /// Returns true if a finished event carries no image.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.finished && self.image.is_none()
    }
}

#[derive(Default)]
struct LoadSlots {
    cache_query: Option<CacheQuery>,
    download: Option<DownloadToken>,
    finished: bool,
}

struct LoadState {
    id: u64,
    cancelled: AtomicBool,
    slots: Mutex<LoadSlots>,
}

impl LoadState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ManagerInner {
    cache: ImageCache,
    downloader: ImageDownloader,
    failed_urls: RwLock<HashSet<Url>>,
    running: Mutex<HashMap<u64, Arc<LoadState>>>,
    next_id: AtomicU64,
    cache_key_filter: RwLock<Option<CacheKeyFilter>>,
    decider: RwLock<Option<Arc<dyn ShouldDownloadDecider>>>,
    transformer: RwLock<Option<Arc<dyn PostDownloadTransformer>>>,
}

impl ManagerInner {
    fn finish(&self, state: &LoadState) {
        {
            let mut slots = state.slots.lock();
            slots.finished = true;
            slots.cache_query = None;
            slots.download = None;
        }
        self.running.lock().remove(&state.id);
    }

    fn cancel(&self, state: &LoadState) {
        if state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let (query, download) = {
            let mut slots = state.slots.lock();
            (slots.cache_query.take(), slots.download.take())
        };
        if let Some(query) = query {
            query.cancel();
        }
        if let Some(token) = download {
            self.downloader.cancel(&token);
        }
        self.running.lock().remove(&state.id);
        trace!(id = state.id, "Load cancelled");
    }
}

/// Cancels one image load.
#[derive(Clone)]
pub struct LoadHandle {
    state: Arc<LoadState>,
    manager: Arc<ManagerInner>,
}

impl std::fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("id", &self.state.id)
            .field("cancelled", &self.state.is_cancelled())
            .finish()
    }
}

impl LoadHandle {
    /// Returns true once the load was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

impl Cancellable for LoadHandle {
    fn cancel(&self) {
        self.manager.cancel(&self.state);
    }
}

/// Everything one load needs after it leaves the caller's thread.
struct LoadJob {
    manager: Arc<ManagerInner>,
    state: Arc<LoadState>,
    url: Url,
    raw_url: String,
    key: CacheKey,
    options: ImageOptions,
    completion: LoadCompletion,
}

impl LoadJob {
    fn deliver(&self, event: ImageLoadedEvent) {
        if self.state.is_cancelled() {
            return;
        }
        (self.completion)(event);
    }

    fn deliver_image(
        &self,
        image: DecodedImage,
        data: Option<Bytes>,
        source: CacheType,
        finished: bool,
    ) {
        self.deliver(ImageLoadedEvent {
            url: self.raw_url.clone(),
            image: Some(LoadedImage {
                image,
                data,
                source,
            }),
            error: None,
            finished,
        });
    }

    fn complete_empty(&self) {
        self.deliver(ImageLoadedEvent {
            url: self.raw_url.clone(),
            image: None,
            error: None,
            finished: true,
        });
        self.manager.finish(&self.state);
    }

    fn fail(&self, error: ImageError) {
        self.deliver(ImageLoadedEvent::failed(&self.raw_url, error));
        self.manager.finish(&self.state);
    }

    /// Continues a load once the cache has answered.
    fn on_cache_result(
        self: Arc<Self>,
        cached: Option<DecodedImage>,
        data: Option<Bytes>,
        source: CacheType,
        progress: Option<ProgressCallback>,
        runtime: Option<Handle>,
    ) {
        if self.state.is_cancelled() {
            return;
        }
        let refresh = self.options.refresh_cached;

        if let Some(image) = &cached
            && !refresh
        {
            trace!(url = %self.url, %source, "Served from cache");
            self.deliver_image(image.clone(), data, source, true);
            self.manager.finish(&self.state);
            return;
        }

        let decider = self.manager.decider.read().clone();
        let should_download = decider.is_none_or(|d| d.should_download(&self.url));
        if !should_download {
            debug!(url = %self.url, "Download declined by host");
            match cached {
                Some(image) => {
                    self.deliver_image(image, data, source, true);
                    self.manager.finish(&self.state);
                }
                None => self.complete_empty(),
            }
            return;
        }

        let had_cached = cached.is_some();
        if let Some(image) = cached {
            self.deliver_image(image, data, source, true);
        }

        let mut options = DownloaderOptions::from(self.options);
        if had_cached {
            options.progressive_download = false;
            options.ignore_cached_response = true;
        }

        let job = Arc::clone(&self);
        let completion: CompletionCallback =
            Arc::new(move |update| Arc::clone(&job).on_download_update(update, had_cached));

        let _guard = runtime.as_ref().map(Handle::enter);
        let token = self
            .manager
            .downloader
            .download(&self.url, options, progress, Some(completion));

        let Some(token) = token else {
            return;
        };
        let stale = {
            let mut slots = self.state.slots.lock();
            if slots.finished || self.state.is_cancelled() {
                true
            } else {
                slots.download = Some(token.clone());
                false
            }
        };
        if stale && self.state.is_cancelled() {
            self.manager.downloader.cancel(&token);
        }
    }

    fn on_download_update(self: Arc<Self>, update: DownloadUpdate, had_cached: bool) {
        if self.state.is_cancelled() {
            return;
        }
        match update {
            DownloadUpdate::Partial(image) => {
                self.deliver_image(image, None, CacheType::None, false);
            }
            DownloadUpdate::Unchanged => {
                if had_cached {
                    trace!(url = %self.url, "Refresh found the cached image unchanged");
                    self.manager.finish(&self.state);
                } else {
                    self.complete_empty();
                }
            }
            DownloadUpdate::Failed { error, .. } => {
                if error.should_blacklist() {
                    info!(url = %self.url, error = %error, "Blacklisting url");
                    self.manager.failed_urls.write().insert(self.url.clone());
                } else if error.is_retryable() {
                    debug!(url = %self.url, error = %error, "Transient failure, url not blacklisted");
                }
                self.fail(error);
            }
            DownloadUpdate::Completed { image, data } => {
                if self.options.retry_failed
                    && self.manager.failed_urls.write().remove(&self.url)
                {
                    debug!(url = %self.url, "Removed url from blacklist");
                }
                let transformer = self.manager.transformer.read().clone();
                match (transformer, Handle::try_current()) {
                    (Some(transformer), Ok(runtime)) => {
                        let job = Arc::clone(&self);
                        runtime.spawn(async move {
                            let url = job.url.clone();
                            let original = image.clone();
                            let transformed = tokio::task::spawn_blocking(move || {
                                transformer.transform(image, &url)
                            })
                            .await;
                            match transformed {
                                Ok(transformed) => {
                                    job.store_and_deliver(&original, transformed, data);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Image transformer panicked");
                                    job.store_and_deliver(&original, original.clone(), data);
                                }
                            }
                        });
                    }
                    (Some(transformer), Err(_)) => {
                        let transformed = transformer.transform(image.clone(), &self.url);
                        self.store_and_deliver(&image, transformed, data);
                    }
                    (None, _) => self.store_and_deliver(&image, image.clone(), data),
                }
            }
        }
    }

    /// Writes the image back into the cache, then reports it.
    fn store_and_deliver(
        self: Arc<Self>,
        original: &DecodedImage,
        image: DecodedImage,
        data: Bytes,
    ) {
        if self.state.is_cancelled() {
            return;
        }
        let data = Arc::ptr_eq(original.pixels(), image.pixels()).then_some(data);
        let to_disk = !self.options.cache_memory_only;
        let job = Arc::clone(&self);
        let delivered = image.clone();
        let delivered_data = data.clone();
        self.manager.cache.store(image, data, &self.key, to_disk, move || {
            job.deliver_image(delivered, delivered_data, CacheType::None, true);
            job.manager.finish(&job.state);
        });
    }
}

/// Loads images through the cache and the downloader.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("running", &self.inner.running.lock().len())
            .field("failed_urls", &self.inner.failed_urls.read().len())
            .finish_non_exhaustive()
    }
}

impl ImageManager {
    /// Creates a manager over the given cache and downloader.
    #[must_use]
    pub fn new(cache: ImageCache, downloader: ImageDownloader) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                failed_urls: RwLock::new(HashSet::new()),
                running: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cache_key_filter: RwLock::new(None),
                decider: RwLock::new(None),
                transformer: RwLock::new(None),
            }),
        }
    }

    /// Process-wide manager over the shared cache and downloader.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<ImageManager> = OnceLock::new();
        SHARED.get_or_init(|| {
            Self::new(
                ImageCache::shared().clone(),
                ImageDownloader::shared().clone(),
            )
        })
    }

    /// The cache this manager reads and fills.
    #[must_use]
    pub fn cache(&self) -> &ImageCache {
        &self.inner.cache
    }

    /// The downloader this manager dispatches to.
    #[must_use]
    pub fn downloader(&self) -> &ImageDownloader {
        &self.inner.downloader
    }

    /// Installs the URL to cache-key mapping.
    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        *self.inner.cache_key_filter.write() = filter;
    }

    /// Lets the host veto downloads.
    pub fn set_should_download_decider(&self, decider: Option<Arc<dyn ShouldDownloadDecider>>) {
        *self.inner.decider.write() = decider;
    }

    /// Lets the host rewrite downloaded images before they are cached.
    pub fn set_post_download_transformer(
        &self,
        transformer: Option<Arc<dyn PostDownloadTransformer>>,
    ) {
        *self.inner.transformer.write() = transformer;
    }

    /// Cache key for `url`: the filter's output, or the absolute URL.
    #[must_use]
    pub fn cache_key_for_url(&self, url: &Url) -> CacheKey {
        let filter = self.inner.cache_key_filter.read().clone();
        match filter {
            Some(filter) => CacheKey::new(filter(url)),
            None => CacheKey::new(url.as_str()),
        }
    }

    /// Loads `url`, from cache when possible.
    ///
    /// `completion` receives progressive previews (`finished == false`) and
    /// terminal results. A memory hit is delivered before this returns.
    pub fn load_image(
        &self,
        url: &str,
        options: ImageOptions,
        progress: Option<ProgressCallback>,
        completion: LoadCompletion,
    ) -> LoadHandle {
        let state = Arc::new(LoadState {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            slots: Mutex::new(LoadSlots::default()),
        });
        let handle = LoadHandle {
            state: Arc::clone(&state),
            manager: Arc::clone(&self.inner),
        };

        let parsed = match Url::parse(url) {
            Ok(parsed) if !url.is_empty() => parsed,
            _ => {
                debug!(url, "Rejecting invalid url");
                state.slots.lock().finished = true;
                completion(ImageLoadedEvent::failed(url, ImageError::invalid_url(url)));
                return handle;
            }
        };

        if !options.retry_failed && self.inner.failed_urls.read().contains(&parsed) {
            debug!(url = %parsed, "Url is blacklisted");
            state.slots.lock().finished = true;
            completion(ImageLoadedEvent::failed(url, ImageError::blacklisted(url)));
            return handle;
        }

        self.inner.running.lock().insert(state.id, Arc::clone(&state));

        let job = Arc::new(LoadJob {
            manager: Arc::clone(&self.inner),
            state: Arc::clone(&state),
            key: self.cache_key_for_url(&parsed),
            url: parsed,
            raw_url: url.to_string(),
            options,
            completion,
        });
        let runtime = Handle::try_current().ok();
        let key = job.key.clone();
        let query = self.inner.cache.query_cache(&key, move |image, data, source| {
            job.on_cache_result(image, data, source, progress, runtime);
        });

        let mut slots = state.slots.lock();
        if !slots.finished && slots.download.is_none() {
            slots.cache_query = Some(query);
        }
        drop(slots);
        handle
    }

    /// Loads `url` and resolves with the first finished event.
    pub async fn load(&self, url: &str, options: ImageOptions) -> ImageLoadedEvent {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _handle = self.load_image(
            url,
            options,
            None,
            Arc::new(move |event: ImageLoadedEvent| {
                if event.finished
                    && let Some(tx) = tx.lock().take()
                {
                    let _ = tx.send(event);
                }
            }),
        );
        rx.await
            .unwrap_or_else(|_| ImageLoadedEvent::failed(url, ImageError::Cancelled))
    }

    /// Stores `image` for `url` in memory and on disk.
    pub fn save_image_to_cache(&self, image: DecodedImage, url: &Url) {
        let key = self.cache_key_for_url(url);
        self.inner.cache.store(image, None, &key, true, || {});
    }

    /// Reports whether `url` is cached in memory or on disk.
    pub fn cached_image_exists(&self, url: &Url, done: impl FnOnce(bool) + Send + 'static) {
        let key = self.cache_key_for_url(url);
        if self.inner.cache.image_from_memory_cache(&key).is_some() {
            done(true);
            return;
        }
        self.inner.cache.disk_image_exists(&key, done);
    }

    /// Reports whether `url` is cached on disk.
    pub fn disk_image_exists(&self, url: &Url, done: impl FnOnce(bool) + Send + 'static) {
        let key = self.cache_key_for_url(url);
        self.inner.cache.disk_image_exists(&key, done);
    }

    /// Returns true if `url` failed permanently and is skipped without
    /// `retry_failed`.
    #[must_use]
    pub fn is_blacklisted(&self, url: &Url) -> bool {
        self.inner.failed_urls.read().contains(url)
    }

    /// Forgets every failed URL.
    pub fn clear_failed_urls(&self) {
        self.inner.failed_urls.write().clear();
    }

    /// Cancels every load in progress.
    pub fn cancel_all(&self) {
        let states: Vec<_> = self.inner.running.lock().drain().map(|(_, s)| s).collect();
        if !states.is_empty() {
            info!(count = states.len(), "Cancelling all image loads");
        }
        for state in states {
            self.inner.cancel(&state);
        }
    }

    /// Returns true while any load is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.running.lock().is_empty()
    }
}
