//! Warms the cache for a list of URLs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::domain::entities::ImageOptions;
use crate::domain::ports::Cancellable;
use crate::infrastructure::config::PrefetcherConfig;

use super::image_manager::{ImageLoadedEvent, ImageManager, LoadHandle};

/// Receives `(completed, total)` after each URL finishes.
pub type PrefetchProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Receives `(succeeded, skipped)` once the whole list is done.
pub type PrefetchCompletion = Box<dyn FnOnce(usize, usize) + Send>;

/// Observer notified alongside the callbacks.
pub trait PrefetcherObserver: Send + Sync {
    /// One URL finished, successfully or not.
    fn did_prefetch_url(&self, url: &str, completed: usize, total: usize);

    /// The whole list is done.
    fn did_finish(&self, total: usize, skipped: usize);
}

#[derive(Default)]
struct Tally {
    next: usize,
    succeeded: usize,
    skipped: usize,
    done: Vec<bool>,
    window: HashMap<usize, LoadHandle>,
    pumping: bool,
}

struct PrefetchSession {
    urls: Vec<String>,
    options: ImageOptions,
    max_concurrent: usize,
    cancelled: AtomicBool,
    tally: Mutex<Tally>,
    progress: Option<PrefetchProgress>,
    completion: Mutex<Option<PrefetchCompletion>>,
    observer: Option<Arc<dyn PrefetcherObserver>>,
}

impl PrefetchSession {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let handles: Vec<_> = self.tally.lock().window.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cancel();
        }
    }
}

struct PrefetcherInner {
    manager: ImageManager,
    max_concurrent: RwLock<usize>,
    options: RwLock<ImageOptions>,
    observer: RwLock<Option<Arc<dyn PrefetcherObserver>>>,
    session: Mutex<Option<Arc<PrefetchSession>>>,
}

impl PrefetcherInner {
    /// Fills the window from the session's URL list.
    ///
    /// Only one caller pumps at a time. Loads that finish synchronously
    /// inside `load_image` re-enter here, find the pump running and return;
    /// the running loop picks up the freed slots.
    fn start_next(self: &Arc<Self>, session: &Arc<PrefetchSession>) {
        {
            let mut tally = session.tally.lock();
            if tally.pumping {
                return;
            }
            tally.pumping = true;
        }
        loop {
            let index = {
                let mut tally = session.tally.lock();
                if session.is_cancelled()
                    || tally.next >= session.urls.len()
                    || tally.next - (tally.succeeded + tally.skipped) >= session.max_concurrent
                {
                    tally.pumping = false;
                    return;
                }
                tally.next += 1;
                tally.next - 1
            };

            let inner = Arc::clone(self);
            let owner = Arc::clone(session);
            let handle = self.manager.load_image(
                &session.urls[index],
                session.options,
                None,
                Arc::new(move |event: ImageLoadedEvent| {
                    if event.finished {
                        inner.url_finished(&owner, index, &event);
                    }
                }),
            );

            let mut tally = session.tally.lock();
            if !tally.done[index] && !session.is_cancelled() {
                tally.window.insert(index, handle);
            }
        }
    }

    fn url_finished(
        self: &Arc<Self>,
        session: &Arc<PrefetchSession>,
        index: usize,
        event: &ImageLoadedEvent,
    ) {
        if session.is_cancelled() {
            return;
        }
        let total = session.urls.len();
        let (completed, all_done, succeeded, skipped) = {
            let mut tally = session.tally.lock();
            if tally.done[index] {
                return;
            }
            tally.done[index] = true;
            tally.window.remove(&index);
            if event.is_failure() {
                tally.skipped += 1;
            } else {
                tally.succeeded += 1;
            }
            let completed = tally.succeeded + tally.skipped;
            (completed, completed == total, tally.succeeded, tally.skipped)
        };

        debug!(url = %event.url, completed, total, "Prefetched url");
        if let Some(progress) = &session.progress {
            progress(completed, total);
        }
        if let Some(observer) = &session.observer {
            observer.did_prefetch_url(&event.url, completed, total);
        }

        if all_done {
            self.session_finished(session, succeeded, skipped);
        } else {
            self.start_next(session);
        }
    }

    fn session_finished(&self, session: &Arc<PrefetchSession>, succeeded: usize, skipped: usize) {
        {
            let mut current = self.session.lock();
            if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *current = None;
            }
        }
        info!(succeeded, skipped, "Prefetch finished");
        if let Some(observer) = &session.observer {
            observer.did_finish(session.urls.len(), skipped);
        }
        let completion = session.completion.lock().take();
        if let Some(completion) = completion {
            completion(succeeded, skipped);
        }
    }
}

/// Downloads a list of URLs into the cache through an [`ImageManager`].
///
/// Cheap to clone; clones share the running session.
#[derive(Clone)]
pub struct ImagePrefetcher {
    inner: Arc<PrefetcherInner>,
}

impl std::fmt::Debug for ImagePrefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePrefetcher")
            .field("max_concurrent_downloads", &self.max_concurrent_downloads())
            .field("active", &self.inner.session.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl ImagePrefetcher {
    /// Creates a prefetcher loading through `manager`.
    #[must_use]
    pub fn new(manager: ImageManager, config: &PrefetcherConfig) -> Self {
        Self {
            inner: Arc::new(PrefetcherInner {
                manager,
                max_concurrent: RwLock::new(config.max_concurrent_downloads.max(1)),
                options: RwLock::new(ImageOptions {
                    low_priority: true,
                    ..ImageOptions::default()
                }),
                observer: RwLock::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// Process-wide prefetcher over the shared manager.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<ImagePrefetcher> = OnceLock::new();
        SHARED.get_or_init(|| {
            Self::new(ImageManager::shared().clone(), &PrefetcherConfig::default())
        })
    }

    /// The manager loads go through.
    #[must_use]
    pub fn manager(&self) -> &ImageManager {
        &self.inner.manager
    }

    /// Window size for sessions started from now on.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        *self.inner.max_concurrent.write() = max.max(1);
    }

    /// Current window size.
    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        *self.inner.max_concurrent.read()
    }

    /// Load options used for every prefetched URL.
    pub fn set_options(&self, options: ImageOptions) {
        *self.inner.options.write() = options;
    }

    /// Current load options.
    #[must_use]
    pub fn options(&self) -> ImageOptions {
        *self.inner.options.read()
    }

    /// Installs an observer for sessions started from now on.
    pub fn set_observer(&self, observer: Option<Arc<dyn PrefetcherObserver>>) {
        *self.inner.observer.write() = observer;
    }

    /// Replaces any running session with one over `urls`.
    ///
    /// `progress` fires once per URL; `completion` fires once at the end
    /// with `(succeeded, skipped)`, which always sum to `urls.len()`.
    pub fn prefetch_urls<I, S>(
        &self,
        urls: I,
        progress: Option<PrefetchProgress>,
        completion: Option<PrefetchCompletion>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cancel_prefetching();

        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        let session = Arc::new(PrefetchSession {
            tally: Mutex::new(Tally {
                done: vec![false; urls.len()],
                ..Tally::default()
            }),
            urls,
            options: self.options(),
            max_concurrent: self.max_concurrent_downloads(),
            cancelled: AtomicBool::new(false),
            progress,
            completion: Mutex::new(completion),
            observer: self.inner.observer.read().clone(),
        });
        info!(count = session.urls.len(), "Prefetch started");

        if session.urls.is_empty() {
            self.inner.session_finished(&session, 0, 0);
            return;
        }
        *self.inner.session.lock() = Some(Arc::clone(&session));
        self.inner.start_next(&session);
    }

    /// Stops the running session. No further callbacks fire for it.
    pub fn cancel_prefetching(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            debug!("Cancelling prefetch");
            session.cancel();
        }
    }

    /// Returns true while a session is running.
    #[must_use]
    pub fn is_prefetching(&self) -> bool {
        self.inner.session.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::CacheKey;
    use crate::domain::ports::mocks::{FixtureResponse, FixtureSession};
    use crate::domain::ports::{HttpSession, NoBackgroundTasks};
    use crate::infrastructure::cache::ImageCache;
    use crate::infrastructure::codec::CodecRegistry;
    use crate::infrastructure::codec::raster_codec::fixtures::png_bytes;
    use crate::infrastructure::config::{DownloaderConfig, ImageCacheConfig};
    use crate::infrastructure::download::{ImageDownloader, SessionConfig, SessionFactory};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn prefetcher(max: usize) -> (ImagePrefetcher, Arc<FixtureSession>, TempDir) {
        let temp = TempDir::new().unwrap();
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let cache = ImageCache::new(ImageCacheConfig::in_dir(temp.path()), Arc::clone(&codecs));
        let session = Arc::new(FixtureSession::new());
        let shared = Arc::clone(&session);
        let factory: SessionFactory =
            Arc::new(move |_: &SessionConfig| Arc::clone(&shared) as Arc<dyn HttpSession>);
        let downloader = ImageDownloader::with_parts(
            DownloaderConfig::default(),
            codecs,
            factory,
            Arc::new(NoBackgroundTasks),
        );
        let prefetcher = ImagePrefetcher::new(
            ImageManager::new(cache, downloader),
            &PrefetcherConfig {
                max_concurrent_downloads: max,
            },
        );
        (prefetcher, session, temp)
    }

    #[derive(Default)]
    struct RecordingObserver {
        urls: Mutex<Vec<String>>,
        finished: Mutex<Option<(usize, usize)>>,
    }

    impl PrefetcherObserver for RecordingObserver {
        fn did_prefetch_url(&self, url: &str, _completed: usize, _total: usize) {
            self.urls.lock().push(url.to_string());
        }

        fn did_finish(&self, total: usize, skipped: usize) {
            *self.finished.lock() = Some((total, skipped));
        }
    }

    #[tokio::test]
    async fn test_counts_add_up_with_failures() {
        let (prefetcher, session, _temp) = prefetcher(3);
        let mut urls = Vec::new();
        for i in 0..5 {
            let url = format!("http://x/p{i}.png");
            if i != 2 {
                session.route(&url, FixtureResponse::ok(png_bytes(2, 2)));
            }
            urls.push(url);
        }
        let observer = Arc::new(RecordingObserver::default());
        prefetcher.set_observer(Some(observer.clone()));

        let progress_calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress_calls);
        let (tx, rx) = oneshot::channel();
        prefetcher.prefetch_urls(
            urls.clone(),
            Some(Arc::new(move |completed: usize, total: usize| {
                sink.lock().push((completed, total));
            })),
            Some(Box::new(move |succeeded: usize, skipped: usize| {
                let _ = tx.send((succeeded, skipped));
            })),
        );

        let (succeeded, skipped) = rx.await.unwrap();
        assert_eq!((succeeded, skipped), (4, 1));
        let progress_calls = progress_calls.lock();
        assert_eq!(progress_calls.len(), 5);
        assert_eq!(progress_calls.last(), Some(&(5, 5)));
        assert_eq!(observer.urls.lock().len(), 5);
        assert_eq!(*observer.finished.lock(), Some((5, 1)));
        assert!(!prefetcher.is_prefetching());
        assert!(
            prefetcher
                .manager()
                .cache()
                .image_from_cache(&CacheKey::new("http://x/p0.png"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let (prefetcher, session, _temp) = prefetcher(2);
        let urls: Vec<String> = (0..4).map(|i| format!("http://x/w{i}.png")).collect();
        for url in &urls {
            session.route(
                url,
                FixtureResponse::ok(png_bytes(2, 2)).with_delay(Duration::from_millis(60)),
            );
        }

        let (tx, rx) = oneshot::channel();
        prefetcher.prefetch_urls(
            urls,
            None,
            Some(Box::new(move |succeeded: usize, _: usize| {
                let _ = tx.send(succeeded);
            })),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.requests().len(), 2);

        assert_eq!(rx.await.unwrap(), 4);
        assert!(
            session
                .requests()
                .iter()
                .all(|r| r.url.path().starts_with("/w"))
        );
    }

    #[tokio::test]
    async fn test_cancel_suppresses_callbacks() {
        let (prefetcher, session, _temp) = prefetcher(1);
        let urls: Vec<String> = (0..3).map(|i| format!("http://x/c{i}.png")).collect();
        for url in &urls {
            session.route(
                url,
                FixtureResponse::ok(png_bytes(2, 2)).with_delay(Duration::from_millis(50)),
            );
        }
        let fired = Arc::new(AtomicBool::new(false));
        let progress_fired = Arc::clone(&fired);
        let completion_fired = Arc::clone(&fired);

        prefetcher.prefetch_urls(
            urls,
            Some(Arc::new(move |_: usize, _: usize| {
                progress_fired.store(true, Ordering::SeqCst);
            })),
            Some(Box::new(move |_: usize, _: usize| {
                completion_fired.store(true, Ordering::SeqCst);
            })),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        prefetcher.cancel_prefetching();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!fired.load(Ordering::SeqCst));
        assert!(!prefetcher.is_prefetching());
        assert!(session.requests().len() <= 1);
    }

    #[tokio::test]
    async fn test_long_list_of_memory_hits_completes_synchronously() {
        let (prefetcher, session, _temp) = prefetcher(3);
        let cache = prefetcher.manager().cache();
        let image = CodecRegistry::with_defaults().decode(&png_bytes(1, 1)).unwrap();
        let urls: Vec<String> = (0..5000).map(|i| format!("http://x/m{i}.png")).collect();
        for url in &urls {
            cache.store(image.clone(), None, &CacheKey::new(url), false, || {});
        }
        let progress_calls = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&progress_calls);
        let result = Arc::new(Mutex::new(None));
        let done = Arc::clone(&result);

        prefetcher.prefetch_urls(
            urls,
            Some(Arc::new(move |_: usize, _: usize| *sink.lock() += 1)),
            Some(Box::new(move |succeeded: usize, skipped: usize| {
                *done.lock() = Some((succeeded, skipped));
            })),
        );

        assert_eq!(*result.lock(), Some((5000, 0)));
        assert_eq!(*progress_calls.lock(), 5000);
        assert!(session.requests().is_empty());
        assert!(!prefetcher.is_prefetching());
    }

    #[tokio::test]
    async fn test_empty_list_completes_immediately() {
        let (prefetcher, _session, _temp) = prefetcher(3);
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);

        prefetcher.prefetch_urls(
            Vec::<String>::new(),
            None,
            Some(Box::new(move |succeeded: usize, skipped: usize| {
                *sink.lock() = Some((succeeded, skipped));
            })),
        );

        assert_eq!(*result.lock(), Some((0, 0)));
    }

    #[test]
    fn test_defaults() {
        let (prefetcher, _session, _temp) = prefetcher(0);
        assert_eq!(prefetcher.max_concurrent_downloads(), 1);
        assert!(prefetcher.options().low_priority);
        prefetcher.set_max_concurrent_downloads(4);
        assert_eq!(prefetcher.max_concurrent_downloads(), 4);
    }
}
