//! Bounded, deduplicating image downloader.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace};
use url::Url;

use crate::domain::entities::{DownloaderOptions, ExecutionOrder};
use crate::domain::errors::{ImageError, TransportKind};
use crate::domain::ports::{
    BackgroundTaskPort, CachePolicy, Credential, HttpHeaders, HttpRequest, HttpSession,
    NoBackgroundTasks,
};
use crate::infrastructure::codec::CodecRegistry;
use crate::infrastructure::config::DownloaderConfig;

use super::operation::{
    CompletionCallback, DownloadOperation, DownloadUpdate, HandlerToken, OperationContext,
    OperationFactory, ProgressCallback, default_operation_factory,
};
use super::session::{SessionConfig, SessionFactory, reqwest_session_factory};

const ACCEPT_HEADER: &str = "Accept";
const DEFAULT_ACCEPT: &str = "image/webp,image/*;q=0.8";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Rewrites the headers sent for one URL.
pub type HeadersFilter = Arc<dyn Fn(&Url, &HttpHeaders) -> HttpHeaders + Send + Sync>;

/// Returned by [`ImageDownloader::download`]; cancels one caller's interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadToken {
    url: Url,
    handler: HandlerToken,
}

impl DownloadToken {
    /// URL the token belongs to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    const fn of(options: &DownloaderOptions) -> Self {
        if options.high_priority {
            Self::High
        } else if options.low_priority {
            Self::Low
        } else {
            Self::Normal
        }
    }
}

struct Settings {
    config: DownloaderConfig,
    headers: HttpHeaders,
    headers_filter: Option<HeadersFilter>,
    url_credential: Option<Credential>,
    operation_factory: OperationFactory,
}

struct QueueState {
    operations: HashMap<Url, Arc<dyn DownloadOperation>>,
    pending: VecDeque<(Priority, Arc<dyn DownloadOperation>)>,
    running: usize,
    suspended: bool,
    session: Option<Arc<dyn HttpSession>>,
    invalidated: bool,
}

impl QueueState {
    fn forget(&mut self, operation: &Arc<dyn DownloadOperation>) {
        if self
            .operations
            .get(operation.url())
            .is_some_and(|current| Arc::ptr_eq(current, operation))
        {
            self.operations.remove(operation.url());
        }
    }

    fn enqueue(
        &mut self,
        priority: Priority,
        order: ExecutionOrder,
        operation: Arc<dyn DownloadOperation>,
    ) {
        let first = |pred: &dyn Fn(Priority) -> bool| {
            self.pending
                .iter()
                .position(|(p, _)| pred(*p))
                .unwrap_or(self.pending.len())
        };
        let index = match (priority, order) {
            (Priority::High, _) => 0,
            (Priority::Normal, ExecutionOrder::Fifo) => first(&|p| p == Priority::Low),
            (Priority::Normal, ExecutionOrder::Lifo) => first(&|p| p != Priority::High),
            (Priority::Low, ExecutionOrder::Fifo) => self.pending.len(),
            (Priority::Low, ExecutionOrder::Lifo) => first(&|p| p == Priority::Low),
        };
        self.pending.insert(index, (priority, operation));
    }

    fn drained(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }
}

struct DownloaderInner {
    settings: RwLock<Settings>,
    queue: Mutex<QueueState>,
    codecs: Arc<CodecRegistry>,
    background: Arc<dyn BackgroundTaskPort>,
    session_factory: SessionFactory,
    runtime: Option<Handle>,
}

/// Downloads images with bounded concurrency, one operation per URL.
///
/// Cheap to clone; clones share the queue and the session.
#[derive(Clone)]
pub struct ImageDownloader {
    inner: Arc<DownloaderInner>,
}

impl std::fmt::Debug for ImageDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDownloader")
            .field("current_download_count", &self.current_download_count())
            .finish_non_exhaustive()
    }
}

impl ImageDownloader {
    /// Creates a downloader backed by `reqwest`.
    ///
    /// Downloads are spawned on the Tokio runtime current at construction
    /// time, or on the caller's runtime if there was none.
    #[must_use]
    pub fn new(config: DownloaderConfig, codecs: Arc<CodecRegistry>) -> Self {
        Self::with_parts(
            config,
            codecs,
            reqwest_session_factory(),
            Arc::new(NoBackgroundTasks),
        )
    }

    /// Creates a downloader with explicit transport and background hooks.
    #[must_use]
    pub fn with_parts(
        config: DownloaderConfig,
        codecs: Arc<CodecRegistry>,
        session_factory: SessionFactory,
        background: Arc<dyn BackgroundTaskPort>,
    ) -> Self {
        let session = session_factory(&session_config(&config));
        let mut headers = HttpHeaders::new();
        headers.insert(ACCEPT_HEADER.to_string(), DEFAULT_ACCEPT.to_string());

        Self {
            inner: Arc::new(DownloaderInner {
                settings: RwLock::new(Settings {
                    config,
                    headers,
                    headers_filter: None,
                    url_credential: None,
                    operation_factory: default_operation_factory(),
                }),
                queue: Mutex::new(QueueState {
                    operations: HashMap::new(),
                    pending: VecDeque::new(),
                    running: 0,
                    suspended: false,
                    session: Some(session),
                    invalidated: false,
                }),
                codecs,
                background,
                session_factory,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Process-wide downloader with the default configuration.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<ImageDownloader> = OnceLock::new();
        SHARED.get_or_init(|| {
            Self::new(
                DownloaderConfig::default(),
                Arc::clone(CodecRegistry::shared()),
            )
        })
    }

    /// Codecs used to decode downloads.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    fn build_request(
        &self,
        url: &Url,
        options: &DownloaderOptions,
    ) -> (HttpRequest, OperationContext, OperationFactory, ExecutionOrder) {
        let (base_headers, filter, timeout, credential, factory, order, should_decompress) = {
            let settings = self.inner.settings.read();
            (
                settings.headers.clone(),
                settings.headers_filter.clone(),
                settings.config.timeout(),
                settings
                    .url_credential
                    .clone()
                    .or_else(|| settings.config.credential()),
                Arc::clone(&settings.operation_factory),
                settings.config.execution_order,
                settings.config.should_decompress_images,
            )
        };
        let headers = match filter {
            Some(filter) => filter(url, &base_headers),
            None => base_headers,
        };
        let request = HttpRequest {
            url: url.clone(),
            headers,
            timeout: if timeout.is_zero() {
                DEFAULT_TIMEOUT
            } else {
                timeout
            },
            handle_cookies: options.handle_cookies,
            cache_policy: if options.use_url_cache {
                CachePolicy::UseProtocolCachePolicy
            } else {
                CachePolicy::ReloadIgnoringLocalCache
            },
            allow_invalid_certificates: options.allow_invalid_ssl_certificates,
            credential,
        };
        let context = OperationContext {
            codecs: Arc::clone(&self.inner.codecs),
            background: Arc::clone(&self.inner.background),
            should_decompress,
        };
        (request, context, factory, order)
    }

    /// Starts or joins the download of `url`.
    ///
    /// Callers asking for a URL that is already downloading share that
    /// download; each gets its own token. Returns `None` when the download
    /// could not be registered, after reporting the failure to `completion`.
    pub fn download(
        &self,
        url: &Url,
        options: DownloaderOptions,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Option<DownloadToken> {
        let (request, context, factory, order) = self.build_request(url, &options);

        let mut queue = self.inner.queue.lock();
        if queue.invalidated {
            drop(queue);
            debug!(url = %url, "Download refused, session invalidated");
            if let Some(completion) = completion {
                completion(DownloadUpdate::Failed {
                    error: ImageError::transport(
                        TransportKind::SessionInvalidated,
                        "downloader session was invalidated",
                    ),
                    data: None,
                });
            }
            return None;
        }

        if let Some(existing) = queue.operations.get(url)
            && let Some(handler) = existing.add_handlers(progress.clone(), completion.clone())
        {
            trace!(url = %url, "Joined in-flight download");
            return Some(DownloadToken {
                url: url.clone(),
                handler,
            });
        }

        let operation = factory(request, options, context);
        let handler = operation.add_handlers(progress, completion)?;
        queue
            .operations
            .insert(url.clone(), Arc::clone(&operation));
        queue.enqueue(Priority::of(&options), order, operation);
        debug!(url = %url, pending = queue.pending.len(), "Queued download");
        drop(queue);

        self.pump();
        Some(DownloadToken {
            url: url.clone(),
            handler,
        })
    }

    /// Withdraws one caller's interest. The transfer itself stops only when
    /// no other caller is waiting on it.
    pub fn cancel(&self, token: &DownloadToken) {
        let operation = self.inner.queue.lock().operations.get(&token.url).cloned();
        let Some(operation) = operation else {
            return;
        };
        if operation.cancel_handler(token.handler) {
            let mut queue = self.inner.queue.lock();
            queue
                .pending
                .retain(|(_, queued)| !Arc::ptr_eq(queued, &operation));
            queue.forget(&operation);
            debug!(url = %token.url, "Download cancelled");
        }
    }

    /// Starts queued downloads while below the concurrency limit.
    fn pump(&self) {
        let max = self
            .inner
            .settings
            .read()
            .config
            .max_concurrent_downloads
            .max(1);
        loop {
            let (operation, session) = {
                let mut queue = self.inner.queue.lock();
                if queue.suspended || queue.running >= max {
                    return;
                }
                let Some(session) = queue.session.clone() else {
                    return;
                };
                let Some((_, operation)) = queue.pending.pop_front() else {
                    return;
                };
                if operation.status().is_terminal() {
                    queue.forget(&operation);
                    continue;
                }
                queue.running += 1;
                (operation, session)
            };

            let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone())
            else {
                error!(url = %operation.url(), "No Tokio runtime to run download on");
                self.inner.queue.lock().running -= 1;
                operation.cancel();
                self.inner.queue.lock().forget(&operation);
                continue;
            };

            trace!(url = %operation.url(), "Starting download");
            let downloader = self.clone();
            runtime.spawn(async move {
                Arc::clone(&operation).run(session).await;
                downloader.operation_finished(&operation);
            });
        }
    }

    fn operation_finished(&self, operation: &Arc<dyn DownloadOperation>) {
        {
            let mut queue = self.inner.queue.lock();
            queue.running = queue.running.saturating_sub(1);
            queue.forget(operation);
            if queue.invalidated && queue.drained() && queue.session.take().is_some() {
                debug!("Session released after draining");
            }
        }
        self.pump();
    }

    /// Pauses or resumes starting queued downloads.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.queue.lock().suspended = suspended;
        if !suspended {
            self.pump();
        }
    }

    /// Cancels every queued and running download.
    pub fn cancel_all(&self) {
        let operations: Vec<_> = {
            let mut queue = self.inner.queue.lock();
            queue.pending.clear();
            queue.operations.drain().map(|(_, op)| op).collect()
        };
        if !operations.is_empty() {
            info!(count = operations.len(), "Cancelling all downloads");
        }
        for operation in operations {
            operation.cancel();
        }
    }

    /// Cancels everything and replaces the session.
    pub fn recreate_session(&self, config: SessionConfig) {
        self.cancel_all();
        let session = (self.inner.session_factory)(&config);
        {
            let mut queue = self.inner.queue.lock();
            queue.session = Some(session);
            queue.invalidated = false;
        }
        debug!(timeout = ?config.timeout, "Recreated download session");
    }

    /// Shuts the session down. With `cancel_pending` every download is
    /// cancelled; otherwise queued and running downloads finish first.
    /// New downloads fail either way.
    pub fn invalidate_session(&self, cancel_pending: bool) {
        if cancel_pending {
            self.cancel_all();
        }
        let mut queue = self.inner.queue.lock();
        queue.invalidated = true;
        if cancel_pending || queue.drained() {
            queue.session = None;
        }
        debug!(cancel_pending, "Invalidated download session");
    }

    /// Downloads running or waiting to run.
    #[must_use]
    pub fn current_download_count(&self) -> usize {
        let queue = self.inner.queue.lock();
        queue.running + queue.pending.len()
    }

    /// Sets (or with `None` removes) a header sent with every request.
    pub fn set_header_value(&self, field: &str, value: Option<&str>) {
        let mut settings = self.inner.settings.write();
        match value {
            Some(value) => {
                settings
                    .headers
                    .insert(field.to_string(), value.to_string());
            }
            None => {
                settings.headers.remove(field);
            }
        }
    }

    /// Value of a header sent with every request.
    #[must_use]
    pub fn http_header(&self, field: &str) -> Option<String> {
        self.inner.settings.read().headers.get(field).cloned()
    }

    /// Installs a per-URL header rewrite.
    pub fn set_headers_filter(&self, filter: Option<HeadersFilter>) {
        self.inner.settings.write().headers_filter = filter;
    }

    /// Replaces the factory used for new operations.
    pub fn set_operation_factory(&self, factory: OperationFactory) {
        self.inner.settings.write().operation_factory = factory;
    }

    /// Changes the concurrency limit.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.inner.settings.write().config.max_concurrent_downloads = max;
        self.pump();
    }

    /// Current concurrency limit.
    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.settings.read().config.max_concurrent_downloads
    }

    /// Changes the order in which queued downloads start.
    pub fn set_execution_order(&self, order: ExecutionOrder) {
        self.inner.settings.write().config.execution_order = order;
    }

    /// Current dispatch order.
    #[must_use]
    pub fn execution_order(&self) -> ExecutionOrder {
        self.inner.settings.read().config.execution_order
    }

    /// Sets basic-auth credentials for every request.
    pub fn set_credentials(&self, username: Option<&str>, password: Option<&str>) {
        let mut settings = self.inner.settings.write();
        settings.config.username = username.map(str::to_string);
        settings.config.password = password.map(str::to_string);
    }

    /// Sets a credential that takes precedence over username/password.
    pub fn set_url_credential(&self, credential: Option<Credential>) {
        self.inner.settings.write().url_credential = credential;
    }

    /// Turns decompression of downloaded images on or off.
    pub fn set_should_decompress_images(&self, decompress: bool) {
        self.inner.settings.write().config.should_decompress_images = decompress;
    }
}

fn session_config(config: &DownloaderConfig) -> SessionConfig {
    SessionConfig {
        timeout: if config.download_timeout == 0 {
            DEFAULT_TIMEOUT
        } else {
            config.timeout()
        },
        pool_max_idle_per_host: config.max_concurrent_downloads.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::{FixtureResponse, FixtureSession};
    use crate::infrastructure::codec::raster_codec::fixtures::png_bytes;
    use crate::infrastructure::download::operation::OperationStatus;

    fn downloader_with(config: DownloaderConfig) -> (ImageDownloader, Arc<FixtureSession>) {
        let session = Arc::new(FixtureSession::new());
        let shared = Arc::clone(&session);
        let factory: SessionFactory =
            Arc::new(move |_: &SessionConfig| Arc::clone(&shared) as Arc<dyn HttpSession>);
        let downloader = ImageDownloader::with_parts(
            config,
            Arc::new(CodecRegistry::with_defaults()),
            factory,
            Arc::new(NoBackgroundTasks),
        );
        (downloader, session)
    }

    fn downloader() -> (ImageDownloader, Arc<FixtureSession>) {
        downloader_with(DownloaderConfig::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn recorder() -> (CompletionCallback, Arc<Mutex<Vec<DownloadUpdate>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let callback: CompletionCallback = Arc::new(move |update| sink.lock().push(update));
        (callback, updates)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_transfer() {
        let (downloader, session) = downloader();
        let target = "http://x/c.png";
        session.route(
            target,
            FixtureResponse::ok(png_bytes(5, 5)).with_delay(Duration::from_millis(50)),
        );
        let (first, first_updates) = recorder();
        let (second, second_updates) = recorder();

        let t1 = downloader
            .download(&url(target), DownloaderOptions::default(), None, Some(first))
            .unwrap();
        let t2 = downloader
            .download(&url(target), DownloaderOptions::default(), None, Some(second))
            .unwrap();
        assert_ne!(t1, t2);
        assert_eq!(t1.url(), t2.url());

        wait_until(|| first_updates.lock().len() == 1 && second_updates.lock().len() == 1).await;

        assert_eq!(session.request_count(target), 1);
        let (first, second) = (first_updates.lock(), second_updates.lock());
        match (&first[0], &second[0]) {
            (
                DownloadUpdate::Completed { image: a, .. },
                DownloadUpdate::Completed { image: b, .. },
            ) => assert!(a.same_pixels(b)),
            other => panic!("unexpected updates {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_non_last_keeps_transfer() {
        let (downloader, session) = downloader();
        let target = "http://x/shared.png";
        session.route(
            target,
            FixtureResponse::ok(png_bytes(3, 3)).with_delay(Duration::from_millis(40)),
        );
        let (first, first_updates) = recorder();
        let (second, second_updates) = recorder();
        let t1 = downloader
            .download(&url(target), DownloaderOptions::default(), None, Some(first))
            .unwrap();
        downloader
            .download(&url(target), DownloaderOptions::default(), None, Some(second))
            .unwrap();

        downloader.cancel(&t1);
        wait_until(|| second_updates.lock().len() == 1).await;

        assert!(first_updates.lock().is_empty());
        assert!(matches!(
            second_updates.lock()[0],
            DownloadUpdate::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_last_handle_stops_operation() {
        let (downloader, session) = downloader();
        let target = "http://x/slow.png";
        session.route(
            target,
            FixtureResponse::ok(png_bytes(3, 3)).with_delay(Duration::from_secs(5)),
        );
        let (completion, updates) = recorder();
        let token = downloader
            .download(&url(target), DownloaderOptions::default(), None, Some(completion))
            .unwrap();
        let operation = downloader
            .inner
            .queue
            .lock()
            .operations
            .get(&url(target))
            .cloned()
            .unwrap();

        downloader.cancel(&token);

        assert_eq!(operation.status(), OperationStatus::Cancelled);
        wait_until(|| downloader.current_download_count() == 0).await;
        assert!(updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let (downloader, session) = downloader_with(DownloaderConfig {
            max_concurrent_downloads: 2,
            ..DownloaderConfig::default()
        });
        let mut recorders = Vec::new();
        for i in 0..5 {
            let target = format!("http://x/{i}.png");
            session.route(
                &target,
                FixtureResponse::ok(png_bytes(2, 2)).with_delay(Duration::from_millis(60)),
            );
            let (completion, updates) = recorder();
            downloader.download(&url(&target), DownloaderOptions::default(), None, Some(completion));
            recorders.push(updates);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.requests().len(), 2);
        assert_eq!(downloader.current_download_count(), 5);

        wait_until(|| recorders.iter().all(|r| r.lock().len() == 1)).await;
        assert_eq!(session.requests().len(), 5);
    }

    async fn dispatch_order(
        order: ExecutionOrder,
        requests: &[(&str, DownloaderOptions)],
    ) -> Vec<String> {
        let (downloader, session) = downloader_with(DownloaderConfig {
            max_concurrent_downloads: 1,
            execution_order: order,
            ..DownloaderConfig::default()
        });
        downloader.set_suspended(true);
        for (target, options) in requests {
            session.route(target, FixtureResponse::ok(png_bytes(1, 1)));
            downloader.download(&url(target), *options, None, None);
        }
        assert!(session.requests().is_empty());

        downloader.set_suspended(false);
        wait_until(|| session.requests().len() == requests.len()).await;
        session
            .requests()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_fifo_and_lifo_dispatch() {
        let normal = DownloaderOptions::default();
        let requests = [
            ("http://x/a", normal),
            ("http://x/b", normal),
            ("http://x/c", normal),
        ];

        assert_eq!(
            dispatch_order(ExecutionOrder::Fifo, &requests).await,
            vec!["/a", "/b", "/c"]
        );
        assert_eq!(
            dispatch_order(ExecutionOrder::Lifo, &requests).await,
            vec!["/c", "/b", "/a"]
        );
    }

    #[tokio::test]
    async fn test_priorities() {
        let normal = DownloaderOptions::default();
        let high = DownloaderOptions {
            high_priority: true,
            ..normal
        };
        let low = DownloaderOptions {
            low_priority: true,
            ..normal
        };
        let requests = [
            ("http://x/low", low),
            ("http://x/a", normal),
            ("http://x/high", high),
            ("http://x/b", normal),
        ];

        assert_eq!(
            dispatch_order(ExecutionOrder::Fifo, &requests).await,
            vec!["/high", "/a", "/b", "/low"]
        );
        assert_eq!(
            dispatch_order(ExecutionOrder::Lifo, &requests).await,
            vec!["/high", "/b", "/a", "/low"]
        );
    }

    #[tokio::test]
    async fn test_headers_and_credentials() {
        let (downloader, session) = downloader();
        assert_eq!(
            downloader.http_header("Accept").as_deref(),
            Some("image/webp,image/*;q=0.8")
        );
        downloader.set_header_value("X-Client", Some("webimage"));
        downloader.set_headers_filter(Some(Arc::new(|url: &Url, headers: &HttpHeaders| {
            let mut headers = headers.clone();
            headers.insert("X-Path".to_string(), url.path().to_string());
            headers
        })));
        downloader.set_credentials(Some("user"), Some("secret"));

        let target = "http://x/h.png";
        session.route(target, FixtureResponse::ok(png_bytes(1, 1)));
        downloader.download(&url(target), DownloaderOptions::default(), None, None);
        wait_until(|| session.request_count(target) == 1).await;

        let request = &session.requests()[0];
        assert_eq!(request.headers.get("X-Client").map(String::as_str), Some("webimage"));
        assert_eq!(request.headers.get("X-Path").map(String::as_str), Some("/h.png"));
        assert_eq!(request.credential.as_ref().map(|c| c.user.as_str()), Some("user"));
        assert_eq!(request.timeout, Duration::from_secs(15));

        downloader.set_header_value("X-Client", None);
        assert_eq!(downloader.http_header("X-Client"), None);
    }

    #[tokio::test]
    async fn test_cancel_all_reports_cancellation() {
        let (downloader, session) = downloader();
        let target = "http://x/never.png";
        session.route(
            target,
            FixtureResponse::ok(png_bytes(1, 1)).with_delay(Duration::from_secs(5)),
        );
        let (completion, updates) = recorder();
        downloader.download(&url(target), DownloaderOptions::default(), None, Some(completion));

        downloader.cancel_all();

        assert!(matches!(
            updates.lock().as_slice(),
            [DownloadUpdate::Failed {
                error: ImageError::Cancelled,
                ..
            }]
        ));
        wait_until(|| downloader.current_download_count() == 0).await;
    }

    #[tokio::test]
    async fn test_invalidated_session_refuses_downloads() {
        let (downloader, _session) = downloader();
        downloader.invalidate_session(true);

        let (completion, updates) = recorder();
        let token = downloader.download(
            &url("http://x/late.png"),
            DownloaderOptions::default(),
            None,
            Some(completion),
        );

        assert!(token.is_none());
        assert!(matches!(
            updates.lock().as_slice(),
            [DownloadUpdate::Failed {
                error: ImageError::Transport {
                    kind: TransportKind::SessionInvalidated,
                    ..
                },
                ..
            }]
        ));

        downloader.recreate_session(SessionConfig::default());
        assert!(
            downloader
                .download(&url("http://x/late.png"), DownloaderOptions::default(), None, None)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_invalidate_without_cancel_lets_running_finish() {
        let (downloader, session) = downloader();
        let target = "http://x/drain.png";
        session.route(
            target,
            FixtureResponse::ok(png_bytes(2, 2)).with_delay(Duration::from_millis(30)),
        );
        let (completion, updates) = recorder();
        downloader.download(&url(target), DownloaderOptions::default(), None, Some(completion));

        downloader.invalidate_session(false);
        wait_until(|| updates.lock().len() == 1).await;

        assert!(matches!(updates.lock()[0], DownloadUpdate::Completed { .. }));
        wait_until(|| downloader.inner.queue.lock().session.is_none()).await;
    }

    #[tokio::test]
    async fn test_finished_url_can_be_downloaded_again() {
        let (downloader, session) = downloader();
        let target = "http://x/again.png";
        session.route(target, FixtureResponse::ok(png_bytes(2, 2)));

        for expected in 1..=2 {
            let (completion, updates) = recorder();
            downloader.download(&url(target), DownloaderOptions::default(), None, Some(completion));
            wait_until(|| updates.lock().len() == 1).await;
            assert_eq!(session.request_count(target), expected);
        }
    }
}
