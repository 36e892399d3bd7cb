//! A single HTTP image download shared by every caller asking for its URL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::domain::entities::{CacheKey, DecodedImage, DownloaderOptions};
use crate::domain::errors::ImageError;
use crate::domain::ports::{
    BackgroundTaskId, BackgroundTaskPort, DecompressOptions, HttpRequest, HttpSession,
};
use crate::infrastructure::codec::CodecRegistry;

use super::notifications::{DownloadNotificationKind, post};

/// Receives `(received_bytes, expected_bytes, url)` as data arrives.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>, &Url) + Send + Sync>;

/// Receives partial and terminal results.
pub type CompletionCallback = Arc<dyn Fn(DownloadUpdate) + Send + Sync>;

/// Something delivered to a completion callback.
#[derive(Debug, Clone)]
pub enum DownloadUpdate {
    /// Best-effort preview of a progressive download.
    Partial(DecodedImage),
    /// The whole body arrived and decoded.
    Completed { image: DecodedImage, data: Bytes },
    /// The response came from the HTTP layer's cache while the caller asked
    /// to ignore cached responses.
    Unchanged,
    /// The download failed. `data` holds the body when decoding failed.
    Failed {
        error: ImageError,
        data: Option<Bytes>,
    },
}

impl DownloadUpdate {
    /// Returns false only for progressive previews.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        !matches!(self, Self::Partial(_))
    }
}

/// Identifies one registered handler pair. Unique across operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

impl HandlerToken {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Waiting in the downloader queue.
    Pending,
    /// Transfer in progress.
    Running,
    /// Completed, successfully or not.
    Finished,
    /// Cancelled before completing.
    Cancelled,
}

impl OperationStatus {
    /// Finished or cancelled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Collaborators an operation borrows from its downloader.
#[derive(Clone)]
pub struct OperationContext {
    /// Codecs used for previews and the final decode.
    pub codecs: Arc<CodecRegistry>,
    /// Host hook for background run time.
    pub background: Arc<dyn BackgroundTaskPort>,
    /// Decompress the final image.
    pub should_decompress: bool,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("should_decompress", &self.should_decompress)
            .finish_non_exhaustive()
    }
}

/// A download the downloader can schedule.
///
/// Implementations must never invoke callbacks while holding a lock, and
/// must deliver each terminal update at most once.
#[async_trait]
pub trait DownloadOperation: Send + Sync {
    /// Target URL.
    fn url(&self) -> &Url;

    /// Options the operation was created with.
    fn options(&self) -> DownloaderOptions;

    /// Current lifecycle state.
    fn status(&self) -> OperationStatus;

    /// Registers a handler pair. Returns `None` once the operation is terminal.
    fn add_handlers(
        &self,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Option<HandlerToken>;

    /// Removes one handler pair. Cancels the transfer when no handler is
    /// left and returns true in that case.
    fn cancel_handler(&self, token: HandlerToken) -> bool;

    /// Cancels the transfer. Remaining handlers get `ImageError::Cancelled`.
    fn cancel(&self);

    /// Performs the transfer on `session`. Returns when the operation is terminal.
    async fn run(self: Arc<Self>, session: Arc<dyn HttpSession>);
}

/// Builds operations for the downloader.
pub type OperationFactory = Arc<
    dyn Fn(HttpRequest, DownloaderOptions, OperationContext) -> Arc<dyn DownloadOperation>
        + Send
        + Sync,
>;

/// Factory producing [`ImageDownloadOperation`]s.
#[must_use]
pub fn default_operation_factory() -> OperationFactory {
    Arc::new(|request, options, context| {
        Arc::new(ImageDownloadOperation::new(request, options, context)) as Arc<dyn DownloadOperation>
    })
}

struct Handler {
    token: HandlerToken,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

struct OperationState {
    status: OperationStatus,
    handlers: Vec<Handler>,
    background_task: Option<BackgroundTaskId>,
}

/// Default [`DownloadOperation`]: streams the body, optionally decoding
/// previews, then decodes the whole payload off the async workers.
pub struct ImageDownloadOperation {
    request: HttpRequest,
    options: DownloaderOptions,
    context: OperationContext,
    state: Mutex<OperationState>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ImageDownloadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDownloadOperation")
            .field("url", &self.request.url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ImageDownloadOperation {
    /// Creates a pending operation.
    #[must_use]
    pub fn new(request: HttpRequest, options: DownloaderOptions, context: OperationContext) -> Self {
        Self {
            request,
            options,
            context,
            state: Mutex::new(OperationState {
                status: OperationStatus::Pending,
                handlers: Vec::new(),
                background_task: None,
            }),
            cancel_token: CancellationToken::new(),
        }
    }

    /// The request this operation sends.
    #[must_use]
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    fn progress_handlers(&self) -> Vec<ProgressCallback> {
        let state = self.state.lock();
        if state.status.is_terminal() {
            return Vec::new();
        }
        state
            .handlers
            .iter()
            .filter_map(|h| h.progress.clone())
            .collect()
    }

    fn completion_handlers(&self) -> Vec<CompletionCallback> {
        let state = self.state.lock();
        if state.status.is_terminal() {
            return Vec::new();
        }
        state
            .handlers
            .iter()
            .filter_map(|h| h.completion.clone())
            .collect()
    }

    fn report_progress(&self, received: u64, expected: Option<u64>) {
        for progress in self.progress_handlers() {
            progress(received, expected, &self.request.url);
        }
    }

    /// Moves to `status` and hands `update` to every retained completion
    /// handler. Does nothing if the operation is already terminal.
    fn finish(&self, status: OperationStatus, update: Option<DownloadUpdate>) {
        let (handlers, background_task) = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            (
                std::mem::take(&mut state.handlers),
                state.background_task.take(),
            )
        };
        if let Some(id) = background_task {
            self.context.background.end_task(id);
        }
        if let Some(update) = update {
            for completion in handlers.into_iter().filter_map(|h| h.completion) {
                completion(update.clone());
            }
        }
    }

    fn begin_background_task(self: &Arc<Self>) {
        if !self.options.continue_in_background {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.context.background.begin_task(
            "webimage-download",
            Box::new(move || {
                if let Some(operation) = weak.upgrade() {
                    debug!(url = %operation.request.url, "Background time expired, cancelling download");
                    operation.cancel();
                }
            }),
        );
        self.state.lock().background_task = id;
    }

    async fn transfer(&self, session: &dyn HttpSession) -> Result<DownloadUpdate, DownloadUpdate> {
        let failed = |error: ImageError, data: Option<Bytes>| DownloadUpdate::Failed { error, data };

        let response = session
            .send(self.request.clone())
            .await
            .map_err(|e| failed(e, None))?;
        post(DownloadNotificationKind::ReceiveResponse, &self.request.url);

        if response.status == 304 && self.options.use_url_cache {
            debug!(url = %self.request.url, "Not modified");
            return Ok(DownloadUpdate::Unchanged);
        }
        if !(200..300).contains(&response.status) {
            return Err(failed(
                ImageError::HttpStatus {
                    code: response.status,
                },
                None,
            ));
        }

        let expected = response.expected_len;
        let served_from_cache = response.served_from_cache;
        let scale = CacheKey::new(self.request.url.as_str()).scale();
        let progressive = self.options.progressive_download;
        self.report_progress(0, expected);

        let mut buffer = BytesMut::with_capacity(
            expected.map_or(0, |len| usize::try_from(len).unwrap_or(0)),
        );
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| failed(e, None))?;
            buffer.extend_from_slice(&chunk);
            self.report_progress(buffer.len() as u64, expected);

            if progressive {
                let snapshot = Bytes::copy_from_slice(&buffer);
                let codecs = Arc::clone(&self.context.codecs);
                let preview =
                    tokio::task::spawn_blocking(move || codecs.incremental_decode(&snapshot, false))
                        .await
                        .ok()
                        .flatten();
                if let Some(image) = preview {
                    trace!(url = %self.request.url, received = buffer.len(), "Delivering partial image");
                    let update = DownloadUpdate::Partial(image.with_scale(scale));
                    for completion in self.completion_handlers() {
                        completion(update.clone());
                    }
                }
            }
        }
        post(DownloadNotificationKind::Finish, &self.request.url);

        if served_from_cache && self.options.ignore_cached_response {
            return Ok(DownloadUpdate::Unchanged);
        }

        let data = buffer.freeze();
        if data.is_empty() {
            return Err(failed(ImageError::decode("downloaded image has 0 bytes"), None));
        }

        let decompress = (self.context.should_decompress && !progressive).then_some(
            DecompressOptions {
                scale_down_large_images: self.options.scale_down_large_images,
            },
        );
        let codecs = Arc::clone(&self.context.codecs);
        let key = CacheKey::new(self.request.url.as_str());
        let decode_data = data.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            codecs.decode_for_key(&decode_data, &key, decompress)
        })
        .await
        .map_err(|e| ImageError::decode(format!("decode task panicked: {e}")))
        .and_then(|result| result);

        match decoded {
            Ok(image) => Ok(DownloadUpdate::Completed { image, data }),
            Err(error) => Err(failed(error, Some(data))),
        }
    }
}

#[async_trait]
impl DownloadOperation for ImageDownloadOperation {
    fn url(&self) -> &Url {
        &self.request.url
    }

    fn options(&self) -> DownloaderOptions {
        self.options
    }

    fn status(&self) -> OperationStatus {
        self.state.lock().status
    }

    fn add_handlers(
        &self,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Option<HandlerToken> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        let token = HandlerToken::next();
        state.handlers.push(Handler {
            token,
            progress,
            completion,
        });
        Some(token)
    }

    fn cancel_handler(&self, token: HandlerToken) -> bool {
        let background_task = {
            let mut state = self.state.lock();
            state.handlers.retain(|h| h.token != token);
            if !state.handlers.is_empty() || state.status.is_terminal() {
                return false;
            }
            state.status = OperationStatus::Cancelled;
            state.background_task.take()
        };
        debug!(url = %self.request.url, "Last handler removed, cancelling download");
        self.cancel_token.cancel();
        if let Some(id) = background_task {
            self.context.background.end_task(id);
        }
        true
    }

    fn cancel(&self) {
        self.cancel_token.cancel();
        self.finish(
            OperationStatus::Cancelled,
            Some(DownloadUpdate::Failed {
                error: ImageError::Cancelled,
                data: None,
            }),
        );
    }

    async fn run(self: Arc<Self>, session: Arc<dyn HttpSession>) {
        {
            let mut state = self.state.lock();
            if state.status != OperationStatus::Pending {
                return;
            }
            state.status = OperationStatus::Running;
        }
        self.begin_background_task();
        post(DownloadNotificationKind::Start, &self.request.url);
        debug!(url = %self.request.url, "Download started");

        let outcome = tokio::select! {
            () = self.cancel_token.cancelled() => None,
            result = self.transfer(session.as_ref()) => Some(result),
        };
        post(DownloadNotificationKind::Stop, &self.request.url);

        match outcome {
            None => trace!(url = %self.request.url, "Download cancelled"),
            Some(Ok(update)) => {
                debug!(url = %self.request.url, "Download finished");
                self.finish(OperationStatus::Finished, Some(update));
            }
            Some(Err(update)) => {
                if let DownloadUpdate::Failed { error, .. } = &update {
                    warn!(url = %self.request.url, error = %error, "Download failed");
                }
                self.finish(OperationStatus::Finished, Some(update));
            }
        }
    }
}
