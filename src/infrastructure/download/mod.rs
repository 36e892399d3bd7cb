//! HTTP downloading: session, per-URL operations and the scheduling downloader.

pub mod downloader;
pub mod notifications;
pub mod operation;
pub mod session;

pub use downloader::{DownloadToken, HeadersFilter, ImageDownloader};
pub use notifications::{DownloadNotification, DownloadNotificationKind, subscribe};
pub use operation::{
    CompletionCallback, DownloadOperation, DownloadUpdate, HandlerToken, ImageDownloadOperation,
    OperationContext, OperationFactory, OperationStatus, ProgressCallback,
    default_operation_factory,
};
pub use session::{ReqwestSession, SessionConfig, SessionFactory, reqwest_session_factory};
