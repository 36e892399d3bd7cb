//! Process-wide bus for download lifecycle events.
//!
//! Events are observational. Nothing in the engine waits on them, and a
//! bus without subscribers drops them.

use std::sync::OnceLock;

use tokio::sync::broadcast;
use url::Url;

const BUS_CAPACITY: usize = 256;

/// Lifecycle stage of a download operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadNotificationKind {
    /// The HTTP request was sent.
    Start,
    /// The response head arrived.
    ReceiveResponse,
    /// The request stopped, successfully or not.
    Stop,
    /// The body finished downloading.
    Finish,
}

impl DownloadNotificationKind {
    /// String tag of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "ImageDownload/start",
            Self::ReceiveResponse => "ImageDownload/receive-response",
            Self::Stop => "ImageDownload/stop",
            Self::Finish => "ImageDownload/finish",
        }
    }
}

impl std::fmt::Display for DownloadNotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadNotification {
    /// Stage reached.
    pub kind: DownloadNotificationKind,
    /// URL of the operation.
    pub url: Url,
}

fn bus() -> &'static broadcast::Sender<DownloadNotification> {
    static BUS: OnceLock<broadcast::Sender<DownloadNotification>> = OnceLock::new();
    BUS.get_or_init(|| broadcast::channel(BUS_CAPACITY).0)
}

/// Subscribes to every download event posted from now on.
#[must_use]
pub fn subscribe() -> broadcast::Receiver<DownloadNotification> {
    bus().subscribe()
}

pub(crate) fn post(kind: DownloadNotificationKind, url: &Url) {
    let _ = bus().send(DownloadNotification {
        kind,
        url: url.clone(),
    });
}
