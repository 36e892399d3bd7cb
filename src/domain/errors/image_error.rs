//! Image loading error types.

use thiserror::Error;

/// Category of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The request timed out.
    Timeout,
    /// Host name could not be resolved.
    DnsFailure,
    /// Connection to the host could not be established.
    CannotConnect,
    /// Connection dropped mid-transfer.
    ConnectionLost,
    /// No network is available.
    NotConnected,
    /// The URL cannot be requested (bad syntax, unsupported scheme).
    BadUrl,
    /// The downloader's session was invalidated.
    SessionInvalidated,
    /// Anything else.
    Other,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::DnsFailure => write!(f, "cannot find host"),
            Self::CannotConnect => write!(f, "cannot connect to host"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::NotConnected => write!(f, "not connected"),
            Self::BadUrl => write!(f, "bad url"),
            Self::SessionInvalidated => write!(f, "session invalidated"),
            Self::Other => write!(f, "transport failure"),
        }
    }
}

/// Errors surfaced by the cache, downloader and manager.
///
/// `Clone` so a single failure can be delivered to every callback that
/// shares one download.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum ImageError {
    #[error("invalid image url: {url:?}")]
    InvalidUrl { url: String },

    #[error("url is blacklisted after an earlier failure: {url}")]
    Blacklisted { url: String },

    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("unexpected HTTP status {code}")]
    HttpStatus { code: u16 },

    #[error("untrusted TLS certificate: {message}")]
    TlsUntrusted { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("disk cache I/O error: {message}")]
    DiskIo { message: String },
}

impl ImageError {
    /// Creates invalid URL error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates blacklisted error.
    #[must_use]
    pub fn blacklisted(url: impl Into<String>) -> Self {
        Self::Blacklisted { url: url.into() }
    }

    /// Creates transport error.
    #[must_use]
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates disk I/O error.
    #[must_use]
    pub fn disk_io(message: impl Into<String>) -> Self {
        Self::DiskIo {
            message: message.into(),
        }
    }

    /// Creates TLS error.
    #[must_use]
    pub fn tls_untrusted(message: impl Into<String>) -> Self {
        Self::TlsUntrusted {
            message: message.into(),
        }
    }

    /// Returns whether the failure is transient and worth retrying later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => !matches!(kind, TransportKind::BadUrl),
            Self::Cancelled | Self::Decode { .. } | Self::DiskIo { .. } => true,
            Self::HttpStatus { code } => *code >= 500,
            Self::InvalidUrl { .. } | Self::Blacklisted { .. } | Self::TlsUntrusted { .. } => {
                false
            }
        }
    }

    /// Returns whether the URL should be blacklisted after this failure.
    #[must_use]
    pub const fn should_blacklist(&self) -> bool {
        match self {
            Self::HttpStatus { code } => *code >= 400 && *code < 500,
            Self::Transport { kind, .. } => matches!(kind, TransportKind::BadUrl),
            _ => false,
        }
    }

    /// Returns whether this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
