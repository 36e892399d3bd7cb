//! Port definition for the HTTP transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use url::Url;

use crate::domain::errors::ImageError;

/// Header name to value map, sorted for stable logging.
pub type HttpHeaders = BTreeMap<String, String>;

/// Basic-auth credential presented to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Local response-cache policy requested by the downloader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always go to the origin.
    #[default]
    ReloadIgnoringLocalCache,
    /// Let the transport honour its own HTTP cache.
    UseProtocolCachePolicy,
}

/// A fully built image GET request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: HttpHeaders,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Send and store cookies.
    pub handle_cookies: bool,
    /// Local cache policy.
    pub cache_policy: CachePolicy,
    /// Accept untrusted TLS certificates.
    pub allow_invalid_certificates: bool,
    /// Credential for authentication challenges.
    pub credential: Option<Credential>,
}

/// Response head plus a stream of body chunks.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Content-Length, when the server sent one.
    pub expected_len: Option<u64>,
    /// True if the transport answered from its own cache.
    pub served_from_cache: bool,
    /// Body chunks in arrival order.
    pub body: BoxStream<'static, Result<Bytes, ImageError>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("expected_len", &self.expected_len)
            .field("served_from_cache", &self.served_from_cache)
            .finish_non_exhaustive()
    }
}

/// One HTTP session (connection pool) owned by a downloader.
#[async_trait]
pub trait HttpSession: Send + Sync {
    /// Sends a request and returns once the response head is available.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ImageError>;
}
