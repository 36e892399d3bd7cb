//! `reqwest`-backed HTTP session.

use std::collections::HashMap;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, trace, warn};

use crate::domain::errors::{ImageError, TransportKind};
use crate::domain::ports::{CachePolicy, HttpRequest, HttpResponse, HttpSession};

/// Settings shared by every client of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Default request timeout; requests may override it.
    pub timeout: Duration,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            pool_max_idle_per_host: 6,
        }
    }
}

/// Builds the session a downloader uses; swapped out in tests.
pub type SessionFactory = Arc<dyn Fn(&SessionConfig) -> Arc<dyn HttpSession> + Send + Sync>;

/// Factory producing [`ReqwestSession`]s.
#[must_use]
pub fn reqwest_session_factory() -> SessionFactory {
    Arc::new(|config: &SessionConfig| {
        Arc::new(ReqwestSession::new(config.clone())) as Arc<dyn HttpSession>
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientFlavor {
    allow_invalid_certificates: bool,
    handle_cookies: bool,
}

/// Connection pool over `reqwest`.
///
/// TLS trust and cookie handling are client-wide in `reqwest`, so one
/// client is built lazily per combination of those request flags.
pub struct ReqwestSession {
    config: SessionConfig,
    clients: Mutex<HashMap<ClientFlavor, reqwest::Client>>,
}

impl std::fmt::Debug for ReqwestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReqwestSession {
    /// Creates a session; clients are built on first use.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, flavor: ClientFlavor) -> Result<reqwest::Client, ImageError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&flavor) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .danger_accept_invalid_certs(flavor.allow_invalid_certificates)
            .cookie_store(flavor.handle_cookies)
            .build()
            .map_err(|e| {
                ImageError::transport(
                    TransportKind::Other,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;
        debug!(?flavor, "Built HTTP client");
        clients.insert(flavor, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpSession for ReqwestSession {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ImageError> {
        let client = self.client(ClientFlavor {
            allow_invalid_certificates: request.allow_invalid_certificates,
            handle_cookies: request.handle_cookies,
        })?;

        let mut builder = client.get(request.url.clone()).timeout(request.timeout);
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!(header = %name, "Skipping invalid request header"),
            }
        }
        if let Some(credential) = &request.credential {
            builder = builder.basic_auth(&credential.user, Some(&credential.password));
        }
        if request.cache_policy == CachePolicy::UseProtocolCachePolicy {
            trace!(url = %request.url, "Transport has no local HTTP cache, fetching from origin");
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status().as_u16();
        let expected_len = response.content_length();
        trace!(url = %request.url, status, ?expected_len, "Received response head");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| classify_error(&e)))
            .boxed();

        Ok(HttpResponse {
            status,
            expected_len,
            served_from_cache: false,
            body,
        })
    }
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text.to_lowercase()
}

/// Maps a `reqwest` failure onto the engine's error taxonomy.
fn classify_error(error: &reqwest::Error) -> ImageError {
    let chain = error_chain(error);
    if error.is_timeout() {
        ImageError::transport(TransportKind::Timeout, chain)
    } else if error.is_builder() {
        ImageError::transport(TransportKind::BadUrl, chain)
    } else if chain.contains("certificate") || chain.contains("tls") {
        ImageError::tls_untrusted(chain)
    } else if error.is_connect() {
        if chain.contains("dns") || chain.contains("lookup") || chain.contains("resolve") {
            ImageError::transport(TransportKind::DnsFailure, chain)
        } else {
            ImageError::transport(TransportKind::CannotConnect, chain)
        }
    } else if error.is_body() || error.is_decode() || error.is_request() {
        ImageError::transport(TransportKind::ConnectionLost, chain)
    } else {
        ImageError::transport(TransportKind::Other, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::HttpHeaders;
    use url::Url;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            url: Url::parse(url).unwrap(),
            headers: HttpHeaders::new(),
            timeout: Duration::from_secs(2),
            handle_cookies: false,
            cache_policy: CachePolicy::default(),
            allow_invalid_certificates: false,
            credential: None,
        }
    }

    #[test]
    fn test_clients_are_reused_per_flavor() {
        let session = ReqwestSession::new(SessionConfig::default());
        let plain = ClientFlavor {
            allow_invalid_certificates: false,
            handle_cookies: false,
        };
        let cookies = ClientFlavor {
            handle_cookies: true,
            ..plain
        };

        session.client(plain).unwrap();
        session.client(plain).unwrap();
        session.client(cookies).unwrap();

        assert_eq!(session.clients.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let session = ReqwestSession::new(SessionConfig::default());
        // Port 9 (discard) on localhost is closed in test environments.
        let result = session.send(request("http://127.0.0.1:9/a.png")).await;

        match result {
            Err(ImageError::Transport { kind, .. }) => {
                assert!(!matches!(kind, TransportKind::BadUrl));
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
