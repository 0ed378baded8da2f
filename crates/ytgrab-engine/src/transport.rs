//! Shared HTTP transport.
//!
//! One `reqwest` client per process, configured once and injected into every
//! component that talks to the network. The transport classifies failures
//! but never retries; retry policy belongs to the downloader and the
//! strategy chain.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

const MAX_REDIRECTS: usize = 10;

/// Transport construction knobs; request deadlines come from `JobOptions`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Overall per-request deadline. Zero disables the client-level cap.
    pub request_timeout: Duration,
    pub user_agent: String,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(180),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Install the process-wide rustls crypto provider exactly once.
fn install_rustls_provider() {
    static PROVIDER_INSTALLED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Process-wide HTTP client with byte-range support.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, DownloadError> {
        install_rustls_provider();

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent.clone())
            .default_headers(headers);

        if !config.request_timeout.is_zero() {
            builder = builder.timeout(config.request_timeout);
        }

        let client = builder
            .build()
            .map_err(|e| DownloadError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// GET, optionally resuming from a byte offset.
    ///
    /// `range_start > 0` sends `Range: bytes=<start>-`; the caller decides
    /// how to react to `416 Range Not Satisfiable`.
    pub async fn get(
        &self,
        url: &Url,
        range_start: u64,
        token: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.get(url.clone());
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={range_start}-"));
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let ok = if range_start > 0 {
            // A server may ignore the range header and answer 200; the
            // downloader detects that and restarts from zero.
            status == StatusCode::PARTIAL_CONTENT || status == StatusCode::OK
        } else {
            status.is_success()
        };

        if !ok {
            debug!(url = %url, status = %status, "request rejected");
            return Err(DownloadError::http_status(status, url.as_str(), "GET"));
        }
        Ok(response)
    }

    /// HEAD probe for size and content type.
    pub async fn head(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<HeaderMap, DownloadError> {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.head(url.clone()).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url.as_str(), "HEAD"));
        }
        Ok(response.headers().clone())
    }
}

/// Classify a reqwest error as transient (retryable) or not.
///
/// Connect, timeout, request, body, and decode failures are transient;
/// redirect-policy and builder errors are not.
pub fn is_transient_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_builds_with_defaults() {
        let transport = HttpTransport::new(&TransportConfig::default());
        assert!(transport.is_ok());
    }

    #[test]
    fn zero_timeout_disables_request_deadline() {
        let config = TransportConfig {
            request_timeout: Duration::ZERO,
            ..TransportConfig::default()
        };
        assert!(HttpTransport::new(&config).is_ok());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_get() {
        let transport = HttpTransport::new(&TransportConfig::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let url = Url::parse("http://127.0.0.1:1/unreachable").unwrap();
        let err = transport.get(&url, 0, &token).await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
