//! Extractor seam.
//!
//! The engine treats metadata/stream resolution as an opaque capability
//! behind [`MediaExtractor`]; platform-specific reverse engineering lives
//! outside the core. A registry picks the first extractor claiming a URL
//! and falls back to [`DirectExtractor`] for plain media URLs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::media::{Format, FormatKind, FormatSource, MediaDescriptor, Playlist};
use crate::transport::HttpTransport;

/// Result of resolving one URL.
#[derive(Debug, Clone)]
pub enum Extracted {
    Single(MediaDescriptor),
    Playlist(Playlist),
}

/// Resolves a URL into media descriptors. Implementations must be cheap to
/// share; the runner calls them from several workers concurrently.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this extractor claims the URL.
    fn handles(&self, url: &Url) -> bool;

    async fn extract(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<Extracted, DownloadError>;
}

/// Ordered extractor registry; first match wins.
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn MediaExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    pub fn register(mut self, extractor: Arc<dyn MediaExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// The extractor claiming `url`, if any.
    pub fn find(&self, url: &Url) -> Option<&Arc<dyn MediaExtractor>> {
        self.extractors.iter().find(|e| e.handles(url))
    }

    pub async fn extract(
        &self,
        raw_url: &str,
        token: &CancellationToken,
    ) -> Result<Extracted, DownloadError> {
        let url = Url::parse(raw_url)
            .map_err(|e| DownloadError::invalid_url(raw_url, e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DownloadError::invalid_url(
                    raw_url,
                    format!("unsupported scheme `{other}`"),
                ));
            }
        }

        let extractor = self.find(&url).ok_or_else(|| {
            DownloadError::unsupported(format!("no extractor for `{raw_url}`"))
        })?;
        debug!(url = %url, extractor = extractor.name(), "resolving media");
        extractor.extract(&url, token).await
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback extractor for direct media URLs: a HEAD probe yields size and
/// container, producing a single-format progressive descriptor.
pub struct DirectExtractor {
    transport: HttpTransport,
}

impl DirectExtractor {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn container_from(url: &Url, content_type: Option<&str>) -> String {
        if let Some(ext) = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        {
            return ext;
        }
        match content_type {
            Some(ct) if ct.contains("mp4") => "mp4".to_string(),
            Some(ct) if ct.contains("webm") => "webm".to_string(),
            Some(ct) if ct.contains("mpegurl") => "m3u8".to_string(),
            Some(ct) if ct.contains("audio") => "m4a".to_string(),
            _ => "bin".to_string(),
        }
    }

    fn title_from(url: &Url) -> String {
        url.path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|name| !name.is_empty())
            .map(|name| {
                name.rsplit_once('.')
                    .map(|(stem, _)| stem)
                    .unwrap_or(name)
                    .to_string()
            })
            .unwrap_or_else(|| url.host_str().unwrap_or("download").to_string())
    }
}

#[async_trait]
impl MediaExtractor for DirectExtractor {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn handles(&self, _url: &Url) -> bool {
        true
    }

    async fn extract(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<Extracted, DownloadError> {
        // The probe is best-effort; a HEAD-hostile server still yields a
        // usable descriptor with unknown size.
        let (size, content_type) = match self.transport.head(url, token).await {
            Ok(headers) => {
                let size = headers
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let ct = headers
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                (size, ct)
            }
            Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(err) => {
                debug!(url = %url, error = %err, "HEAD probe failed, continuing without size");
                (None, None)
            }
        };

        let container = Self::container_from(url, content_type.as_deref());
        let title = Self::title_from(url);

        let descriptor = MediaDescriptor {
            id: title.clone(),
            title,
            source_url: url.to_string(),
            formats: vec![Format {
                itag: "direct".to_string(),
                container,
                codec: content_type.unwrap_or_else(|| "unknown".to_string()),
                kind: FormatKind::Progressive,
                bitrate: None,
                resolution: None,
                audio_bitrate: None,
                approx_size: size,
                source: FormatSource::Url {
                    url: url.to_string(),
                    size,
                },
            }],
            ..Default::default()
        };
        Ok(Extracted::Single(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClaimAll;

    #[async_trait]
    impl MediaExtractor for ClaimAll {
        fn name(&self) -> &'static str {
            "claim-all"
        }

        fn handles(&self, _url: &Url) -> bool {
            true
        }

        async fn extract(
            &self,
            url: &Url,
            _token: &CancellationToken,
        ) -> Result<Extracted, DownloadError> {
            Ok(Extracted::Single(MediaDescriptor {
                id: "x".to_string(),
                source_url: url.to_string(),
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn registry_rejects_bad_urls_before_dispatch() {
        let registry = ExtractorRegistry::new().register(Arc::new(ClaimAll));
        let token = CancellationToken::new();

        let err = registry.extract("not a url", &token).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));

        let err = registry
            .extract("ftp://example.com/x.mp4", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn registry_dispatches_to_first_claiming_extractor() {
        let registry = ExtractorRegistry::new().register(Arc::new(ClaimAll));
        let token = CancellationToken::new();
        let extracted = registry
            .extract("https://example.com/watch?v=abc", &token)
            .await
            .unwrap();
        assert!(matches!(extracted, Extracted::Single(_)));
    }

    #[test]
    fn direct_extractor_derives_container_and_title() {
        let url = Url::parse("https://cdn.example/media/Some%20Clip.mp4").unwrap();
        assert_eq!(DirectExtractor::container_from(&url, None), "mp4");
        assert_eq!(DirectExtractor::title_from(&url), "Some%20Clip");

        let url = Url::parse("https://cdn.example/stream").unwrap();
        assert_eq!(
            DirectExtractor::container_from(&url, Some("video/webm")),
            "webm"
        );
        assert_eq!(DirectExtractor::title_from(&url), "stream");
    }
}
