//! Media descriptors produced by extractors and consumed by the strategy
//! chain. The engine never inspects codecs beyond what is needed to rank
//! renditions; everything else is carried opaquely into the sidecar.

use serde::{Deserialize, Serialize};

use crate::options::QualityPreference;

/// Video resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which elementary streams a format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatKind {
    /// Muxed audio+video in a single stream.
    Progressive,
    VideoOnly,
    AudioOnly,
}

/// Where the bytes of a format come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatSource {
    /// A single resolvable URL, optionally with a known size.
    Url { url: String, size: Option<u64> },
    /// An ordered segment manifest; sizes are per-segment when known.
    Segments { segments: Vec<Segment> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub url: String,
    pub size: Option<u64>,
}

impl FormatSource {
    /// Total size when every constituent size is known, else `None`.
    pub fn known_size(&self) -> Option<u64> {
        match self {
            Self::Url { size, .. } => *size,
            Self::Segments { segments } => {
                segments.iter().map(|s| s.size).sum::<Option<u64>>()
            }
        }
    }
}

/// A single downloadable rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    /// Opaque upstream identifier.
    pub itag: String,
    pub container: String,
    pub codec: String,
    pub kind: FormatKind,
    /// Combined bitrate in kbit/s when reported.
    pub bitrate: Option<u32>,
    pub resolution: Option<Resolution>,
    /// Audio bitrate in kbit/s for audio-carrying formats.
    pub audio_bitrate: Option<u32>,
    pub approx_size: Option<u64>,
    pub source: FormatSource,
}

impl Format {
    /// Short human label used for task names and the selector UI.
    pub fn label(&self) -> String {
        match (self.kind, self.resolution, self.audio_bitrate) {
            (FormatKind::AudioOnly, _, Some(abr)) => {
                format!("{} audio {}kbps ({})", self.container, abr, self.itag)
            }
            (FormatKind::AudioOnly, _, None) => format!("{} audio ({})", self.container, self.itag),
            (_, Some(res), _) => format!("{} {}p ({})", self.container, res.height, self.itag),
            _ => format!("{} ({})", self.container, self.itag),
        }
    }

    fn height(&self) -> u32 {
        self.resolution.map(|r| r.height).unwrap_or(0)
    }

    /// Ranking key for video formats: resolution first, bitrate second.
    fn video_rank(&self) -> (u32, u32) {
        (self.height(), self.bitrate.unwrap_or(0))
    }

    fn audio_rank(&self) -> u32 {
        self.audio_bitrate.or(self.bitrate).unwrap_or(0)
    }

    fn fits(&self, quality: QualityPreference) -> bool {
        match quality {
            QualityPreference::Best | QualityPreference::Worst => true,
            QualityPreference::Height(max) => self.height() <= max,
        }
    }
}

/// Extractor output for a single piece of media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaDescriptor {
    /// Upstream identifier; used to derive the item id.
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration_secs: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    pub release_date: Option<String>,
    /// Original page/watch URL.
    pub source_url: String,
    pub formats: Vec<Format>,
}

impl MediaDescriptor {
    pub fn by_itag(&self, itag: &str) -> Option<&Format> {
        self.formats.iter().find(|f| f.itag == itag)
    }

    /// Best muxed rendition within the quality cap; `Worst` inverts the
    /// ranking.
    pub fn best_progressive(&self, quality: QualityPreference) -> Option<&Format> {
        let candidates = self
            .formats
            .iter()
            .filter(|f| f.kind == FormatKind::Progressive && f.fits(quality));
        match quality {
            QualityPreference::Worst => candidates.min_by_key(|f| f.video_rank()),
            _ => candidates.max_by_key(|f| f.video_rank()),
        }
    }

    pub fn best_video_only(&self, quality: QualityPreference) -> Option<&Format> {
        let candidates = self
            .formats
            .iter()
            .filter(|f| f.kind == FormatKind::VideoOnly && f.fits(quality));
        match quality {
            QualityPreference::Worst => candidates.min_by_key(|f| f.video_rank()),
            _ => candidates.max_by_key(|f| f.video_rank()),
        }
    }

    pub fn best_audio_only(&self) -> Option<&Format> {
        self.formats
            .iter()
            .filter(|f| f.kind == FormatKind::AudioOnly)
            .max_by_key(|f| f.audio_rank())
    }
}

/// A playlist entry before per-item extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub url: String,
    pub id: Option<String>,
    pub title: Option<String>,
    /// Private/deleted/region-locked entries surface here instead of
    /// failing extraction; they end as skipped items.
    pub unavailable: Option<String>,
}

/// An expanded playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(itag: &str, kind: FormatKind, height: u32, abr: u32) -> Format {
        Format {
            itag: itag.to_string(),
            container: "mp4".to_string(),
            codec: "avc1".to_string(),
            kind,
            bitrate: Some(height * 4),
            resolution: (height > 0).then(|| Resolution::new(height * 16 / 9, height)),
            audio_bitrate: (abr > 0).then_some(abr),
            approx_size: None,
            source: FormatSource::Url {
                url: format!("https://cdn.example/{itag}"),
                size: None,
            },
        }
    }

    fn descriptor() -> MediaDescriptor {
        MediaDescriptor {
            id: "vid123".to_string(),
            title: "Title".to_string(),
            formats: vec![
                fmt("18", FormatKind::Progressive, 360, 96),
                fmt("22", FormatKind::Progressive, 720, 128),
                fmt("137", FormatKind::VideoOnly, 1080, 0),
                fmt("140", FormatKind::AudioOnly, 0, 128),
                fmt("251", FormatKind::AudioOnly, 0, 160),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn best_progressive_respects_quality_cap() {
        let d = descriptor();
        assert_eq!(d.best_progressive(QualityPreference::Best).unwrap().itag, "22");
        assert_eq!(
            d.best_progressive(QualityPreference::Height(480)).unwrap().itag,
            "18"
        );
        assert_eq!(d.best_progressive(QualityPreference::Worst).unwrap().itag, "18");
    }

    #[test]
    fn best_audio_prefers_highest_bitrate() {
        let d = descriptor();
        assert_eq!(d.best_audio_only().unwrap().itag, "251");
    }

    #[test]
    fn video_only_selection_ignores_audio_formats() {
        let d = descriptor();
        assert_eq!(d.best_video_only(QualityPreference::Best).unwrap().itag, "137");
        assert!(d.best_video_only(QualityPreference::Height(720)).is_none());
    }

    #[test]
    fn segmented_size_is_sum_only_when_all_known() {
        let known = FormatSource::Segments {
            segments: vec![
                Segment { url: "a".into(), size: Some(10) },
                Segment { url: "b".into(), size: Some(20) },
            ],
        };
        assert_eq!(known.known_size(), Some(30));

        let partial = FormatSource::Segments {
            segments: vec![
                Segment { url: "a".into(), size: Some(10) },
                Segment { url: "b".into(), size: None },
            ],
        };
        assert_eq!(partial.known_size(), None);
    }
}
