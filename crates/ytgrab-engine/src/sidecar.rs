//! Metadata sidecar and tag assembly.
//!
//! The sidecar is a stable JSON document written next to the finished media
//! file (`<final>.info.json`) after finalize; failures here are logged but
//! never fail the item. The same merged view of metadata feeds the tag
//! embedder: operator `-meta` overrides beat extractor metadata, which
//! beats defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::helper::TagSet;
use crate::media::{Format, MediaDescriptor};

pub const SIDECAR_SUFFIX: &str = ".info.json";

/// The format the strategy chain actually acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChosenFormat {
    pub itag: String,
    pub container: String,
    pub quality: String,
}

impl ChosenFormat {
    pub fn from_format(format: &Format) -> Self {
        let quality = match (format.resolution, format.audio_bitrate) {
            (Some(res), _) => format!("{}p", res.height),
            (None, Some(abr)) => format!("{abr}kbps"),
            (None, None) => "unknown".to_string(),
        };
        Self {
            itag: format.itag.clone(),
            container: format.container.clone(),
            quality,
        }
    }
}

/// Stable sidecar schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Sidecar {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    pub duration_secs: Option<u64>,
    pub release_date: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub format: Option<ChosenFormat>,
    /// Operator overrides that were applied, in input order.
    pub overrides: Vec<(String, String)>,
}

impl Sidecar {
    /// Merge extractor metadata with operator overrides.
    pub fn build(
        descriptor: &MediaDescriptor,
        chosen: &Format,
        overrides: &[(String, String)],
    ) -> Self {
        let mut sidecar = Self {
            id: descriptor.id.clone(),
            title: descriptor.title.clone(),
            author: descriptor.author.clone(),
            artist: descriptor.artist.clone(),
            album: descriptor.album.clone(),
            track: descriptor.track,
            duration_secs: descriptor.duration_secs,
            release_date: descriptor.release_date.clone(),
            thumbnail_url: descriptor.thumbnail_url.clone(),
            source_url: descriptor.source_url.clone(),
            format: Some(ChosenFormat::from_format(chosen)),
            overrides: overrides.to_vec(),
        };

        for (key, value) in overrides {
            match key.as_str() {
                "title" => sidecar.title = value.clone(),
                "artist" => sidecar.artist = Some(value.clone()),
                "author" => sidecar.author = Some(value.clone()),
                "album" => sidecar.album = Some(value.clone()),
                "track" => sidecar.track = value.parse().ok(),
                "date" | "release_date" => sidecar.release_date = Some(value.clone()),
                _ => {}
            }
        }
        sidecar
    }

    /// Tags for the embedder; artist falls back to the author.
    pub fn tags(&self) -> TagSet {
        TagSet {
            title: Some(self.title.clone()),
            artist: self.artist.clone().or_else(|| self.author.clone()),
            album: self.album.clone(),
            track: self.track,
            date: self.release_date.clone(),
            comment: Some(self.source_url.clone()),
        }
    }
}

/// Sidecar path next to a final media path.
pub fn sidecar_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(SIDECAR_SUFFIX);
    final_path.with_file_name(name)
}

/// Write the sidecar next to the media file.
pub async fn write(final_path: &Path, sidecar: &Sidecar) -> Result<PathBuf, DownloadError> {
    let path = sidecar_path(final_path);
    let json = serde_json::to_vec_pretty(sidecar)
        .map_err(|e| DownloadError::internal(format!("sidecar serialization failed: {e}")))?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

/// Read a sidecar back; used by the catalog importer and tests.
pub async fn read(path: &Path) -> Result<Sidecar, DownloadError> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| DownloadError::internal(format!("sidecar parse failed: {e}")))
}
