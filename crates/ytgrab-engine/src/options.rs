use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when the planned output path already exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Ask the operator through the prompt broker.
    #[default]
    Prompt,
    /// Leave the existing file alone; the item ends as skipped.
    Skip,
    /// Replace the existing file atomically on finalize.
    Overwrite,
    /// Append ` (2)`, ` (3)`, … before the extension until a free name exists.
    Rename,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompt" => Ok(Self::Prompt),
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "rename" => Ok(Self::Rename),
            other => Err(format!("unknown duplicate policy `{other}`")),
        }
    }
}

/// Requested rendition quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    #[default]
    Best,
    Worst,
    /// Capped at a vertical resolution, e.g. `720` for "720p".
    Height(u32),
}

impl std::str::FromStr for QualityPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best" | "" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            other => {
                let digits = other.strip_suffix('p').unwrap_or(other);
                digits
                    .parse::<u32>()
                    .map(Self::Height)
                    .map_err(|_| format!("unknown quality `{other}`"))
            }
        }
    }
}

impl std::fmt::Display for QualityPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Worst => f.write_str("worst"),
            Self::Height(h) => write!(f, "{h}p"),
        }
    }
}

/// Frozen per-job option snapshot.
///
/// Built once by the caller (CLI flags or the web request body) and never
/// mutated after the job is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Output path template relative to `output_root`.
    pub output_template: String,
    /// Root directory all planned paths must stay inside.
    pub output_root: PathBuf,
    /// Requested rendition quality.
    pub quality: QualityPreference,
    /// Preferred container (e.g. `mp4`), advisory.
    pub format: Option<String>,
    /// Exact upstream format identifier; bypasses quality selection.
    pub itag: Option<String>,
    /// Acquire the best audio-only rendition.
    pub audio_only: bool,
    /// Worker pool size, clamped to 1..=32.
    pub jobs: usize,
    /// Per-item request deadline, seconds on the wire.
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Collision handling for the planned output path.
    pub duplicate_policy: DuplicatePolicy,
    /// Operator metadata overrides (`key=value`), highest precedence.
    pub meta_overrides: Vec<(String, String)>,
    /// Concurrent in-flight segments for segmented acquisition.
    pub segment_concurrency: usize,
    /// Transient retries before a strategy is considered defeated.
    pub retries_per_strategy: u32,
    /// Abort the whole job on the first unrecoverable runner failure
    /// instead of draining remaining items.
    pub fail_fast: bool,
    /// How long a duplicate prompt may stay unanswered before it defaults
    /// to skip, seconds on the wire.
    #[serde(with = "secs")]
    pub prompt_timeout: Duration,
    /// Try the external helper before the single-request retry for
    /// audio-only requests.
    pub external_extract_first: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            output_template: "{title}.{ext}".to_string(),
            output_root: PathBuf::from("."),
            quality: QualityPreference::Best,
            format: None,
            itag: None,
            audio_only: false,
            jobs: 1,
            timeout: Duration::from_secs(180),
            duplicate_policy: DuplicatePolicy::default(),
            meta_overrides: Vec::new(),
            segment_concurrency: 4,
            retries_per_strategy: 3,
            fail_fast: false,
            prompt_timeout: Duration::from_secs(60),
            external_extract_first: false,
        }
    }
}

impl JobOptions {
    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = template.into();
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_quality(mut self, quality: QualityPreference) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_itag(mut self, itag: impl Into<String>) -> Self {
        self.itag = Some(itag.into());
        self
    }

    pub fn with_audio_only(mut self, audio: bool) -> Self {
        self.audio_only = audio;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_meta_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta_overrides.push((key.into(), value.into()));
        self
    }

    /// Worker pool size clamped to the supported range.
    pub fn effective_jobs(&self) -> usize {
        self.jobs.clamp(1, 32)
    }
}

/// Durations cross the wire as integer seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parses_common_forms() {
        assert_eq!("best".parse::<QualityPreference>().unwrap(), QualityPreference::Best);
        assert_eq!("worst".parse::<QualityPreference>().unwrap(), QualityPreference::Worst);
        assert_eq!(
            "720p".parse::<QualityPreference>().unwrap(),
            QualityPreference::Height(720)
        );
        assert_eq!(
            "1080".parse::<QualityPreference>().unwrap(),
            QualityPreference::Height(1080)
        );
        assert!("ultra".parse::<QualityPreference>().is_err());
    }

    #[test]
    fn jobs_are_clamped() {
        let opts = JobOptions::default().with_jobs(0);
        assert_eq!(opts.effective_jobs(), 1);
        let opts = JobOptions::default().with_jobs(512);
        assert_eq!(opts.effective_jobs(), 32);
    }

    #[test]
    fn options_round_trip_as_json() {
        let opts = JobOptions::default()
            .with_output_template("{artist}/{title}.{ext}")
            .with_audio_only(true)
            .with_meta_override("album", "Singles");
        let json = serde_json::to_string(&opts).unwrap();
        let back: JobOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.output_template, "{artist}/{title}.{ext}");
        assert!(back.audio_only);
        assert_eq!(back.timeout, Duration::from_secs(180));
        assert_eq!(back.meta_overrides.len(), 1);
    }

    #[test]
    fn duplicate_policy_parses() {
        assert_eq!("skip".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Skip);
        assert_eq!(
            "OVERWRITE".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::Overwrite
        );
        assert!("clobber".parse::<DuplicatePolicy>().is_err());
    }
}
