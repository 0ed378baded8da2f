use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ytgrab_engine::{DuplicatePolicy, JobOptions, QualityPreference};

/// Media acquisition tool with resumable, multi-strategy downloads.
#[derive(Debug, Parser)]
#[command(name = "ytgrab", version, about)]
pub struct CliArgs {
    /// URLs to download (videos, playlists, or direct media URLs).
    #[arg(required_unless_present = "list_formats")]
    pub urls: Vec<String>,

    /// Output path template relative to the output root.
    /// Placeholders: {title} {id} {ext} {quality} {artist} {album}
    /// {playlist_title} {playlist_id} {index} {count}
    #[arg(short, long, default_value = "{title}.{ext}")]
    pub output: String,

    /// Directory all outputs stay inside.
    #[arg(long, default_value = ".")]
    pub output_root: PathBuf,

    /// Requested quality: best, worst, or a height like 720p.
    #[arg(short, long, default_value = "best")]
    pub quality: String,

    /// Preferred container (advisory), e.g. mp4.
    #[arg(short, long)]
    pub format: Option<String>,

    /// Exact upstream format identifier; bypasses quality selection.
    #[arg(long)]
    pub itag: Option<String>,

    /// Download the best audio-only rendition.
    #[arg(short, long)]
    pub audio: bool,

    /// Concurrent items (1..=32).
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,

    /// Per-item timeout in seconds.
    #[arg(long, default_value_t = 180)]
    pub timeout: u64,

    /// Duplicate handling: prompt, skip, overwrite, or rename.
    #[arg(long, default_value = "prompt")]
    pub duplicate: String,

    /// Metadata override, key=value; repeatable. Keys: title, artist,
    /// author, album, track, date.
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,

    /// Print the format table for the first URL and exit.
    #[arg(long)]
    pub list_formats: bool,

    /// Choose the format interactively before downloading.
    #[arg(long)]
    pub select: bool,

    /// Emit newline-delimited JSON events instead of TTY progress.
    #[arg(long)]
    pub json: bool,

    /// Record successful items into this SQLite catalog.
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// External multiplexing helper binary.
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Try the external helper before the plain retry for audio requests.
    #[arg(long)]
    pub extract_first: bool,

    /// Abort the whole job on the first unrecoverable failure.
    #[arg(long)]
    pub fail_fast: bool,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Freeze the flags into the engine's option snapshot.
    pub fn to_options(&self) -> Result<JobOptions, String> {
        let quality: QualityPreference = self.quality.parse()?;
        let duplicate: DuplicatePolicy = self.duplicate.parse()?;

        let mut meta_overrides = Vec::with_capacity(self.meta.len());
        for entry in &self.meta {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("invalid --meta `{entry}`, expected key=value"))?;
            meta_overrides.push((key.trim().to_string(), value.to_string()));
        }

        let mut options = JobOptions {
            output_template: self.output.clone(),
            output_root: self.output_root.clone(),
            quality,
            format: self.format.clone(),
            itag: self.itag.clone(),
            audio_only: self.audio,
            jobs: self.jobs,
            timeout: Duration::from_secs(self.timeout),
            duplicate_policy: duplicate,
            meta_overrides,
            external_extract_first: self.extract_first,
            fail_fast: self.fail_fast,
            ..JobOptions::default()
        };
        // JSON consumers cannot answer terminal prompts; fall back to the
        // safe default unless a broker-connected frontend is attached.
        if self.json && options.duplicate_policy == DuplicatePolicy::Prompt {
            options.duplicate_policy = DuplicatePolicy::Skip;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_valid_options() {
        let args = CliArgs::parse_from(["ytgrab", "https://example.com/v.mp4"]);
        let options = args.to_options().unwrap();
        assert_eq!(options.output_template, "{title}.{ext}");
        assert_eq!(options.jobs, 1);
        assert_eq!(options.duplicate_policy, DuplicatePolicy::Prompt);
    }

    #[test]
    fn meta_overrides_parse_key_value_pairs() {
        let args = CliArgs::parse_from([
            "ytgrab",
            "--meta",
            "artist=Someone",
            "--meta",
            "album=Album=With=Equals",
            "https://example.com/v.mp4",
        ]);
        let options = args.to_options().unwrap();
        assert_eq!(
            options.meta_overrides,
            vec![
                ("artist".to_string(), "Someone".to_string()),
                ("album".to_string(), "Album=With=Equals".to_string()),
            ]
        );
    }

    #[test]
    fn json_mode_downgrades_prompt_policy() {
        let args = CliArgs::parse_from(["ytgrab", "--json", "https://example.com/v.mp4"]);
        let options = args.to_options().unwrap();
        assert_eq!(options.duplicate_policy, DuplicatePolicy::Skip);
    }

    #[test]
    fn bad_meta_is_rejected() {
        let args = CliArgs::parse_from(["ytgrab", "--meta", "noequals", "https://x.example/v"]);
        assert!(args.to_options().is_err());
    }
}
