//! External multiplexing/extraction helper (ffmpeg).
//!
//! Three duties, all stream-copy only: merging separately downloaded video
//! and audio tracks, pulling an audio track out of a progressive stream as
//! the last-resort acquisition path, and embedding metadata tags. Every
//! invocation writes to a scratch file that is renamed over the target by
//! the caller's finalize step or swapped in place here for tag edits.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DownloadError;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata written into the output container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    pub date: Option<String>,
    pub comment: Option<String>,
}

impl TagSet {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |key: &str, value: &str| {
            args.push("-metadata".to_string());
            args.push(format!("{key}={value}"));
        };
        if let Some(v) = &self.title {
            push("title", v);
        }
        if let Some(v) = &self.artist {
            push("artist", v);
        }
        if let Some(v) = &self.album {
            push("album", v);
        }
        if let Some(v) = self.track {
            push("track", &v.to_string());
        }
        if let Some(v) = &self.date {
            push("date", v);
        }
        if let Some(v) = &self.comment {
            push("comment", v);
        }
        args
    }

    pub fn is_empty(&self) -> bool {
        self.to_args().is_empty()
    }
}

/// Wrapper around the external helper binary.
pub struct ExternalHelper {
    binary: String,
    version: Option<String>,
}

impl ExternalHelper {
    pub fn new(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        let version = Self::detect_version(&binary);
        Self { binary, version }
    }

    fn detect_version(binary: &str) -> Option<String> {
        std::process::Command::new(binary)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(str::to_string))
            })
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Merge separately acquired video and audio files into `output`.
    ///
    /// `container` names the target container explicitly; the staging file
    /// carries a `.part` extension the helper could not infer a muxer from.
    pub async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        container: &str,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-i".to_string(),
            audio.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
        ];
        args.extend(Self::muxer_args(container));
        args.push(output.to_string_lossy().into_owned());
        self.run(args, token).await
    }

    /// Pull a stream out of a progressive source. With `audio_only` the
    /// video track is dropped; otherwise the source is remuxed as-is. The
    /// source may be a URL (the helper performs the transfer itself) or a
    /// local file.
    pub async fn extract(
        &self,
        source: &str,
        output: &Path,
        container: &str,
        audio_only: bool,
        user_agent: &str,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
        if source.starts_with("http://") || source.starts_with("https://") {
            args.extend(["-user_agent".to_string(), user_agent.to_string()]);
        }
        args.extend(["-i".to_string(), source.to_string()]);
        if audio_only {
            args.push("-vn".to_string());
        }
        args.extend(["-c".to_string(), "copy".to_string()]);
        args.extend(Self::muxer_args(container));
        args.push(output.to_string_lossy().into_owned());
        self.run(args, token).await
    }

    /// Embed tags by rewriting the container in place (stream copy into a
    /// scratch sibling, then atomic swap).
    pub async fn embed_tags(
        &self,
        file: &Path,
        tags: &TagSet,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if tags.is_empty() {
            return Ok(());
        }

        let scratch = scratch_path(file);
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-i".to_string(),
            file.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
        ];
        args.extend(tags.to_args());
        let container = file.extension().and_then(|e| e.to_str()).unwrap_or("");
        args.extend(Self::muxer_args(container));
        args.push(scratch.to_string_lossy().into_owned());

        let result = self.run(args, token).await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&scratch, file).await?;
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                Err(err)
            }
        }
    }

    /// Output muxer flags for a target container. Staging files carry a
    /// `.part` extension, so the muxer must always be named explicitly.
    fn muxer_args(container: &str) -> Vec<String> {
        let strs = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match container {
            "m4a" | "mp4" | "mov" => strs(&["-f", "mp4", "-movflags", "+faststart"]),
            "webm" => strs(&["-f", "webm"]),
            "mp3" => strs(&["-f", "mp3"]),
            "flv" => strs(&["-f", "flv"]),
            "ts" => strs(&["-f", "mpegts"]),
            // Matroska swallows nearly anything under stream copy.
            _ => strs(&["-f", "matroska"]),
        }
    }

    async fn run(&self, args: Vec<String>, token: &CancellationToken) -> Result<(), DownloadError> {
        if !self.is_available() {
            return Err(DownloadError::external_helper(format!(
                "`{}` is not available on this system",
                self.binary
            )));
        }

        info!(binary = %self.binary, ?args, "invoking external helper");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::external_helper(format!("failed to spawn `{}`: {e}", self.binary))
            })?;

        // Keep the tail of stderr for the error message; the helper is
        // chatty and only the last lines matter.
        let stderr = child.stderr.take();
        let (tail_tx, tail_rx) = oneshot::channel();
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail: Vec<String> = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "helper", "{line}");
                    tail.push(line);
                    if tail.len() > 8 {
                        tail.remove(0);
                    }
                }
                let _ = tail_tx.send(tail.join("\n"));
            });
        } else {
            let _ = tail_tx.send(String::new());
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                DownloadError::external_helper(format!("failed to wait for helper: {e}"))
            })?,
            _ = token.cancelled() => {
                warn!(binary = %self.binary, "cancellation requested, killing helper");
                let _ = child.kill().await;
                match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => error!(binary = %self.binary, "helper did not exit after kill"),
                }
                return Err(DownloadError::Cancelled);
            }
        };

        if status.success() {
            Ok(())
        } else {
            let tail = tail_rx.await.unwrap_or_default();
            Err(DownloadError::external_helper(format!(
                "helper exited with {}: {}",
                status.code().unwrap_or(-1),
                tail
            )))
        }
    }
}

fn scratch_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tagtmp");
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
    if ext.is_empty() {
        file.with_file_name(name)
    } else {
        // Keep the real extension last so the helper can infer the muxer.
        file.with_file_name(format!("{name}.{ext}"))
    }
}
