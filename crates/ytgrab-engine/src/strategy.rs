//! Acquisition strategy selection and execution.
//!
//! A closed set of acquisition plans is derived from the media descriptor
//! and the job options, ordered so that the cheapest viable path runs
//! first and upstream blocks fall through to progressively heavier
//! recovery paths. Execution of a single attempt always leaves a complete
//! staging file at the planned `.part` path; the runner finalizes.

use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::bus::JobPublisher;
use crate::download::{Downloader, ProgressReporter, SegmentRef};
use crate::error::DownloadError;
use crate::helper::ExternalHelper;
use crate::media::{Format, FormatSource, MediaDescriptor};
use crate::options::JobOptions;
use crate::planner::PlannedPath;

/// One acquisition plan. The set is closed by design; dispatch is over the
/// variant, not open polymorphism.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Single HTTP GET with `Range` resume.
    ProgressiveStream { format: Format },
    /// Separate track acquisition reassembled in order; a present audio
    /// track is merged by the external helper.
    SegmentedStream {
        video: Format,
        audio: Option<Format>,
    },
    /// Plain single-shot GET with ranging and resume disabled; recovery
    /// path for range-hostile upstreams.
    SingleRequestRetry { format: Format },
    /// Hand the source to the external helper to demux/remux.
    ExternalExtract { source: Format, audio_only: bool },
    /// Non-extractor media; one GET.
    DirectUrl { format: Format },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProgressiveStream { .. } => "progressive",
            Self::SegmentedStream { .. } => "segmented",
            Self::SingleRequestRetry { .. } => "single-request",
            Self::ExternalExtract { .. } => "external-extract",
            Self::DirectUrl { .. } => "direct",
        }
    }

    /// The format recorded as chosen when this strategy succeeds.
    pub fn chosen_format(&self) -> &Format {
        match self {
            Self::ProgressiveStream { format }
            | Self::SingleRequestRetry { format }
            | Self::DirectUrl { format } => format,
            Self::SegmentedStream { video, .. } => video,
            Self::ExternalExtract { source, .. } => source,
        }
    }

    /// Container of the file this strategy produces, which drives `{ext}`.
    pub fn output_container(&self) -> String {
        match self {
            Self::ProgressiveStream { format }
            | Self::SingleRequestRetry { format }
            | Self::DirectUrl { format } => format.container.clone(),
            Self::SegmentedStream { video, .. } => video.container.clone(),
            Self::ExternalExtract { source, audio_only } => {
                if *audio_only {
                    "m4a".to_string()
                } else {
                    source.container.clone()
                }
            }
        }
    }
}

/// Build the ordered attempt list for one descriptor.
///
/// Mirrors the selection table: progressive first where available, the
/// segmented+mux path as the block-recovery route, the plain single
/// request as the range-hostile fallback, and the external helper last
/// (or earlier for audio when `external_extract_first` is set).
pub fn plan_attempts(
    descriptor: &MediaDescriptor,
    options: &JobOptions,
) -> Result<Vec<Strategy>, DownloadError> {
    // A direct-URL descriptor short-circuits the whole table.
    if descriptor.formats.len() == 1 && descriptor.formats[0].itag == "direct" {
        return Ok(vec![Strategy::DirectUrl {
            format: descriptor.formats[0].clone(),
        }]);
    }

    // An explicit itag wins over every other preference.
    if let Some(itag) = &options.itag {
        let format = descriptor.by_itag(itag).ok_or_else(|| {
            DownloadError::unsupported(format!("itag `{itag}` not offered for `{}`", descriptor.id))
        })?;
        return Ok(vec![
            Strategy::ProgressiveStream {
                format: format.clone(),
            },
            Strategy::SingleRequestRetry {
                format: format.clone(),
            },
        ]);
    }

    // The container preference is advisory: it narrows the candidate set
    // when anything matches and is ignored otherwise.
    let narrowed;
    let descriptor = match &options.format {
        Some(container) => {
            let matching: Vec<_> = descriptor
                .formats
                .iter()
                .filter(|f| f.container.eq_ignore_ascii_case(container))
                .cloned()
                .collect();
            if matching.is_empty() {
                descriptor
            } else {
                narrowed = MediaDescriptor {
                    formats: matching,
                    ..descriptor.clone()
                };
                &narrowed
            }
        }
        None => descriptor,
    };

    if options.audio_only {
        let audio = descriptor.best_audio_only();
        let progressive = descriptor.best_progressive(crate::options::QualityPreference::Best);
        let mut attempts = Vec::new();

        if let Some(audio) = audio {
            attempts.push(Strategy::ProgressiveStream {
                format: audio.clone(),
            });
            let retry = Strategy::SingleRequestRetry {
                format: audio.clone(),
            };
            let external = progressive.map(|p| Strategy::ExternalExtract {
                source: p.clone(),
                audio_only: true,
            });
            if options.external_extract_first {
                attempts.extend(external);
                attempts.push(retry);
            } else {
                attempts.push(retry);
                attempts.extend(external);
            }
        } else if let Some(p) = progressive {
            attempts.push(Strategy::ExternalExtract {
                source: p.clone(),
                audio_only: true,
            });
        }

        if attempts.is_empty() {
            return Err(DownloadError::unsupported(format!(
                "no audio rendition for `{}`",
                descriptor.id
            )));
        }
        return Ok(attempts);
    }

    let progressive = descriptor.best_progressive(options.quality);
    let video_only = descriptor.best_video_only(options.quality);
    let audio_only = descriptor.best_audio_only();

    let mut attempts = Vec::new();
    let segmented = video_only.map(|v| Strategy::SegmentedStream {
        video: v.clone(),
        audio: audio_only.cloned(),
    });

    match progressive {
        Some(p) => {
            attempts.push(Strategy::ProgressiveStream { format: p.clone() });
            attempts.extend(segmented);
            attempts.push(Strategy::SingleRequestRetry { format: p.clone() });
        }
        None => {
            attempts.extend(segmented);
            // The unconstrained best progressive is still a usable last
            // resort when the quality cap filtered everything out.
            if let Some(p) = descriptor.best_progressive(crate::options::QualityPreference::Best) {
                attempts.push(Strategy::ExternalExtract {
                    source: p.clone(),
                    audio_only: false,
                });
            }
        }
    }

    if attempts.is_empty() {
        return Err(DownloadError::unsupported(format!(
            "no downloadable format for `{}`",
            descriptor.id
        )));
    }
    Ok(attempts)
}

/// Shared handles an attempt executes against.
pub struct AttemptContext<'a> {
    pub downloader: &'a Downloader,
    pub helper: &'a ExternalHelper,
    pub publisher: &'a JobPublisher,
    pub user_agent: &'a str,
    pub token: &'a CancellationToken,
}

fn parse_source_url(raw: &str) -> Result<Url, DownloadError> {
    Url::parse(raw).map_err(|e| DownloadError::invalid_url(raw, e.to_string()))
}

fn primary_url(format: &Format) -> Result<Url, DownloadError> {
    match &format.source {
        FormatSource::Url { url, .. } => parse_source_url(url),
        FormatSource::Segments { .. } => Err(DownloadError::unsupported(
            "format offers only a segment manifest",
        )),
    }
}

/// Fetch one track (either source shape) into `dest`.
async fn fetch_track(
    ctx: &AttemptContext<'_>,
    format: &Format,
    dest: &std::path::Path,
    task_id: &str,
    label: &str,
    allow_resume: bool,
) -> Result<u64, DownloadError> {
    let mut reporter = ProgressReporter::new(
        ctx.publisher.clone(),
        task_id,
        ctx.downloader.tuning(),
    );
    match &format.source {
        FormatSource::Url { url, size } => {
            let url = parse_source_url(url)?;
            ctx.downloader
                .fetch_single(dest, &url, *size, allow_resume, &mut reporter, label, ctx.token)
                .await
        }
        FormatSource::Segments { segments } => {
            let refs = segments
                .iter()
                .map(|s| {
                    Ok(SegmentRef {
                        url: parse_source_url(&s.url)?,
                        size: s.size,
                    })
                })
                .collect::<Result<Vec<_>, DownloadError>>()?;
            ctx.downloader
                .fetch_segmented(dest, &refs, &mut reporter, label, ctx.token)
                .await
        }
    }
}

/// Execute one strategy, leaving the complete payload at `plan.temp_path`.
///
/// Task ids are derived from `task_prefix` so every attempt opens fresh
/// progress tasks; a late subscriber sees the currently active strategy
/// through its `register` events.
pub async fn execute(
    ctx: &AttemptContext<'_>,
    strategy: &Strategy,
    plan: &PlannedPath,
    task_prefix: &str,
) -> Result<u64, DownloadError> {
    info!(strategy = strategy.name(), dest = %plan.final_path.display(), "executing strategy");

    match strategy {
        Strategy::ProgressiveStream { format } | Strategy::DirectUrl { format } => {
            let url = primary_url(format)?;
            let mut reporter =
                ProgressReporter::new(ctx.publisher.clone(), task_prefix, ctx.downloader.tuning());
            ctx.downloader
                .fetch_single(
                    &plan.temp_path,
                    &url,
                    format.source.known_size().or(format.approx_size),
                    true,
                    &mut reporter,
                    &format.label(),
                    ctx.token,
                )
                .await
        }

        Strategy::SingleRequestRetry { format } => {
            let url = primary_url(format)?;
            let mut reporter =
                ProgressReporter::new(ctx.publisher.clone(), task_prefix, ctx.downloader.tuning());
            ctx.downloader
                .fetch_single(
                    &plan.temp_path,
                    &url,
                    format.source.known_size().or(format.approx_size),
                    false,
                    &mut reporter,
                    &format.label(),
                    ctx.token,
                )
                .await
        }

        Strategy::SegmentedStream { video, audio } => {
            let container = strategy.output_container();
            match audio {
                None => {
                    fetch_track(ctx, video, &plan.temp_path, task_prefix, &video.label(), false)
                        .await
                }
                Some(audio) => {
                    let video_path = plan.temp_path.with_extension("part.video");
                    let audio_path = plan.temp_path.with_extension("part.audio");

                    let video_task = format!("{task_prefix}:video");
                    let audio_task = format!("{task_prefix}:audio");
                    let video_bytes =
                        fetch_track(ctx, video, &video_path, &video_task, &video.label(), false)
                            .await?;
                    let audio_bytes =
                        fetch_track(ctx, audio, &audio_path, &audio_task, &audio.label(), false)
                            .await?;

                    let result = ctx
                        .helper
                        .mux(&video_path, &audio_path, &plan.temp_path, &container, ctx.token)
                        .await;
                    let _ = tokio::fs::remove_file(&video_path).await;
                    let _ = tokio::fs::remove_file(&audio_path).await;
                    result?;
                    Ok(video_bytes + audio_bytes)
                }
            }
        }

        Strategy::ExternalExtract { source, audio_only } => {
            let url = primary_url(source)?;
            let container = strategy.output_container();
            // The helper performs the transfer itself; the task is
            // indeterminate (total 0) until it finishes.
            let mut reporter =
                ProgressReporter::new(ctx.publisher.clone(), task_prefix, ctx.downloader.tuning());
            reporter.register(&format!("extract {}", source.label()), 0, 0);
            let result = ctx
                .helper
                .extract(url.as_str(), &plan.temp_path, &container, *audio_only, ctx.user_agent, ctx.token)
                .await;
            reporter.finish();
            result?;
            let written = tokio::fs::metadata(&plan.temp_path).await?.len();
            Ok(written)
        }
    }
}

/// Whether `err` defeats only this strategy (advance) or the whole item.
pub fn should_advance(err: &DownloadError, audio_only: bool) -> bool {
    err.advances_strategy(audio_only)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FormatKind, Resolution, Segment};
    use crate::options::QualityPreference;

    fn url_format(itag: &str, kind: FormatKind, height: u32, abr: u32) -> Format {
        Format {
            itag: itag.to_string(),
            container: if kind == FormatKind::AudioOnly { "m4a" } else { "mp4" }.to_string(),
            codec: "avc1".to_string(),
            kind,
            bitrate: Some(height.max(1) * 4),
            resolution: (height > 0).then(|| Resolution::new(height * 16 / 9, height)),
            audio_bitrate: (abr > 0).then_some(abr),
            approx_size: None,
            source: FormatSource::Url {
                url: format!("https://cdn.example/{itag}"),
                size: Some(1000),
            },
        }
    }

    fn full_descriptor() -> MediaDescriptor {
        MediaDescriptor {
            id: "vid".to_string(),
            formats: vec![
                url_format("18", FormatKind::Progressive, 360, 96),
                url_format("22", FormatKind::Progressive, 720, 128),
                url_format("137", FormatKind::VideoOnly, 1080, 0),
                url_format("140", FormatKind::AudioOnly, 0, 128),
            ],
            ..Default::default()
        }
    }

    fn names(attempts: &[Strategy]) -> Vec<&'static str> {
        attempts.iter().map(Strategy::name).collect()
    }

    #[test]
    fn best_video_with_progressive_available() {
        let attempts = plan_attempts(&full_descriptor(), &JobOptions::default()).unwrap();
        assert_eq!(names(&attempts), vec!["progressive", "segmented", "single-request"]);
        assert_eq!(attempts[0].chosen_format().itag, "22");
        match &attempts[1] {
            Strategy::SegmentedStream { video, audio } => {
                assert_eq!(video.itag, "137");
                assert_eq!(audio.as_ref().unwrap().itag, "140");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn best_video_without_progressive_falls_back_to_external() {
        let descriptor = MediaDescriptor {
            id: "vid".to_string(),
            formats: vec![
                url_format("137", FormatKind::VideoOnly, 1080, 0),
                url_format("140", FormatKind::AudioOnly, 0, 128),
            ],
            ..Default::default()
        };
        let attempts = plan_attempts(&descriptor, &JobOptions::default()).unwrap();
        assert_eq!(names(&attempts), vec!["segmented"]);

        // With a progressive outside the quality cap, the external helper
        // is the last resort.
        let options = JobOptions::default().with_quality(QualityPreference::Height(480));
        let mut formats = descriptor.formats.clone();
        formats.push(url_format("22", FormatKind::Progressive, 720, 128));
        let descriptor = MediaDescriptor {
            formats,
            ..descriptor
        };
        let attempts = plan_attempts(&descriptor, &options).unwrap();
        assert_eq!(names(&attempts), vec!["external-extract"]);
    }

    #[test]
    fn explicit_itag_gets_progressive_then_plain_retry() {
        let options = JobOptions::default().with_itag("18");
        let attempts = plan_attempts(&full_descriptor(), &options).unwrap();
        assert_eq!(names(&attempts), vec!["progressive", "single-request"]);
        assert!(attempts.iter().all(|s| s.chosen_format().itag == "18"));

        let options = JobOptions::default().with_itag("999");
        assert!(matches!(
            plan_attempts(&full_descriptor(), &options),
            Err(DownloadError::Unsupported { .. })
        ));
    }

    #[test]
    fn audio_chain_is_progressive_retry_external() {
        let options = JobOptions::default().with_audio_only(true);
        let attempts = plan_attempts(&full_descriptor(), &options).unwrap();
        assert_eq!(
            names(&attempts),
            vec!["progressive", "single-request", "external-extract"]
        );
        assert_eq!(attempts[0].chosen_format().itag, "140");
        match &attempts[2] {
            Strategy::ExternalExtract { source, audio_only } => {
                assert_eq!(source.itag, "22");
                assert!(audio_only);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn audio_chain_order_flips_with_external_first() {
        let mut options = JobOptions::default().with_audio_only(true);
        options.external_extract_first = true;
        let attempts = plan_attempts(&full_descriptor(), &options).unwrap();
        assert_eq!(
            names(&attempts),
            vec!["progressive", "external-extract", "single-request"]
        );
    }

    #[test]
    fn container_preference_narrows_selection_when_it_matches() {
        let mut descriptor = full_descriptor();
        descriptor.formats.push(Format {
            container: "webm".to_string(),
            ..url_format("43", FormatKind::Progressive, 480, 128)
        });

        let mut options = JobOptions::default();
        options.format = Some("webm".to_string());
        let attempts = plan_attempts(&descriptor, &options).unwrap();
        assert_eq!(attempts[0].chosen_format().itag, "43");

        // An unmatched preference is ignored, not fatal.
        options.format = Some("mkv".to_string());
        let attempts = plan_attempts(&descriptor, &options).unwrap();
        assert_eq!(attempts[0].chosen_format().itag, "22");
    }

    #[test]
    fn direct_descriptor_uses_direct_strategy_only() {
        let descriptor = MediaDescriptor {
            id: "file".to_string(),
            formats: vec![Format {
                itag: "direct".to_string(),
                container: "mp4".to_string(),
                codec: "unknown".to_string(),
                kind: FormatKind::Progressive,
                bitrate: None,
                resolution: None,
                audio_bitrate: None,
                approx_size: None,
                source: FormatSource::Url {
                    url: "https://cdn.example/file.mp4".to_string(),
                    size: None,
                },
            }],
            ..Default::default()
        };
        let attempts = plan_attempts(&descriptor, &JobOptions::default()).unwrap();
        assert_eq!(names(&attempts), vec!["direct"]);
    }

    #[test]
    fn no_formats_is_unsupported() {
        let descriptor = MediaDescriptor::default();
        assert!(matches!(
            plan_attempts(&descriptor, &JobOptions::default()),
            Err(DownloadError::Unsupported { .. })
        ));
    }

    #[test]
    fn external_extract_output_container_for_audio_is_m4a() {
        let strategy = Strategy::ExternalExtract {
            source: url_format("22", FormatKind::Progressive, 720, 128),
            audio_only: true,
        };
        assert_eq!(strategy.output_container(), "m4a");
    }

    #[test]
    fn segment_manifest_formats_refuse_primary_url() {
        let format = Format {
            source: FormatSource::Segments {
                segments: vec![Segment {
                    url: "https://cdn.example/seg0".to_string(),
                    size: None,
                }],
            },
            ..url_format("sb", FormatKind::VideoOnly, 720, 0)
        };
        assert!(primary_url(&format).is_err());
    }
}
