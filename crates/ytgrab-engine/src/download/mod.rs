//! Streaming downloader: chunked transfers with resume, segmented
//! assembly, throttled progress reporting, and atomic finalize.
//!
//! Bytes are always staged in the planner's `.part` sibling; the rename in
//! [`Downloader::finalize`] is the single atomic commit point. Errors leave
//! the partial file in place so the next attempt can resume.

mod segmented;

pub use segmented::SegmentRef;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::JobPublisher;
use crate::error::DownloadError;
use crate::planner::PlannedPath;
use crate::retry::RetryPolicy;
use crate::runner::PathLocks;
use crate::transport::HttpTransport;

/// Throughput and reporting knobs.
#[derive(Debug, Clone)]
pub struct DownloadTuning {
    /// Progress is published when at least this many bytes accumulated...
    pub throttle_bytes: u64,
    /// ...or this much time passed since the last emission.
    pub throttle_interval: Duration,
    /// In-flight bound for segmented acquisition.
    pub segment_concurrency: usize,
    /// Per-segment deadline, distinct from the per-item deadline.
    pub segment_timeout: Duration,
    /// Backoff policy for transient chunk/segment failures.
    pub retry: RetryPolicy,
}

impl Default for DownloadTuning {
    fn default() -> Self {
        Self {
            throttle_bytes: 64 * 1024,
            throttle_interval: Duration::from_millis(200),
            segment_concurrency: 4,
            segment_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Publishes `register`/`progress`/`finish` for one task, rate-limited so
/// a fast transfer does not flood the bus.
pub struct ProgressReporter {
    publisher: JobPublisher,
    base_id: String,
    task_id: String,
    label: String,
    restarts: u32,
    total: u64,
    current: u64,
    pending_bytes: u64,
    last_emit: Instant,
    throttle_bytes: u64,
    throttle_interval: Duration,
}

impl ProgressReporter {
    pub fn new(publisher: JobPublisher, task_id: impl Into<String>, tuning: &DownloadTuning) -> Self {
        let base_id = task_id.into();
        Self {
            publisher,
            task_id: base_id.clone(),
            base_id,
            label: String::new(),
            restarts: 0,
            total: 0,
            current: 0,
            pending_bytes: 0,
            last_emit: Instant::now(),
            throttle_bytes: tuning.throttle_bytes,
            throttle_interval: tuning.throttle_interval,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Open the task. A resumed transfer immediately reports its offset so
    /// late subscribers see the true position.
    pub fn register(&mut self, label: &str, total: u64, current: u64) {
        self.total = total;
        self.current = current;
        self.label = label.to_string();
        self.publisher.register(&self.task_id, label, total);
        if current > 0 {
            self.emit();
        }
    }

    /// Account `n` transferred bytes, publishing if a threshold is due.
    pub fn advance(&mut self, n: u64) {
        self.current += n;
        self.pending_bytes += n;
        if self.pending_bytes >= self.throttle_bytes
            || self.last_emit.elapsed() >= self.throttle_interval
        {
            self.emit();
        }
    }

    /// Restart accounting from an absolute offset (416 recovery, plain
    /// single-shot retry). `current` never decreases within a task, so a
    /// true rewind closes the task and opens a successor.
    pub fn reset_to(&mut self, current: u64) {
        if current < self.current {
            self.publisher.finish(&self.task_id);
            self.restarts += 1;
            self.task_id = format!("{}/r{}", self.base_id, self.restarts);
            let label = self.label.clone();
            self.publisher.register(&self.task_id, &label, self.total);
        }
        self.current = current;
        self.emit();
    }

    fn emit(&mut self) {
        let total = (self.total > 0).then_some(self.total);
        self.publisher.progress(&self.task_id, self.current, total);
        self.pending_bytes = 0;
        self.last_emit = Instant::now();
    }

    /// Close the task, flushing the terminal byte count first.
    pub fn finish(&mut self) {
        self.emit();
        self.publisher.finish(&self.task_id);
    }
}

/// Streaming downloader bound to the shared transport.
#[derive(Clone)]
pub struct Downloader {
    transport: HttpTransport,
    locks: Arc<PathLocks>,
    tuning: DownloadTuning,
}

impl Downloader {
    pub fn new(transport: HttpTransport, locks: Arc<PathLocks>, tuning: DownloadTuning) -> Self {
        Self {
            transport,
            locks,
            tuning,
        }
    }

    pub fn tuning(&self) -> &DownloadTuning {
        &self.tuning
    }

    /// Stream a single HTTP source into `dest`.
    ///
    /// With `allow_resume` an existing partial file continues from its
    /// length via a `Range` request; `416` truncates and restarts once.
    /// Without it the partial file is truncated and the body is fetched in
    /// one plain request (the recovery path for range-hostile servers).
    /// Transient mid-body failures resume from the bytes already written,
    /// up to the retry policy. The file is fsynced before returning.
    pub async fn fetch_single(
        &self,
        dest: &Path,
        url: &Url,
        size: Option<u64>,
        allow_resume: bool,
        reporter: &mut ProgressReporter,
        label: &str,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dest)
            .await?;

        let mut resume_at = if allow_resume {
            file.metadata().await?.len()
        } else {
            file.set_len(0).await?;
            0
        };
        if resume_at > 0 {
            info!(dest = %dest.display(), resume_at, "resuming partial download");
        }

        let total = size.unwrap_or(0);
        reporter.register(label, total, resume_at);

        let max_attempts = self.tuning.retry.max_retries;
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                reporter.finish();
                return Err(DownloadError::Cancelled);
            }

            let range_start = if allow_resume { resume_at } else { 0 };
            let response = match self.transport.get(url, range_start, token).await {
                Ok(response) => response,
                Err(DownloadError::HttpStatus {
                    status: StatusCode::RANGE_NOT_SATISFIABLE,
                    ..
                }) if resume_at > 0 => {
                    // The partial file outlived the server's view of the
                    // resource; restart from scratch.
                    warn!(dest = %dest.display(), "range not satisfiable, restarting from zero");
                    file.set_len(0).await?;
                    file.seek(std::io::SeekFrom::Start(0)).await?;
                    resume_at = 0;
                    reporter.reset_to(0);
                    continue;
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    attempt += 1;
                    self.backoff(attempt, token).await?;
                    continue;
                }
                Err(err) => {
                    reporter.finish();
                    return Err(err);
                }
            };

            if resume_at > 0 && response.status() == StatusCode::OK {
                // Server ignored the range header and replied with the
                // full body; the partial bytes are stale.
                debug!(dest = %dest.display(), "server ignored range request, restarting");
                file.set_len(0).await?;
                resume_at = 0;
                reporter.reset_to(0);
            }
            file.seek(std::io::SeekFrom::Start(resume_at)).await?;

            match self
                .copy_body(response, &mut file, reporter, token)
                .await
            {
                Ok(()) => {
                    let written = reporter.current();
                    if total > 0 && written < total {
                        // Truncated body; treat like any transient failure
                        // and pick up from what we have.
                        if attempt < max_attempts {
                            attempt += 1;
                            resume_at =
                                self.rewind_for_retry(&mut file, reporter, allow_resume).await?;
                            self.backoff(attempt, token).await?;
                            continue;
                        }
                        reporter.finish();
                        return Err(DownloadError::Timeout {
                            reason: format!(
                                "body truncated at {written} of {total} bytes after {attempt} retries"
                            ),
                        });
                    }
                    file.sync_all().await?;
                    reporter.finish();
                    return Ok(written);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    attempt += 1;
                    resume_at = self.rewind_for_retry(&mut file, reporter, allow_resume).await?;
                    self.backoff(attempt, token).await?;
                    continue;
                }
                Err(err) => {
                    reporter.finish();
                    return Err(err);
                }
            }
        }
    }

    async fn copy_body(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
        reporter: &mut ProgressReporter,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    reporter.advance(bytes.len() as u64);
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            }
        }
    }

    /// Pick the restart offset for a retry. Resumable transfers continue
    /// from the bytes on disk; plain single-shot transfers start over,
    /// since the next response will carry the full body again.
    async fn rewind_for_retry(
        &self,
        file: &mut tokio::fs::File,
        reporter: &mut ProgressReporter,
        allow_resume: bool,
    ) -> Result<u64, DownloadError> {
        if allow_resume {
            Ok(reporter.current())
        } else {
            file.set_len(0).await?;
            reporter.reset_to(0);
            Ok(0)
        }
    }

    async fn backoff(&self, attempt: u32, token: &CancellationToken) -> Result<(), DownloadError> {
        let delay = self
            .tuning
            .retry
            .base_delay
            .checked_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
            .unwrap_or(self.tuning.retry.max_delay)
            .min(self.tuning.retry.max_delay);
        tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Atomically publish a completed temp file at its final path.
    ///
    /// Serialized per target path, so two items planning the same final
    /// path cannot interleave the remove/rename window.
    pub async fn finalize(&self, plan: &PlannedPath, overwrite: bool) -> Result<(), DownloadError> {
        let _guard = self.locks.acquire(&plan.final_path).await;

        if overwrite && tokio::fs::try_exists(&plan.final_path).await? {
            tokio::fs::remove_file(&plan.final_path).await?;
        }
        tokio::fs::rename(&plan.temp_path, &plan.final_path).await?;
        debug!(path = %plan.final_path.display(), "finalized output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventPayload, ProgressBus};
    use crate::planner;

    fn reporter_with_bus() -> (ProgressBus, ProgressReporter) {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        let tuning = DownloadTuning::default();
        let reporter = ProgressReporter::new(bus.publisher("j1"), "t1", &tuning);
        (bus, reporter)
    }

    fn progress_events(bus: &ProgressBus) -> Vec<(u64, Option<u64>)> {
        let mut rx = bus.subscribe("j1", 0).unwrap();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::Progress { current, total, .. } = &event.payload {
                out.push((*current, *total));
            }
        }
        out
    }

    #[tokio::test]
    async fn small_chunks_are_coalesced_by_the_throttle() {
        let (bus, mut reporter) = reporter_with_bus();
        reporter.register("clip", 1 << 20, 0);

        // 16 chunks of 1 KiB stay under both thresholds.
        for _ in 0..16 {
            reporter.advance(1024);
        }
        assert!(progress_events(&bus).is_empty());

        // Crossing 64 KiB forces an emission.
        reporter.advance(60 * 1024);
        let events = progress_events(&bus);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 76 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_forces_an_emission() {
        let (bus, mut reporter) = reporter_with_bus();
        reporter.register("clip", 0, 0);

        reporter.advance(1);
        tokio::time::advance(Duration::from_millis(250)).await;
        reporter.advance(1);

        let events = progress_events(&bus);
        assert_eq!(events.len(), 1);
        // Unknown total is carried as absent, not zero.
        assert_eq!(events[0], (2, None));
    }

    #[tokio::test]
    async fn resumed_register_reports_the_offset() {
        let (bus, mut reporter) = reporter_with_bus();
        reporter.register("clip", 1000, 400);
        let events = progress_events(&bus);
        assert_eq!(events, vec![(400, Some(1000))]);
    }

    #[tokio::test]
    async fn finish_flushes_the_terminal_count() {
        let (bus, mut reporter) = reporter_with_bus();
        reporter.register("clip", 0, 0);
        reporter.advance(5);
        reporter.finish();

        let mut rx = bus.subscribe("j1", 0).unwrap();
        let mut saw_progress_five = false;
        let mut saw_finish = false;
        while let Ok(event) = rx.try_recv() {
            match &event.payload {
                EventPayload::Progress { current: 5, .. } => saw_progress_five = true,
                EventPayload::Finish { .. } => saw_finish = true,
                _ => {}
            }
        }
        assert!(saw_progress_five && saw_finish);
    }

    #[tokio::test]
    async fn rewind_closes_the_task_and_opens_a_successor() {
        let (bus, mut reporter) = reporter_with_bus();
        reporter.register("clip", 1000, 400);
        reporter.reset_to(0);

        let mut rx = bus.subscribe("j1", 0).unwrap();
        let mut timeline = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match &event.payload {
                EventPayload::Register { id, .. } => timeline.push(format!("register:{id}")),
                EventPayload::Finish { id } => timeline.push(format!("finish:{id}")),
                EventPayload::Progress { id, current, .. } => {
                    timeline.push(format!("progress:{id}:{current}"))
                }
                _ => {}
            }
        }
        assert_eq!(
            timeline,
            vec![
                "register:t1",
                "progress:t1:400",
                "finish:t1",
                "register:t1/r1",
                "progress:t1/r1:0",
            ]
        );
        assert_eq!(reporter.task_id(), "t1/r1");
    }

    #[tokio::test]
    async fn finalize_renames_and_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.mp4");
        let plan = PlannedPath {
            abs_dir: dir.path().to_path_buf(),
            final_path: final_path.clone(),
            temp_path: planner::part_path(&final_path),
        };

        let transport = HttpTransport::new(&crate::transport::TransportConfig::default()).unwrap();
        let downloader = Downloader::new(
            transport,
            Arc::new(PathLocks::default()),
            DownloadTuning::default(),
        );

        tokio::fs::write(&plan.temp_path, b"new bytes").await.unwrap();
        tokio::fs::write(&plan.final_path, b"old").await.unwrap();

        downloader.finalize(&plan, true).await.unwrap();
        assert_eq!(tokio::fs::read(&plan.final_path).await.unwrap(), b"new bytes");
        assert!(!plan.temp_path.exists());
    }

    #[tokio::test]
    async fn finalize_without_overwrite_fails_cleanly_when_missing_temp() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.mp4");
        let plan = PlannedPath {
            abs_dir: dir.path().to_path_buf(),
            final_path: final_path.clone(),
            temp_path: planner::part_path(&final_path),
        };
        let transport = HttpTransport::new(&crate::transport::TransportConfig::default()).unwrap();
        let downloader = Downloader::new(
            transport,
            Arc::new(PathLocks::default()),
            DownloadTuning::default(),
        );
        let err = downloader.finalize(&plan, false).await.unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
    }
}
