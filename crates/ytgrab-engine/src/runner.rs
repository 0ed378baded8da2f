//! Job runner: the concurrency core.
//!
//! A fixed worker pool drains an item channel; every worker runs the item
//! pipeline (extract, plan, strategy chain, finalize, sidecar/tags,
//! catalog) and publishes each state change over the bus. Cancellation is
//! hierarchical: process token, job token, item execution, chunk boundary.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{JobPublisher, JobStats, JobStatus, LogLevel, ProgressBus};
use crate::catalog::{Catalog, CatalogRecord};
use crate::download::{DownloadTuning, Downloader};
use crate::error::{DownloadError, ErrorKind, dominant_exit_code};
use crate::extractor::{Extracted, ExtractorRegistry};
use crate::helper::ExternalHelper;
use crate::media::{FormatKind, MediaDescriptor};
use crate::options::{DuplicatePolicy, JobOptions};
use crate::planner::{self, PathMeta, PlannedPath};
use crate::prompt::{PromptBroker, Resolution};
use crate::retry::RetryPolicy;
use crate::strategy::{self, AttemptContext, Strategy};
use crate::transport::HttpTransport;

/// In-process serialization of the finalize window per target path.
#[derive(Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub async fn acquire(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// Terminal result of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item_id: String,
    pub url: String,
    pub outcome: OutcomeKind,
    pub output: Option<PathBuf>,
    pub bytes: u64,
    pub error: Option<(ErrorKind, String)>,
}

impl ItemOutcome {
    fn ok(item: &WorkItem, output: PathBuf, bytes: u64) -> Self {
        Self {
            item_id: item.item_id.clone(),
            url: item.url.clone(),
            outcome: OutcomeKind::Ok,
            output: Some(output),
            bytes,
            error: None,
        }
    }

    fn skipped(item: &WorkItem) -> Self {
        Self {
            item_id: item.item_id.clone(),
            url: item.url.clone(),
            outcome: OutcomeKind::Skipped,
            output: None,
            bytes: 0,
            error: None,
        }
    }

    fn failed(item: &WorkItem, err: &DownloadError) -> Self {
        Self {
            item_id: item.item_id.clone(),
            url: item.url.clone(),
            outcome: OutcomeKind::Failed,
            output: None,
            bytes: 0,
            error: Some((err.kind(), err.to_string())),
        }
    }
}

/// Aggregate view handed back when the job reaches a terminal state.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub stats: JobStats,
    pub exit_code: i32,
    pub error: Option<String>,
}

/// A submitted job: its id plus the per-item and terminal channels.
pub struct SubmittedJob {
    pub job_id: String,
    pub items: mpsc::UnboundedReceiver<ItemOutcome>,
    pub done: oneshot::Receiver<JobSummary>,
}

/// One unit of acquisition inside a job.
#[derive(Debug, Clone)]
struct WorkItem {
    item_id: String,
    url: String,
    descriptor: Option<MediaDescriptor>,
    index: Option<u32>,
    count: Option<u32>,
    playlist_title: String,
    playlist_id: String,
    from_playlist: bool,
    unavailable: Option<String>,
}

struct RunnerInner {
    bus: ProgressBus,
    transport: HttpTransport,
    extractors: Arc<ExtractorRegistry>,
    broker: PromptBroker,
    helper: Arc<ExternalHelper>,
    catalog: Option<Catalog>,
    locks: Arc<PathLocks>,
    user_agent: String,
    shutdown: CancellationToken,
    jobs: Mutex<HashMap<String, CancellationToken>>,
}

/// The runner. Cheap to clone; all dependencies are injected explicitly at
/// construction so nothing lives in package-level state.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(
        bus: ProgressBus,
        transport: HttpTransport,
        extractors: Arc<ExtractorRegistry>,
        broker: PromptBroker,
        helper: Arc<ExternalHelper>,
        catalog: Option<Catalog>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                bus,
                transport,
                extractors,
                broker,
                helper,
                catalog,
                locks: Arc::new(PathLocks::default()),
                user_agent: user_agent.into(),
                shutdown: CancellationToken::new(),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.inner.bus
    }

    pub fn broker(&self) -> &PromptBroker {
        &self.inner.broker
    }

    /// Queue a job and start executing it.
    pub fn submit(&self, urls: Vec<String>, options: JobOptions) -> SubmittedJob {
        let job_id = Uuid::new_v4().to_string();
        let token = self.inner.shutdown.child_token();

        self.inner.bus.create_job(&job_id);
        let publisher = self.inner.bus.publisher(&job_id);
        publisher.status(JobStatus::Queued, None);

        self.inner
            .jobs
            .lock()
            .insert(job_id.clone(), token.clone());

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            let summary =
                run_job(Arc::clone(&inner), &spawned_id, urls, options, token, items_tx).await;
            inner.jobs.lock().remove(&spawned_id);
            inner.broker.forget_job(&spawned_id);
            let _ = done_tx.send(summary);
        });

        SubmittedJob {
            job_id,
            items: items_rx,
            done: done_rx,
        }
    }

    /// Cancel one job. Returns false for unknown (or already finished) ids.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.jobs.lock().get(job_id) {
            Some(token) => {
                info!(job_id, "cancelling job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running job (process shutdown).
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Derive the per-job download tuning from the frozen options.
fn tuning_for(options: &JobOptions) -> DownloadTuning {
    DownloadTuning {
        segment_concurrency: options.segment_concurrency.max(1),
        retry: RetryPolicy::default().with_max_retries(options.retries_per_strategy),
        ..DownloadTuning::default()
    }
}

/// Decide terminal status, stats, and exit code from the item outcomes.
///
/// `complete` requires at least one success and no failures; anything else
/// is an error, including the zero-success job.
fn summarize(
    job_id: &str,
    outcomes: &[ItemOutcome],
    cancelled: bool,
) -> JobSummary {
    let stats = JobStats {
        total: outcomes.len(),
        succeeded: outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Ok)
            .count(),
        failed: outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Failed)
            .count(),
        skipped: outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Skipped)
            .count(),
    };

    let complete = stats.failed == 0 && stats.succeeded >= 1;
    let status = if complete {
        JobStatus::Complete
    } else {
        JobStatus::Error
    };

    let mut exit_code = dominant_exit_code(
        outcomes
            .iter()
            .filter_map(|o| o.error.as_ref())
            .map(|(kind, _)| *kind),
    );
    if !complete && exit_code == 0 {
        exit_code = if cancelled {
            ErrorKind::Cancelled.exit_code()
        } else {
            1
        };
    }

    let error = if cancelled {
        Some("canceled".to_string())
    } else if complete {
        None
    } else {
        outcomes
            .iter()
            .find_map(|o| o.error.as_ref().map(|(_, msg)| msg.clone()))
            .or(Some("no items succeeded".to_string()))
    };

    JobSummary {
        job_id: job_id.to_string(),
        status,
        stats,
        exit_code,
        error,
    }
}

async fn run_job(
    inner: Arc<RunnerInner>,
    job_id: &str,
    urls: Vec<String>,
    options: JobOptions,
    token: CancellationToken,
    items_tx: mpsc::UnboundedSender<ItemOutcome>,
) -> JobSummary {
    let publisher = inner.bus.publisher(job_id);
    publisher.status(JobStatus::Running, None);

    let options = Arc::new(options);
    let mut outcomes: Vec<ItemOutcome> = Vec::new();

    // Resolve every URL into work items up front; playlist expansion
    // happens here so workers only ever see single items.
    let mut items: Vec<WorkItem> = Vec::new();
    for (n, url) in urls.iter().enumerate() {
        if token.is_cancelled() {
            break;
        }
        match resolve_url(&inner, &publisher, n, url, &token).await {
            Ok(resolved) => items.extend(resolved),
            Err(err) => {
                publisher.log(LogLevel::Error, format!("{url}: {err}"));
                let item = WorkItem {
                    item_id: format!("item{}", n + 1),
                    url: url.clone(),
                    descriptor: None,
                    index: None,
                    count: None,
                    playlist_title: String::new(),
                    playlist_id: String::new(),
                    from_playlist: false,
                    unavailable: None,
                };
                let outcome = ItemOutcome::failed(&item, &err);
                let _ = items_tx.send(outcome.clone());
                outcomes.push(outcome);
            }
        }
    }
    dedupe_item_ids(&mut items);

    let ctx = Arc::new(JobContext {
        inner: Arc::clone(&inner),
        publisher: publisher.clone(),
        options: Arc::clone(&options),
        downloader: Downloader::new(
            inner.transport.clone(),
            Arc::clone(&inner.locks),
            tuning_for(&options),
        ),
        claimed_paths: Mutex::new(HashSet::new()),
        job_id: job_id.to_string(),
    });

    // Fixed worker pool over a closed item channel.
    let workers = options.effective_jobs().min(items.len().max(1));
    let (work_tx, work_rx) = async_channel_bounded(items.len().max(1));
    for item in items {
        // Capacity covers every item; the send cannot fail.
        let _ = work_tx.try_send(item);
    }
    drop(work_tx);

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ItemOutcome>();
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx = Arc::clone(&ctx);
        let work_rx = work_rx.clone();
        let outcome_tx = outcome_tx.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            debug!(worker_id, "worker started");
            while let Some(item) = work_rx.recv().await {
                let outcome = if token.is_cancelled() {
                    ItemOutcome::failed(&item, &DownloadError::Cancelled)
                } else {
                    process_item(&ctx, &item, &token).await
                };
                if ctx.options.fail_fast
                    && matches!(
                        outcome.error,
                        Some((ErrorKind::Internal | ErrorKind::Filesystem, _))
                    )
                {
                    warn!(item = %item.item_id, "fail-fast: unrecoverable failure, cancelling job");
                    token.cancel();
                }
                if outcome_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!(worker_id, "worker drained");
        }));
    }
    drop(outcome_tx);

    while let Some(outcome) = outcome_rx.recv().await {
        report_outcome(&publisher, &outcome);
        let _ = items_tx.send(outcome.clone());
        outcomes.push(outcome);
    }
    for handle in handles {
        let _ = handle.await;
    }

    let summary = summarize(job_id, &outcomes, token.is_cancelled());
    publisher.status_with_stats(
        summary.status,
        summary.stats,
        summary.error.clone(),
        summary.exit_code,
    );
    publisher.done(
        summary.status,
        summary.exit_code,
        summary.stats,
        summary.error.clone(),
    );
    info!(
        job_id,
        status = ?summary.status,
        succeeded = summary.stats.succeeded,
        failed = summary.stats.failed,
        skipped = summary.stats.skipped,
        "job finished"
    );
    summary
}

fn report_outcome(publisher: &JobPublisher, outcome: &ItemOutcome) {
    match outcome.outcome {
        OutcomeKind::Ok => publisher.log(
            LogLevel::Info,
            format!("{} -> {}", outcome.url, display_path(&outcome.output)),
        ),
        OutcomeKind::Skipped => {
            publisher.log(LogLevel::Info, format!("{} skipped", outcome.url))
        }
        OutcomeKind::Failed => {
            let msg = outcome
                .error
                .as_ref()
                .map(|(_, m)| m.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            publisher.log(LogLevel::Error, format!("{}: {msg}", outcome.url));
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Resolve one URL into work items, expanding playlists.
async fn resolve_url(
    inner: &RunnerInner,
    publisher: &JobPublisher,
    position: usize,
    url: &str,
    token: &CancellationToken,
) -> Result<Vec<WorkItem>, DownloadError> {
    match inner.extractors.extract(url, token).await? {
        Extracted::Single(descriptor) => {
            let item_id = if descriptor.id.is_empty() {
                format!("item{}", position + 1)
            } else {
                descriptor.id.clone()
            };
            Ok(vec![WorkItem {
                item_id,
                url: url.to_string(),
                descriptor: Some(descriptor),
                index: None,
                count: None,
                playlist_title: String::new(),
                playlist_id: String::new(),
                from_playlist: false,
                unavailable: None,
            }])
        }
        Extracted::Playlist(playlist) => {
            publisher.log(
                LogLevel::Info,
                format!(
                    "playlist `{}`: {} entries",
                    playlist.title,
                    playlist.entries.len()
                ),
            );
            let count = playlist.entries.len() as u32;
            Ok(playlist
                .entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| WorkItem {
                    item_id: entry
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("{}-{}", playlist.id, i + 1)),
                    url: entry.url,
                    descriptor: None,
                    index: Some(i as u32 + 1),
                    count: Some(count),
                    playlist_title: playlist.title.clone(),
                    playlist_id: playlist.id.clone(),
                    from_playlist: true,
                    unavailable: entry.unavailable,
                })
                .collect())
        }
    }
}

/// Item ids must be unique within the job; collisions get a suffix.
fn dedupe_item_ids(items: &mut [WorkItem]) {
    let mut seen: HashSet<String> = HashSet::new();
    for item in items.iter_mut() {
        if !seen.insert(item.item_id.clone()) {
            let mut n = 2;
            loop {
                let candidate = format!("{}-{}", item.item_id, n);
                if seen.insert(candidate.clone()) {
                    item.item_id = candidate;
                    break;
                }
                n += 1;
            }
        }
    }
}

struct JobContext {
    inner: Arc<RunnerInner>,
    publisher: JobPublisher,
    options: Arc<JobOptions>,
    downloader: Downloader,
    claimed_paths: Mutex<HashSet<PathBuf>>,
    job_id: String,
}

/// The planner outcome for one attempt, after prompt round-trips and
/// in-process claim deduplication.
enum PlanOutcome {
    Planned { plan: PlannedPath, overwrite: bool },
    Skip,
}

async fn plan_for_attempt(
    ctx: &JobContext,
    meta: &PathMeta,
    token: &CancellationToken,
) -> Result<PlanOutcome, DownloadError> {
    let options = &ctx.options;
    let mut policy = options.duplicate_policy;
    let mut custom_name: Option<String> = None;

    let planned = loop {
        let result = match &custom_name {
            Some(name) => {
                planner::plan_renamed(&options.output_template, meta, &options.output_root, name)
            }
            None => planner::plan(&options.output_template, meta, &options.output_root, policy),
        };

        match result {
            Ok(planned) => break planned,
            Err(DownloadError::DuplicateSkipped { path }) => {
                ctx.publisher
                    .log(LogLevel::Info, format!("exists, skipping: {path}"));
                return Ok(PlanOutcome::Skip);
            }
            Err(DownloadError::PromptRequired { path }) => {
                match ctx
                    .inner
                    .broker
                    .ask(&ctx.publisher, Path::new(&path), token)
                    .await
                {
                    Resolution::Skip => return Ok(PlanOutcome::Skip),
                    Resolution::Overwrite => policy = DuplicatePolicy::Overwrite,
                    Resolution::RenameAuto => policy = DuplicatePolicy::Rename,
                    Resolution::Rename { new_name } => custom_name = Some(new_name),
                }
            }
            Err(err) => return Err(err),
        }
    };

    // Two in-flight items may plan the same final path before either file
    // exists on disk; the claim set closes that window.
    let mut claimed = ctx.claimed_paths.lock();
    if claimed.insert(planned.final_path.clone()) {
        return Ok(PlanOutcome::Planned {
            overwrite: policy == DuplicatePolicy::Overwrite,
            plan: planned,
        });
    }
    drop(claimed);

    if policy == DuplicatePolicy::Skip {
        return Ok(PlanOutcome::Skip);
    }
    // Fall back to an auto-renamed sibling; overwriting an output another
    // item of this job is still producing is never safe.
    let mut n = 2;
    loop {
        let stem = planned
            .final_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let candidate_name = match planned.final_path.extension() {
            Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
            None => format!("{stem} ({n})"),
        };
        let candidate = planner::plan_renamed(
            &ctx.options.output_template,
            meta,
            &ctx.options.output_root,
            &candidate_name,
        )?;
        let mut claimed = ctx.claimed_paths.lock();
        if !candidate.final_path.exists() && claimed.insert(candidate.final_path.clone()) {
            return Ok(PlanOutcome::Planned {
                plan: candidate,
                overwrite: false,
            });
        }
        drop(claimed);
        n += 1;
    }
}

fn meta_for(item: &WorkItem, descriptor: &MediaDescriptor, ext: &str, quality: &str) -> PathMeta {
    PathMeta {
        title: if descriptor.title.is_empty() {
            descriptor.id.clone()
        } else {
            descriptor.title.clone()
        },
        id: descriptor.id.clone(),
        ext: ext.to_string(),
        quality: quality.to_string(),
        artist: descriptor
            .artist
            .clone()
            .or_else(|| descriptor.author.clone())
            .unwrap_or_default(),
        album: descriptor.album.clone().unwrap_or_default(),
        playlist_title: item.playlist_title.clone(),
        playlist_id: item.playlist_id.clone(),
        index: item.index,
        count: item.count,
    }
}

async fn process_item(
    ctx: &JobContext,
    item: &WorkItem,
    token: &CancellationToken,
) -> ItemOutcome {
    if let Some(reason) = &item.unavailable {
        ctx.publisher.log(
            LogLevel::Warn,
            format!("{} unavailable ({reason}), skipping", item.url),
        );
        return ItemOutcome::skipped(item);
    }

    // Playlist entries are extracted lazily, in the worker.
    let descriptor = match &item.descriptor {
        Some(descriptor) => descriptor.clone(),
        None => match ctx.inner.extractors.extract(&item.url, token).await {
            Ok(Extracted::Single(descriptor)) => descriptor,
            Ok(Extracted::Playlist(_)) => {
                return ItemOutcome::failed(
                    item,
                    &DownloadError::unsupported("nested playlists are not supported"),
                );
            }
            Err(err) => {
                // A dead entry inside a playlist degrades to skipped; the
                // job carries on.
                if item.from_playlist
                    && matches!(err.kind(), ErrorKind::Restricted | ErrorKind::InvalidUrl)
                {
                    ctx.publisher.log(
                        LogLevel::Warn,
                        format!("{} unavailable ({err}), skipping", item.url),
                    );
                    return ItemOutcome::skipped(item);
                }
                return ItemOutcome::failed(item, &err);
            }
        },
    };

    let attempts = match strategy::plan_attempts(&descriptor, &ctx.options) {
        Ok(attempts) => attempts,
        Err(err) => return ItemOutcome::failed(item, &err),
    };

    let attempt_ctx = AttemptContext {
        downloader: &ctx.downloader,
        helper: &ctx.inner.helper,
        publisher: &ctx.publisher,
        user_agent: &ctx.inner.user_agent,
        token,
    };

    let total = attempts.len();
    let mut last_err: Option<DownloadError> = None;
    for (n, attempt) in attempts.iter().enumerate() {
        ctx.publisher.log(
            LogLevel::Info,
            format!(
                "{}: strategy {}/{}: {}",
                item.item_id,
                n + 1,
                total,
                attempt.name()
            ),
        );

        let ext = attempt.output_container();
        let quality = ctx.options.quality.to_string();
        let meta = meta_for(item, &descriptor, &ext, &quality);

        let (plan, overwrite) = match plan_for_attempt(ctx, &meta, token).await {
            Ok(PlanOutcome::Planned { plan, overwrite }) => (plan, overwrite),
            Ok(PlanOutcome::Skip) => return ItemOutcome::skipped(item),
            Err(err) => return ItemOutcome::failed(item, &err),
        };

        let task_id = format!("{}:a{}", item.item_id, n + 1);
        match strategy::execute(&attempt_ctx, attempt, &plan, &task_id).await {
            Ok(bytes) => {
                match finish_item(ctx, item, &descriptor, attempt, &plan, overwrite, bytes).await {
                    Ok(outcome) => return outcome,
                    Err(err) => return ItemOutcome::failed(item, &err),
                }
            }
            Err(err) => {
                // Release the claim; a later attempt replans (possibly
                // with a different extension).
                ctx.claimed_paths.lock().remove(&plan.final_path);

                if matches!(err, DownloadError::Cancelled) {
                    return ItemOutcome::failed(item, &err);
                }
                let advance =
                    strategy::should_advance(&err, ctx.options.audio_only) && n + 1 < total;
                if advance {
                    ctx.publisher.log(
                        LogLevel::Warn,
                        format!("{}: strategy advanced after: {err}", item.item_id),
                    );
                    last_err = Some(err);
                    continue;
                }
                return ItemOutcome::failed(item, &err);
            }
        }
    }

    let err = last_err.map_or_else(
        || DownloadError::internal("strategy chain produced no attempts"),
        |last| DownloadError::StrategiesExhausted {
            reason: last.to_string(),
        },
    );
    ItemOutcome::failed(item, &err)
}

/// Finalize and post-process a successful attempt: atomic rename, sidecar,
/// tag embedding, catalog insert. Sidecar/tag/catalog failures degrade to
/// warnings; the bytes are already safely in place.
async fn finish_item(
    ctx: &JobContext,
    item: &WorkItem,
    descriptor: &MediaDescriptor,
    attempt: &Strategy,
    plan: &PlannedPath,
    overwrite: bool,
    bytes: u64,
) -> Result<ItemOutcome, DownloadError> {
    ctx.downloader.finalize(plan, overwrite).await?;

    let chosen = attempt.chosen_format();
    let sidecar = crate::sidecar::Sidecar::build(descriptor, chosen, &ctx.options.meta_overrides);

    if let Err(err) = crate::sidecar::write(&plan.final_path, &sidecar).await {
        ctx.publisher
            .log(LogLevel::Warn, format!("sidecar write failed: {err}"));
    }

    // Tags only make sense for audio outputs, and only when the helper is
    // around; a failure is a warning plus a catalog note, never an item
    // failure.
    let mut tag_error = None;
    let is_audio = ctx.options.audio_only || chosen.kind == FormatKind::AudioOnly;
    if is_audio && ctx.inner.helper.is_available() {
        let shutdown = CancellationToken::new();
        if let Err(err) = ctx
            .inner
            .helper
            .embed_tags(&plan.final_path, &sidecar.tags(), &shutdown)
            .await
        {
            ctx.publisher
                .log(LogLevel::Warn, format!("tag embedding failed: {err}"));
            tag_error = Some(err.to_string());
        }
    }

    if let Some(catalog) = &ctx.inner.catalog {
        let record = CatalogRecord {
            job_id: ctx.job_id.clone(),
            item_id: item.item_id.clone(),
            source_url: item.url.clone(),
            output_path: plan.final_path.display().to_string(),
            title: sidecar.title.clone(),
            container: chosen.container.clone(),
            itag: chosen.itag.clone(),
            bytes,
            duration_secs: descriptor.duration_secs,
            tag_error,
        };
        if let Err(err) = catalog.record(&record).await {
            error!(error = %err, "catalog insert failed");
            ctx.publisher
                .log(LogLevel::Warn, format!("catalog insert failed: {err}"));
        }
    }

    Ok(ItemOutcome::ok(item, plan.final_path.clone(), bytes))
}

/// Minimal multi-consumer bounded channel on top of tokio primitives;
/// workers share the receiver by cloning.
fn async_channel_bounded<T: Send + 'static>(capacity: usize) -> (WorkSender<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        WorkSender { tx },
        WorkReceiver {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        },
    )
}

struct WorkSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> WorkSender<T> {
    fn try_send(&self, value: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.tx.try_send(value)
    }
}

#[derive(Clone)]
struct WorkReceiver<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> WorkReceiver<T> {
    async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}
