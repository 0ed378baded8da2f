//! Progress bus: the per-job ordered event log every observer consumes.
//!
//! One `EventLog` per job, a strictly monotone sequence number assigned
//! under a single mutex at publish time, snapshot-plus-delta subscriptions
//! with `since=` replay, bounded subscriber channels that drop slow
//! consumers, and reaping of terminal jobs after a grace interval.
//!
//! The bus never calls back into the runner; the runner publishes through
//! [`JobPublisher`], a narrow one-way handle.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bound of a subscriber's live-delta channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
/// Default number of trailing log lines carried by a snapshot.
pub const DEFAULT_LOG_TAIL: usize = 80;
/// Minimum time a terminal job is kept around for late subscribers.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(60);

/// Job lifecycle as observers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Reconnecting,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Aggregate item counts reported with terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// State of one progress task as carried by snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub label: String,
    pub total: u64,
    pub current: u64,
    pub done: bool,
}

/// A pending duplicate prompt as carried by snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSnapshot {
    pub prompt_id: String,
    pub path: String,
    pub filename: String,
}

/// Event payloads; the `type` tag is the wire discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    Status {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<JobStats>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    Register { id: String, label: String, total: u64 },
    #[serde(rename_all = "camelCase")]
    Progress {
        id: String,
        current: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Finish { id: String },
    #[serde(rename_all = "camelCase")]
    Log { level: LogLevel, message: String },
    #[serde(rename_all = "camelCase")]
    Duplicate {
        prompt_id: String,
        path: String,
        filename: String,
    },
    #[serde(rename_all = "camelCase")]
    DuplicateResolved { prompt_id: String },
    #[serde(rename_all = "camelCase")]
    Done {
        status: JobStatus,
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<JobStats>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Synthesized for late subscribers; never appended to the log.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        status: JobStatus,
        last_seq: u64,
        tasks: Vec<TaskSnapshot>,
        log_tail: Vec<String>,
        prompts: Vec<PromptSnapshot>,
    },
}

impl EventPayload {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

fn seq_is_zero(seq: &u64) -> bool {
    *seq == 0
}

/// One event on the wire. `seq` is omitted for the synthesized snapshot,
/// which carries `lastSeq` in its payload instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "seq_is_zero")]
    pub seq: u64,
    /// Unix epoch milliseconds.
    pub ts: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

struct JobLog {
    seq: u64,
    events: Vec<Arc<Event>>,
    status: JobStatus,
    tasks: BTreeMap<String, TaskSnapshot>,
    log_tail: VecDeque<String>,
    prompts: Vec<PromptSnapshot>,
    subscribers: Vec<mpsc::Sender<Arc<Event>>>,
    done: bool,
    reapable_since: Option<Instant>,
}

impl JobLog {
    fn new() -> Self {
        Self {
            seq: 0,
            events: Vec::new(),
            status: JobStatus::Queued,
            tasks: BTreeMap::new(),
            log_tail: VecDeque::new(),
            prompts: Vec::new(),
            subscribers: Vec::new(),
            done: false,
            reapable_since: None,
        }
    }

    /// Fold an event into the derived state snapshots are built from.
    fn apply(&mut self, payload: &EventPayload, log_tail_limit: usize) {
        match payload {
            EventPayload::Status { status, .. } => self.status = *status,
            EventPayload::Register { id, label, total } => {
                self.tasks.insert(
                    id.clone(),
                    TaskSnapshot {
                        id: id.clone(),
                        label: label.clone(),
                        total: *total,
                        current: 0,
                        done: false,
                    },
                );
            }
            EventPayload::Progress { id, current, total, .. } => {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.current = (*current).max(task.current);
                    if let Some(total) = total {
                        task.total = *total;
                    }
                }
            }
            EventPayload::Finish { id } => {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.done = true;
                }
            }
            EventPayload::Log { message, .. } => {
                self.log_tail.push_back(message.clone());
                while self.log_tail.len() > log_tail_limit {
                    self.log_tail.pop_front();
                }
            }
            EventPayload::Duplicate {
                prompt_id,
                path,
                filename,
            } => {
                self.prompts.push(PromptSnapshot {
                    prompt_id: prompt_id.clone(),
                    path: path.clone(),
                    filename: filename.clone(),
                });
            }
            EventPayload::DuplicateResolved { prompt_id } => {
                self.prompts.retain(|p| &p.prompt_id != prompt_id);
            }
            EventPayload::Done { status, .. } => {
                self.status = *status;
                self.done = true;
                self.reapable_since = Some(Instant::now());
            }
            EventPayload::Snapshot { .. } => {}
        }
    }

    fn snapshot_event(&self, job_id: &str) -> Event {
        Event {
            job_id: job_id.to_string(),
            seq: 0,
            ts: chrono::Utc::now().timestamp_millis(),
            payload: EventPayload::Snapshot {
                status: self.status,
                last_seq: self.seq,
                tasks: self.tasks.values().cloned().collect(),
                log_tail: self.log_tail.iter().cloned().collect(),
                prompts: self.prompts.clone(),
            },
        }
    }
}

struct Inner {
    jobs: Mutex<HashMap<String, JobLog>>,
    subscriber_capacity: usize,
    log_tail_limit: usize,
    reap_grace: Duration,
}

/// Multi-subscriber progress bus; cheap to clone.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<Inner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_SUBSCRIBER_CAPACITY,
            DEFAULT_LOG_TAIL,
            DEFAULT_REAP_GRACE,
        )
    }

    pub fn with_limits(
        subscriber_capacity: usize,
        log_tail_limit: usize,
        reap_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                subscriber_capacity,
                log_tail_limit,
                reap_grace: reap_grace.max(DEFAULT_REAP_GRACE),
            }),
        }
    }

    /// Register a job so subscribers can attach before the first event.
    pub fn create_job(&self, job_id: &str) {
        let mut jobs = self.inner.jobs.lock();
        jobs.entry(job_id.to_string()).or_insert_with(JobLog::new);
    }

    pub fn job_exists(&self, job_id: &str) -> bool {
        self.inner.jobs.lock().contains_key(job_id)
    }

    /// Append an event and fan it out. Returns the assigned sequence
    /// number, or `None` when the job has already been reaped.
    pub fn publish(&self, job_id: &str, payload: EventPayload) -> Option<u64> {
        let mut jobs = self.inner.jobs.lock();
        let log = jobs.get_mut(job_id)?;

        log.seq += 1;
        let event = Arc::new(Event {
            job_id: job_id.to_string(),
            seq: log.seq,
            ts: chrono::Utc::now().timestamp_millis(),
            payload,
        });
        log.apply(&event.payload, self.inner.log_tail_limit);
        log.events.push(Arc::clone(&event));

        // Fan out without blocking the publisher. A full channel means the
        // subscriber fell behind its bound; it is dropped and expected to
        // reconnect with `since=` to recover the gap.
        log.subscribers.retain(|tx| match tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id, seq = event.seq, "subscriber channel overflow, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Some(event.seq)
    }

    /// Attach a subscriber.
    ///
    /// Delivers a synthesized snapshot first, then the backlog with
    /// `seq > since` in order, then live events. The snapshot and backlog
    /// are buffered in full; the configured bound applies to live deltas.
    pub fn subscribe(&self, job_id: &str, since: u64) -> Option<mpsc::Receiver<Arc<Event>>> {
        let mut jobs = self.inner.jobs.lock();
        let log = jobs.get_mut(job_id)?;

        let backlog: Vec<Arc<Event>> = log
            .events
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(backlog.len() + 1 + self.inner.subscriber_capacity);
        let snapshot = Arc::new(log.snapshot_event(job_id));
        // Capacity covers snapshot + backlog, so these sends cannot fail.
        let _ = tx.try_send(snapshot);
        for event in backlog {
            let _ = tx.try_send(event);
        }

        log.subscribers.push(tx);
        log.reapable_since = log.done.then(Instant::now);
        Some(rx)
    }

    /// Current status of a job, if it is still retained.
    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.jobs.lock().get(job_id).map(|log| log.status)
    }

    /// Drop terminal jobs whose grace interval has elapsed with no
    /// subscribers attached. Returns the ids reaped.
    pub fn sweep(&self) -> Vec<String> {
        let mut jobs = self.inner.jobs.lock();
        let grace = self.inner.reap_grace;
        let mut reaped = Vec::new();

        for (id, log) in jobs.iter_mut() {
            log.subscribers.retain(|tx| !tx.is_closed());
            if !log.done {
                continue;
            }
            if !log.subscribers.is_empty() {
                // The grace timer restarts once the last subscriber leaves.
                log.reapable_since = None;
                continue;
            }
            match log.reapable_since {
                Some(since) if since.elapsed() >= grace => reaped.push(id.clone()),
                Some(_) => {}
                None => log.reapable_since = Some(Instant::now()),
            }
        }

        for id in &reaped {
            debug!(job_id = %id, "reaping terminal job log");
            jobs.remove(id);
        }
        reaped
    }

    /// Spawn the periodic reaper. Call once from an async context.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                bus.sweep();
            }
        })
    }

    /// A narrow publish-only handle bound to one job.
    pub fn publisher(&self, job_id: &str) -> JobPublisher {
        JobPublisher {
            bus: self.clone(),
            job_id: job_id.to_string(),
        }
    }
}

/// Publish-only handle handed to the runner and downloader.
#[derive(Clone)]
pub struct JobPublisher {
    bus: ProgressBus,
    job_id: String,
}

impl JobPublisher {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self, status: JobStatus, message: Option<String>) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Status {
                status,
                message,
                error: None,
                stats: None,
                exit_code: None,
            },
        );
    }

    pub fn status_with_stats(
        &self,
        status: JobStatus,
        stats: JobStats,
        error: Option<String>,
        exit_code: i32,
    ) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Status {
                status,
                message: None,
                error,
                stats: Some(stats),
                exit_code: Some(exit_code),
            },
        );
    }

    pub fn register(&self, task_id: &str, label: &str, total: u64) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Register {
                id: task_id.to_string(),
                label: label.to_string(),
                total,
            },
        );
    }

    pub fn progress(&self, task_id: &str, current: u64, total: Option<u64>) {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| ((current.saturating_mul(100) / t).min(100)) as u8);
        self.bus.publish(
            &self.job_id,
            EventPayload::Progress {
                id: task_id.to_string(),
                current,
                total,
                percent,
                eta: None,
            },
        );
    }

    pub fn finish(&self, task_id: &str) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Finish {
                id: task_id.to_string(),
            },
        );
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Log {
                level,
                message: message.into(),
            },
        );
    }

    pub fn duplicate(&self, prompt_id: &str, path: &str, filename: &str) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Duplicate {
                prompt_id: prompt_id.to_string(),
                path: path.to_string(),
                filename: filename.to_string(),
            },
        );
    }

    pub fn duplicate_resolved(&self, prompt_id: &str) {
        self.bus.publish(
            &self.job_id,
            EventPayload::DuplicateResolved {
                prompt_id: prompt_id.to_string(),
            },
        );
    }

    pub fn done(&self, status: JobStatus, exit_code: i32, stats: JobStats, error: Option<String>) {
        self.bus.publish(
            &self.job_id,
            EventPayload::Done {
                status,
                exit_code,
                stats: Some(stats),
                error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn log_event(message: &str) -> EventPayload {
        EventPayload::Log {
            level: LogLevel::Info,
            message: message.to_string(),
        }
    }

    #[test]
    fn sequence_is_monotone_and_gap_free() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        for i in 0..100 {
            let seq = bus.publish("j1", log_event(&format!("line {i}"))).unwrap();
            assert_eq!(seq, i + 1);
        }
    }

    #[tokio::test]
    async fn subscriber_gets_snapshot_then_backlog_then_live() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        bus.publish("j1", log_event("one"));
        bus.publish("j1", log_event("two"));

        let mut rx = bus.subscribe("j1", 0).unwrap();
        bus.publish("j1", log_event("three"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0].payload, EventPayload::Snapshot { .. }));
        assert_eq!(events[0].seq, 0);
        let seqs: Vec<u64> = events[1..].iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reconnect_with_since_replays_exact_gap() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        for i in 1..=10 {
            bus.publish("j1", log_event(&format!("line {i}")));
        }

        let mut rx = bus.subscribe("j1", 7).unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[0].payload, EventPayload::Snapshot { .. }));
        let seqs: Vec<u64> = events[1..].iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn snapshot_reflects_task_and_prompt_state() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        let publisher = bus.publisher("j1");
        publisher.status(JobStatus::Running, None);
        publisher.register("t1", "video", 1000);
        publisher.progress("t1", 400, Some(1000));
        publisher.duplicate("p1", "/out/Song.mp3", "Song.mp3");

        let mut rx = bus.subscribe("j1", u64::MAX).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "since=MAX suppresses the backlog");
        match &events[0].payload {
            EventPayload::Snapshot {
                status,
                last_seq,
                tasks,
                prompts,
                ..
            } => {
                assert_eq!(*status, JobStatus::Running);
                assert_eq!(*last_seq, 4);
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].current, 400);
                assert_eq!(prompts.len(), 1);
                assert_eq!(prompts[0].prompt_id, "p1");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolved_prompts_leave_the_snapshot() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        let publisher = bus.publisher("j1");
        publisher.duplicate("p1", "/out/Song.mp3", "Song.mp3");
        publisher.duplicate_resolved("p1");

        let mut rx = bus.subscribe("j1", u64::MAX).unwrap();
        let events = drain(&mut rx);
        match &events[0].payload {
            EventPayload::Snapshot { prompts, .. } => assert!(prompts.is_empty()),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_on_overflow() {
        let bus = ProgressBus::with_limits(4, DEFAULT_LOG_TAIL, DEFAULT_REAP_GRACE);
        bus.create_job("j1");
        let mut rx = bus.subscribe("j1", 0).unwrap();

        // Fill the live bound (capacity = backlog 0 + snapshot 1 + 4).
        for i in 0..16 {
            bus.publish("j1", log_event(&format!("line {i}")));
        }

        // The receiver still drains what was buffered before the drop.
        let received = drain(&mut rx);
        assert!(received.len() < 17);

        // A reconnect recovers the full log by sequence number.
        let last_seq = received.iter().map(|e| e.seq).max().unwrap_or(0);
        let mut rx2 = bus.subscribe("j1", last_seq).unwrap();
        let replay = drain(&mut rx2);
        assert!(matches!(replay[0].payload, EventPayload::Snapshot { .. }));
        let seqs: Vec<u64> = replay[1..].iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (last_seq + 1..=16).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn sweep_reaps_done_jobs_after_grace_without_subscribers() {
        let bus = ProgressBus::with_limits(
            DEFAULT_SUBSCRIBER_CAPACITY,
            DEFAULT_LOG_TAIL,
            DEFAULT_REAP_GRACE,
        );
        bus.create_job("j1");
        bus.publish(
            "j1",
            EventPayload::Done {
                status: JobStatus::Complete,
                exit_code: 0,
                stats: None,
                error: None,
            },
        );

        // Grace has not elapsed yet.
        assert!(bus.sweep().is_empty());
        assert!(bus.job_exists("j1"));

        // Force the deadline into the past.
        {
            let mut jobs = bus.inner.jobs.lock();
            jobs.get_mut("j1").unwrap().reapable_since =
                Some(Instant::now() - DEFAULT_REAP_GRACE - Duration::from_secs(1));
        }
        assert_eq!(bus.sweep(), vec!["j1".to_string()]);
        assert!(!bus.job_exists("j1"));
    }

    #[tokio::test]
    async fn subscriber_presence_blocks_reaping() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        bus.publish(
            "j1",
            EventPayload::Done {
                status: JobStatus::Complete,
                exit_code: 0,
                stats: None,
                error: None,
            },
        );
        let _rx = bus.subscribe("j1", 0).unwrap();

        {
            let mut jobs = bus.inner.jobs.lock();
            jobs.get_mut("j1").unwrap().reapable_since =
                Some(Instant::now() - DEFAULT_REAP_GRACE * 2);
        }
        assert!(bus.sweep().is_empty());
        assert!(bus.job_exists("j1"));
    }

    #[test]
    fn percent_is_clamped_and_absent_for_unknown_total() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        let publisher = bus.publisher("j1");
        publisher.register("t1", "x", 0);
        publisher.progress("t1", 10, None);
        publisher.progress("t1", 10, Some(4));

        let jobs = bus.inner.jobs.lock();
        let log = jobs.get("j1").unwrap();
        match &log.events[1].payload {
            EventPayload::Progress { percent, .. } => assert!(percent.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        match &log.events[2].payload {
            EventPayload::Progress { percent, .. } => assert_eq!(*percent, Some(100)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let event = Event {
            job_id: "j1".to_string(),
            seq: 7,
            ts: 1700000000000,
            payload: EventPayload::Duplicate {
                prompt_id: "p1".to_string(),
                path: "/out/Song.mp3".to_string(),
                filename: "Song.mp3".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "duplicate");
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["promptId"], "p1");

        let resolved = Event {
            job_id: "j1".to_string(),
            seq: 8,
            ts: 1700000000001,
            payload: EventPayload::DuplicateResolved {
                prompt_id: "p1".to_string(),
            },
        };
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["type"], "duplicate-resolved");

        let done = Event {
            job_id: "j1".to_string(),
            seq: 9,
            ts: 1700000000002,
            payload: EventPayload::Done {
                status: JobStatus::Complete,
                exit_code: 0,
                stats: Some(JobStats {
                    total: 1,
                    succeeded: 1,
                    failed: 0,
                    skipped: 0,
                }),
                error: None,
            },
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["stats"]["succeeded"], 1);
    }

    #[tokio::test]
    async fn snapshot_omits_seq_but_carries_last_seq() {
        let bus = ProgressBus::new();
        bus.create_job("j1");
        bus.publish("j1", log_event("x"));
        let mut rx = bus.subscribe("j1", u64::MAX).unwrap();
        let events = drain(&mut rx);
        let json = serde_json::to_value(events[0].as_ref()).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert!(json.get("seq").is_none());
        assert_eq!(json["lastSeq"], 1);
    }

    proptest::proptest! {
        #[test]
        fn replay_from_any_since_is_gap_free(publishes in 1usize..64, since in 0u64..80) {
            let bus = ProgressBus::new();
            bus.create_job("j1");
            for i in 0..publishes {
                bus.publish("j1", EventPayload::Log {
                    level: LogLevel::Debug,
                    message: format!("m{i}"),
                });
            }
            let mut rx = bus.subscribe("j1", since).unwrap();
            let mut events = Vec::new();
            while let Ok(e) = rx.try_recv() {
                events.push(e);
            }
            let is_snapshot = matches!(events[0].payload, EventPayload::Snapshot { .. });
            proptest::prop_assert!(is_snapshot);
            let seqs: Vec<u64> = events[1..].iter().map(|e| e.seq).collect();
            let expected: Vec<u64> = ((since + 1)..=(publishes as u64)).collect();
            proptest::prop_assert_eq!(seqs, expected);
        }
    }
}
