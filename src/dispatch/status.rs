// src/dispatch/status.rs

//! Job status sources.
//!
//! Jobs report progress by appending lines to their status file and, on
//! push platforms, to an inbox file the scheduler watches. Both routes end
//! up as [`JobEvent::Message`] events on the runtime channel:
//!
//! - [`PollStatusSource`] reads status files on the job host on demand;
//! - [`PushStatusSource`] follows the local inbox directory with `notify`.
//!
//! A message is reported once per job whichever route sees it first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::dispatcher::RemoteContext;
use crate::dispatch::job::{JobEvent, JobFailure, JobKey, JobRef};
use crate::dispatch::job_file::{
    self, JobPaths, EXIT_SUCCEEDED, STATUS_EXIT, STATUS_EXIT_TIME, STATUS_INIT_TIME, STATUS_JOB_ID,
    STATUS_MESSAGE,
};
use crate::dispatch::remote::shell_quote;
use crate::engine::RuntimeEvent;
use crate::fs::FileSystem;
use crate::platform::PlatformDef;
use crate::types::{CyclingMode, Severity};

const STATUS_MARK: &str = "[STATUS]";

/// Message names with fixed meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMessageKind {
    Started,
    Succeeded,
    /// `failed/<reason>`; carries the reason.
    Failed(String),
    Custom,
}

pub fn classify(message: &str) -> JobMessageKind {
    let message = message.trim();
    match message {
        "started" => JobMessageKind::Started,
        "succeeded" => JobMessageKind::Succeeded,
        "failed" => JobMessageKind::Failed(message.to_string()),
        _ => match message.strip_prefix("failed/") {
            Some(reason) => JobMessageKind::Failed(reason.to_string()),
            None => JobMessageKind::Custom,
        },
    }
}

/// One `<time>|<severity>|<message>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLine {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

pub fn parse_message_line(line: &str) -> Option<MessageLine> {
    let mut parts = line.trim_end().splitn(3, '|');
    let at = DateTime::parse_from_rfc3339(parts.next()?.trim()).ok()?.with_timezone(&Utc);
    let severity = parts.next()?.parse().ok()?;
    let message = parts.next()?.to_string();
    Some(MessageLine { at, severity, message })
}

/// How a job finished, according to its status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    Succeeded,
    Failed(String),
}

/// Parsed content of a `job.status` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub init_time: Option<String>,
    pub exit: Option<JobExit>,
    pub exit_time: Option<String>,
    pub job_id: Option<String>,
    /// Raw message lines in file order.
    pub messages: Vec<String>,
}

pub fn parse_status_file(text: &str) -> JobStatus {
    let mut status = JobStatus::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            STATUS_INIT_TIME => status.init_time = Some(value.to_string()),
            STATUS_EXIT_TIME => status.exit_time = Some(value.to_string()),
            STATUS_JOB_ID => status.job_id = Some(value.to_string()),
            STATUS_EXIT => {
                status.exit = Some(if value == EXIT_SUCCEEDED {
                    JobExit::Succeeded
                } else {
                    JobExit::Failed(value.to_string())
                });
            }
            STATUS_MESSAGE => status.messages.push(value.to_string()),
            _ => {}
        }
    }
    status
}

/// Message lines already reported, per job.
#[derive(Debug, Default)]
pub struct SeenMessages {
    seen: Mutex<HashMap<JobKey, BTreeSet<String>>>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `line` is offered for `key`.
    pub fn first_time(&self, key: &JobKey, line: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.entry(key.clone()).or_default().insert(line.to_string())
    }

    pub fn forget(&self, key: &JobKey) {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.remove(key);
    }
}

/// Turn raw message lines into events, skipping ones already reported.
fn message_events(key: &JobKey, lines: &[String], seen: &SeenMessages) -> Vec<JobEvent> {
    let mut events = Vec::new();
    for raw in lines {
        if raw.trim().is_empty() || !seen.first_time(key, raw.trim_end()) {
            continue;
        }
        match parse_message_line(raw) {
            Some(line) => events.push(JobEvent::Message {
                key: key.clone(),
                message: line.message,
                severity: line.severity,
                at: line.at,
            }),
            None => warn!(job = %key, line = %raw, "unparseable job message"),
        }
    }
    events
}

/// Something that finds out what jobs are doing and reports it on the
/// runtime channel.
pub trait JobStatusSource: Send + Sync {
    fn check<'a>(&'a self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

async fn send(events: &mpsc::Sender<RuntimeEvent>, ev: JobEvent) {
    if let Err(err) = events.send(RuntimeEvent::Job(ev)).await {
        debug!(error = %err, "runtime channel closed; dropping job event");
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Reads status files and batch-system state on the job hosts.
pub struct PollStatusSource {
    ctx: Arc<RemoteContext>,
    seen: Arc<SeenMessages>,
}

impl std::fmt::Debug for PollStatusSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollStatusSource").finish_non_exhaustive()
    }
}

impl PollStatusSource {
    pub fn new(ctx: Arc<RemoteContext>, seen: Arc<SeenMessages>) -> Self {
        Self { ctx, seen }
    }

    /// One bash snippet: batch-system listing first, then every status file
    /// behind a `[STATUS] <job>` marker.
    fn poll_script(&self, platform: &PlatformDef, jobs: &[JobRef]) -> String {
        let run_root = self.ctx.run_root(platform);
        let ids: Vec<String> = jobs.iter().filter_map(|j| j.job_id.clone()).collect();
        let mut s = String::new();
        if !ids.is_empty() {
            s.push_str(&platform.batch_system.poll_command(&ids));
            s.push('\n');
        }
        for job in jobs {
            let paths = JobPaths::new(&run_root, &job.key);
            s.push_str(&format!(
                "echo {}\ncat {} 2>/dev/null || true\n",
                shell_quote(&format!("{STATUS_MARK} {}", job.key)),
                shell_quote(&paths.status)
            ));
        }
        s
    }

    async fn check_platform(&self, platform_name: String, jobs: Vec<JobRef>) {
        let Some(platform) = self.ctx.selector.registry().platform(&platform_name).cloned() else {
            for job in jobs {
                let failure = JobFailure::PollFailed(format!("unknown platform {platform_name}"));
                send(&self.ctx.events, JobEvent::Failed { key: job.key, failure }).await;
            }
            return;
        };
        let script = self.poll_script(&platform, &jobs);
        let ssh = self.ctx.ssh_for(&platform).to_vec();
        let _permit = match self.ctx.permits.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let runner = Arc::clone(&self.ctx.runner);
        let result = self
            .ctx
            .selector
            .first_reachable(&platform_name, |cand| {
                let runner = Arc::clone(&runner);
                let script = script.clone();
                let ssh = ssh.clone();
                async move { runner.run(&cand.host, &ssh, &script).await }
            })
            .await;

        match result {
            Ok((cand, output)) => {
                debug!(platform = %platform_name, host = %cand.host, jobs = jobs.len(), "poll complete");
                for ev in interpret_poll(&platform, &jobs, &output.stdout, &self.seen) {
                    send(&self.ctx.events, ev).await;
                }
            }
            Err(err) => {
                warn!(platform = %platform_name, error = %err, jobs = jobs.len(), "poll failed; will poll again");
                for job in jobs {
                    let failure = JobFailure::PollFailed(err.to_string());
                    send(&self.ctx.events, JobEvent::Failed { key: job.key, failure }).await;
                }
            }
        }
    }
}

/// Split poll output into the batch-system listing and per-job status text.
fn split_poll_output(stdout: &str) -> (String, BTreeMap<String, String>) {
    let mut listing = String::new();
    let mut sections: BTreeMap<String, String> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in stdout.lines() {
        if let Some(job) = line.strip_prefix(STATUS_MARK) {
            let job = job.trim().to_string();
            sections.entry(job.clone()).or_default();
            current = Some(job);
            continue;
        }
        match &current {
            Some(job) => {
                let text = sections.entry(job.clone()).or_default();
                text.push_str(line);
                text.push('\n');
            }
            None => {
                listing.push_str(line);
                listing.push('\n');
            }
        }
    }
    (listing, sections)
}

/// Events implied by one poll's output.
pub fn interpret_poll(
    platform: &PlatformDef,
    jobs: &[JobRef],
    stdout: &str,
    seen: &SeenMessages,
) -> Vec<JobEvent> {
    let (listing, sections) = split_poll_output(stdout);
    let ids: Vec<String> = jobs.iter().filter_map(|j| j.job_id.clone()).collect();
    let alive = platform.batch_system.parse_poll(&listing, &ids);
    let now = Utc::now();

    let mut events = Vec::new();
    for job in jobs {
        let status = sections
            .get(&job.key.to_string())
            .map(|text| parse_status_file(text))
            .unwrap_or_default();
        let mut lines = status.messages.clone();
        let finished_reported = lines.iter().filter_map(|l| parse_message_line(l)).any(|l| {
            matches!(classify(&l.message), JobMessageKind::Succeeded | JobMessageKind::Failed(_))
        });

        match &status.exit {
            Some(exit) if !finished_reported => {
                // Killed hard after writing the exit line.
                let (severity, message) = match exit {
                    JobExit::Succeeded => (Severity::Info, "succeeded".to_string()),
                    JobExit::Failed(reason) => (Severity::Critical, format!("failed/{reason}")),
                };
                let at = status.exit_time.clone().unwrap_or_else(|| now.to_rfc3339());
                lines.push(format!("{at}|{severity}|{message}"));
            }
            None => {
                let gone = job
                    .job_id
                    .as_ref()
                    .is_some_and(|id| !alive.contains(id));
                if gone {
                    events.extend(message_events(&job.key, &lines, seen));
                    info!(job = %job.key, job_id = ?job.job_id, "job no longer known to the batch system and left no exit status");
                    events.push(JobEvent::Failed {
                        key: job.key.clone(),
                        failure: JobFailure::ExecutionFailed(
                            "job vanished from the batch system".to_string(),
                        ),
                    });
                    continue;
                }
            }
            _ => {}
        }
        events.extend(message_events(&job.key, &lines, seen));
    }
    events
}

impl JobStatusSource for PollStatusSource {
    fn check<'a>(&'a self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut by_platform: BTreeMap<String, Vec<JobRef>> = BTreeMap::new();
            for job in jobs {
                by_platform.entry(job.platform.clone()).or_default().push(job);
            }
            for (platform, jobs) in by_platform {
                self.check_platform(platform, jobs).await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Follows the local inbox directory.
///
/// Each inbox file is read from the offset reached last time, so appended
/// lines are seen exactly once.
#[derive(Debug)]
pub struct PushStatusSource {
    inbox: PathBuf,
    mode: CyclingMode,
    fs: Arc<dyn FileSystem>,
    offsets: Mutex<HashMap<PathBuf, usize>>,
    seen: Arc<SeenMessages>,
    events: mpsc::Sender<RuntimeEvent>,
}

/// Keeps the inbox watcher alive; dropping it stops the watch.
pub struct InboxWatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for InboxWatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxWatcherHandle").finish()
    }
}

impl PushStatusSource {
    pub fn new(
        run_dir: &Path,
        mode: CyclingMode,
        fs: Arc<dyn FileSystem>,
        seen: Arc<SeenMessages>,
        events: mpsc::Sender<RuntimeEvent>,
    ) -> Self {
        Self {
            inbox: job_file::inbox_dir(run_dir),
            mode,
            fs,
            offsets: Mutex::new(HashMap::new()),
            seen,
            events,
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// New message events from one inbox file.
    pub fn read_file(&self, path: &Path) -> Vec<JobEvent> {
        let Some(key) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| job_file::parse_inbox_file_name(n, self.mode))
        else {
            return Vec::new();
        };
        let text = match self.read_all(path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = ?path, error = %err, "inbox file not readable yet");
                return Vec::new();
            }
        };
        let mut offsets = self.offsets.lock().unwrap_or_else(|p| p.into_inner());
        let offset = offsets.entry(path.to_path_buf()).or_insert(0);
        if text.len() < *offset {
            *offset = 0;
        }
        // Only complete lines; a partial write is picked up next time.
        let fresh = &text[*offset..];
        let complete = fresh.rfind('\n').map_or(0, |i| i + 1);
        let lines: Vec<String> = fresh[..complete].lines().map(str::to_string).collect();
        *offset += complete;
        drop(offsets);
        message_events(&key, &lines, &self.seen)
    }

    fn read_all(&self, path: &Path) -> Result<String> {
        let mut text = String::new();
        self.fs.open_read(path)?.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Read every inbox file once, e.g. after a restart.
    pub fn scan(&self) -> Vec<JobEvent> {
        if !self.fs.is_dir(&self.inbox) {
            return Vec::new();
        }
        let mut files = match self.fs.read_dir(&self.inbox) {
            Ok(files) => files,
            Err(err) => {
                warn!(inbox = ?self.inbox, error = %err, "cannot list inbox");
                return Vec::new();
            }
        };
        files.sort();
        files.iter().flat_map(|f| self.read_file(f)).collect()
    }

    async fn forward(&self, events: Vec<JobEvent>) {
        for ev in events {
            send(&self.events, ev).await;
        }
    }

    /// Start following the inbox directory.
    pub fn spawn_watcher(self: Arc<Self>) -> Result<InboxWatcherHandle> {
        std::fs::create_dir_all(&self.inbox)?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(err) = event_tx.send(event) {
                        eprintln!("cyclorama: failed to forward inbox event: {err}");
                    }
                }
                Err(err) => eprintln!("cyclorama: inbox watch error: {err}"),
            },
            Config::default(),
        )?;
        watcher.watch(&self.inbox, RecursiveMode::NonRecursive)?;
        info!(inbox = ?self.inbox, "watching job message inbox");

        let source = Arc::clone(&self);
        tokio::spawn(async move {
            source.forward(source.scan()).await;
            while let Some(event) = event_rx.recv().await {
                for path in event.paths {
                    let events = source.read_file(&path);
                    source.forward(events).await;
                }
            }
            debug!("inbox watcher loop finished");
        });

        Ok(InboxWatcherHandle { _inner: watcher })
    }
}

impl JobStatusSource for PushStatusSource {
    fn check<'a>(&'a self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for job in jobs {
                let path = self.inbox.join(job_file::inbox_file_name(&job.key));
                let events = self.read_file(&path);
                self.forward(events).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;
    use crate::dispatch::batch_system::BatchSystemKind;
    use crate::fs::mock::MockFileSystem;
    use crate::task::TaskId;

    fn key(name: &str, n: u32) -> JobKey {
        JobKey::new(TaskId::new(name, CyclePoint::Integer(1)), n)
    }

    fn job(name: &str, id: Option<&str>) -> JobRef {
        JobRef {
            key: key(name, 1),
            platform: "hpc".into(),
            host: None,
            job_id: id.map(str::to_string),
        }
    }

    fn slurm() -> PlatformDef {
        let mut p = PlatformDef::localhost();
        p.name = "hpc".into();
        p.batch_system = BatchSystemKind::Slurm;
        p
    }

    #[test]
    fn classifies_messages() {
        assert_eq!(classify("started"), JobMessageKind::Started);
        assert_eq!(classify("failed/EXIT:3"), JobMessageKind::Failed("EXIT:3".into()));
        assert_eq!(classify("failed"), JobMessageKind::Failed("failed".into()));
        assert_eq!(classify("data ready"), JobMessageKind::Custom);
    }

    #[test]
    fn parses_status_file() {
        let text = "JOB_INIT_TIME=2024-01-01T00:00:00Z\n\
                    JOB_MESSAGE=2024-01-01T00:00:00Z|INFO|started\n\
                    JOB_EXIT=ERR:2\n\
                    JOB_EXIT_TIME=2024-01-01T00:01:00Z\n";
        let status = parse_status_file(text);
        assert_eq!(status.exit, Some(JobExit::Failed("ERR:2".into())));
        assert_eq!(status.messages.len(), 1);
        let line = parse_message_line(&status.messages[0]).unwrap();
        assert_eq!(line.severity, Severity::Info);
        assert_eq!(line.message, "started");
    }

    #[test]
    fn poll_reports_each_message_once_and_detects_vanished_jobs() {
        let seen = SeenMessages::new();
        let jobs = vec![job("a", Some("11")), job("b", Some("12"))];
        let stdout = "11\n\
            [STATUS] 1/a/01\n\
            JOB_MESSAGE=2024-01-01T00:00:00Z|INFO|started\n\
            [STATUS] 1/b/01\n\
            JOB_MESSAGE=2024-01-01T00:00:00Z|INFO|started\n";

        let events = interpret_poll(&slurm(), &jobs, stdout, &seen);
        // a: started. b: started, then vanished.
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[2],
            JobEvent::Failed { failure: JobFailure::ExecutionFailed(_), .. }
        ));

        let again = interpret_poll(&slurm(), &jobs[..1], stdout, &seen);
        assert!(again.is_empty());
    }

    #[test]
    fn exit_without_finish_message_is_synthesised() {
        let seen = SeenMessages::new();
        let jobs = vec![job("a", Some("11"))];
        let stdout = "[STATUS] 1/a/01\nJOB_EXIT=SUCCEEDED\nJOB_EXIT_TIME=2024-01-01T00:01:00Z\n";
        let events = interpret_poll(&slurm(), &jobs, stdout, &seen);
        assert!(matches!(&events[..], [JobEvent::Message { message, .. }] if message == "succeeded"));
    }

    #[test]
    fn push_source_reads_appended_lines_once() {
        let fs = MockFileSystem::new();
        let (tx, _rx) = mpsc::channel(8);
        let source = PushStatusSource::new(
            Path::new("/run"),
            CyclingMode::Integer,
            Arc::new(fs.clone()),
            Arc::new(SeenMessages::new()),
            tx,
        );
        let path = source.inbox().join("1__a__01.msg");
        fs.add_file(&path, "2024-01-01T00:00:00Z|INFO|started\n2024-01-01T00:00:05Z|INFO|half");
        assert_eq!(source.read_file(&path).len(), 1);

        fs.add_file(
            &path,
            "2024-01-01T00:00:00Z|INFO|started\n2024-01-01T00:00:05Z|INFO|half\n",
        );
        let events = source.read_file(&path);
        assert!(matches!(&events[..], [JobEvent::Message { message, .. }] if message == "half"));
        assert!(source.read_file(&path).is_empty());
    }
}
