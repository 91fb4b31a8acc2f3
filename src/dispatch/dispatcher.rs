// src/dispatch/dispatcher.rs

//! The job dispatcher: submission, polling and kill against platforms.
//!
//! The control loop hands batches of jobs to a [`JobBackend`] and moves on;
//! every remote call runs on a background Tokio task bounded by the process
//! pool semaphore, and results come back as [`JobEvent`]s on the runtime
//! channel.
//!
//! Submission of a batch:
//!
//! 1. resolve each job's platform (dynamic expressions via the resolver);
//! 2. group by platform or group name and chunk by `max_batch_submit_size`;
//! 3. per chunk, pick a host with [`PlatformSelector::first_reachable`],
//!    run remote init there once, then one bash script that writes and
//!    submits every job script of the chunk.
//!
//! Unreachable hosts fail over to the next candidate; a rejected command
//! rules out the platform (see [`RemoteError`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::job::{JobEvent, JobFailure, JobKey, JobRef, JobSpec};
use crate::dispatch::job_file::{self, JobPaths, JobScript};
use crate::dispatch::remote::{RemoteError, RemoteRunner};
use crate::dispatch::remote_init::RemoteInit;
use crate::dispatch::status::{JobStatusSource, PollStatusSource, SeenMessages};
use crate::engine::RuntimeEvent;
use crate::errors::Result;
use crate::platform::model::LOCALHOST;
use crate::platform::resolver::PlatformResolver;
use crate::platform::{PlatformDef, PlatformSelector, PlatformSpec, SelectError};
use crate::types::CommunicationMethod;

const JOB_MARK: &str = "[JOB]";
const EXIT_MARK: &str = "[EXIT]";

/// How the control loop talks to whatever runs jobs.
///
/// Production uses [`JobDispatcher`]; tests plug in a fake that answers
/// with scripted events.
pub trait JobBackend: Send {
    fn submit(&mut self, jobs: Vec<JobSpec>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn poll(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn kill(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// What every remote operation needs.
pub struct RemoteContext {
    pub selector: PlatformSelector,
    pub runner: Arc<dyn RemoteRunner>,
    /// Scheduler-wide ssh command; platforms may override it.
    pub ssh_command: Vec<String>,
    pub run_dir: PathBuf,
    /// Bounds concurrent remote commands.
    pub permits: Arc<Semaphore>,
    pub events: mpsc::Sender<RuntimeEvent>,
}

impl fmt::Debug for RemoteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteContext")
            .field("selector", &self.selector)
            .field("run_dir", &self.run_dir)
            .finish_non_exhaustive()
    }
}

impl RemoteContext {
    pub fn ssh_for<'a>(&'a self, platform: &'a PlatformDef) -> &'a [String] {
        platform.ssh_command.as_deref().unwrap_or(&self.ssh_command)
    }

    /// Run directory as seen from `platform`'s hosts.
    pub fn run_root(&self, platform: &PlatformDef) -> String {
        platform
            .remote_run_dir
            .clone()
            .unwrap_or_else(|| self.run_dir.to_string_lossy().into_owned())
    }

    pub async fn send(&self, ev: JobEvent) {
        if let Err(err) = self.events.send(RuntimeEvent::Job(ev)).await {
            debug!(error = %err, "runtime channel closed; dropping job event");
        }
    }
}

/// Cancellation handle held by an in-flight submission.
struct CancelFlag {
    rx: oneshot::Receiver<()>,
    fired: bool,
    /// The dispatcher let go of the sender; no kill can arrive any more.
    detached: bool,
}

impl CancelFlag {
    fn new(rx: oneshot::Receiver<()>) -> Self {
        Self {
            rx,
            fired: false,
            detached: false,
        }
    }

    fn is_cancelled(&mut self) -> bool {
        if !self.fired && !self.detached {
            match self.rx.try_recv() {
                Ok(()) => self.fired = true,
                Err(oneshot::error::TryRecvError::Closed) => self.detached = true,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        self.fired
    }

    /// Resolves once a kill arrives; never resolves for a detached flag.
    async fn cancelled(&mut self) {
        if !self.fired && !self.detached {
            match (&mut self.rx).await {
                Ok(()) => self.fired = true,
                Err(_) => self.detached = true,
            }
        }
        if !self.fired {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves once every flag has fired.
async fn all_cancelled(flags: &mut [CancelFlag]) {
    for flag in flags.iter_mut() {
        flag.cancelled().await;
    }
}

struct PendingJob {
    spec: JobSpec,
    cancel: CancelFlag,
}

/// Production [`JobBackend`].
pub struct JobDispatcher {
    ctx: Arc<RemoteContext>,
    resolver: Arc<dyn PlatformResolver>,
    remote_init: Arc<RemoteInit>,
    poller: Arc<PollStatusSource>,
    seen: Arc<SeenMessages>,
    /// Submissions not yet returned, for operator kill.
    in_flight: HashMap<JobKey, oneshot::Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("ctx", &self.ctx)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(
        ctx: RemoteContext,
        resolver: Arc<dyn PlatformResolver>,
        remote_init: RemoteInit,
        seen: Arc<SeenMessages>,
    ) -> Self {
        let ctx = Arc::new(ctx);
        let poller = Arc::new(PollStatusSource::new(Arc::clone(&ctx), Arc::clone(&seen)));
        Self {
            ctx,
            resolver,
            remote_init: Arc::new(remote_init),
            poller,
            seen,
            in_flight: HashMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<RemoteContext> {
        &self.ctx
    }

    fn reap(&mut self) {
        self.in_flight.retain(|_, tx| !tx.is_closed());
        self.workers.retain(|h| !h.is_finished());
    }

    fn spawn(&mut self, fut: impl Future<Output = ()> + Send + 'static) {
        self.workers.push(tokio::spawn(fut));
    }

    /// Abort every background worker; used on shutdown.
    pub fn abort_all(&mut self) {
        for h in self.workers.drain(..) {
            h.abort();
        }
        self.in_flight.clear();
    }
}

impl JobBackend for JobDispatcher {
    fn submit(&mut self, jobs: Vec<JobSpec>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.reap();
            if jobs.is_empty() {
                return Ok(());
            }
            let mut pending = Vec::with_capacity(jobs.len());
            for spec in jobs {
                let (tx, rx) = oneshot::channel();
                self.seen.forget(&spec.key);
                self.in_flight.insert(spec.key.clone(), tx);
                pending.push(PendingJob {
                    spec,
                    cancel: CancelFlag::new(rx),
                });
            }
            debug!(jobs = pending.len(), "dispatching submission batch");
            let submission = Submission {
                ctx: Arc::clone(&self.ctx),
                resolver: Arc::clone(&self.resolver),
                remote_init: Arc::clone(&self.remote_init),
            };
            self.spawn(async move { submission.run(pending).await });
            Ok(())
        })
    }

    fn poll(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.reap();
            let mut by_platform: BTreeMap<String, Vec<JobRef>> = BTreeMap::new();
            for job in jobs {
                by_platform.entry(job.platform.clone()).or_default().push(job);
            }
            for (_, jobs) in by_platform {
                let poller = Arc::clone(&self.poller);
                self.spawn(async move { poller.check(jobs).await });
            }
            Ok(())
        })
    }

    fn kill(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.reap();
            for job in jobs {
                if let Some(tx) = self.in_flight.remove(&job.key) {
                    if tx.send(()).is_ok() {
                        // The submission worker reports Killed itself, or
                        // kills the job through its batch system once the
                        // submit command returns with a job id.
                        info!(job = %job.key, "cancelling in-flight submission");
                        continue;
                    }
                }
                let ctx = Arc::clone(&self.ctx);
                self.spawn(async move { kill_job(&ctx, job).await });
            }
            Ok(())
        })
    }
}

/// Kill a submitted job through its batch system.
async fn kill_job(ctx: &RemoteContext, job: JobRef) {
    let Some(job_id) = job.job_id.clone() else {
        debug!(job = %job.key, "no job id to kill");
        ctx.send(JobEvent::Killed { key: job.key }).await;
        return;
    };
    let Some(platform) = ctx.selector.registry().platform(&job.platform).cloned() else {
        let reason = format!("unknown platform {}", job.platform);
        ctx.send(JobEvent::KillFailed { key: job.key, reason }).await;
        return;
    };
    let script = platform.batch_system.kill_command(&job_id);
    let ssh = ctx.ssh_for(&platform).to_vec();
    let Ok(_permit) = ctx.permits.acquire().await else {
        return;
    };
    let runner = Arc::clone(&ctx.runner);
    let result = ctx
        .selector
        .first_reachable(&job.platform, |cand| {
            let runner = Arc::clone(&runner);
            let (script, ssh) = (script.clone(), ssh.clone());
            async move { runner.run(&cand.host, &ssh, &script).await }
        })
        .await;
    match result {
        Ok((cand, _)) => {
            info!(job = %job.key, job_id, host = %cand.host, "job killed");
            ctx.send(JobEvent::Killed { key: job.key }).await;
        }
        Err(err) => {
            warn!(job = %job.key, job_id, error = %err, "kill failed");
            ctx.send(JobEvent::KillFailed {
                key: job.key,
                reason: err.to_string(),
            })
            .await;
        }
    }
}

/// Outcome of one job within a batched submission script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub exit: Option<i32>,
    pub output: String,
}

/// Split the output of a batched submission into per-job sections.
pub fn parse_submit_output(stdout: &str) -> BTreeMap<String, SubmitResult> {
    let mut results = BTreeMap::new();
    let mut current: Option<(String, String)> = None;
    for line in stdout.lines() {
        if let Some(job) = line.strip_prefix(JOB_MARK) {
            current = Some((job.trim().to_string(), String::new()));
        } else if let Some(code) = line.strip_prefix(EXIT_MARK) {
            if let Some((job, output)) = current.take() {
                results.insert(
                    job,
                    SubmitResult {
                        exit: code.trim().parse().ok(),
                        output,
                    },
                );
            }
        } else if let Some((_, output)) = current.as_mut() {
            output.push_str(line);
            output.push('\n');
        }
    }
    results
}

/// Everything a submission worker needs, detached from the dispatcher.
struct Submission {
    ctx: Arc<RemoteContext>,
    resolver: Arc<dyn PlatformResolver>,
    remote_init: Arc<RemoteInit>,
}

impl Submission {
    async fn run(self, jobs: Vec<PendingJob>) {
        let mut by_target: BTreeMap<String, Vec<PendingJob>> = BTreeMap::new();
        for mut job in jobs {
            if job.cancel.is_cancelled() {
                self.ctx.send(JobEvent::Killed { key: job.spec.key }).await;
                continue;
            }
            match self.target_of(&job.spec).await {
                Ok(target) => by_target.entry(target).or_default().push(job),
                Err(reason) => {
                    warn!(job = %job.spec.key, reason, "cannot determine platform");
                    self.submit_failed(&job.spec.key, reason).await;
                }
            }
        }

        let this = Arc::new(self);
        let mut groups = Vec::new();
        for (target, jobs) in by_target {
            let this = Arc::clone(&this);
            groups.push(tokio::spawn(async move { this.submit_target(target, jobs).await }));
        }
        for g in groups {
            if let Err(err) = g.await {
                warn!(error = %err, "submission worker panicked");
            }
        }
    }

    async fn submit_failed(&self, key: &JobKey, reason: String) {
        self.ctx
            .send(JobEvent::Failed {
                key: key.clone(),
                failure: JobFailure::SubmitFailed(reason),
            })
            .await;
    }

    /// Platform or group name the job goes to.
    async fn target_of(&self, spec: &JobSpec) -> std::result::Result<String, String> {
        if let Some(name) = &spec.resolved_platform {
            return Ok(name.clone());
        }
        match &spec.platform {
            PlatformSpec::Local => Ok(LOCALHOST.to_string()),
            PlatformSpec::Named(name) => Ok(name.clone()),
            PlatformSpec::Dynamic(expr) => {
                let Ok(_permit) = self.ctx.permits.acquire().await else {
                    return Err("dispatcher shutting down".to_string());
                };
                let name = self
                    .resolver
                    .resolve(expr)
                    .await
                    .map_err(|e| format!("platform expression {expr} failed: {e:#}"))?;
                info!(job = %spec.key, expr, platform = %name, "platform resolved");
                self.ctx
                    .send(JobEvent::PlatformResolved {
                        key: spec.key.clone(),
                        platform: name.clone(),
                    })
                    .await;
                Ok(name)
            }
        }
    }

    fn chunk_size(&self, target: &str) -> usize {
        self.ctx
            .selector
            .registry()
            .candidates(target)
            .and_then(|c| c.platforms.iter().map(|p| p.max_batch_submit_size).min())
            .unwrap_or(1)
            .max(1)
    }

    async fn submit_target(&self, target: String, jobs: Vec<PendingJob>) {
        let size = self.chunk_size(&target);
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            let chunk: Vec<PendingJob> = jobs.by_ref().take(size).collect();
            self.submit_chunk(&target, chunk).await;
        }
    }

    /// Bash script writing and submitting every job of a chunk, with
    /// `[JOB] <key>` / `[EXIT] <code>` markers around each.
    fn chunk_script(&self, platform: &PlatformDef, specs: &[JobSpec]) -> String {
        let run_root = self.ctx.run_root(platform);
        let mut s = String::new();
        for spec in specs {
            let key = &spec.key;
            let paths = JobPaths::new(&run_root, key);
            let inbox = (platform.communication == CommunicationMethod::Push).then(|| {
                format!(
                    "{}/{}",
                    job_file::inbox_dir(Path::new(&run_root)).to_string_lossy(),
                    job_file::inbox_file_name(key)
                )
            });
            let script = JobScript {
                spec,
                paths: &paths,
                batch_system: platform.batch_system,
                platform: &platform.name,
                run_root: &run_root,
                inbox: inbox.as_deref(),
            };
            s.push_str(&format!("echo '{JOB_MARK} {key}'\n(\n"));
            s.push_str(&script.install_and_submit());
            s.push_str(&format!("\n) 2>&1\necho \"{EXIT_MARK} $?\"\n"));
        }
        s
    }

    async fn submit_chunk(&self, target: &str, chunk: Vec<PendingJob>) {
        let mut specs = Vec::with_capacity(chunk.len());
        let mut cancels = Vec::with_capacity(chunk.len());
        for mut job in chunk {
            if job.cancel.is_cancelled() {
                info!(job = %job.spec.key, "submission cancelled");
                self.ctx.send(JobEvent::Killed { key: job.spec.key }).await;
            } else {
                specs.push(job.spec);
                cancels.push(job.cancel);
            }
        }
        if specs.is_empty() {
            return;
        }

        let Ok(permit) = self.ctx.permits.acquire().await else {
            return;
        };
        let specs_ref = &specs;
        let selection = self
            .ctx
            .selector
            .first_reachable(target, move |cand| async move {
                let platform = self
                    .ctx
                    .selector
                    .registry()
                    .platform(&cand.platform)
                    .cloned()
                    .ok_or_else(|| RemoteError::Rejected {
                        host: cand.host.clone(),
                        code: None,
                        stderr: format!("unknown platform {}", cand.platform),
                    })?;
                let ssh = self.ctx.ssh_for(&platform).to_vec();
                let run_root = self.ctx.run_root(&platform);
                self.remote_init
                    .ensure(self.ctx.runner.as_ref(), &platform, &cand.host, &ssh, &run_root)
                    .await?;
                let script = self.chunk_script(&platform, specs_ref);
                let out = self.ctx.runner.run(&cand.host, &ssh, &script).await?;
                Ok((platform, out))
            });
        // Dropping the selection kills the running ssh child.
        let result = tokio::select! {
            result = selection => result,
            _ = all_cancelled(&mut cancels) => Err(SelectError::Cancelled),
        };
        drop(permit);

        let (cand, platform, output) = match result {
            Ok((cand, (platform, output))) => (cand, platform, output),
            Err(SelectError::Cancelled) => {
                info!(platform = %target, jobs = specs.len(), "submission cancelled during host selection");
                for spec in specs {
                    self.ctx.send(JobEvent::Killed { key: spec.key }).await;
                }
                return;
            }
            Err(err) => {
                for spec in specs {
                    self.submit_failed(&spec.key, err.to_string()).await;
                }
                return;
            }
        };

        let results = parse_submit_output(&output.stdout);
        let at = Utc::now();
        let mut to_kill = Vec::new();
        for (spec, mut cancel) in specs.into_iter().zip(cancels) {
            let key = spec.key;
            match results.get(&key.to_string()) {
                Some(SubmitResult { exit: Some(0), output }) => {
                    let job_id = platform.batch_system.parse_job_id(output);
                    if job_id.is_none() {
                        warn!(job = %key, output = %output.trim(), "submitted but no job id recognised");
                    }
                    info!(job = %key, platform = %cand.platform, host = %cand.host, job_id = ?job_id, "job submitted");
                    self.ctx
                        .send(JobEvent::Submitted {
                            key: key.clone(),
                            platform: cand.platform.clone(),
                            host: cand.host.clone(),
                            job_id: job_id.clone(),
                            at,
                        })
                        .await;
                    if cancel.is_cancelled() {
                        to_kill.push(JobRef {
                            key,
                            platform: cand.platform.clone(),
                            host: Some(cand.host.clone()),
                            job_id,
                        });
                    }
                }
                Some(SubmitResult { exit, output }) => {
                    let reason = format!(
                        "{} submission exited {}: {}",
                        platform.batch_system,
                        exit.map_or_else(|| "abnormally".to_string(), |c| c.to_string()),
                        output.trim()
                    );
                    self.submit_failed(&key, reason).await;
                }
                None => {
                    self.submit_failed(&key, "no submission result reported".to_string())
                        .await;
                }
            }
        }
        // Killed while the submission command was running.
        for job in to_kill {
            kill_job(&self.ctx, job).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_batched_submission_output() {
        let stdout = "[JOB] 1/a/01\nSubmitted batch job 7\n[EXIT] 0\n\
                      [JOB] 1/b/01\nsbatch: error: invalid partition\n[EXIT] 1\n\
                      [JOB] 1/c/01\n";
        let results = parse_submit_output(stdout);
        assert_eq!(results.len(), 2);
        assert_eq!(results["1/a/01"].exit, Some(0));
        assert_eq!(results["1/a/01"].output, "Submitted batch job 7\n");
        assert_eq!(results["1/b/01"].exit, Some(1));
        assert!(!results.contains_key("1/c/01"));
    }
}
