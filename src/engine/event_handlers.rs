// src/engine/event_handlers.rs

//! Event handling for the core runtime: job outcomes, timers, operator
//! commands and event sink failures.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::dispatch::status::{classify, JobMessageKind};
use crate::dispatch::{JobEvent, JobFailure, JobKey, JobRef, JobSpec};
use crate::engine::core::CoreRuntime;
use crate::engine::OperatorCommand;
use crate::platform::model::LOCALHOST;
use crate::pool::Snapshot;
use crate::retry::{RetryPolicy, ScheduleOutcome};
use crate::task::status::RESET_TARGETS;
use crate::task::{TaskEvent, TaskId, TaskProxy, TaskStatus};
use crate::types::Severity;

/// Command produced by the pure core, carried out by the IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand these jobs to the backend in one batch.
    Submit(Vec<JobSpec>),
    Poll(Vec<JobRef>),
    Kill(Vec<JobRef>),
    /// Pass task events to the event sink. Ids identify retries.
    EmitEvents(Vec<(u64, TaskEvent)>),
    Checkpoint(Box<Snapshot>),
    RequestExit(ExitReason),
}

/// What the core decided after one event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    pub keep_running: bool,
    /// Earliest timer deadline; the shell wakes the core then.
    pub next_wakeup: Option<Instant>,
}

/// Why the scheduler loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every task finished as expected and nothing is left to spawn.
    Completed,
    /// The workflow stalled and `abort_on_stall` is set.
    Stalled,
    /// Operator stop.
    Stopped,
    ShutdownRequested,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Completed => write!(f, "completed"),
            ExitReason::Stalled => write!(f, "stalled"),
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// Keys of the core's single retry queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKey {
    SubmitRetry(TaskId),
    ExecutionRetry(TaskId),
    SubmissionPoll(JobKey),
    ExecutionPoll(JobKey),
    TimeLimitPoll(JobKey),
    EventHandler(u64),
}

impl TimerKey {
    pub fn job(&self) -> Option<&JobKey> {
        match self {
            TimerKey::SubmissionPoll(k) | TimerKey::ExecutionPoll(k) | TimerKey::TimeLimitPoll(k) => Some(k),
            _ => None,
        }
    }
}

/// Poll/kill handle for a task's current job.
pub(super) fn job_ref(task: &TaskProxy) -> JobRef {
    JobRef {
        key: JobKey::new(task.id.clone(), task.submit_num()),
        platform: task
            .platform
            .clone()
            .or_else(|| task.resolved_platform.clone())
            .unwrap_or_else(|| LOCALHOST.to_string()),
        host: task.host.clone(),
        job_id: task.job_id.clone(),
    }
}

impl CoreRuntime {
    /// The job is the task's current attempt and still in flight.
    fn is_live(&self, key: &JobKey) -> bool {
        self.pool
            .get(&key.task)
            .is_some_and(|t| t.submit_num() == key.submit_num && t.status().is_active())
    }

    fn clear_job_timers(&mut self, key: &JobKey) {
        self.timers.reset_where(|k| k.job() == Some(key));
    }

    fn reset_task_timers(&mut self, id: &TaskId) {
        self.timers.reset(&TimerKey::SubmitRetry(id.clone()));
        self.timers.reset(&TimerKey::ExecutionRetry(id.clone()));
    }

    // ---- job outcomes ---------------------------------------------------

    pub(super) fn handle_job_event(&mut self, ev: JobEvent, now: Instant) {
        if !self.pool.contains(&ev.key().task) {
            debug!(job = %ev.key(), "event for a task no longer in the pool");
            return;
        }
        self.changed = true;
        match ev {
            JobEvent::PlatformResolved { key, platform } => {
                if let Some(task) = self.pool.get_mut(&key.task) {
                    if task.submit_num() == key.submit_num {
                        task.resolved_platform = Some(platform);
                    }
                }
            }
            JobEvent::Submitted {
                key,
                platform,
                host,
                job_id,
                at,
            } => self.job_submitted(&key, &platform, &host, job_id, at, now),
            JobEvent::Message {
                key,
                message,
                severity,
                at,
            } => self.job_message(&key, &message, severity, at, now),
            JobEvent::Failed { key, failure } => match failure {
                JobFailure::SubmitFailed(reason) => self.submit_failed(&key, &reason, now),
                JobFailure::ExecutionFailed(reason) => self.execution_failed(&key, &reason, Utc::now(), now),
                JobFailure::PollFailed(reason) => {
                    warn!(job = %key, reason, "poll failed; will poll again");
                }
            },
            JobEvent::Killed { key } => self.job_killed(&key),
            JobEvent::KillFailed { key, reason } => {
                self.kill_pending.remove(&key);
                warn!(job = %key, reason, "kill failed");
            }
        }
    }

    fn job_submitted(
        &mut self,
        key: &JobKey,
        platform: &str,
        host: &str,
        job_id: Option<String>,
        at: DateTime<Utc>,
        now: Instant,
    ) {
        let Some(task) = self.pool.get_mut(&key.task) else {
            return;
        };
        task.set_target(key.submit_num, platform, host);
        if !task.job_submitted(key.submit_num, job_id, at) {
            return;
        }
        let status = task.status();
        // A fresh execution attempt gets the full submission retry budget.
        self.timers.reset(&TimerKey::SubmitRetry(key.task.clone()));
        match status {
            TaskStatus::Submitted => self.arm_submission_poll(key, platform, now),
            TaskStatus::Running => self.arm_execution_polls(key, platform, now),
            _ => {}
        }
    }

    fn job_message(&mut self, key: &JobKey, message: &str, severity: Severity, at: DateTime<Utc>, now: Instant) {
        match classify(message) {
            JobMessageKind::Started => {
                let Some(task) = self.pool.get_mut(&key.task) else {
                    return;
                };
                if task.job_started(key.submit_num, at) {
                    if let Some(platform) = task.platform.clone() {
                        self.arm_execution_polls(key, &platform, now);
                    }
                }
            }
            JobMessageKind::Succeeded => {
                let done = self
                    .pool
                    .get_mut(&key.task)
                    .is_some_and(|t| t.job_succeeded(key.submit_num, at));
                if done {
                    self.clear_job_timers(key);
                }
            }
            JobMessageKind::Failed(reason) => self.execution_failed(key, &reason, at, now),
            JobMessageKind::Custom => {
                if let Some(task) = self.pool.get_mut(&key.task) {
                    task.job_message(key.submit_num, message, severity);
                }
            }
        }
    }

    fn execution_failed(&mut self, key: &JobKey, reason: &str, at: DateTime<Utc>, now: Instant) {
        if !self.is_live(key) {
            debug!(job = %key, reason, "failure for a job no longer live");
            return;
        }
        let retry = if self.kill_pending.remove(key) {
            None
        } else {
            let delays = self
                .runtime_of(&key.task)
                .map(|r| r.execution_retry_delays)
                .unwrap_or_default();
            Some(self.timers.schedule_with(
                TimerKey::ExecutionRetry(key.task.clone()),
                || RetryPolicy::new(delays),
                now,
            ))
        };
        self.clear_job_timers(key);
        if let Some(task) = self.pool.get_mut(&key.task) {
            task.job_failed(key.submit_num, reason, retry, at);
        }
    }

    fn submit_failed(&mut self, key: &JobKey, reason: &str, now: Instant) {
        if !self.is_live(key) {
            debug!(job = %key, reason, "submission failure for a job no longer live");
            return;
        }
        let retry_key = TimerKey::SubmitRetry(key.task.clone());
        let retry = if self.kill_pending.remove(key) {
            ScheduleOutcome::Exhausted {
                attempts: self.timers.attempts(&retry_key),
            }
        } else {
            let delays = self
                .runtime_of(&key.task)
                .map(|r| r.submission_retry_delays)
                .unwrap_or_default();
            self.timers
                .schedule_with(retry_key, || RetryPolicy::new(delays), now)
        };
        self.clear_job_timers(key);
        if let Some(task) = self.pool.get_mut(&key.task) {
            task.job_submit_failed(key.submit_num, reason, retry);
        }
    }

    fn job_killed(&mut self, key: &JobKey) {
        let requested = self.kill_pending.remove(key);
        if !self.is_live(key) {
            return;
        }
        if !requested {
            debug!(job = %key, "job reported killed without a kill request");
        }
        self.clear_job_timers(key);
        let attempts = self.timers.attempts(&TimerKey::SubmitRetry(key.task.clone()));
        let Some(task) = self.pool.get_mut(&key.task) else {
            return;
        };
        if task.status() == TaskStatus::Ready {
            task.job_submit_failed(
                key.submit_num,
                "submission killed",
                ScheduleOutcome::Exhausted { attempts },
            );
        } else {
            task.job_failed(key.submit_num, "killed", None, Utc::now());
        }
    }

    // ---- polling ---------------------------------------------------------------

    pub(super) fn arm_submission_poll(&mut self, key: &JobKey, platform: &str, now: Instant) {
        let Some(def) = self.platforms.platform(platform) else {
            return;
        };
        if !def.polls() {
            return;
        }
        let timer = TimerKey::SubmissionPoll(key.clone());
        self.timers
            .set_policy(timer.clone(), RetryPolicy::repeating(def.submission_polling.clone()));
        self.timers.schedule(&timer, now);
    }

    /// Execution polls on poll platforms, and the time limit poll wherever
    /// an execution time limit is set.
    pub(super) fn arm_execution_polls(&mut self, key: &JobKey, platform: &str, now: Instant) {
        self.timers.reset(&TimerKey::SubmissionPoll(key.clone()));
        let Some(def) = self.platforms.platform(platform) else {
            return;
        };
        if def.polls() {
            let timer = TimerKey::ExecutionPoll(key.clone());
            self.timers
                .set_policy(timer.clone(), RetryPolicy::repeating(def.execution_polling.clone()));
            self.timers.schedule(&timer, now);
        }
        let limit = self
            .runtime_of(&key.task)
            .and_then(|r| r.execution_time_limit);
        if let Some(limit) = limit {
            let mut delays = def.time_limit_polling.clone();
            match delays.first_mut() {
                Some(first) => *first += limit,
                None => delays.push(limit),
            }
            let timer = TimerKey::TimeLimitPoll(key.clone());
            self.timers.set_policy(timer.clone(), RetryPolicy::repeating(delays));
            self.timers.schedule(&timer, now);
        }
    }

    // ---- timers ------------------------------------------------------------------

    pub(super) fn fire_timers(&mut self, now: Instant, commands: &mut Vec<CoreCommand>) {
        let due = self.timers.poll_due(now);
        if due.is_empty() {
            return;
        }
        self.changed = true;
        let mut polls = Vec::new();
        for timer in due {
            match &timer {
                TimerKey::SubmitRetry(id) | TimerKey::ExecutionRetry(id) => {
                    if let Some(task) = self.pool.get_mut(id) {
                        task.retry_due();
                    }
                }
                TimerKey::SubmissionPoll(job) | TimerKey::ExecutionPoll(job) | TimerKey::TimeLimitPoll(job) => {
                    let wanted = match timer {
                        TimerKey::SubmissionPoll(_) => TaskStatus::Submitted,
                        _ => TaskStatus::Running,
                    };
                    let task = self
                        .pool
                        .get(&job.task)
                        .filter(|t| t.submit_num() == job.submit_num && t.status() == wanted);
                    let Some(task) = task else {
                        self.timers.reset(&timer);
                        continue;
                    };
                    if matches!(timer, TimerKey::TimeLimitPoll(_)) {
                        warn!(job = %job, "execution time limit passed; polling job");
                    }
                    polls.push(job_ref(task));
                    self.timers.schedule(&timer, now);
                }
                TimerKey::EventHandler(id) => {
                    if let Some(event) = self.pending_handlers.remove(id) {
                        commands.push(CoreCommand::EmitEvents(vec![(*id, event)]));
                    }
                }
            }
        }
        if !polls.is_empty() {
            debug!(jobs = polls.len(), "polling jobs");
            commands.push(CoreCommand::Poll(polls));
        }
    }

    // ---- event handlers --------------------------------------------------------------

    pub(super) fn handle_sink_failure(&mut self, id: u64, event: TaskEvent, error: &str, now: Instant) {
        let timer = TimerKey::EventHandler(id);
        let delays = self.handler_delays.clone();
        match self
            .timers
            .schedule_with(timer.clone(), || RetryPolicy::new(delays), now)
        {
            ScheduleOutcome::Scheduled { delay, remaining, .. } => {
                warn!(
                    task = %event.task,
                    event = %event.kind,
                    error,
                    ?delay,
                    remaining = ?remaining,
                    "event handler failed; will retry"
                );
                self.pending_handlers.insert(id, event);
            }
            ScheduleOutcome::Exhausted { attempts } => {
                error!(
                    task = %event.task,
                    event = %event.kind,
                    error,
                    retries = attempts,
                    "event handler failed; no retries left"
                );
                self.timers.reset(&timer);
            }
        }
    }

    // ---- operator commands ------------------------------------------------------------

    pub(super) fn handle_command(
        &mut self,
        command: OperatorCommand,
        commands: &mut Vec<CoreCommand>,
    ) -> Result<usize, String> {
        info!(%command, "operator command");
        self.changed = true;
        match command {
            OperatorCommand::Hold { tasks } => {
                let ids = self.select(&tasks)?;
                Ok(ids
                    .iter()
                    .filter(|id| self.pool.get_mut(id).is_some_and(|t| t.hold()))
                    .count())
            }
            OperatorCommand::Release { tasks } => {
                let ids = self.select(&tasks)?;
                Ok(ids
                    .iter()
                    .filter(|id| self.pool.get_mut(id).is_some_and(|t| t.release()))
                    .count())
            }
            OperatorCommand::Trigger { tasks } => {
                let mut ids = self.select(&tasks)?;
                let mode = self.pool.definition().mode;
                for pattern in &tasks {
                    let Ok(id) = TaskId::parse(pattern, mode) else {
                        continue;
                    };
                    if !self.pool.contains(&id) && self.pool.spawn_task(&id) {
                        ids.push(id);
                    }
                }
                let mut count = 0;
                for id in ids {
                    if self.pool.get_mut(&id).is_some_and(|t| t.trigger()) {
                        self.reset_task_timers(&id);
                        self.pool.sync_ledger(&id);
                        count += 1;
                    }
                }
                Ok(count)
            }
            OperatorCommand::Reset { tasks, to } => {
                if !RESET_TARGETS.contains(&to) {
                    return Err(format!("cannot reset a task to {to}"));
                }
                let ids = self.select(&tasks)?;
                let mut count = 0;
                for id in ids {
                    if self.pool.get_mut(&id).is_some_and(|t| t.reset(to)) {
                        self.reset_task_timers(&id);
                        self.pool.sync_ledger(&id);
                        if to == TaskStatus::Waiting {
                            self.pool.rescan_task(&id);
                        }
                        count += 1;
                    }
                }
                Ok(count)
            }
            OperatorCommand::Kill { tasks } => {
                let ids = self.select(&tasks)?;
                let mut refs = Vec::new();
                let mut count = 0;
                for id in ids {
                    let Some(task) = self.pool.get_mut(&id) else {
                        continue;
                    };
                    let status = task.status();
                    if status.is_active() {
                        let job = job_ref(task);
                        self.kill_pending.insert(job.key.clone());
                        refs.push(job);
                        count += 1;
                    } else if status.is_retrying() && task.kill_retry("killed while waiting to retry") {
                        self.reset_task_timers(&id);
                        count += 1;
                    }
                }
                if !refs.is_empty() {
                    commands.push(CoreCommand::Kill(refs));
                }
                Ok(count)
            }
            OperatorCommand::Broadcast {
                point,
                namespace,
                key,
                value,
            } => {
                self.pool
                    .broadcasts_mut()
                    .put(point, &namespace, &key, &value)
                    .map_err(|e| e.to_string())?;
                Ok(1)
            }
            OperatorCommand::ClearBroadcast { point, namespace } => {
                Ok(self.pool.broadcasts_mut().clear(point, namespace.as_deref()))
            }
            OperatorCommand::Stop => {
                self.exit = Some(ExitReason::Stopped);
                Ok(0)
            }
        }
    }

    fn select(&self, patterns: &[String]) -> Result<Vec<TaskId>, String> {
        let ids = self.pool.matching(patterns).map_err(|e| e.to_string())?;
        if ids.is_empty() {
            debug!(?patterns, "no task in the pool matches");
        }
        Ok(ids)
    }
}
