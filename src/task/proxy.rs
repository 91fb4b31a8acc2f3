// src/task/proxy.rs

//! The task proxy: one task definition at one cycle point.
//!
//! The proxy owns its run state and reacts to two kinds of input:
//!
//! - scheduler decisions (`queue`, `begin_submit`, retry timers firing);
//! - job outcomes (`job_submitted`, `job_started`, `job_failed`, ...).
//!
//! Automatic transitions are checked against
//! [`TaskStatus::can_transition_to`]; an illegal one is a programming error
//! and panics. Operator commands (`hold`, `release`, `reset`, `trigger`) are
//! explicit external transitions: idempotent, logged, and allowed to move
//! the task backwards.
//!
//! Every transition queues a [`TaskEvent`] and every newly completed output
//! is queued for publication; the pool drains both after each step.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retry::ScheduleOutcome;
use crate::task::events::{TaskEvent, TaskEventKind};
use crate::task::outputs::{self, TaskOutputs};
use crate::task::prerequisite::{OutputRef, Prerequisite};
use crate::task::status::TaskStatus;
use crate::task::TaskId;
use crate::types::Severity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProxy {
    pub id: TaskId,
    status: TaskStatus,
    held: bool,
    /// Named queue this task is limited by.
    pub queue: String,
    prerequisites: Vec<Prerequisite>,
    suicide_prerequisites: Vec<Prerequisite>,
    outputs: TaskOutputs,
    /// Outputs that may legitimately not be completed.
    optional_outputs: BTreeSet<String>,
    /// Incremented on every submission attempt.
    submit_num: u32,
    /// Execution attempts since the last manual trigger or reset.
    try_num: u32,
    /// Set by an operator trigger: prerequisites are ignored for the next
    /// submission.
    manual_trigger: bool,
    pub platform: Option<String>,
    pub host: Option<String>,
    pub job_id: Option<String>,
    /// Platform name produced by a dynamic platform expression; cached for
    /// the life of the proxy.
    pub resolved_platform: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    events: Vec<TaskEvent>,
}

impl TaskProxy {
    pub fn new(id: TaskId, queue: impl Into<String>) -> Self {
        Self {
            id,
            status: TaskStatus::Waiting,
            held: false,
            queue: queue.into(),
            prerequisites: Vec::new(),
            suicide_prerequisites: Vec::new(),
            outputs: TaskOutputs::default(),
            optional_outputs: BTreeSet::new(),
            submit_num: 0,
            try_num: 0,
            manual_trigger: false,
            platform: None,
            host: None,
            job_id: None,
            resolved_platform: None,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            events: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: TaskOutputs, optional: BTreeSet<String>) -> Self {
        self.outputs = outputs;
        self.optional_outputs = optional;
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<Prerequisite>, suicide: Vec<Prerequisite>) -> Self {
        self.prerequisites = prerequisites;
        self.suicide_prerequisites = suicide;
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn submit_num(&self) -> u32 {
        self.submit_num
    }

    pub fn try_num(&self) -> u32 {
        self.try_num
    }

    pub fn is_manually_triggered(&self) -> bool {
        self.manual_trigger
    }

    pub fn outputs(&self) -> &TaskOutputs {
        &self.outputs
    }

    pub fn prerequisites(&self) -> &[Prerequisite] {
        &self.prerequisites
    }

    pub fn suicide_prerequisites(&self) -> &[Prerequisite] {
        &self.suicide_prerequisites
    }

    // ---- prerequisites --------------------------------------------------

    /// Apply a published upstream output. Returns whether any prerequisite
    /// (positive or suicide) changed.
    pub fn satisfy(&mut self, output: &OutputRef) -> bool {
        let mut changed = false;
        for p in self
            .prerequisites
            .iter_mut()
            .chain(self.suicide_prerequisites.iter_mut())
        {
            changed |= p.satisfy(output);
        }
        changed
    }

    /// All positive prerequisites are met (or an operator triggered it).
    pub fn prerequisites_satisfied(&self) -> bool {
        self.manual_trigger || self.prerequisites.iter().all(Prerequisite::is_satisfied)
    }

    /// Whether the positive prerequisites can still be met.
    pub fn prerequisites_satisfiable(&self) -> bool {
        self.manual_trigger || self.prerequisites.iter().all(Prerequisite::is_satisfiable)
    }

    pub fn suicide_fired(&self) -> bool {
        self.suicide_prerequisites.iter().any(Prerequisite::is_satisfied)
    }

    /// Every upstream output this task still waits on.
    pub fn awaited_outputs(&self) -> impl Iterator<Item = &OutputRef> {
        self.prerequisites
            .iter()
            .chain(self.suicide_prerequisites.iter())
            .flat_map(|p| p.unsatisfied())
    }

    // ---- drained by the pool ---------------------------------------------

    pub fn take_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_new_outputs(&mut self) -> Vec<OutputRef> {
        self.outputs
            .take_unpublished()
            .into_iter()
            .map(|o| OutputRef::new(self.id.clone(), o))
            .collect()
    }

    /// Finished with an unexpected outcome: failure of a task whose failure
    /// output is not marked optional, or submission failure likewise.
    pub fn is_incomplete(&self) -> bool {
        match self.status {
            TaskStatus::Failed => !self.optional_outputs.contains(outputs::FAILED),
            TaskStatus::SubmitFailed => !self.optional_outputs.contains(outputs::SUBMIT_FAILED),
            _ => false,
        }
    }

    // ---- internals --------------------------------------------------------

    fn emit(&mut self, kind: TaskEventKind, message: impl Into<String>, severity: Severity) {
        self.events.push(TaskEvent::new(
            self.id.clone(),
            kind,
            message,
            severity,
            self.submit_num,
        ));
    }

    fn set_status(&mut self, to: TaskStatus, reason: &str) {
        let from = self.status;
        if from == to {
            return;
        }
        assert!(
            from.can_transition_to(to),
            "illegal task state transition for {}: {from} -> {to} ({reason})",
            self.id
        );
        debug!(task = %self.id, %from, %to, reason, "task state change");
        self.status = to;
    }

    /// Out-of-band state change requested by an operator.
    fn force_status(&mut self, to: TaskStatus, reason: &str) {
        info!(task = %self.id, from = %self.status, %to, reason, "task state reset");
        self.status = to;
    }

    fn is_current(&self, submit_num: u32, what: &str) -> bool {
        if submit_num != self.submit_num {
            debug!(
                task = %self.id,
                submit_num,
                current = self.submit_num,
                what,
                "ignoring outcome of a superseded job"
            );
            return false;
        }
        true
    }

    // ---- scheduler-driven transitions --------------------------------------

    /// `waiting -> queued`.
    pub fn queue(&mut self) {
        assert!(
            self.prerequisites_satisfied(),
            "{} queued with unsatisfied prerequisites",
            self.id
        );
        self.set_status(TaskStatus::Queued, "prerequisites satisfied");
    }

    /// `queued -> waiting`, when an upstream reset invalidates what queued it.
    pub fn unqueue(&mut self) {
        self.set_status(TaskStatus::Waiting, "prerequisites no longer satisfied");
    }

    /// `queued -> ready`: a submission attempt starts. Returns the new
    /// submit number.
    pub fn begin_submit(&mut self) -> u32 {
        assert!(
            self.prerequisites_satisfied(),
            "{} selected for submission with unsatisfied prerequisites",
            self.id
        );
        self.set_status(TaskStatus::Ready, "selected for submission");
        self.submit_num += 1;
        self.job_id = None;
        self.submitted_at = None;
        self.started_at = None;
        self.finished_at = None;
        self.submit_num
    }

    /// A retry timer fired: back to the queue for resubmission.
    pub fn retry_due(&mut self) {
        if !self.status.is_retrying() {
            debug!(task = %self.id, status = %self.status, "retry timer fired for a task no longer retrying");
            return;
        }
        self.set_status(TaskStatus::Queued, "retry delay elapsed");
    }

    /// Suicide trigger fired or the task can never run.
    pub fn remove(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.set_status(TaskStatus::Removed, reason);
        self.emit(TaskEventKind::Removed, reason.to_string(), Severity::Warning);
    }

    pub fn expire(&mut self, reason: &str) {
        self.set_status(TaskStatus::Expired, reason);
        self.outputs.complete(outputs::EXPIRED);
        self.emit(TaskEventKind::Expired, reason.to_string(), Severity::Warning);
    }

    // ---- job outcomes ------------------------------------------------------

    /// Record the platform and host a submission attempt is using.
    pub fn set_target(&mut self, submit_num: u32, platform: &str, host: &str) {
        if self.is_current(submit_num, "target") {
            self.platform = Some(platform.to_string());
            self.host = Some(host.to_string());
        }
    }

    /// `ready -> submitted`. Returns false for a stale result.
    pub fn job_submitted(&mut self, submit_num: u32, job_id: Option<String>, at: DateTime<Utc>) -> bool {
        if !self.is_current(submit_num, "submitted") {
            return false;
        }
        if self.status != TaskStatus::Ready {
            // A start or finish message already overtook the submit result.
            self.job_id = job_id.or(self.job_id.take());
            self.outputs.complete(outputs::SUBMITTED);
            return true;
        }
        self.set_status(TaskStatus::Submitted, "job submitted");
        self.job_id = job_id;
        self.submitted_at = Some(at);
        self.outputs.complete(outputs::SUBMITTED);
        self.emit(
            TaskEventKind::Submitted,
            format!("job submitted to {}", self.host.as_deref().unwrap_or("localhost")),
            Severity::Info,
        );
        true
    }

    /// Submission failed. `retry` is the retry queue's answer for this task.
    pub fn job_submit_failed(&mut self, submit_num: u32, reason: &str, retry: ScheduleOutcome) -> bool {
        if !self.is_current(submit_num, "submit-failed") || !self.status.is_active() {
            return false;
        }
        match retry {
            ScheduleOutcome::Scheduled {
                delay,
                attempt,
                remaining,
                ..
            } => {
                self.set_status(TaskStatus::SubmitRetrying, reason);
                let remaining = remaining.map_or_else(|| "unbounded".to_string(), |n| n.to_string());
                warn!(
                    task = %self.id,
                    submit_num,
                    ?delay,
                    attempt,
                    %remaining,
                    reason,
                    "job submission failed; will retry"
                );
                self.emit(
                    TaskEventKind::SubmissionRetry,
                    format!("{reason}; retrying in {delay:?} ({remaining} retries left)"),
                    Severity::Warning,
                );
            }
            ScheduleOutcome::Exhausted { attempts } => {
                self.set_status(TaskStatus::SubmitFailed, reason);
                self.finished_at = Some(Utc::now());
                self.outputs.complete(outputs::SUBMIT_FAILED);
                warn!(task = %self.id, submit_num, retries = attempts, reason, "job submission failed; no retries left");
                self.emit(TaskEventKind::SubmissionFailed, reason.to_string(), Severity::Critical);
            }
        }
        true
    }

    /// `submitted -> running`.
    pub fn job_started(&mut self, submit_num: u32, at: DateTime<Utc>) -> bool {
        if !self.is_current(submit_num, "started") {
            return false;
        }
        if !matches!(self.status, TaskStatus::Ready | TaskStatus::Submitted) {
            return false;
        }
        self.set_status(TaskStatus::Running, "job started");
        self.try_num += 1;
        self.started_at = Some(at);
        self.outputs.complete(outputs::STARTED);
        self.emit(TaskEventKind::Started, "job started", Severity::Info);
        true
    }

    fn ensure_started(&mut self, at: DateTime<Utc>) {
        if matches!(self.status, TaskStatus::Ready | TaskStatus::Submitted) {
            self.job_started(self.submit_num, at);
        }
    }

    pub fn job_succeeded(&mut self, submit_num: u32, at: DateTime<Utc>) -> bool {
        if !self.is_current(submit_num, "succeeded") || !self.status.is_active() {
            return false;
        }
        self.ensure_started(at);
        self.set_status(TaskStatus::Succeeded, "job succeeded");
        self.finished_at = Some(at);
        self.outputs.complete(outputs::SUCCEEDED);
        self.emit(TaskEventKind::Succeeded, "job succeeded", Severity::Info);
        true
    }

    /// The job failed. `retry` is the retry queue's answer for this task;
    /// `None` means retries do not apply (operator kill).
    pub fn job_failed(
        &mut self,
        submit_num: u32,
        reason: &str,
        retry: Option<ScheduleOutcome>,
        at: DateTime<Utc>,
    ) -> bool {
        if !self.is_current(submit_num, "failed") || !self.status.is_active() {
            return false;
        }
        self.ensure_started(at);
        self.finished_at = Some(at);
        match retry {
            Some(ScheduleOutcome::Scheduled {
                delay,
                attempt,
                remaining,
                ..
            }) => {
                self.set_status(TaskStatus::Retrying, reason);
                let remaining = remaining.map_or_else(|| "unbounded".to_string(), |n| n.to_string());
                warn!(
                    task = %self.id,
                    submit_num,
                    ?delay,
                    attempt,
                    %remaining,
                    reason,
                    "job failed; will retry"
                );
                // Started is per attempt; a retry starts afresh.
                self.outputs.clear(&[outputs::STARTED, outputs::SUBMITTED]);
                self.emit(
                    TaskEventKind::Retry,
                    format!("{reason}; retrying in {delay:?} ({remaining} retries left)"),
                    Severity::Warning,
                );
            }
            Some(ScheduleOutcome::Exhausted { attempts }) => {
                self.set_status(TaskStatus::Failed, reason);
                self.outputs.complete(outputs::FAILED);
                if attempts > 0 {
                    warn!(task = %self.id, submit_num, retries = attempts, reason, "job failed; no retries left");
                } else {
                    warn!(task = %self.id, submit_num, reason, "job failed");
                }
                self.emit(TaskEventKind::Failed, reason.to_string(), Severity::Critical);
            }
            None => {
                self.set_status(TaskStatus::Failed, reason);
                self.outputs.complete(outputs::FAILED);
                warn!(task = %self.id, submit_num, reason, "job failed");
                self.emit(TaskEventKind::Failed, reason.to_string(), Severity::Critical);
            }
        }
        true
    }

    /// A free-form job message. Completes a custom output when the message
    /// matches one. Returns the completed output name, if any.
    pub fn job_message(&mut self, submit_num: u32, message: &str, severity: Severity) -> Option<String> {
        if !self.is_current(submit_num, "message") {
            return None;
        }
        let output = self.outputs.output_for_message(message).map(str::to_string);
        match &output {
            Some(name) => {
                if self.outputs.complete(name) {
                    info!(task = %self.id, output = %name, "custom output completed");
                }
            }
            None => debug!(task = %self.id, %severity, message, "job message"),
        }
        self.emit(TaskEventKind::Custom(message.to_string()), message.to_string(), severity);
        output
    }

    // ---- operator commands ---------------------------------------------------

    /// Returns false when the task was already held.
    pub fn hold(&mut self) -> bool {
        if self.held {
            debug!(task = %self.id, "already held");
            return false;
        }
        if self.status.is_terminal() {
            debug!(task = %self.id, status = %self.status, "not holding a finished task");
            return false;
        }
        self.held = true;
        info!(task = %self.id, status = %self.status, "task held");
        true
    }

    pub fn release(&mut self) -> bool {
        if !self.held {
            debug!(task = %self.id, "not held");
            return false;
        }
        self.held = false;
        info!(task = %self.id, status = %self.status, "task released");
        true
    }

    /// Operator reset. Refused for tasks with a job in flight (kill them
    /// first). Completing outputs is part of the reset so downstream tasks
    /// see a consistent history.
    pub fn reset(&mut self, to: TaskStatus) -> bool {
        if self.status == to {
            debug!(task = %self.id, status = %to, "reset to current state ignored");
            return false;
        }
        if self.status.is_active() {
            warn!(task = %self.id, status = %self.status, "cannot reset a task with an active job; kill it first");
            return false;
        }
        match to {
            TaskStatus::Waiting => {
                for p in self.prerequisites.iter_mut() {
                    p.unsatisfy_all();
                }
                self.outputs.clear_all();
                self.manual_trigger = false;
                self.try_num = 0;
                self.force_status(to, "operator reset");
            }
            TaskStatus::Queued => {
                for p in self.prerequisites.iter_mut() {
                    p.satisfy_all();
                }
                self.force_status(to, "operator reset");
            }
            TaskStatus::Succeeded => {
                self.outputs.clear(&[outputs::FAILED]);
                for o in [outputs::SUBMITTED, outputs::STARTED, outputs::SUCCEEDED] {
                    self.outputs.complete(o);
                }
                self.force_status(to, "operator reset");
                self.emit(TaskEventKind::Succeeded, "reset to succeeded", Severity::Info);
            }
            TaskStatus::Failed => {
                self.outputs.clear(&[outputs::SUCCEEDED]);
                for o in [outputs::SUBMITTED, outputs::STARTED, outputs::FAILED] {
                    self.outputs.complete(o);
                }
                self.force_status(to, "operator reset");
                self.emit(TaskEventKind::Failed, "reset to failed", Severity::Warning);
            }
            TaskStatus::Expired => {
                self.outputs.complete(outputs::EXPIRED);
                self.force_status(to, "operator reset");
                self.emit(TaskEventKind::Expired, "reset to expired", Severity::Warning);
            }
            other => {
                warn!(task = %self.id, target = %other, "unsupported reset target");
                return false;
            }
        }
        true
    }

    /// Operator trigger: run now regardless of prerequisites. Leaves the
    /// task `queued` with the manual flag set; the scheduler submits it on
    /// its next pass without waiting for a queue slot.
    pub fn trigger(&mut self) -> bool {
        if self.status.is_active() {
            debug!(task = %self.id, status = %self.status, "trigger ignored; job already active");
            return false;
        }
        if self.manual_trigger && self.status == TaskStatus::Queued {
            debug!(task = %self.id, "already triggered");
            return false;
        }
        self.manual_trigger = true;
        self.try_num = 0;
        self.held = false;
        if self.status.is_terminal() {
            self.outputs.clear(&[
                outputs::SUBMITTED,
                outputs::STARTED,
                outputs::SUCCEEDED,
                outputs::FAILED,
                outputs::SUBMIT_FAILED,
            ]);
        }
        self.force_status(TaskStatus::Queued, "operator trigger");
        true
    }

    /// A submission was in flight when the previous run stopped; its result
    /// is lost, so submit again. Returns whether anything changed.
    pub fn restore_after_restart(&mut self) -> bool {
        if self.status != TaskStatus::Ready {
            return false;
        }
        self.force_status(TaskStatus::Queued, "submission interrupted by restart");
        true
    }

    /// Consume the manual-trigger flag once a submission starts.
    pub fn clear_manual_trigger(&mut self) {
        self.manual_trigger = false;
    }

    /// Operator kill of a task waiting on a retry timer.
    pub fn kill_retry(&mut self, reason: &str) -> bool {
        match self.status {
            TaskStatus::Retrying => {
                self.force_status(TaskStatus::Failed, reason);
                self.outputs.complete(outputs::FAILED);
                self.emit(TaskEventKind::Failed, reason.to_string(), Severity::Critical);
                true
            }
            TaskStatus::SubmitRetrying => {
                self.force_status(TaskStatus::SubmitFailed, reason);
                self.outputs.complete(outputs::SUBMIT_FAILED);
                self.emit(TaskEventKind::SubmissionFailed, reason.to_string(), Severity::Critical);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;
    use crate::task::prerequisite::{AtomState, PrereqExpr};
    use std::time::{Duration, Instant};

    fn id(name: &str, p: i64) -> TaskId {
        TaskId::new(name, CyclePoint::Integer(p))
    }

    fn proxy_after(upstream: &str) -> TaskProxy {
        let prereq = Prerequisite::new(
            vec![(OutputRef::new(id(upstream, 1), outputs::SUCCEEDED), AtomState::Unsatisfied)],
            PrereqExpr::Atom(0),
            format!("{upstream} => foo"),
        );
        TaskProxy::new(id("foo", 1), "default").with_prerequisites(vec![prereq], Vec::new())
    }

    fn retry(remaining: usize) -> ScheduleOutcome {
        ScheduleOutcome::Scheduled {
            due: Instant::now(),
            delay: Duration::ZERO,
            attempt: 1,
            remaining: Some(remaining),
        }
    }

    #[test]
    fn full_lifecycle_with_retry() {
        let now = Utc::now();
        let mut t = proxy_after("a");
        assert!(!t.prerequisites_satisfied());
        t.satisfy(&OutputRef::new(id("a", 1), outputs::SUCCEEDED));
        t.queue();

        let n = t.begin_submit();
        assert_eq!(n, 1);
        assert!(t.job_submitted(1, Some("123".into()), now));
        assert!(t.job_started(1, now));
        assert!(t.job_failed(1, "exit 1", Some(retry(0)), now));
        assert_eq!(t.status(), TaskStatus::Retrying);

        t.retry_due();
        assert_eq!(t.begin_submit(), 2);
        // Outcome for the first job arrives late and is ignored.
        assert!(!t.job_succeeded(1, now));
        assert!(t.job_succeeded(2, now));
        assert_eq!(t.status(), TaskStatus::Succeeded);
        assert_eq!(t.try_num(), 2);

        let kinds: Vec<_> = t.take_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Submitted,
                TaskEventKind::Started,
                TaskEventKind::Retry,
                TaskEventKind::Started,
                TaskEventKind::Succeeded
            ]
        );
    }

    #[test]
    #[should_panic(expected = "unsatisfied prerequisites")]
    fn cannot_queue_with_unsatisfied_prerequisites() {
        let mut t = proxy_after("a");
        t.queue();
    }

    #[test]
    fn failure_without_retries_is_terminal_and_incomplete() {
        let now = Utc::now();
        let mut t = TaskProxy::new(id("foo", 1), "default");
        t.queue();
        t.begin_submit();
        t.job_failed(1, "exit 1", Some(ScheduleOutcome::Exhausted { attempts: 0 }), now);
        assert_eq!(t.status(), TaskStatus::Failed);
        assert!(t.is_incomplete());
        assert!(t.take_new_outputs().iter().any(|o| o.output == outputs::FAILED));
    }

    #[test]
    fn operator_commands_are_idempotent() {
        let mut t = proxy_after("a");
        assert!(t.hold());
        assert!(!t.hold());
        assert!(t.release());
        assert!(!t.release());

        assert!(t.trigger());
        assert!(!t.trigger());
        assert!(t.prerequisites_satisfied());

        assert!(t.reset(TaskStatus::Waiting));
        assert!(!t.reset(TaskStatus::Waiting));
        assert!(!t.prerequisites_satisfied());
    }

    #[test]
    fn messages_may_overtake_submission_result() {
        let now = Utc::now();
        let mut t = TaskProxy::new(id("foo", 1), "default");
        t.queue();
        t.begin_submit();
        assert!(t.job_started(1, now));
        assert!(t.job_submitted(1, Some("42".into()), now));
        assert_eq!(t.status(), TaskStatus::Running);
        assert_eq!(t.job_id.as_deref(), Some("42"));
    }
}
