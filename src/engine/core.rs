// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! [`CoreRuntime`] consumes [`RuntimeEvent`]s and produces:
//! - an updated pool (task states, outputs, spawned instances);
//! - a list of [`CoreCommand`]s for the IO shell to carry out.
//!
//! It performs no IO. Timers run off the `now` every call takes, so retry
//! and poll timing is fully deterministic under test; clock expiry alone
//! reads wall time, through the pool's replaceable clock. The only
//! channel it touches is the reply end of a query or command.
//!
//! One call to [`step`](CoreRuntime::step) is one iteration of the
//! scheduler loop:
//!
//! 1. apply the event (job outcome, operator command, ...);
//! 2. fire due timers (retries, polls, event handler retries);
//! 3. spawn within the runahead window and propagate outputs;
//! 4. release queued tasks within the queue limits as one submit batch;
//! 5. check for completion and stalls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::model::WorkflowConfig;
use crate::dispatch::{JobKey, JobSpec};
use crate::engine::event_handlers::{job_ref, CoreCommand, CoreStep, ExitReason, TimerKey};
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::errors::Result;
use crate::graph::{GraphExpander, TaskRuntime};
use crate::platform::bad_hosts::{self, SharedBadHosts};
use crate::platform::PlatformRegistry;
use crate::pool::{QueueSet, Snapshot, TaskPool, TaskSummary};
use crate::retry::EventRetryQueue;
use crate::task::{TaskEvent, TaskId, TaskStatus};

#[derive(Debug)]
pub struct CoreRuntime {
    pub(super) pool: TaskPool,
    pub(super) timers: EventRetryQueue<TimerKey>,
    pub(super) platforms: Arc<PlatformRegistry>,
    bad_hosts: SharedBadHosts,
    pub(super) handler_delays: Vec<Duration>,
    /// Events waiting on an event handler retry.
    pub(super) pending_handlers: BTreeMap<u64, TaskEvent>,
    next_event_id: u64,
    /// Jobs an operator asked to kill; their failure is final.
    pub(super) kill_pending: BTreeSet<JobKey>,
    options: RuntimeOptions,
    restarted: bool,
    stall_reported: bool,
    pub(super) exit: Option<ExitReason>,
    /// Something worth checkpointing happened this step.
    pub(super) changed: bool,
}

impl CoreRuntime {
    pub fn new(
        pool: TaskPool,
        platforms: Arc<PlatformRegistry>,
        bad_hosts: SharedBadHosts,
        handler_delays: Vec<Duration>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            pool,
            timers: EventRetryQueue::new(),
            platforms,
            bad_hosts,
            handler_delays,
            pending_handlers: BTreeMap::new(),
            next_event_id: 0,
            kill_pending: BTreeSet::new(),
            options,
            restarted: false,
            stall_reported: false,
            exit: None,
            changed: false,
        }
    }

    /// Core for a validated workflow, with an empty pool.
    pub fn from_config(
        cfg: &WorkflowConfig,
        platforms: Arc<PlatformRegistry>,
        bad_hosts: SharedBadHosts,
        options: RuntimeOptions,
    ) -> Self {
        let expander = GraphExpander::new(Arc::clone(&cfg.definition));
        let queues = QueueSet::new(cfg.scheduling.max_active_submissions, &cfg.scheduling.queues);
        let pool = TaskPool::new(expander, cfg.scheduling.runahead, queues);
        Self::new(
            pool,
            platforms,
            bad_hosts,
            cfg.scheduler.handler_retry_delays.clone(),
            options,
        )
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn timers(&self) -> &EventRetryQueue<TimerKey> {
        &self.timers
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.pool.summaries()
    }

    /// Load a checkpoint into the pool before [`start`](Self::start).
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.pool.restore(snapshot)?;
        self.restarted = true;
        Ok(())
    }

    /// Settings a job of `id` would run with now, broadcasts included.
    pub(super) fn runtime_of(&self, id: &TaskId) -> Option<TaskRuntime> {
        let def = self.pool.definition().task(&id.name)?;
        Some(self.pool.broadcasts().apply(def, id.point))
    }

    /// First iteration. After a restart, jobs that were in flight are
    /// polled and tasks that were waiting to retry are queued again.
    pub fn start(&mut self, now: Instant) -> CoreStep {
        let mut commands = Vec::new();
        if self.restarted {
            self.resume(now, &mut commands);
        }
        self.changed = true;
        let keep_running = self.schedule(now, &mut commands);
        self.finish(commands, keep_running)
    }

    /// Handle a single runtime event.
    pub fn step(&mut self, event: RuntimeEvent, now: Instant) -> CoreStep {
        let mut commands = Vec::new();
        match event {
            RuntimeEvent::Tick => {}
            RuntimeEvent::Job(ev) => self.handle_job_event(ev, now),
            RuntimeEvent::EventHandlerFailed { id, event, error } => {
                self.handle_sink_failure(id, event, &error, now)
            }
            RuntimeEvent::Command { command, reply } => {
                let result = self.handle_command(command, &mut commands);
                if let Err(reason) = &result {
                    warn!(reason, "operator command refused");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RuntimeEvent::Query(reply) => {
                let _ = reply.send(self.pool.summaries());
                return self.finish(commands, true);
            }
            RuntimeEvent::ShutdownRequested => {
                info!("shutdown requested");
                self.exit = Some(ExitReason::ShutdownRequested);
            }
        }
        self.fire_timers(now, &mut commands);
        let keep_running = self.schedule(now, &mut commands);
        self.finish(commands, keep_running)
    }

    fn finish(&self, commands: Vec<CoreCommand>, keep_running: bool) -> CoreStep {
        CoreStep {
            commands,
            keep_running,
            next_wakeup: self.next_wakeup(),
        }
    }

    /// Earliest of the timer deadlines and the next bad host clear.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let clear = bad_hosts::lock(&self.bad_hosts).next_clear_at();
        Some(self.timers.next_deadline().map_or(clear, |d| d.min(clear)))
    }

    fn resume(&mut self, now: Instant, commands: &mut Vec<CoreCommand>) {
        let mut polls = Vec::new();
        let mut retrying = Vec::new();
        for task in self.pool.tasks() {
            match task.status() {
                TaskStatus::Submitted | TaskStatus::Running => polls.push(job_ref(task)),
                s if s.is_retrying() => retrying.push(task.id.clone()),
                _ => {}
            }
        }
        for id in retrying {
            if let Some(task) = self.pool.get_mut(&id) {
                info!(task = %id, "retry timer lost in restart; retrying now");
                task.retry_due();
            }
        }
        if polls.is_empty() {
            return;
        }
        info!(jobs = polls.len(), "polling jobs active before restart");
        for job in &polls {
            let running = self
                .pool
                .get(&job.key.task)
                .is_some_and(|t| t.status() == TaskStatus::Running);
            if running {
                self.arm_execution_polls(&job.key, &job.platform, now);
            } else {
                self.arm_submission_poll(&job.key, &job.platform, now);
            }
        }
        commands.push(CoreCommand::Poll(polls));
    }

    /// Steps 3-5 of an iteration. Returns whether the loop continues.
    fn schedule(&mut self, now: Instant, commands: &mut Vec<CoreCommand>) -> bool {
        bad_hosts::lock(&self.bad_hosts).maybe_clear(now);

        let before = self.pool.len();
        self.pool.expire_overdue();
        let mut events = self.pool.advance();
        if self.exit.is_none() {
            self.submit_released(commands);
        }
        events.extend(self.pool.settle());
        if self.pool.len() != before || !events.is_empty() {
            self.changed = true;
        }
        self.emit(events, commands);

        if self.exit.is_none() {
            self.check_completion();
        }
        if std::mem::take(&mut self.changed) && self.options.checkpoint.is_some() {
            commands.push(CoreCommand::Checkpoint(Box::new(self.pool.snapshot())));
        }
        match self.exit {
            Some(reason) => {
                commands.push(CoreCommand::RequestExit(reason));
                false
            }
            None => true,
        }
    }

    /// Move released tasks to `ready` and batch their jobs.
    fn submit_released(&mut self, commands: &mut Vec<CoreCommand>) {
        let released = self.pool.release_queued();
        if released.is_empty() {
            return;
        }
        let mut jobs = Vec::with_capacity(released.len());
        for id in released {
            let Some(runtime) = self.runtime_of(&id) else {
                continue;
            };
            let Some(task) = self.pool.get_mut(&id) else {
                continue;
            };
            let manual = task.is_manually_triggered();
            let submit_num = task.begin_submit();
            task.clear_manual_trigger();
            debug!(task = %id, submit_num, manual, "task ready");
            jobs.push(JobSpec {
                key: JobKey::new(id, submit_num),
                platform: runtime.platform.clone(),
                resolved_platform: task.resolved_platform.clone(),
                try_num: task.try_num() + 1,
                runtime,
            });
        }
        info!(jobs = jobs.len(), "submitting batch");
        self.changed = true;
        commands.push(CoreCommand::Submit(jobs));
    }

    fn emit(&mut self, events: Vec<TaskEvent>, commands: &mut Vec<CoreCommand>) {
        if events.is_empty() {
            return;
        }
        let batch = events
            .into_iter()
            .map(|ev| {
                let id = self.next_event_id;
                self.next_event_id += 1;
                (id, ev)
            })
            .collect();
        commands.push(CoreCommand::EmitEvents(batch));
    }

    fn check_completion(&mut self) {
        if self.pool.is_idle() && self.pool.incomplete().is_empty() {
            if self.options.stop_when_idle {
                info!("all tasks finished");
                self.exit = Some(ExitReason::Completed);
            }
            return;
        }
        if !self.pool.is_stalled() {
            self.stall_reported = false;
            return;
        }
        if !self.stall_reported {
            self.stall_reported = true;
            warn!("workflow stalled");
            for line in self.pool.stall_report() {
                warn!("  {line}");
            }
        }
        if self.options.abort_on_stall {
            error!("aborting: workflow stalled");
            self.exit = Some(ExitReason::Stalled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{RawNamespace, RawQueue, RunaheadLimit, DEFAULT_QUEUE};
    use crate::config::model::QueueConfig;
    use crate::cycling::{parse_delays, CyclePoint};
    use crate::dispatch::{JobEvent, JobFailure};
    use crate::engine::OperatorCommand;
    use crate::graph::WorkflowDefinition;
    use crate::platform::model::LOCALHOST;
    use crate::platform::{BadHostRegistry, PlatformDef};
    use crate::task::TaskEventKind;
    use crate::types::{CommunicationMethod, CyclingMode, Severity};
    use chrono::Utc;
    use tokio::sync::oneshot;

    fn core_for(
        graph: &[(&str, &str)],
        runtime: BTreeMap<String, RawNamespace>,
        platforms: Vec<PlatformDef>,
        options: RuntimeOptions,
        now: Instant,
    ) -> CoreRuntime {
        let graph: BTreeMap<String, String> =
            graph.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let def = WorkflowDefinition::build(
            CyclingMode::Integer,
            CyclePoint::Integer(1),
            Some(CyclePoint::Integer(1)),
            &graph,
            &runtime,
            &BTreeMap::<String, RawQueue>::new(),
        )
        .unwrap();
        let queues: BTreeMap<String, QueueConfig> =
            [(DEFAULT_QUEUE.to_string(), QueueConfig { limit: 10 })].into();
        let pool = TaskPool::new(
            GraphExpander::new(Arc::new(def)),
            RunaheadLimit::Cycles(1),
            QueueSet::new(10, &queues),
        );
        CoreRuntime::new(
            pool,
            Arc::new(PlatformRegistry::new(platforms, Vec::new())),
            BadHostRegistry::shared(Duration::from_secs(1800), now),
            parse_delays(&["PT5S"]).unwrap(),
            options,
        )
    }

    fn submitted(step: &CoreStep) -> Vec<JobKey> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Submit(jobs) => Some(jobs.iter().map(|j| j.key.clone())),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn accept(core: &mut CoreRuntime, key: &JobKey, now: Instant) -> CoreStep {
        core.step(
            RuntimeEvent::Job(JobEvent::Submitted {
                key: key.clone(),
                platform: LOCALHOST.to_string(),
                host: LOCALHOST.to_string(),
                job_id: Some("101".into()),
                at: Utc::now(),
            }),
            now,
        )
    }

    fn message(core: &mut CoreRuntime, key: &JobKey, msg: &str, now: Instant) -> CoreStep {
        core.step(
            RuntimeEvent::Job(JobEvent::Message {
                key: key.clone(),
                message: msg.to_string(),
                severity: Severity::Info,
                at: Utc::now(),
            }),
            now,
        )
    }

    fn id(name: &str) -> TaskId {
        TaskId::new(name, CyclePoint::Integer(1))
    }

    #[test]
    fn chain_runs_to_completion() {
        let now = Instant::now();
        let options = RuntimeOptions {
            stop_when_idle: true,
            ..Default::default()
        };
        let mut core = core_for(&[("R1", "a => b")], BTreeMap::new(), Vec::new(), options, now);

        let step = core.start(now);
        let keys = submitted(&step);
        assert_eq!(keys, vec![JobKey::new(id("a"), 1)]);

        accept(&mut core, &keys[0], now);
        message(&mut core, &keys[0], "started", now);
        let step = message(&mut core, &keys[0], "succeeded", now);
        let keys = submitted(&step);
        assert_eq!(keys, vec![JobKey::new(id("b"), 1)]);

        accept(&mut core, &keys[0], now);
        let step = message(&mut core, &keys[0], "succeeded", now);
        assert!(!step.keep_running);
        assert!(matches!(
            step.commands.last(),
            Some(CoreCommand::RequestExit(ExitReason::Completed))
        ));
        assert_eq!(core.pool().get(&id("b")).unwrap().status(), TaskStatus::Succeeded);
    }

    #[test]
    fn failed_job_retries_after_its_delay() {
        let now = Instant::now();
        let mut runtime = BTreeMap::new();
        runtime.insert(
            "foo".to_string(),
            RawNamespace {
                execution_retry_delays: Some(vec!["PT0S".into(), "PT10S".into()]),
                ..Default::default()
            },
        );
        let mut core = core_for(&[("R1", "foo")], runtime, Vec::new(), RuntimeOptions::default(), now);

        let first = submitted(&core.start(now)).remove(0);
        accept(&mut core, &first, now);
        // Zero delay: the retry fires within the same step.
        let step = message(&mut core, &first, "failed/ERR", now);
        let second = submitted(&step).remove(0);
        assert_eq!(second.submit_num, 2);

        accept(&mut core, &second, now);
        let step = message(&mut core, &second, "failed/ERR", now);
        assert!(submitted(&step).is_empty());
        assert_eq!(core.pool().get(&id("foo")).unwrap().status(), TaskStatus::Retrying);

        let step = core.step(RuntimeEvent::Tick, now + Duration::from_secs(9));
        assert!(submitted(&step).is_empty());
        let step = core.step(RuntimeEvent::Tick, now + Duration::from_secs(10));
        let third = submitted(&step).remove(0);
        assert_eq!(third.submit_num, 3);

        accept(&mut core, &third, now + Duration::from_secs(10));
        message(&mut core, &third, "succeeded", now + Duration::from_secs(11));
        let foo = core.pool().get(&id("foo")).unwrap();
        assert_eq!(foo.status(), TaskStatus::Succeeded);
        assert_eq!(foo.submit_num(), 3);
    }

    #[test]
    fn exhausted_submission_retries_are_final() {
        let now = Instant::now();
        let mut runtime = BTreeMap::new();
        runtime.insert(
            "foo".to_string(),
            RawNamespace {
                submission_retry_delays: Some(vec!["PT1S".into()]),
                ..Default::default()
            },
        );
        let mut core = core_for(&[("R1", "foo")], runtime, Vec::new(), RuntimeOptions::default(), now);
        let first = submitted(&core.start(now)).remove(0);
        let fail = |key: &JobKey| {
            RuntimeEvent::Job(JobEvent::Failed {
                key: key.clone(),
                failure: JobFailure::SubmitFailed("no reachable host".into()),
            })
        };
        core.step(fail(&first), now);
        assert_eq!(core.pool().get(&id("foo")).unwrap().status(), TaskStatus::SubmitRetrying);

        let second = submitted(&core.step(RuntimeEvent::Tick, now + Duration::from_secs(1))).remove(0);
        core.step(fail(&second), now + Duration::from_secs(1));
        assert_eq!(core.pool().get(&id("foo")).unwrap().status(), TaskStatus::SubmitFailed);
        assert!(core.pool().is_stalled());
    }

    #[test]
    fn poll_platform_arms_polls_and_stale_results_are_ignored() {
        let now = Instant::now();
        let mut hpc = PlatformDef::localhost();
        hpc.name = "hpc".into();
        hpc.hosts = vec!["login1".into()];
        hpc.communication = CommunicationMethod::Poll;
        hpc.submission_polling = vec![Duration::from_secs(30)];
        hpc.execution_polling = vec![Duration::from_secs(60)];
        let mut runtime = BTreeMap::new();
        runtime.insert(
            "foo".to_string(),
            RawNamespace {
                platform: Some("hpc".into()),
                ..Default::default()
            },
        );
        let mut core = core_for(&[("R1", "foo")], runtime, vec![hpc], RuntimeOptions::default(), now);
        let key = submitted(&core.start(now)).remove(0);
        core.step(
            RuntimeEvent::Job(JobEvent::Submitted {
                key: key.clone(),
                platform: "hpc".into(),
                host: "login1".into(),
                job_id: Some("77".into()),
                at: Utc::now(),
            }),
            now,
        );
        assert!(core.timers().is_armed(&TimerKey::SubmissionPoll(key.clone())));

        let step = core.step(RuntimeEvent::Tick, now + Duration::from_secs(30));
        let polled: Vec<_> = step
            .commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Poll(jobs) => Some(jobs.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].job_id.as_deref(), Some("77"));
        assert_eq!(polled[0].host.as_deref(), Some("login1"));

        message(&mut core, &key, "started", now + Duration::from_secs(31));
        assert!(!core.timers().is_armed(&TimerKey::SubmissionPoll(key.clone())));
        assert!(core.timers().is_armed(&TimerKey::ExecutionPoll(key.clone())));

        // An outcome for an older submission changes nothing.
        let stale = JobKey::new(id("foo"), 0);
        message(&mut core, &stale, "succeeded", now + Duration::from_secs(32));
        assert_eq!(core.pool().get(&id("foo")).unwrap().status(), TaskStatus::Running);
    }

    #[test]
    fn operator_kill_fails_the_task_without_retry() {
        let now = Instant::now();
        let mut runtime = BTreeMap::new();
        runtime.insert(
            "foo".to_string(),
            RawNamespace {
                execution_retry_delays: Some(vec!["PT1M".into()]),
                ..Default::default()
            },
        );
        let mut core = core_for(&[("R1", "foo")], runtime, Vec::new(), RuntimeOptions::default(), now);
        let key = submitted(&core.start(now)).remove(0);
        accept(&mut core, &key, now);
        message(&mut core, &key, "started", now);

        let (tx, mut rx) = oneshot::channel();
        let step = core.step(
            RuntimeEvent::Command {
                command: OperatorCommand::Kill {
                    tasks: vec!["1/foo".into()],
                },
                reply: Some(tx),
            },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(1));
        assert!(step
            .commands
            .iter()
            .any(|c| matches!(c, CoreCommand::Kill(jobs) if jobs[0].key == key)));

        core.step(RuntimeEvent::Job(JobEvent::Killed { key: key.clone() }), now);
        let foo = core.pool().get(&id("foo")).unwrap();
        assert_eq!(foo.status(), TaskStatus::Failed);
        assert!(!core.timers().is_armed(&TimerKey::ExecutionRetry(id("foo"))));
    }

    #[test]
    fn hold_blocks_submission_until_release() {
        let now = Instant::now();
        let mut core = core_for(&[("R1", "a => b")], BTreeMap::new(), Vec::new(), RuntimeOptions::default(), now);
        let a = submitted(&core.start(now)).remove(0);
        core.step(
            RuntimeEvent::Command {
                command: OperatorCommand::Hold {
                    tasks: vec!["*/b".into()],
                },
                reply: None,
            },
            now,
        );
        accept(&mut core, &a, now);
        let step = message(&mut core, &a, "succeeded", now);
        assert!(submitted(&step).is_empty());
        assert_eq!(core.pool().get(&id("b")).unwrap().status(), TaskStatus::Waiting);

        let step = core.step(
            RuntimeEvent::Command {
                command: OperatorCommand::Release {
                    tasks: vec!["*/b".into()],
                },
                reply: None,
            },
            now,
        );
        assert_eq!(submitted(&step), vec![JobKey::new(id("b"), 1)]);
    }

    #[test]
    fn reset_to_waiting_reruns_from_completed_upstream_outputs() {
        let now = Instant::now();
        let mut core = core_for(&[("R1", "a => b")], BTreeMap::new(), Vec::new(), RuntimeOptions::default(), now);
        let a = submitted(&core.start(now)).remove(0);
        accept(&mut core, &a, now);
        let b = submitted(&message(&mut core, &a, "succeeded", now)).remove(0);
        accept(&mut core, &b, now);
        message(&mut core, &b, "succeeded", now);
        assert_eq!(core.pool().get(&id("b")).unwrap().status(), TaskStatus::Succeeded);

        let (tx, mut rx) = oneshot::channel();
        let step = core.step(
            RuntimeEvent::Command {
                command: OperatorCommand::Reset {
                    tasks: vec!["1/b".into()],
                    to: TaskStatus::Waiting,
                },
                reply: Some(tx),
            },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(1));
        assert_eq!(submitted(&step), vec![JobKey::new(id("b"), 2)]);
        assert_eq!(core.pool().get(&id("b")).unwrap().status(), TaskStatus::Ready);
        assert!(!core.pool().is_stalled());
    }

    #[test]
    fn failing_event_sink_is_retried_then_dropped() {
        let now = Instant::now();
        let mut core = core_for(&[("R1", "foo")], BTreeMap::new(), Vec::new(), RuntimeOptions::default(), now);
        core.start(now);
        let event = TaskEvent::new(id("foo"), TaskEventKind::Submitted, "x", Severity::Info, 1);
        core.step(
            RuntimeEvent::EventHandlerFailed {
                id: 7,
                event: event.clone(),
                error: "handler exited 1".into(),
            },
            now,
        );
        assert!(core.timers().is_armed(&TimerKey::EventHandler(7)));

        let step = core.step(RuntimeEvent::Tick, now + Duration::from_secs(5));
        assert!(step
            .commands
            .iter()
            .any(|c| matches!(c, CoreCommand::EmitEvents(evs) if evs == &vec![(7, event.clone())])));

        core.step(
            RuntimeEvent::EventHandlerFailed {
                id: 7,
                event,
                error: "handler exited 1".into(),
            },
            now + Duration::from_secs(5),
        );
        assert!(!core.timers().has_policy(&TimerKey::EventHandler(7)));
    }

    #[test]
    fn checkpoints_only_after_changes() {
        let now = Instant::now();
        let options = RuntimeOptions {
            checkpoint: Some("/run/checkpoint.json".into()),
            ..Default::default()
        };
        let mut core = core_for(&[("R1", "foo")], BTreeMap::new(), Vec::new(), options, now);
        let step = core.start(now);
        assert!(step.commands.iter().any(|c| matches!(c, CoreCommand::Checkpoint(_))));
        let step = core.step(RuntimeEvent::Tick, now);
        assert!(!step.commands.iter().any(|c| matches!(c, CoreCommand::Checkpoint(_))));
    }
}
