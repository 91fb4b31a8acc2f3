// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::dispatch::{JobBackend, JobEvent, JobFailure, JobSpec};
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::pool::Snapshot;
use crate::task::{EventSink, TaskEvent};

use super::core::CoreRuntime;
use super::{CoreCommand, ExitReason, RuntimeEvent};

/// Drives the core in response to `RuntimeEvent`s and timer deadlines,
/// and delegates job handling to a `JobBackend`.
///
/// All scheduling semantics live in `CoreRuntime`; this struct only reads
/// events from the channel, sleeps until the next deadline and carries out
/// the commands the core returns.
pub struct Runtime<B: JobBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    event_tx: mpsc::WeakSender<RuntimeEvent>,
    backend: B,
    sink: Arc<dyn EventSink>,
    fs: Arc<dyn FileSystem>,
    /// Upper bound on the time between two iterations.
    tick: Duration,
}

impl<B: JobBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl<B: JobBackend> Runtime<B> {
    /// `event_tx` must feed `event_rx`; event sink failures are reported
    /// through it. Only a weak handle is kept so the loop still ends when
    /// every other sender is gone.
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: &mpsc::Sender<RuntimeEvent>,
        backend: B,
        sink: Arc<dyn EventSink>,
        fs: Arc<dyn FileSystem>,
        tick: Duration,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx: event_tx.downgrade(),
            backend,
            sink,
            fs,
            tick,
        }
    }

    pub fn core(&self) -> &CoreRuntime {
        &self.core
    }

    /// Main event loop. Returns why the workflow stopped.
    pub async fn run(mut self) -> Result<ExitReason> {
        info!("cyclorama scheduler started");

        let step = self.core.start(Instant::now().into_std());
        let mut next_wakeup = step.next_wakeup;
        let mut exit = None;
        for command in step.commands {
            if let Some(reason) = self.execute_command(command).await {
                exit = Some(reason);
            }
        }
        if !step.keep_running {
            return Ok(exit.unwrap_or(ExitReason::Completed));
        }

        loop {
            let deadline = self.deadline(next_wakeup);
            let event = tokio::select! {
                received = self.event_rx.recv() => match received {
                    Some(e) => e,
                    None => {
                        info!("runtime event channel closed; exiting");
                        return Ok(ExitReason::ShutdownRequested);
                    }
                },
                _ = sleep_until(deadline) => RuntimeEvent::Tick,
            };

            if !matches!(event, RuntimeEvent::Tick) {
                debug!(?event, "runtime received event");
            }

            let step = self.core.step(event, Instant::now().into_std());
            next_wakeup = step.next_wakeup;

            for command in step.commands {
                if let Some(reason) = self.execute_command(command).await {
                    exit = Some(reason);
                }
            }

            if !step.keep_running {
                let reason = exit.unwrap_or(ExitReason::Stopped);
                info!(%reason, "core requested exit; stopping runtime");
                return Ok(reason);
            }
        }
    }

    fn deadline(&self, next_wakeup: Option<std::time::Instant>) -> Instant {
        let tick = Instant::now() + self.tick;
        match next_wakeup {
            Some(at) => Instant::from_std(at).min(tick),
            None => tick,
        }
    }

    /// Execute a single command from the core. Returns the exit reason
    /// when the core asked to stop.
    async fn execute_command(&mut self, command: CoreCommand) -> Option<ExitReason> {
        match command {
            CoreCommand::Submit(jobs) => self.submit(jobs).await,
            CoreCommand::Poll(jobs) => {
                if let Err(e) = self.backend.poll(jobs).await {
                    warn!(error = %e, "poll failed");
                }
            }
            CoreCommand::Kill(jobs) => {
                if let Err(e) = self.backend.kill(jobs).await {
                    warn!(error = %e, "kill failed");
                }
            }
            CoreCommand::EmitEvents(events) => {
                for (id, event) in events {
                    self.emit(id, event);
                }
            }
            CoreCommand::Checkpoint(snapshot) => self.checkpoint(&snapshot),
            CoreCommand::RequestExit(reason) => {
                info!(%reason, "core issued RequestExit command");
                return Some(reason);
            }
        }
        None
    }

    /// A backend that cannot take the batch at all fails every job in it,
    /// so the tasks go through their submission retries.
    async fn submit(&mut self, jobs: Vec<JobSpec>) {
        if jobs.is_empty() {
            return;
        }
        let keys: Vec<_> = jobs.iter().map(|j| j.key.clone()).collect();
        debug!(jobs = keys.len(), "submitting jobs");
        if let Err(e) = self.backend.submit(jobs).await {
            error!(error = %e, "job submission failed");
            let Some(tx) = self.event_tx.upgrade() else {
                return;
            };
            for key in keys {
                let failure = JobFailure::SubmitFailed(e.to_string());
                if tx
                    .send(RuntimeEvent::Job(JobEvent::Failed { key, failure }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    /// Event sinks may be slow (mail, external scripts); they run off the
    /// loop and report failures back for retry.
    fn emit(&self, id: u64, event: TaskEvent) {
        let sink = Arc::clone(&self.sink);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let Err(e) = sink.handle(&event).await else {
                return;
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(RuntimeEvent::EventHandlerFailed {
                        id,
                        event,
                        error: e.to_string(),
                    })
                    .await;
            }
        });
    }

    fn checkpoint(&self, snapshot: &Snapshot) {
        let Some(path) = self.core.options().checkpoint.as_deref() else {
            return;
        };
        if let Err(e) = snapshot.save(self.fs.as_ref(), path) {
            error!(error = %e, path = %path.display(), "checkpoint failed");
        }
    }
}
