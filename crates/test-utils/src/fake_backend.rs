use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cyclorama::dispatch::{JobBackend, JobEvent, JobFailure, JobKey, JobRef, JobSpec};
use cyclorama::engine::RuntimeEvent;
use cyclorama::errors::Result;
use cyclorama::platform::resolver::static_name;
use cyclorama::platform::LOCALHOST;
use cyclorama::types::Severity;
use tokio::sync::mpsc;

/// What a fake job does once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOutcome {
    Succeed,
    /// Runs and fails with the given reason.
    Fail(String),
    /// Submission is rejected.
    SubmitFail(String),
    /// Runs, sends these custom messages, then succeeds.
    Messages(Vec<String>),
    /// Starts and never finishes (until killed).
    Hang,
}

/// Everything the fake saw, shared with the test.
#[derive(Debug, Default)]
pub struct FakeJobLog {
    pub submitted: Vec<JobSpec>,
    pub polled: Vec<JobRef>,
    pub killed: Vec<JobRef>,
}

impl FakeJobLog {
    /// `point/name/NN` of every submission, in order.
    pub fn submitted_keys(&self) -> Vec<String> {
        self.submitted.iter().map(|s| s.key.to_string()).collect()
    }

    /// Task names of every submission, in order.
    pub fn submitted_names(&self) -> Vec<String> {
        self.submitted.iter().map(|s| s.key.task.name.clone()).collect()
    }
}

/// A fake backend that answers every job immediately from a per-task
/// script of outcomes (default: succeed).
///
/// Events are sent while the runtime awaits `submit`, so give the runtime
/// channel room for a few events per job.
pub struct FakeJobBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    script: Arc<Mutex<BTreeMap<String, VecDeque<FakeOutcome>>>>,
    log: Arc<Mutex<FakeJobLog>>,
    next_job_id: u64,
}

impl FakeJobBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            script: Arc::default(),
            log: Arc::default(),
            next_job_id: 1000,
        }
    }

    /// Queue outcomes for successive submissions of a task, keyed by
    /// `point/name` or by bare task name.
    pub fn script(self, task: &str, outcomes: impl IntoIterator<Item = FakeOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn log(&self) -> Arc<Mutex<FakeJobLog>> {
        Arc::clone(&self.log)
    }

    fn next_outcome(&self, key: &JobKey) -> FakeOutcome {
        let mut script = self.script.lock().unwrap();
        for k in [key.task.to_string(), key.task.name.clone()] {
            if let Some(outcome) = script.get_mut(&k).and_then(VecDeque::pop_front) {
                return outcome;
            }
        }
        FakeOutcome::Succeed
    }

    async fn send(&self, ev: JobEvent) -> Result<()> {
        self.runtime_tx
            .send(RuntimeEvent::Job(ev))
            .await
            .map_err(|_| anyhow::anyhow!("runtime channel closed"))?;
        Ok(())
    }

    async fn message(&self, key: &JobKey, message: &str) -> Result<()> {
        self.send(JobEvent::Message {
            key: key.clone(),
            message: message.to_string(),
            severity: Severity::Info,
            at: Utc::now(),
        })
        .await
    }
}

impl JobBackend for FakeJobBackend {
    fn submit(&mut self, jobs: Vec<JobSpec>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for spec in jobs {
                self.log.lock().unwrap().submitted.push(spec.clone());
                let key = spec.key.clone();
                let outcome = self.next_outcome(&key);
                if let FakeOutcome::SubmitFail(reason) = outcome {
                    self.send(JobEvent::Failed {
                        key,
                        failure: JobFailure::SubmitFailed(reason),
                    })
                    .await?;
                    continue;
                }
                self.next_job_id += 1;
                self.send(JobEvent::Submitted {
                    key: key.clone(),
                    platform: spec
                        .resolved_platform
                        .clone()
                        .or_else(|| static_name(&spec.platform).map(str::to_string))
                        .unwrap_or_else(|| LOCALHOST.to_string()),
                    host: LOCALHOST.to_string(),
                    job_id: Some(self.next_job_id.to_string()),
                    at: Utc::now(),
                })
                .await?;
                self.message(&key, "started").await?;
                match outcome {
                    FakeOutcome::Succeed => self.message(&key, "succeeded").await?,
                    FakeOutcome::Fail(reason) => self.message(&key, &format!("failed/{reason}")).await?,
                    FakeOutcome::Messages(messages) => {
                        for m in &messages {
                            self.message(&key, m).await?;
                        }
                        self.message(&key, "succeeded").await?;
                    }
                    FakeOutcome::Hang | FakeOutcome::SubmitFail(_) => {}
                }
            }
            Ok(())
        })
    }

    fn poll(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.log.lock().unwrap().polled.extend(jobs);
            Ok(())
        })
    }

    fn kill(&mut self, jobs: Vec<JobRef>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for job in jobs {
                self.log.lock().unwrap().killed.push(job.clone());
                self.send(JobEvent::Killed { key: job.key }).await?;
            }
            Ok(())
        })
    }
}
