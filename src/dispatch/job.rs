// src/dispatch/job.rs

//! Job records exchanged between the scheduler core and the dispatcher.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::definition::TaskRuntime;
use crate::platform::model::PlatformSpec;
use crate::task::TaskId;
use crate::types::Severity;

/// One submission attempt of one task: `point/name/NN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub task: TaskId,
    pub submit_num: u32,
}

impl JobKey {
    pub fn new(task: TaskId, submit_num: u32) -> Self {
        Self { task, submit_num }
    }

    /// Two-digit submit number used in job directory names.
    pub fn job_dir_name(&self) -> String {
        format!("{:02}", self.submit_num)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02}", self.task, self.submit_num)
    }
}

/// Everything needed to prepare and submit one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub key: JobKey,
    /// Platform setting after broadcasts; `Dynamic` is evaluated by the
    /// dispatcher unless `resolved_platform` is already known.
    pub platform: PlatformSpec,
    pub resolved_platform: Option<String>,
    pub runtime: TaskRuntime,
    /// Execution attempt number the job will run as.
    pub try_num: u32,
}

impl JobSpec {
    pub fn execution_time_limit(&self) -> Option<Duration> {
        self.runtime.execution_time_limit
    }
}

/// A submitted job, as needed to poll or kill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub key: JobKey,
    pub platform: String,
    /// Host the job was submitted from; selection may pick another host of
    /// the platform when this one has gone bad.
    pub host: Option<String>,
    pub job_id: Option<String>,
}

/// How a job attempt went wrong, as surfaced to the task proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// No platform or host accepted the job.
    #[error("submission failed: {0}")]
    SubmitFailed(String),

    /// The job ran and exited non-zero, or was killed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The job's status could not be determined this time. Transient: the
    /// next poll is scheduled as usual.
    #[error("poll failed: {0}")]
    PollFailed(String),
}

impl JobFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobFailure::PollFailed(_))
    }
}

/// Outcome reported by the dispatch layer, fed back into the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A dynamic platform expression was evaluated for this submission.
    PlatformResolved { key: JobKey, platform: String },

    Submitted {
        key: JobKey,
        platform: String,
        host: String,
        job_id: Option<String>,
        at: DateTime<Utc>,
    },

    /// A message from the running job (`started`, `succeeded`,
    /// `failed/<reason>` or a custom message), by push or found by a poll.
    Message {
        key: JobKey,
        message: String,
        severity: Severity,
        at: DateTime<Utc>,
    },

    Failed { key: JobKey, failure: JobFailure },

    /// The job was killed, or its submission cancelled before completion.
    Killed { key: JobKey },

    KillFailed { key: JobKey, reason: String },
}

impl JobEvent {
    pub fn key(&self) -> &JobKey {
        match self {
            JobEvent::PlatformResolved { key, .. }
            | JobEvent::Submitted { key, .. }
            | JobEvent::Message { key, .. }
            | JobEvent::Failed { key, .. }
            | JobEvent::Killed { key }
            | JobEvent::KillFailed { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;

    #[test]
    fn job_key_formatting() {
        let key = JobKey::new(TaskId::new("foo", CyclePoint::Integer(3)), 2);
        assert_eq!(key.to_string(), "3/foo/02");
        assert_eq!(key.job_dir_name(), "02");
        assert!(JobFailure::PollFailed("timeout".into()).is_transient());
        assert!(!JobFailure::SubmitFailed("x".into()).is_transient());
    }
}
