// src/task/status.rs

//! Task run states and the automatic transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Run state of a task proxy.
///
/// The held flag is orthogonal and lives on the proxy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Spawned; prerequisites not (yet) all satisfied.
    Waiting,
    /// Prerequisites satisfied and inside the runahead window; waiting for
    /// a queue slot.
    Queued,
    /// Selected for dispatch; a submission attempt is in flight.
    Ready,
    /// The batch system accepted the job.
    Submitted,
    /// Submission failed; a submission retry is pending.
    SubmitRetrying,
    /// Every submission attempt failed.
    SubmitFailed,
    /// The job has started executing.
    Running,
    /// The job failed; an execution retry is pending.
    Retrying,
    Succeeded,
    Failed,
    Expired,
    /// Removed by a suicide trigger or because it can never run.
    Removed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Waiting,
        TaskStatus::Queued,
        TaskStatus::Ready,
        TaskStatus::Submitted,
        TaskStatus::SubmitRetrying,
        TaskStatus::SubmitFailed,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Expired,
        TaskStatus::Removed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::SubmitFailed
                | TaskStatus::Expired
                | TaskStatus::Removed
        )
    }

    /// A job is (or may be) in flight.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Submitted | TaskStatus::Running)
    }

    /// Waiting on the retry timer.
    pub fn is_retrying(self) -> bool {
        matches!(self, TaskStatus::Retrying | TaskStatus::SubmitRetrying)
    }

    /// Transitions the scheduler may make on its own. Operator commands
    /// bypass this table (see `TaskProxy::reset`).
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;

        if to == Removed {
            return !self.is_terminal();
        }
        match self {
            Waiting => matches!(to, Queued | Expired),
            Queued => matches!(to, Waiting | Ready | Expired),
            // Job messages may overtake the submission result.
            Ready => matches!(
                to,
                Submitted | SubmitRetrying | SubmitFailed | Running | Retrying | Succeeded | Failed
            ),
            Submitted => matches!(to, Running | Retrying | Succeeded | Failed | SubmitFailed),
            Running => matches!(to, Retrying | Succeeded | Failed),
            Retrying | SubmitRetrying => matches!(to, Queued),
            Succeeded | Failed | SubmitFailed | Expired | Removed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Queued => "queued",
            TaskStatus::Ready => "ready",
            TaskStatus::Submitted => "submitted",
            TaskStatus::SubmitRetrying => "submit-retrying",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
            TaskStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// States an operator may `reset` a task to.
pub const RESET_TARGETS: [TaskStatus; 5] = [
    TaskStatus::Waiting,
    TaskStatus::Queued,
    TaskStatus::Succeeded,
    TaskStatus::Failed,
    TaskStatus::Expired,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_automatic_exit() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        use TaskStatus::*;
        let path = [Waiting, Queued, Ready, Submitted, Running, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Waiting.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Submitted));
    }

    #[test]
    fn round_trips_names() {
        for st in TaskStatus::ALL {
            assert_eq!(st.as_str().parse::<TaskStatus>().unwrap(), st);
        }
    }
}
