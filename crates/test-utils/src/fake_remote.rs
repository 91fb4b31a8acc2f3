use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use cyclorama::dispatch::{RemoteError, RemoteOutput, RemoteRunner};

/// Which kind of script a call carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Init,
    Submit,
    Other,
}

#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub host: String,
    pub kind: CallKind,
    pub script: String,
}

#[derive(Debug, Default)]
struct State {
    unreachable: BTreeSet<String>,
    rejecting: BTreeSet<String>,
    hanging: BTreeSet<String>,
    failing_jobs: BTreeSet<String>,
    calls: Vec<RemoteCall>,
    next_job_id: u64,
}

/// Scripted stand-in for ssh: records every call and answers submission
/// scripts with one slurm-style job id per `[JOB]` marker.
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(&self, host: &str) -> &Self {
        self.state.lock().unwrap().unreachable.insert(host.to_string());
        self
    }

    pub fn reachable(&self, host: &str) -> &Self {
        self.state.lock().unwrap().unreachable.remove(host);
        self
    }

    /// Every command on `host` exits non-zero.
    pub fn rejecting(&self, host: &str) -> &Self {
        self.state.lock().unwrap().rejecting.insert(host.to_string());
        self
    }

    /// Commands on `host` never return, like an ssh stuck on a dead
    /// connection.
    pub fn hanging(&self, host: &str) -> &Self {
        self.state.lock().unwrap().hanging.insert(host.to_string());
        self
    }

    /// Submissions of this task name exit 1 within an otherwise fine batch.
    pub fn failing_job(&self, task_name: &str) -> &Self {
        self.state.lock().unwrap().failing_jobs.insert(task_name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Hosts contacted for `kind`, in order (failed attempts included).
    pub fn hosts_for(&self, kind: CallKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.host)
            .collect()
    }

    /// `None` when the call hangs.
    fn answer(&self, host: &str, script: &str) -> Option<Result<RemoteOutput, RemoteError>> {
        let mut state = self.state.lock().unwrap();
        let kind = if script.contains("[INSTALL]") {
            CallKind::Init
        } else if script.contains("echo '[JOB] ") {
            CallKind::Submit
        } else {
            CallKind::Other
        };
        state.calls.push(RemoteCall {
            host: host.to_string(),
            kind,
            script: script.to_string(),
        });

        if state.hanging.contains(host) {
            return None;
        }
        if state.unreachable.contains(host) {
            return Some(Err(RemoteError::Unreachable {
                host: host.to_string(),
                reason: "ssh: connect to host: Connection refused".to_string(),
            }));
        }
        if state.rejecting.contains(host) {
            return Some(Err(RemoteError::Rejected {
                host: host.to_string(),
                code: Some(1),
                stderr: "permission denied".to_string(),
            }));
        }

        let stdout = match kind {
            CallKind::Init => "[INSTALL] done\n".to_string(),
            CallKind::Other => String::new(),
            CallKind::Submit => {
                let mut out = String::new();
                let keys: Vec<String> = script
                    .lines()
                    .filter_map(|l| l.strip_prefix("echo '[JOB] "))
                    .map(|rest| rest.trim_end_matches('\'').to_string())
                    .collect();
                for key in keys {
                    let name = key.split('/').nth(1).unwrap_or_default().to_string();
                    out.push_str(&format!("[JOB] {key}\n"));
                    if state.failing_jobs.contains(&name) {
                        out.push_str("sbatch: error: invalid partition\n[EXIT] 1\n");
                    } else {
                        state.next_job_id += 1;
                        let id = 5000 + state.next_job_id;
                        out.push_str(&format!("Submitted batch job {id}\n[EXIT] 0\n"));
                    }
                }
                out
            }
        };
        Some(Ok(RemoteOutput {
            stdout,
            stderr: String::new(),
        }))
    }
}

impl RemoteRunner for FakeRemote {
    fn run<'a>(
        &'a self,
        host: &'a str,
        _ssh_command: &'a [String],
        script: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutput, RemoteError>> + Send + 'a>> {
        let answer = self.answer(host, script);
        Box::pin(async move {
            match answer {
                Some(answer) => answer,
                None => std::future::pending().await,
            }
        })
    }
}
