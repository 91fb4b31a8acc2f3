// src/dispatch/remote.rs

//! Remote command invocation.
//!
//! Every remote operation (init, install, submit, poll, kill) is a bash
//! script fed to `bash -s` on the target host: directly for local hosts,
//! through the configured ssh command otherwise. The [`RemoteRunner`]
//! trait lets tests replace this with a scripted fake.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::platform::model::is_local_host;

/// Exit status ssh uses for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The host could not be contacted. Host-level: try another host.
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    /// The host answered but the command failed. Platform-level: other
    /// hosts of the platform would fail the same way.
    #[error("command rejected on {host} (exit {code:?}): {stderr}")]
    Rejected {
        host: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl RemoteError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a bash script on a host.
pub trait RemoteRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        host: &'a str,
        ssh_command: &'a [String],
        script: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutput, RemoteError>> + Send + 'a>>;
}

/// Production runner: `bash -s` locally, `<ssh> <host> bash -s` remotely.
#[derive(Debug, Clone)]
pub struct SshRunner {
    timeout: Duration,
}

impl SshRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_inner(
        &self,
        host: &str,
        ssh_command: &[String],
        script: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        let local = is_local_host(host);
        let mut cmd = if local {
            let mut c = Command::new("bash");
            c.arg("-s");
            c
        } else {
            let (program, args) = ssh_command.split_first().ok_or_else(|| RemoteError::Rejected {
                host: host.to_string(),
                code: None,
                stderr: "empty ssh command".to_string(),
            })?;
            let mut c = Command::new(program);
            c.args(args).arg(host).arg("bash").arg("-s");
            c
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host, local, "running remote command");

        let mut child = cmd.spawn().map_err(|e| {
            if local {
                RemoteError::Rejected {
                    host: host.to_string(),
                    code: None,
                    stderr: format!("failed to spawn bash: {e}"),
                }
            } else {
                RemoteError::Unreachable {
                    host: host.to_string(),
                    reason: format!("failed to spawn ssh: {e}"),
                }
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                warn!(host, error = %e, "failed writing script to remote shell");
            }
            // dropping stdin sends EOF
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RemoteError::Unreachable {
                    host: host.to_string(),
                    reason: format!("waiting for command: {e}"),
                });
            }
            Err(_) => {
                return Err(RemoteError::Unreachable {
                    host: host.to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(0) => Ok(RemoteOutput { stdout, stderr }),
            Some(SSH_CONNECTION_FAILURE) if !local => Err(RemoteError::Unreachable {
                host: host.to_string(),
                reason: stderr.trim().to_string(),
            }),
            code => Err(RemoteError::Rejected {
                host: host.to_string(),
                code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

impl RemoteRunner for SshRunner {
    fn run<'a>(
        &'a self,
        host: &'a str,
        ssh_command: &'a [String],
        script: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutput, RemoteError>> + Send + 'a>> {
        Box::pin(self.run_inner(host, ssh_command, script))
    }
}

/// Quote a string for safe inclusion in a bash script.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain/path-1"), "plain/path-1");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn local_commands_run_without_ssh() {
        let runner = SshRunner::new(Duration::from_secs(10));
        let out = runner.run("localhost", &[], "echo hello").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");

        let err = runner.run("localhost", &[], "echo nope >&2; exit 3").await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected {
                host: "localhost".into(),
                code: Some(3),
                stderr: "nope".into()
            }
        );
    }
}
