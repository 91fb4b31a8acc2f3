// src/platform/resolver.rs

//! Evaluation of dynamic platform settings.
//!
//! A task whose `platform` is `$(command)` or `` `command` `` gets its
//! platform name from running that command once, at its first submission.
//! The answer is cached on the task proxy for later submissions, polls and
//! kills.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::process::Command;
use tracing::debug;

use crate::platform::model::PlatformSpec;

/// Turns a [`PlatformSpec::Dynamic`] expression into a platform name.
pub trait PlatformResolver: Send + Sync {
    fn resolve<'a>(&'a self, expr: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Strip `$( ... )` or backticks, leaving the command text.
pub fn command_of(expr: &str) -> Option<&str> {
    let expr = expr.trim();
    if let Some(inner) = expr.strip_prefix("$(").and_then(|s| s.strip_suffix(')')) {
        return Some(inner.trim());
    }
    if let Some(inner) = expr.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        return Some(inner.trim());
    }
    None
}

/// Runs the command with local `bash -c`.
#[derive(Debug, Clone)]
pub struct ShellResolver {
    timeout: Duration,
}

impl ShellResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, expr: &str) -> Result<String> {
        let command = command_of(expr).ok_or_else(|| anyhow!("not a command expression: {expr}"))?;
        debug!(command, "evaluating platform expression");
        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning platform command `{command}`"))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("platform command `{command}` timed out after {:?}", self.timeout))?
            .with_context(|| format!("running platform command `{command}`"))?;

        if !output.status.success() {
            bail!(
                "platform command `{command}` failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if name.is_empty() {
            bail!("platform command `{command}` printed nothing");
        }
        Ok(name)
    }
}

impl PlatformResolver for ShellResolver {
    fn resolve<'a>(&'a self, expr: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.run(expr))
    }
}

/// Fixed answers, keyed by expression.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: std::collections::BTreeMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, expr: impl Into<String>, platform: impl Into<String>) -> Self {
        self.answers.insert(expr.into(), platform.into());
        self
    }
}

impl PlatformResolver for StaticResolver {
    fn resolve<'a>(&'a self, expr: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        let answer = self
            .answers
            .get(expr)
            .cloned()
            .ok_or_else(|| anyhow!("no answer for platform expression {expr}"));
        Box::pin(async move { answer })
    }
}

/// The platform name a spec refers to, when known without evaluation.
pub fn static_name(spec: &PlatformSpec) -> Option<&str> {
    match spec {
        PlatformSpec::Local => Some(crate::platform::model::LOCALHOST),
        PlatformSpec::Named(name) => Some(name),
        PlatformSpec::Dynamic(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_extraction() {
        assert_eq!(command_of("$(pick-platform hpc)"), Some("pick-platform hpc"));
        assert_eq!(command_of("`pick`"), Some("pick"));
        assert_eq!(command_of("hpc"), None);
    }

    #[tokio::test]
    async fn shell_resolver_trims_output() {
        let r = ShellResolver::new(Duration::from_secs(10));
        assert_eq!(r.resolve("$(echo '  hpc2 ')").await.unwrap(), "hpc2");
        assert!(r.resolve("$(exit 1)").await.is_err());
        assert!(r.resolve("$(true)").await.is_err());
    }

    #[tokio::test]
    async fn static_resolver_answers() {
        let r = StaticResolver::new().with("$(x)", "p1");
        assert_eq!(r.resolve("$(x)").await.unwrap(), "p1");
        assert!(r.resolve("$(y)").await.is_err());
    }
}
