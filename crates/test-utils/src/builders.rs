#![allow(dead_code)]

use std::path::Path;

use cyclorama::config::{RawWorkflowConfig, WorkflowConfig};
use toml::{Table, Value};

fn strings(items: &[&str]) -> Value {
    Value::Array(items.iter().map(|s| Value::String(s.to_string())).collect())
}

fn section<'a>(root: &'a mut Table, path: &[&str]) -> &'a mut Table {
    let mut table = root;
    for key in path {
        table = table
            .entry(key.to_string())
            .or_insert_with(|| Value::Table(Table::new()))
            .as_table_mut()
            .expect("builder sections are tables");
    }
    table
}

/// Builder for workflow definitions, producing the same TOML a user would
/// write.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    doc: Table,
}

impl WorkflowBuilder {
    /// Integer cycling starting at `initial`.
    pub fn integer(initial: i64) -> Self {
        let mut doc = Table::new();
        let scheduling = section(&mut doc, &["scheduling"]);
        scheduling.insert("cycling_mode".into(), Value::String("integer".into()));
        scheduling.insert("initial_cycle_point".into(), Value::String(initial.to_string()));
        Self { doc }
    }

    /// Calendar cycling starting at an ISO 8601 date-time.
    pub fn gregorian(initial: &str) -> Self {
        let mut doc = Table::new();
        let scheduling = section(&mut doc, &["scheduling"]);
        scheduling.insert("cycling_mode".into(), Value::String("gregorian".into()));
        scheduling.insert("initial_cycle_point".into(), Value::String(initial.into()));
        Self { doc }
    }

    pub fn final_point(mut self, point: &str) -> Self {
        section(&mut self.doc, &["scheduling"]).insert("final_cycle_point".into(), Value::String(point.into()));
        self
    }

    pub fn runahead(mut self, limit: &str) -> Self {
        section(&mut self.doc, &["scheduling"]).insert("runahead_limit".into(), Value::String(limit.into()));
        self
    }

    pub fn max_active_submissions(mut self, n: i64) -> Self {
        section(&mut self.doc, &["scheduling"]).insert("max_active_submissions".into(), Value::Integer(n));
        self
    }

    pub fn graph(mut self, recurrence: &str, graph: &str) -> Self {
        section(&mut self.doc, &["scheduling", "graph"]).insert(recurrence.into(), Value::String(graph.into()));
        self
    }

    pub fn queue(mut self, name: &str, limit: i64, members: &[&str]) -> Self {
        let q = section(&mut self.doc, &["scheduling", "queues", name]);
        q.insert("limit".into(), Value::Integer(limit));
        q.insert("members".into(), strings(members));
        self
    }

    pub fn namespace(mut self, name: &str, ns: NamespaceBuilder) -> Self {
        section(&mut self.doc, &["runtime"]).insert(name.into(), Value::Table(ns.table));
        self
    }

    pub fn platform(mut self, name: &str, platform: PlatformBuilder) -> Self {
        section(&mut self.doc, &["platforms"]).insert(name.into(), Value::Table(platform.table));
        self
    }

    pub fn platform_group(mut self, name: &str, platforms: &[&str], selection: &str) -> Self {
        let g = section(&mut self.doc, &["platform_groups", name]);
        g.insert("platforms".into(), strings(platforms));
        g.insert("platform_selection".into(), Value::String(selection.into()));
        self
    }

    /// Any `[scheduler]` setting, e.g. `("retry_unit", "platform".into())`.
    pub fn scheduler(mut self, key: &str, value: impl Into<Value>) -> Self {
        section(&mut self.doc, &["scheduler"]).insert(key.into(), value.into());
        self
    }

    pub fn to_toml(&self) -> String {
        toml::to_string(&self.doc).expect("builder document serialises")
    }

    /// Write the workflow to `dir/flow.toml` and return the path.
    pub fn write_to(&self, dir: &Path) -> std::path::PathBuf {
        let path = dir.join("flow.toml");
        std::fs::write(&path, self.to_toml()).expect("write flow.toml");
        path
    }

    pub fn raw(&self) -> RawWorkflowConfig {
        Value::Table(self.doc.clone())
            .try_into()
            .expect("builder produces a well-formed workflow")
    }

    pub fn try_build(&self) -> cyclorama::errors::Result<WorkflowConfig> {
        WorkflowConfig::try_from(self.raw())
    }

    pub fn build(&self) -> WorkflowConfig {
        self.try_build().expect("Failed to build valid workflow from builder")
    }
}

/// Builder for a `[runtime.<namespace>]` section.
#[derive(Debug, Clone, Default)]
pub struct NamespaceBuilder {
    table: Table,
}

impl NamespaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inherit(mut self, parents: &[&str]) -> Self {
        self.table.insert("inherit".into(), strings(parents));
        self
    }

    pub fn script(mut self, script: &str) -> Self {
        self.table.insert("script".into(), Value::String(script.into()));
        self
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.table.insert("platform".into(), Value::String(platform.into()));
        self
    }

    pub fn execution_retry_delays(mut self, delays: &[&str]) -> Self {
        self.table.insert("execution_retry_delays".into(), strings(delays));
        self
    }

    pub fn submission_retry_delays(mut self, delays: &[&str]) -> Self {
        self.table.insert("submission_retry_delays".into(), strings(delays));
        self
    }

    pub fn execution_time_limit(mut self, limit: &str) -> Self {
        self.table.insert("execution_time_limit".into(), Value::String(limit.into()));
        self
    }

    pub fn clock_expire(mut self, offset: &str) -> Self {
        self.table.insert("clock_expire".into(), Value::String(offset.into()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        section(&mut self.table, &["environment"]).insert(key.into(), Value::String(value.into()));
        self
    }

    pub fn output(mut self, name: &str, message: &str) -> Self {
        section(&mut self.table, &["outputs"]).insert(name.into(), Value::String(message.into()));
        self
    }
}

/// Builder for a `[platforms.<name>]` section.
#[derive(Debug, Clone, Default)]
pub struct PlatformBuilder {
    table: Table,
}

impl PlatformBuilder {
    pub fn new(hosts: &[&str]) -> Self {
        let mut table = Table::new();
        table.insert("hosts".into(), strings(hosts));
        Self { table }
    }

    pub fn job_runner(mut self, runner: &str) -> Self {
        self.table.insert("job_runner".into(), Value::String(runner.into()));
        self
    }

    pub fn random_hosts(mut self) -> Self {
        self.table.insert("host_selection".into(), Value::String("random".into()));
        self
    }

    /// Pull model with the given submission and execution polling
    /// intervals.
    pub fn poll(mut self, submission: &[&str], execution: &[&str]) -> Self {
        self.table.insert("communication_method".into(), Value::String("poll".into()));
        self.table.insert("submission_polling_intervals".into(), strings(submission));
        self.table.insert("execution_polling_intervals".into(), strings(execution));
        self
    }

    pub fn install_target(mut self, target: &str) -> Self {
        self.table.insert("install_target".into(), Value::String(target.into()));
        self
    }

    pub fn max_batch_submit_size(mut self, n: i64) -> Self {
        self.table.insert("max_batch_submit_size".into(), Value::Integer(n));
        self
    }
}
