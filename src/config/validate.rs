// src/config/validate.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::model::{
    QueueConfig, RawPlatform, RawSchedulerSection, RawScheduling, RawWorkflowConfig, RunaheadLimit,
    Scheduling, SchedulerSettings, WorkflowConfig, DEFAULT_QUEUE,
};
use crate::cycling::{parse_delay, parse_delays, CyclePoint, Interval};
use crate::dispatch::BatchSystemKind;
use crate::errors::{CycloramaError, Result};
use crate::graph::WorkflowDefinition;
use crate::platform::model::LOCALHOST;
use crate::platform::{PlatformDef, PlatformGroup, PlatformRegistry, PlatformSpec};
use crate::types::CyclingMode;

impl TryFrom<RawWorkflowConfig> for WorkflowConfig {
    type Error = crate::errors::CycloramaError;

    fn try_from(raw: RawWorkflowConfig) -> std::result::Result<Self, Self::Error> {
        let scheduling = validate_scheduling(&raw.scheduling)?;
        let scheduler = validate_scheduler(&raw.scheduler)?;
        let platforms = validate_platforms(&raw)?;

        let definition = WorkflowDefinition::build(
            scheduling.mode,
            scheduling.initial,
            scheduling.final_point,
            &raw.scheduling.graph,
            &raw.runtime,
            &raw.scheduling.queues,
        )?;
        definition.detect_cycles()?;
        validate_task_platforms(&definition, &platforms)?;

        Ok(WorkflowConfig {
            scheduling,
            scheduler,
            definition: Arc::new(definition),
            platforms,
        })
    }
}

fn config_error(msg: impl Into<String>) -> CycloramaError {
    CycloramaError::ConfigError(msg.into())
}

fn validate_scheduling(raw: &RawScheduling) -> Result<Scheduling> {
    if raw.graph.is_empty() {
        return Err(config_error(
            "[scheduling.graph] must contain at least one recurrence",
        ));
    }
    let mode = raw.cycling_mode;
    let initial = CyclePoint::parse(&raw.initial_cycle_point, mode)?;
    let final_point = raw
        .final_cycle_point
        .as_deref()
        .map(|s| CyclePoint::parse(s, mode))
        .transpose()?;
    if let Some(fp) = final_point {
        if fp < initial {
            return Err(config_error(format!(
                "final cycle point {fp} is before initial cycle point {initial}"
            )));
        }
    }
    if raw.max_active_submissions == 0 {
        return Err(config_error(
            "[scheduling].max_active_submissions must be >= 1 (got 0)",
        ));
    }

    let mut queues = BTreeMap::new();
    for (name, q) in &raw.queues {
        if q.limit == 0 {
            return Err(config_error(format!(
                "[scheduling.queues.{name}].limit must be >= 1 (got 0)"
            )));
        }
        queues.insert(name.clone(), QueueConfig { limit: q.limit });
    }
    queues
        .entry(DEFAULT_QUEUE.to_string())
        .or_insert(QueueConfig {
            limit: raw.max_active_submissions,
        });

    Ok(Scheduling {
        mode,
        initial,
        final_point,
        runahead: parse_runahead(&raw.runahead_limit, mode)?,
        max_active_submissions: raw.max_active_submissions,
        queues,
    })
}

/// `P<n>` counts cycles; anything else is a duration from the base point.
pub fn parse_runahead(s: &str, mode: CyclingMode) -> Result<RunaheadLimit> {
    let s = s.trim();
    if let Some(n) = s.strip_prefix('P').filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())) {
        let cycles = n
            .parse()
            .map_err(|_| CycloramaError::InvalidInterval(s.to_string()))?;
        return Ok(RunaheadLimit::Cycles(cycles));
    }
    Ok(RunaheadLimit::Interval(Interval::parse(s, mode)?))
}

fn validate_scheduler(raw: &RawSchedulerSection) -> Result<SchedulerSettings> {
    if raw.process_pool_size == 0 {
        return Err(config_error("[scheduler].process_pool_size must be >= 1 (got 0)"));
    }
    let ssh_command = split_command(&raw.ssh_command);
    if ssh_command.is_empty() {
        return Err(config_error("[scheduler].ssh_command must not be empty"));
    }
    let main_loop_interval = parse_delay(&raw.main_loop_interval)?;
    if main_loop_interval == Duration::ZERO {
        return Err(config_error("[scheduler].main_loop_interval must be positive"));
    }

    Ok(SchedulerSettings {
        bad_hosts_clear_interval: parse_delay(&raw.bad_hosts_clear_interval)?,
        process_pool_size: raw.process_pool_size,
        retry_unit: raw.retry_unit,
        exhaustion_retry: raw.exhaustion_retry,
        ssh_command,
        remote_timeout: parse_delay(&raw.remote_timeout)?,
        // Relative paths are resolved against the config directory by the
        // loader.
        run_dir: raw.run_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
        source_dir: PathBuf::from("."),
        install: raw.install.clone(),
        handler_retry_delays: parse_delays(&raw.handler_retry_delays)?,
        stop_when_idle: raw.stop_when_idle,
        abort_on_stall: raw.abort_on_stall,
        main_loop_interval,
    })
}

fn split_command(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn validate_platforms(raw: &RawWorkflowConfig) -> Result<PlatformRegistry> {
    let mut platforms = Vec::with_capacity(raw.platforms.len());
    for (name, p) in &raw.platforms {
        platforms.push(validate_platform(name, p)?);
    }

    let mut groups = Vec::with_capacity(raw.platform_groups.len());
    for (name, g) in &raw.platform_groups {
        if raw.platforms.contains_key(name) {
            return Err(config_error(format!(
                "'{name}' is defined both as a platform and as a platform group"
            )));
        }
        if g.platforms.is_empty() {
            return Err(config_error(format!(
                "[platform_groups.{name}] lists no platforms"
            )));
        }
        for member in &g.platforms {
            if member != LOCALHOST && !raw.platforms.contains_key(member) {
                return Err(config_error(format!(
                    "platform group '{name}' refers to unknown platform '{member}'"
                )));
            }
        }
        groups.push(PlatformGroup {
            name: name.clone(),
            platforms: g.platforms.clone(),
            selection: g.platform_selection,
        });
    }

    Ok(PlatformRegistry::new(platforms, groups))
}

fn validate_platform(name: &str, raw: &RawPlatform) -> Result<PlatformDef> {
    let hosts = if raw.hosts.is_empty() {
        vec![name.to_string()]
    } else {
        raw.hosts.clone()
    };
    let batch_system: BatchSystemKind = raw
        .job_runner
        .parse()
        .map_err(|e: String| config_error(format!("[platforms.{name}]: {e}")))?;
    if raw.max_batch_submit_size == 0 {
        return Err(config_error(format!(
            "[platforms.{name}].max_batch_submit_size must be >= 1 (got 0)"
        )));
    }
    let polling = |items: &[String], key: &str| -> Result<Vec<Duration>> {
        let delays = parse_delays(items)?;
        if delays.is_empty() || delays.iter().any(|d| d.is_zero()) {
            return Err(config_error(format!(
                "[platforms.{name}].{key} must list positive intervals"
            )));
        }
        Ok(delays)
    };

    Ok(PlatformDef {
        name: name.to_string(),
        hosts,
        host_selection: raw.host_selection,
        batch_system,
        communication: raw.communication_method,
        submission_polling: polling(&raw.submission_polling_intervals, "submission_polling_intervals")?,
        execution_polling: polling(&raw.execution_polling_intervals, "execution_polling_intervals")?,
        time_limit_polling: polling(
            &raw.execution_time_limit_polling_intervals,
            "execution_time_limit_polling_intervals",
        )?,
        install_target: raw.install_target.clone().unwrap_or_else(|| name.to_string()),
        max_batch_submit_size: raw.max_batch_submit_size,
        retrieve_job_logs: raw.retrieve_job_logs,
        ssh_command: raw.ssh_command.as_deref().map(split_command),
        remote_run_dir: raw.run_dir.clone(),
    })
}

/// Static platform names must exist; `$(...)` expressions are checked when
/// they are evaluated.
fn validate_task_platforms(def: &WorkflowDefinition, platforms: &PlatformRegistry) -> Result<()> {
    for task in def.tasks() {
        if let PlatformSpec::Named(name) = &task.runtime.platform {
            if !platforms.contains(name) {
                return Err(config_error(format!(
                    "task '{}' uses unknown platform '{name}'",
                    task.name
                )));
            }
        }
    }
    Ok(())
}
