// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::cycling::{CyclePoint, Interval};
use crate::graph::WorkflowDefinition;
use crate::platform::PlatformRegistry;
use crate::types::{CommunicationMethod, CyclingMode, RetryUnit, SelectionMethod};

/// Top-level workflow definition as read from a TOML file.
///
/// ```toml
/// [scheduling]
/// cycling_mode = "integer"
/// initial_cycle_point = "1"
/// final_cycle_point = "3"
///
/// [scheduling.graph]
/// P1 = "foo[-P1] => foo => bar"
///
/// [runtime.foo]
/// script = "run-model"
/// execution_retry_delays = ["PT0S", "PT10S"]
/// platform = "hpc"
///
/// [platforms.hpc]
/// hosts = ["login1", "login2"]
/// job_runner = "slurm"
/// ```
///
/// Use [`WorkflowConfig::try_from`] to validate it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkflowConfig {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    pub scheduling: RawScheduling,

    /// `[runtime.<namespace>]`: tasks and families.
    #[serde(default)]
    pub runtime: BTreeMap<String, RawNamespace>,

    #[serde(default)]
    pub platforms: BTreeMap<String, RawPlatform>,

    #[serde(default)]
    pub platform_groups: BTreeMap<String, RawPlatformGroup>,
}

/// `[scheduling]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawScheduling {
    #[serde(default)]
    pub cycling_mode: CyclingMode,

    pub initial_cycle_point: String,

    #[serde(default)]
    pub final_cycle_point: Option<String>,

    /// An interval (`PT12H`) or a number of cycles (`P4`).
    #[serde(default = "default_runahead_limit")]
    pub runahead_limit: String,

    /// Upper bound on submissions in flight at once, over all queues.
    #[serde(default = "default_max_active_submissions")]
    pub max_active_submissions: usize,

    /// `[scheduling.queues.<name>]`. The `default` queue always exists.
    #[serde(default)]
    pub queues: BTreeMap<String, RawQueue>,

    /// Recurrence expression -> graph string.
    #[serde(default)]
    pub graph: BTreeMap<String, String>,
}

fn default_runahead_limit() -> String {
    "P4".to_string()
}

fn default_max_active_submissions() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawQueue {
    #[serde(default = "default_queue_limit")]
    pub limit: usize,

    /// Task or family names.
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_queue_limit() -> usize {
    100
}

/// `[runtime.<namespace>]`.
///
/// Every field is optional so that inheritance can tell "unset" from
/// "set to the default".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNamespace {
    /// Parent namespaces. Defaults to `["root"]` when a `root` namespace
    /// exists.
    #[serde(default)]
    pub inherit: Vec<String>,

    #[serde(default)]
    pub script: Option<String>,

    #[serde(default)]
    pub pre_script: Option<String>,

    #[serde(default)]
    pub post_script: Option<String>,

    /// Platform or platform group name, or a `$(command)` expression
    /// evaluated at submission time.
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub execution_retry_delays: Option<Vec<String>>,

    #[serde(default)]
    pub submission_retry_delays: Option<Vec<String>>,

    #[serde(default)]
    pub execution_time_limit: Option<String>,

    /// Offset from the cycle point after which a task that has not yet
    /// submitted expires instead of running. Datetime cycling only.
    #[serde(default)]
    pub clock_expire: Option<String>,

    /// Custom outputs: output name -> job message.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// `[platforms.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPlatform {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub host_selection: SelectionMethod,

    /// Batch system: `background`, `at`, `slurm` or `pbs`.
    #[serde(default = "default_job_runner")]
    pub job_runner: String,

    #[serde(default)]
    pub communication_method: CommunicationMethod,

    #[serde(default = "default_submission_polling")]
    pub submission_polling_intervals: Vec<String>,

    #[serde(default = "default_execution_polling")]
    pub execution_polling_intervals: Vec<String>,

    #[serde(default = "default_time_limit_polling")]
    pub execution_time_limit_polling_intervals: Vec<String>,

    /// Platforms sharing an install target share one remote init.
    #[serde(default)]
    pub install_target: Option<String>,

    #[serde(default = "default_max_batch_submit_size")]
    pub max_batch_submit_size: usize,

    #[serde(default)]
    pub retrieve_job_logs: bool,

    /// Overrides `[scheduler].ssh_command` for this platform.
    #[serde(default)]
    pub ssh_command: Option<String>,

    /// Remote directory holding workflow run directories.
    #[serde(default)]
    pub run_dir: Option<String>,
}

fn default_job_runner() -> String {
    "background".to_string()
}

fn default_submission_polling() -> Vec<String> {
    vec!["PT15M".to_string()]
}

fn default_execution_polling() -> Vec<String> {
    vec!["PT15M".to_string()]
}

fn default_time_limit_polling() -> Vec<String> {
    vec!["PT1M".to_string(), "PT2M".to_string(), "PT7M".to_string()]
}

fn default_max_batch_submit_size() -> usize {
    100
}

/// `[platform_groups.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPlatformGroup {
    pub platforms: Vec<String>,

    #[serde(default)]
    pub platform_selection: SelectionMethod,
}

/// `[scheduler]` section: scheduler-wide behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSchedulerSection {
    /// How often the bad host registry is cleared.
    #[serde(default = "default_bad_hosts_clear_interval")]
    pub bad_hosts_clear_interval: String,

    /// Concurrent remote commands (submit, poll, kill, init).
    #[serde(default = "default_process_pool_size")]
    pub process_pool_size: usize,

    #[serde(default)]
    pub retry_unit: RetryUnit,

    /// When every candidate host is bad, try the bad ones again rather
    /// than failing immediately.
    #[serde(default)]
    pub exhaustion_retry: bool,

    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    /// Timeout applied to every remote command.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: String,

    /// Local run directory. Defaults to the directory holding the config.
    #[serde(default)]
    pub run_dir: Option<PathBuf>,

    /// Extra paths (relative to the workflow source directory) installed on
    /// remote platforms during remote init.
    #[serde(default)]
    pub install: Vec<String>,

    #[serde(default = "default_handler_retry_delays")]
    pub handler_retry_delays: Vec<String>,

    #[serde(default)]
    pub stop_when_idle: bool,

    #[serde(default)]
    pub abort_on_stall: bool,

    #[serde(default = "default_main_loop_interval")]
    pub main_loop_interval: String,
}

fn default_bad_hosts_clear_interval() -> String {
    "PT30M".to_string()
}

fn default_process_pool_size() -> usize {
    4
}

fn default_ssh_command() -> String {
    "ssh -oBatchMode=yes -oConnectTimeout=10".to_string()
}

fn default_remote_timeout() -> String {
    "PT60S".to_string()
}

fn default_handler_retry_delays() -> Vec<String> {
    vec!["PT10S".to_string(), "PT1M".to_string()]
}

fn default_main_loop_interval() -> String {
    "PT1S".to_string()
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            bad_hosts_clear_interval: default_bad_hosts_clear_interval(),
            process_pool_size: default_process_pool_size(),
            retry_unit: RetryUnit::default(),
            exhaustion_retry: false,
            ssh_command: default_ssh_command(),
            remote_timeout: default_remote_timeout(),
            run_dir: None,
            install: Vec::new(),
            handler_retry_delays: default_handler_retry_delays(),
            stop_when_idle: false,
            abort_on_stall: false,
            main_loop_interval: default_main_loop_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// How far ahead of the oldest active cycle the pool may spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunaheadLimit {
    /// Fixed distance from the oldest active point.
    Interval(Interval),
    /// Number of cycle points beyond the oldest active one.
    Cycles(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub limit: usize,
}

/// Validated `[scheduling]`.
#[derive(Debug, Clone)]
pub struct Scheduling {
    pub mode: CyclingMode,
    pub initial: CyclePoint,
    pub final_point: Option<CyclePoint>,
    pub runahead: RunaheadLimit,
    pub max_active_submissions: usize,
    /// Queue name -> limit. Always contains `default`.
    pub queues: BTreeMap<String, QueueConfig>,
}

/// Validated `[scheduler]`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub bad_hosts_clear_interval: Duration,
    pub process_pool_size: usize,
    pub retry_unit: RetryUnit,
    pub exhaustion_retry: bool,
    pub ssh_command: Vec<String>,
    pub remote_timeout: Duration,
    pub run_dir: PathBuf,
    pub source_dir: PathBuf,
    pub install: Vec<String>,
    pub handler_retry_delays: Vec<Duration>,
    pub stop_when_idle: bool,
    pub abort_on_stall: bool,
    pub main_loop_interval: Duration,
}

/// A fully validated workflow.
///
/// The graph, sequences and flattened runtime settings live in the shared
/// [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub scheduling: Scheduling,
    pub scheduler: SchedulerSettings,
    pub definition: Arc<WorkflowDefinition>,
    pub platforms: PlatformRegistry,
}

pub const DEFAULT_QUEUE: &str = "default";
