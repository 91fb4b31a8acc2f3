// src/engine/mod.rs

//! The scheduler loop.
//!
//! The pure state machine lives in [`core`]: it owns the task pool and the
//! retry/poll timers, consumes [`RuntimeEvent`]s and returns
//! [`CoreCommand`]s. The async shell in [`runtime`] reads events from the
//! channel, sleeps until the next timer, and carries the commands out
//! against a [`JobBackend`](crate::dispatch::JobBackend).
//!
//! Operators and other tools talk to a running scheduler through a
//! [`SchedulerHandle`].

use std::fmt;
use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::dispatch::JobEvent;
use crate::pool::{BroadcastPoint, TaskSummary};
use crate::task::{TaskEvent, TaskStatus};

pub mod core;
pub mod event_handlers;
pub mod handle;
pub mod runtime;

pub use self::core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep, ExitReason, TimerKey};
pub use handle::SchedulerHandle;
pub use runtime::Runtime;

/// Reply channel for an operator command: the number of tasks affected, or
/// why the command was refused.
pub type CommandReply = oneshot::Sender<Result<usize, String>>;

/// Options shared by the core and the shell.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Shut down once every task has finished and nothing is left to spawn.
    pub stop_when_idle: bool,
    /// Shut down with an error when the workflow stalls.
    pub abort_on_stall: bool,
    /// Where to write pool snapshots; `None` disables checkpointing.
    pub checkpoint: Option<PathBuf>,
}

/// External intervention in a running workflow.
///
/// Task selectors are globs over `point/name`; `name` may also be a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Hold { tasks: Vec<String> },
    Release { tasks: Vec<String> },
    /// Run now, ignoring prerequisites. An exact `point/name` that is not
    /// in the pool yet is spawned first.
    Trigger { tasks: Vec<String> },
    Reset { tasks: Vec<String>, to: TaskStatus },
    Kill { tasks: Vec<String> },
    Broadcast {
        point: BroadcastPoint,
        namespace: String,
        key: String,
        value: String,
    },
    ClearBroadcast {
        point: Option<BroadcastPoint>,
        namespace: Option<String>,
    },
    Stop,
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCommand::Hold { tasks } => write!(f, "hold {}", tasks.join(" ")),
            OperatorCommand::Release { tasks } => write!(f, "release {}", tasks.join(" ")),
            OperatorCommand::Trigger { tasks } => write!(f, "trigger {}", tasks.join(" ")),
            OperatorCommand::Reset { tasks, to } => write!(f, "reset {} to {to}", tasks.join(" ")),
            OperatorCommand::Kill { tasks } => write!(f, "kill {}", tasks.join(" ")),
            OperatorCommand::Broadcast {
                point,
                namespace,
                key,
                value,
            } => write!(f, "broadcast [{point}] {namespace}.{key} = {value}"),
            OperatorCommand::ClearBroadcast { point, namespace } => write!(
                f,
                "clear broadcast [{}] {}",
                point.as_ref().map_or_else(|| "any".to_string(), ToString::to_string),
                namespace.as_deref().unwrap_or("any")
            ),
            OperatorCommand::Stop => write!(f, "stop"),
        }
    }
}

/// Everything that wakes the control loop.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// The loop's own timer: retry and poll deadlines, periodic checks.
    Tick,
    /// Outcome reported by the dispatch layer.
    Job(JobEvent),
    /// An event sink failed; the event is retried with the handler delays.
    EventHandlerFailed { id: u64, event: TaskEvent, error: String },
    Command {
        command: OperatorCommand,
        reply: Option<CommandReply>,
    },
    Query(oneshot::Sender<Vec<TaskSummary>>),
    /// Graceful shutdown (Ctrl-C).
    ShutdownRequested,
}
