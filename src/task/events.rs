// src/task/events.rs

//! Task event records and the sinks that receive them.
//!
//! Every state transition of a task proxy produces a [`TaskEvent`]. The
//! engine hands them to an [`EventSink`]; a sink failure is retried through
//! the event retry queue with the workflow's handler retry delays.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::task::TaskId;
use crate::types::Severity;

/// Named task event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskEventKind {
    Submitted,
    Started,
    Succeeded,
    Failed,
    Retry,
    SubmissionFailed,
    SubmissionRetry,
    Expired,
    Removed,
    /// Custom output message or free-form job message.
    Custom(String),
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEventKind::Submitted => write!(f, "submitted"),
            TaskEventKind::Started => write!(f, "started"),
            TaskEventKind::Succeeded => write!(f, "succeeded"),
            TaskEventKind::Failed => write!(f, "failed"),
            TaskEventKind::Retry => write!(f, "retry"),
            TaskEventKind::SubmissionFailed => write!(f, "submission failed"),
            TaskEventKind::SubmissionRetry => write!(f, "submission retry"),
            TaskEventKind::Expired => write!(f, "expired"),
            TaskEventKind::Removed => write!(f, "removed"),
            TaskEventKind::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

/// Record handed to event handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task: TaskId,
    pub kind: TaskEventKind,
    pub message: String,
    pub severity: Severity,
    pub submit_num: u32,
}

impl TaskEvent {
    pub fn new(
        task: TaskId,
        kind: TaskEventKind,
        message: impl Into<String>,
        severity: Severity,
        submit_num: u32,
    ) -> Self {
        Self {
            task,
            kind,
            message: message.into(),
            severity,
            submit_num,
        }
    }
}

/// Receiver of task events.
///
/// Mirrors the boxed-future trait style of the job backend so sinks can be
/// stored as trait objects.
pub trait EventSink: Send + Sync {
    fn handle<'a>(
        &'a self,
        event: &'a TaskEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn handle<'a>(
        &'a self,
        event: &'a TaskEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match event.severity {
                Severity::Critical => error!(
                    task = %event.task,
                    event = %event.kind,
                    submit_num = event.submit_num,
                    "{}",
                    event.message
                ),
                Severity::Warning => warn!(
                    task = %event.task,
                    event = %event.kind,
                    submit_num = event.submit_num,
                    "{}",
                    event.message
                ),
                _ => info!(
                    task = %event.task,
                    event = %event.kind,
                    submit_num = event.submit_num,
                    "{}",
                    event.message
                ),
            }
            Ok(())
        })
    }
}

/// Collects events in memory; used by tests and the query interface.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event names recorded for one task, in order.
    pub fn kinds_for(&self, task: &TaskId) -> Vec<TaskEventKind> {
        self.events()
            .into_iter()
            .filter(|e| &e.task == task)
            .map(|e| e.kind)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn handle<'a>(
        &'a self,
        event: &'a TaskEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.events
                .lock()
                .map_err(|_| anyhow::anyhow!("event sink mutex poisoned"))?
                .push(event.clone());
            Ok(())
        })
    }
}
