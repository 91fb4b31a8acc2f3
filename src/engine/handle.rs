// src/engine/handle.rs

//! Client side of a running scheduler.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::pool::{BroadcastPoint, TaskSummary};
use crate::task::TaskStatus;

use super::{OperatorCommand, RuntimeEvent};

/// Cheap to clone; every clone talks to the same scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl SchedulerHandle {
    pub fn new(tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self { tx }
    }

    /// Current state of every task in the pool.
    pub async fn query(&self) -> Result<Vec<TaskSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Query(reply)).await?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the query"))
    }

    /// Run an operator command; returns how many tasks it affected.
    pub async fn command(&self, command: OperatorCommand) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Command {
            command,
            reply: Some(reply),
        })
        .await?;
        rx.await
            .map_err(|_| anyhow!("scheduler dropped the command"))?
            .map_err(|reason| anyhow!(reason))
    }

    pub async fn hold(&self, tasks: &[&str]) -> Result<usize> {
        self.command(OperatorCommand::Hold { tasks: owned(tasks) }).await
    }

    pub async fn release(&self, tasks: &[&str]) -> Result<usize> {
        self.command(OperatorCommand::Release { tasks: owned(tasks) }).await
    }

    pub async fn trigger(&self, tasks: &[&str]) -> Result<usize> {
        self.command(OperatorCommand::Trigger { tasks: owned(tasks) }).await
    }

    pub async fn reset(&self, tasks: &[&str], to: TaskStatus) -> Result<usize> {
        self.command(OperatorCommand::Reset {
            tasks: owned(tasks),
            to,
        })
        .await
    }

    pub async fn kill(&self, tasks: &[&str]) -> Result<usize> {
        self.command(OperatorCommand::Kill { tasks: owned(tasks) }).await
    }

    pub async fn broadcast(&self, point: BroadcastPoint, namespace: &str, key: &str, value: &str) -> Result<usize> {
        self.command(OperatorCommand::Broadcast {
            point,
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(OperatorCommand::Stop).await.map(|_| ())
    }

    /// Same as Ctrl-C.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(RuntimeEvent::ShutdownRequested).await
    }

    async fn send(&self, event: RuntimeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("scheduler is not running"))
    }
}

fn owned(tasks: &[&str]) -> Vec<String> {
    tasks.iter().map(|t| t.to_string()).collect()
}
