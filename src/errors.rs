// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! [`CycloramaError`] covers definition-time problems (bad config, cyclic
//! graphs, unparsable recurrences). These are fatal at load time. Runtime
//! infrastructure failures have their own types closer to where they happen
//! (see `dispatch::remote::RemoteError` and `platform::selector::SelectError`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CycloramaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cycle detected in graph: {0}")]
    GraphCycle(String),

    #[error("Invalid cycle point: {0}")]
    InvalidPoint(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Inheritance conflict: {0}")]
    InheritanceConflict(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CycloramaError>;
