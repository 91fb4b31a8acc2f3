// src/config/mod.rs

//! Workflow configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a workflow file from disk (`loader.rs`).
//! - Validate it into a [`WorkflowConfig`] (`validate.rs`): cycle points,
//!   recurrences, graph, runtime inheritance, platforms.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    RawWorkflowConfig, RunaheadLimit, Scheduling, SchedulerSettings, WorkflowConfig, DEFAULT_QUEUE,
};
pub use validate::parse_runahead;
