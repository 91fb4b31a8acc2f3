// src/task/mod.rs

//! Task instances: identity, run state, prerequisites and outputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cycling::CyclePoint;
use crate::errors::{CycloramaError, Result};
use crate::types::CyclingMode;

pub mod events;
pub mod outputs;
pub mod prerequisite;
pub mod proxy;
pub mod status;

pub use events::{EventSink, LoggingEventSink, MemoryEventSink, TaskEvent, TaskEventKind};
pub use outputs::TaskOutputs;
pub use prerequisite::{AtomState, OutputRef, PrereqExpr, Prerequisite};
pub use proxy::TaskProxy;
pub use status::TaskStatus;

/// Identity of one task instance: `point/name`.
///
/// Ordered by point first so pool iteration walks cycles oldest-first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub point: CyclePoint,
    pub name: String,
}

impl TaskId {
    pub fn new(name: impl Into<String>, point: CyclePoint) -> Self {
        Self {
            point,
            name: name.into(),
        }
    }

    /// Parse `point/name` (or the older `name.point`).
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self> {
        let s = s.trim();
        if let Some((point, name)) = s.split_once('/') {
            return Ok(TaskId::new(name, CyclePoint::parse(point, mode)?));
        }
        if let Some((name, point)) = s.rsplit_once('.') {
            return Ok(TaskId::new(name, CyclePoint::parse(point, mode)?));
        }
        Err(CycloramaError::TaskNotFound(format!(
            "{s}: expected <point>/<name>"
        )))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_id_forms() {
        let a = TaskId::parse("3/foo", CyclingMode::Integer).unwrap();
        let b = TaskId::parse("foo.3", CyclingMode::Integer).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "3/foo");
        assert!(TaskId::parse("foo", CyclingMode::Integer).is_err());
    }
}
