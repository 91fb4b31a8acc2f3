// src/pool/broadcast.rs

//! Operator overrides of task runtime settings.
//!
//! A broadcast targets one cycle point (or every point) and one namespace
//! (a task, a family, or `root`). Settings are applied on top of the
//! flattened runtime when a job is prepared: all-point broadcasts first,
//! then point-specific ones; within each, the farthest ancestor first and
//! the task itself last.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cycling::{parse_delay, parse_delays, CyclePoint};
use crate::errors::{CycloramaError, Result};
use crate::graph::definition::{TaskDef, TaskRuntime};
use crate::platform::model::PlatformSpec;

/// Cycle points a broadcast applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BroadcastPoint {
    All,
    Point(CyclePoint),
}

impl fmt::Display for BroadcastPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastPoint::All => f.write_str("*"),
            BroadcastPoint::Point(p) => write!(f, "{p}"),
        }
    }
}

/// One stored broadcast, as persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub point: BroadcastPoint,
    pub namespace: String,
    pub settings: BTreeMap<String, String>,
}

const SCALAR_KEYS: [&str; 7] = [
    "script",
    "pre_script",
    "post_script",
    "platform",
    "execution_retry_delays",
    "submission_retry_delays",
    "execution_time_limit",
];

const ENV_PREFIX: &str = "environment.";

/// Check a setting before it is stored, so a bad broadcast is refused up
/// front rather than failing every later submission.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    let bad = |msg: String| Err(CycloramaError::ConfigError(format!("broadcast {key}: {msg}")));
    match key {
        "execution_retry_delays" | "submission_retry_delays" => {
            parse_delays(&split_list(value))?;
        }
        "execution_time_limit" => {
            parse_delay(value)?;
        }
        k if SCALAR_KEYS.contains(&k) => {}
        k if k.starts_with(ENV_PREFIX) && k.len() > ENV_PREFIX.len() => {}
        _ => return bad("unknown setting".to_string()),
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn apply_setting(runtime: &mut TaskRuntime, key: &str, value: &str) {
    match key {
        "script" => runtime.script = Some(value.to_string()),
        "pre_script" => runtime.pre_script = Some(value.to_string()),
        "post_script" => runtime.post_script = Some(value.to_string()),
        "platform" => runtime.platform = PlatformSpec::parse(Some(value)),
        "execution_retry_delays" => {
            if let Ok(d) = parse_delays(&split_list(value)) {
                runtime.execution_retry_delays = d;
            }
        }
        "submission_retry_delays" => {
            if let Ok(d) = parse_delays(&split_list(value)) {
                runtime.submission_retry_delays = d;
            }
        }
        "execution_time_limit" => runtime.execution_time_limit = parse_delay(value).ok(),
        k => {
            if let Some(var) = k.strip_prefix(ENV_PREFIX) {
                runtime.environment.insert(var.to_string(), value.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStore {
    settings: BTreeMap<(BroadcastPoint, String), BTreeMap<String, String>>,
}

impl BroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one setting. Later broadcasts of the same key replace earlier
    /// ones.
    pub fn put(&mut self, point: BroadcastPoint, namespace: &str, key: &str, value: &str) -> Result<()> {
        validate_setting(key, value)?;
        info!(%point, namespace, key, value, "broadcast set");
        self.settings
            .entry((point, namespace.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Remove broadcasts matching `point` and `namespace` (`None` matches
    /// anything). Returns the number of settings removed.
    pub fn clear(&mut self, point: Option<BroadcastPoint>, namespace: Option<&str>) -> usize {
        let mut removed = 0;
        self.settings.retain(|(p, ns), settings| {
            let hit = point.is_none_or(|x| x == *p) && namespace.is_none_or(|x| x == ns);
            if hit {
                removed += settings.len();
            }
            !hit
        });
        if removed > 0 {
            info!(removed, "broadcasts cleared");
        }
        removed
    }

    /// Drop point-specific broadcasts older than `point`.
    pub fn clear_before(&mut self, point: CyclePoint) -> usize {
        let mut removed = 0;
        self.settings.retain(|(p, _), settings| match p {
            BroadcastPoint::Point(x) if *x < point => {
                removed += settings.len();
                false
            }
            _ => true,
        });
        if removed > 0 {
            debug!(removed, before = %point, "expired broadcasts dropped");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// `task`'s runtime at `point` with broadcasts applied.
    pub fn apply(&self, task: &TaskDef, point: CyclePoint) -> TaskRuntime {
        let mut runtime = task.runtime.clone();
        if self.settings.is_empty() {
            return runtime;
        }
        let namespaces: Vec<&str> = task
            .ancestors
            .iter()
            .rev()
            .map(String::as_str)
            .chain(std::iter::once(task.name.as_str()))
            .collect();
        for scope in [BroadcastPoint::All, BroadcastPoint::Point(point)] {
            for ns in &namespaces {
                if let Some(settings) = self.settings.get(&(scope, ns.to_string())) {
                    for (k, v) in settings {
                        apply_setting(&mut runtime, k, v);
                    }
                }
            }
        }
        runtime
    }

    pub fn entries(&self) -> Vec<BroadcastEntry> {
        self.settings
            .iter()
            .map(|((point, namespace), settings)| BroadcastEntry {
                point: *point,
                namespace: namespace.clone(),
                settings: settings.clone(),
            })
            .collect()
    }

    pub fn from_entries(entries: Vec<BroadcastEntry>) -> Self {
        Self {
            settings: entries
                .into_iter()
                .map(|e| ((e.point, e.namespace), e.settings))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn task() -> TaskDef {
        TaskDef {
            name: "model".into(),
            sequences: vec![0],
            triggers: Vec::new(),
            runtime: TaskRuntime {
                script: Some("run".into()),
                ..Default::default()
            },
            queue: "default".into(),
            optional_outputs: BTreeSet::new(),
            ancestors: vec!["MODELS".into(), "root".into()],
        }
    }

    #[test]
    fn nearest_namespace_and_specific_point_win() {
        let mut store = BroadcastStore::new();
        let p2 = CyclePoint::Integer(2);
        store.put(BroadcastPoint::All, "root", "script", "from-root").unwrap();
        store.put(BroadcastPoint::All, "MODELS", "script", "from-family").unwrap();
        store.put(BroadcastPoint::Point(p2), "root", "environment.MODE", "fast").unwrap();
        store.put(BroadcastPoint::Point(p2), "model", "execution_retry_delays", "PT0S, PT5S").unwrap();

        let at1 = store.apply(&task(), CyclePoint::Integer(1));
        assert_eq!(at1.script.as_deref(), Some("from-family"));
        assert!(at1.environment.is_empty());

        let at2 = store.apply(&task(), p2);
        assert_eq!(at2.environment.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(at2.execution_retry_delays, vec![Duration::ZERO, Duration::from_secs(5)]);

        assert_eq!(store.clear_before(CyclePoint::Integer(3)), 2);
        assert_eq!(store.clear(None, Some("MODELS")), 1);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn rejects_unknown_or_malformed_settings() {
        let mut store = BroadcastStore::new();
        assert!(store.put(BroadcastPoint::All, "root", "colour", "red").is_err());
        assert!(store.put(BroadcastPoint::All, "root", "execution_time_limit", "soon").is_err());
        assert!(store.is_empty());
    }
}
