// src/platform/model.rs

//! Validated platform and platform-group definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::dispatch::batch_system::BatchSystemKind;
use crate::types::{CommunicationMethod, SelectionMethod};

pub const LOCALHOST: &str = "localhost";

/// A named deployment target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDef {
    pub name: String,
    pub hosts: Vec<String>,
    pub host_selection: SelectionMethod,
    pub batch_system: BatchSystemKind,
    pub communication: CommunicationMethod,
    pub submission_polling: Vec<Duration>,
    pub execution_polling: Vec<Duration>,
    pub time_limit_polling: Vec<Duration>,
    /// Platforms with the same install target share remote init.
    pub install_target: String,
    pub max_batch_submit_size: usize,
    pub retrieve_job_logs: bool,
    /// Platform-specific ssh command; falls back to the scheduler's.
    pub ssh_command: Option<Vec<String>>,
    /// Remote run directory root; falls back to the local run directory
    /// path.
    pub remote_run_dir: Option<String>,
}

impl PlatformDef {
    /// The implicit local platform.
    pub fn localhost() -> Self {
        Self {
            name: LOCALHOST.to_string(),
            hosts: vec![LOCALHOST.to_string()],
            host_selection: SelectionMethod::DefinitionOrder,
            batch_system: BatchSystemKind::Background,
            communication: CommunicationMethod::Push,
            submission_polling: vec![Duration::from_secs(900)],
            execution_polling: vec![Duration::from_secs(900)],
            time_limit_polling: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(420),
            ],
            install_target: LOCALHOST.to_string(),
            max_batch_submit_size: 100,
            retrieve_job_logs: false,
            ssh_command: None,
            remote_run_dir: None,
        }
    }

    /// Jobs run on the scheduler host; no remote init or ssh needed.
    pub fn is_local(&self) -> bool {
        self.hosts.iter().all(|h| is_local_host(h))
    }

    /// Job progress is found by polling rather than pushed by the job.
    pub fn polls(&self) -> bool {
        self.communication == CommunicationMethod::Poll
    }
}

pub fn is_local_host(host: &str) -> bool {
    matches!(host, LOCALHOST | "127.0.0.1" | "::1")
}

/// Ordered set of platforms a task may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformGroup {
    pub name: String,
    pub platforms: Vec<String>,
    pub selection: SelectionMethod,
}

/// What a task's `platform` setting refers to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlatformSpec {
    /// No setting: run locally.
    #[default]
    Local,
    /// Platform or group name.
    Named(String),
    /// Expression evaluated by a resolver at submission time, e.g.
    /// `$(select-platform)`.
    Dynamic(String),
}

impl PlatformSpec {
    pub fn parse(setting: Option<&str>) -> Self {
        match setting.map(str::trim) {
            None | Some("") => PlatformSpec::Local,
            Some(s) if s.contains("$(") || s.contains('`') => PlatformSpec::Dynamic(s.to_string()),
            Some(s) => PlatformSpec::Named(s.to_string()),
        }
    }
}

/// Candidates for one selection: the platforms (in configured order) and
/// how to order them.
#[derive(Debug, Clone)]
pub struct PlatformCandidates<'a> {
    pub platforms: Vec<&'a PlatformDef>,
    pub selection: SelectionMethod,
}

/// Every platform and group known to the workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, PlatformDef>,
    groups: BTreeMap<String, PlatformGroup>,
}

impl PlatformRegistry {
    /// Build a registry; the implicit `localhost` platform is added when
    /// not defined explicitly.
    pub fn new(platforms: Vec<PlatformDef>, groups: Vec<PlatformGroup>) -> Self {
        let mut map: BTreeMap<String, PlatformDef> =
            platforms.into_iter().map(|p| (p.name.clone(), p)).collect();
        map.entry(LOCALHOST.to_string())
            .or_insert_with(PlatformDef::localhost);
        Self {
            platforms: map,
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformDef> {
        self.platforms.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&PlatformGroup> {
        self.groups.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.contains_key(name) || self.groups.contains_key(name)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &PlatformDef> {
        self.platforms.values()
    }

    /// Resolve a platform or group name into selection candidates.
    pub fn candidates(&self, name: &str) -> Option<PlatformCandidates<'_>> {
        if let Some(group) = self.groups.get(name) {
            let platforms = group
                .platforms
                .iter()
                .filter_map(|p| self.platforms.get(p))
                .collect();
            return Some(PlatformCandidates {
                platforms,
                selection: group.selection,
            });
        }
        self.platforms.get(name).map(|p| PlatformCandidates {
            platforms: vec![p],
            selection: SelectionMethod::DefinitionOrder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_spec_detects_dynamic_expressions() {
        assert_eq!(PlatformSpec::parse(None), PlatformSpec::Local);
        assert_eq!(PlatformSpec::parse(Some("hpc")), PlatformSpec::Named("hpc".into()));
        assert!(matches!(PlatformSpec::parse(Some("$(pick)")), PlatformSpec::Dynamic(_)));
        assert!(matches!(PlatformSpec::parse(Some("`pick`")), PlatformSpec::Dynamic(_)));
    }

    #[test]
    fn groups_resolve_to_member_platforms() {
        let mut a = PlatformDef::localhost();
        a.name = "a".into();
        let mut b = PlatformDef::localhost();
        b.name = "b".into();
        let registry = PlatformRegistry::new(
            vec![a, b],
            vec![PlatformGroup {
                name: "g".into(),
                platforms: vec!["b".into(), "a".into()],
                selection: SelectionMethod::DefinitionOrder,
            }],
        );
        let names: Vec<_> = registry
            .candidates("g")
            .unwrap()
            .platforms
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(registry.platform(LOCALHOST).is_some());
        assert!(registry.candidates("nope").is_none());
    }
}
