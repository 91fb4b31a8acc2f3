// src/platform/selector.rs

//! Host and platform selection with failover.
//!
//! A selection walks the candidate platforms (one platform, or every
//! platform of a group) and their hosts in the configured order. Hosts in
//! the [`BadHostRegistry`](super::bad_hosts::BadHostRegistry) are skipped.
//! Failures are reported back so the next call to
//! [`PlatformSelector::next`] moves on; how much one failure rules out is
//! governed by [`RetryUnit`].
//!
//! Submission, poll and kill each run their own selection, so a host that
//! went bad after submission is avoided at poll time too.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::remote::RemoteError;
use crate::platform::bad_hosts::{self, SharedBadHosts};
use crate::platform::model::{PlatformDef, PlatformRegistry};
use crate::types::{RetryUnit, SelectionMethod};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no reachable host for '{target}' (tried: {tried:?}){}", last_error.as_ref().map(|e| format!("; last error: {e}")).unwrap_or_default())]
    NoReachableHost {
        target: String,
        tried: Vec<String>,
        last_error: Option<String>,
    },

    #[error("unknown platform or platform group: {0}")]
    UnknownPlatform(String),

    /// Every job waiting on the selection was killed.
    #[error("cancelled")]
    Cancelled,
}

/// Orders candidate names for one selection.
pub trait SelectionPolicy: Send + Sync {
    fn order(&self, items: Vec<String>) -> Vec<String>;
}

/// Left to right as configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionOrder;

impl SelectionPolicy for DefinitionOrder {
    fn order(&self, items: Vec<String>) -> Vec<String> {
        items
    }
}

/// Shuffled afresh for every selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomOrder;

impl SelectionPolicy for RandomOrder {
    fn order(&self, mut items: Vec<String>) -> Vec<String> {
        fastrand::shuffle(&mut items);
        items
    }
}

pub fn policy_for(method: SelectionMethod) -> Box<dyn SelectionPolicy> {
    match method {
        SelectionMethod::DefinitionOrder => Box::new(DefinitionOrder),
        SelectionMethod::Random => Box::new(RandomOrder),
    }
}

/// A concrete choice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate {
    pub platform: String,
    pub host: String,
}

/// State of one in-progress selection.
#[derive(Debug, Clone)]
pub struct SelectionAttempt {
    target: String,
    /// Platforms in selection order, each with hosts in selection order.
    order: Vec<(PlatformDef, Vec<String>)>,
    tried: BTreeSet<Candidate>,
    ruled_out: BTreeSet<String>,
    attempts: usize,
    finished: bool,
    exhaustion_retry_used: bool,
    last_error: Option<String>,
}

impl SelectionAttempt {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn tried(&self) -> impl Iterator<Item = &Candidate> {
        self.tried.iter()
    }

    fn exhausted(&self) -> SelectError {
        SelectError::NoReachableHost {
            target: self.target.clone(),
            tried: self.tried.iter().map(|c| c.host.clone()).collect(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Clone)]
pub struct PlatformSelector {
    registry: Arc<PlatformRegistry>,
    bad_hosts: SharedBadHosts,
    retry_unit: RetryUnit,
    exhaustion_retry: bool,
}

impl std::fmt::Debug for PlatformSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSelector")
            .field("retry_unit", &self.retry_unit)
            .field("exhaustion_retry", &self.exhaustion_retry)
            .finish_non_exhaustive()
    }
}

impl PlatformSelector {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        bad_hosts: SharedBadHosts,
        retry_unit: RetryUnit,
        exhaustion_retry: bool,
    ) -> Self {
        Self {
            registry,
            bad_hosts,
            retry_unit,
            exhaustion_retry,
        }
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn bad_hosts(&self) -> &SharedBadHosts {
        &self.bad_hosts
    }

    /// Start a selection for a platform or group name.
    pub fn begin(&self, target: &str) -> Result<SelectionAttempt, SelectError> {
        let candidates = self
            .registry
            .candidates(target)
            .ok_or_else(|| SelectError::UnknownPlatform(target.to_string()))?;
        let by_name: Vec<String> = candidates.platforms.iter().map(|p| p.name.clone()).collect();
        let ordered = policy_for(candidates.selection).order(by_name);
        let order = ordered
            .into_iter()
            .filter_map(|name| self.registry.platform(&name).cloned())
            .map(|p| {
                let hosts = policy_for(p.host_selection).order(p.hosts.clone());
                (p, hosts)
            })
            .collect();
        Ok(SelectionAttempt {
            target: target.to_string(),
            order,
            tried: BTreeSet::new(),
            ruled_out: BTreeSet::new(),
            attempts: 0,
            finished: false,
            exhaustion_retry_used: false,
            last_error: None,
        })
    }

    /// Next candidate to try, skipping tried, ruled-out and bad ones.
    pub fn next(&self, attempt: &mut SelectionAttempt) -> Result<Candidate, SelectError> {
        if attempt.finished {
            return Err(attempt.exhausted());
        }
        let found = {
            let reg = bad_hosts::lock(&self.bad_hosts);
            self.find(attempt, |platform, host| {
                !reg.is_bad_platform(platform) && !reg.is_bad_host(host)
            })
        };
        let found = match found {
            Some(c) => Some(c),
            None if self.exhaustion_retry && !attempt.exhaustion_retry_used => {
                attempt.exhaustion_retry_used = true;
                let retry = self.find(attempt, |_, _| true);
                if let Some(c) = &retry {
                    info!(
                        target = %attempt.target,
                        host = %c.host,
                        "all candidates are bad; retrying a bad host"
                    );
                }
                retry
            }
            None => None,
        };
        match found {
            Some(candidate) => {
                attempt.attempts += 1;
                attempt.tried.insert(candidate.clone());
                debug!(
                    target = %attempt.target,
                    platform = %candidate.platform,
                    host = %candidate.host,
                    attempt = attempt.attempts,
                    "selected host"
                );
                Ok(candidate)
            }
            None => Err(attempt.exhausted()),
        }
    }

    fn find(
        &self,
        attempt: &SelectionAttempt,
        usable: impl Fn(&str, &str) -> bool,
    ) -> Option<Candidate> {
        for (platform, hosts) in &attempt.order {
            if attempt.ruled_out.contains(&platform.name) {
                continue;
            }
            for host in hosts {
                let c = Candidate {
                    platform: platform.name.clone(),
                    host: host.clone(),
                };
                if !attempt.tried.contains(&c) && usable(&platform.name, host) {
                    return Some(c);
                }
            }
        }
        None
    }

    /// Convenience: the first usable candidate without reporting outcomes.
    pub fn select(&self, target: &str) -> Result<Candidate, SelectError> {
        let mut attempt = self.begin(target)?;
        self.next(&mut attempt)
    }

    /// Record that `candidate`'s host could not be contacted.
    pub fn report_unreachable(
        &self,
        attempt: &mut SelectionAttempt,
        candidate: &Candidate,
        reason: &str,
        now: Instant,
    ) {
        attempt.last_error = Some(reason.to_string());
        let mut reg = bad_hosts::lock(&self.bad_hosts);
        reg.add_host(&candidate.host, now);

        let platform_exhausted = attempt
            .order
            .iter()
            .find(|(p, _)| p.name == candidate.platform)
            .is_some_and(|(_, hosts)| hosts.iter().all(|h| reg.is_bad_host(h)));
        if platform_exhausted {
            reg.add_platform(&candidate.platform, now);
        }
        drop(reg);

        let remaining = self.remaining_after_failure(attempt, candidate);
        warn!(
            target = %attempt.target,
            platform = %candidate.platform,
            host = %candidate.host,
            retry_unit = %self.retry_unit,
            remaining,
            reason,
            "host unreachable"
        );
    }

    fn remaining_after_failure(&self, attempt: &mut SelectionAttempt, candidate: &Candidate) -> usize {
        match self.retry_unit {
            RetryUnit::Host => {}
            RetryUnit::Platform => {
                attempt.ruled_out.insert(candidate.platform.clone());
            }
            RetryUnit::Group => attempt.finished = true,
        }
        if attempt.finished {
            return 0;
        }
        attempt
            .order
            .iter()
            .filter(|(p, _)| !attempt.ruled_out.contains(&p.name))
            .map(|(p, hosts)| {
                hosts
                    .iter()
                    .filter(|h| {
                        !attempt.tried.contains(&Candidate {
                            platform: p.name.clone(),
                            host: (*h).clone(),
                        })
                    })
                    .count()
            })
            .sum()
    }

    /// The platform refused the operation: skip its other hosts.
    pub fn report_platform_error(&self, attempt: &mut SelectionAttempt, candidate: &Candidate, error: &str) {
        attempt.last_error = Some(error.to_string());
        attempt.ruled_out.insert(candidate.platform.clone());
        if self.retry_unit == RetryUnit::Group {
            attempt.finished = true;
        }
        warn!(
            target = %attempt.target,
            platform = %candidate.platform,
            host = %candidate.host,
            error,
            "platform rejected the command; trying other platforms only"
        );
    }

    /// Successful contact clears the host's bad entry.
    pub fn report_success(&self, candidate: &Candidate) {
        bad_hosts::lock(&self.bad_hosts).remove_host(&candidate.host, Some(&candidate.platform));
    }

    /// Run `op` against candidates until one succeeds.
    ///
    /// Unreachable hosts are added to the bad host registry and the next
    /// candidate is tried; a rejection rules out the platform. Fails with
    /// [`SelectError::NoReachableHost`] once every candidate is used up.
    pub async fn first_reachable<T, F, Fut>(
        &self,
        target: &str,
        mut op: F,
    ) -> Result<(Candidate, T), SelectError>
    where
        F: FnMut(Candidate) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = self.begin(target)?;
        loop {
            let candidate = self.next(&mut attempt)?;
            match op(candidate.clone()).await {
                Ok(value) => {
                    self.report_success(&candidate);
                    return Ok((candidate, value));
                }
                Err(RemoteError::Unreachable { reason, .. }) => {
                    self.report_unreachable(&mut attempt, &candidate, &reason, Instant::now());
                }
                Err(err @ RemoteError::Rejected { .. }) => {
                    self.report_platform_error(&mut attempt, &candidate, &err.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::bad_hosts::BadHostRegistry;
    use crate::platform::model::PlatformGroup;
    use std::time::Duration;

    fn platform(name: &str, hosts: &[&str]) -> PlatformDef {
        let mut p = PlatformDef::localhost();
        p.name = name.to_string();
        p.hosts = hosts.iter().map(|h| h.to_string()).collect();
        p.install_target = name.to_string();
        p
    }

    fn selector(unit: RetryUnit, exhaustion_retry: bool) -> PlatformSelector {
        let registry = PlatformRegistry::new(
            vec![platform("p1", &["a1", "a2"]), platform("p2", &["b1"])],
            vec![PlatformGroup {
                name: "g".into(),
                platforms: vec!["p1".into(), "p2".into()],
                selection: SelectionMethod::DefinitionOrder,
            }],
        );
        PlatformSelector::new(
            Arc::new(registry),
            BadHostRegistry::shared(Duration::from_secs(600), Instant::now()),
            unit,
            exhaustion_retry,
        )
    }

    #[test]
    fn host_unit_walks_every_host_of_every_platform() {
        let sel = selector(RetryUnit::Host, false);
        let mut attempt = sel.begin("g").unwrap();
        let mut seen = Vec::new();
        while let Ok(c) = sel.next(&mut attempt) {
            seen.push(c.host.clone());
            sel.report_unreachable(&mut attempt, &c, "down", Instant::now());
        }
        assert_eq!(seen, vec!["a1", "a2", "b1"]);
        let reg = bad_hosts::lock(sel.bad_hosts());
        assert!(reg.is_bad_platform("p1"));
        assert!(reg.is_bad_platform("p2"));
    }

    #[test]
    fn platform_unit_skips_rest_of_platform() {
        let sel = selector(RetryUnit::Platform, false);
        let mut attempt = sel.begin("g").unwrap();
        let c = sel.next(&mut attempt).unwrap();
        sel.report_unreachable(&mut attempt, &c, "down", Instant::now());
        assert_eq!(sel.next(&mut attempt).unwrap().host, "b1");
    }

    #[test]
    fn group_unit_allows_a_single_attempt() {
        let sel = selector(RetryUnit::Group, false);
        let mut attempt = sel.begin("g").unwrap();
        let c = sel.next(&mut attempt).unwrap();
        sel.report_unreachable(&mut attempt, &c, "down", Instant::now());
        assert!(matches!(sel.next(&mut attempt), Err(SelectError::NoReachableHost { .. })));
    }

    #[test]
    fn bad_hosts_are_skipped_until_cleared() {
        let sel = selector(RetryUnit::Host, false);
        bad_hosts::lock(sel.bad_hosts()).add_host("a1", Instant::now());
        assert_eq!(sel.select("p1").unwrap().host, "a2");

        bad_hosts::lock(sel.bad_hosts()).clear(Instant::now());
        assert_eq!(sel.select("p1").unwrap().host, "a1");
    }

    #[test]
    fn exhaustion_retry_falls_back_to_bad_hosts() {
        let strict = selector(RetryUnit::Host, false);
        bad_hosts::lock(strict.bad_hosts()).add_host("b1", Instant::now());
        assert!(strict.select("p2").is_err());

        let lenient = selector(RetryUnit::Host, true);
        bad_hosts::lock(lenient.bad_hosts()).add_host("b1", Instant::now());
        assert_eq!(lenient.select("p2").unwrap().host, "b1");
    }

    #[test]
    fn unknown_target() {
        let sel = selector(RetryUnit::Host, false);
        assert_eq!(
            sel.select("nope").unwrap_err(),
            SelectError::UnknownPlatform("nope".into())
        );
    }
}
