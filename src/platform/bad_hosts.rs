// src/platform/bad_hosts.rs

//! Registry of hosts and platforms recently found unreachable.
//!
//! The control loop owns the periodic full clear; dispatch workers insert
//! entries and remove a host again after talking to it successfully. The
//! registry is shared as [`SharedBadHosts`] and the lock is never held
//! across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BadHostRegistry {
    hosts: BTreeMap<String, Instant>,
    platforms: BTreeMap<String, Instant>,
    clear_interval: Duration,
    last_cleared: Instant,
    /// Incremented on every full clear.
    generation: u64,
}

pub type SharedBadHosts = Arc<Mutex<BadHostRegistry>>;

impl BadHostRegistry {
    pub fn new(clear_interval: Duration, now: Instant) -> Self {
        Self {
            hosts: BTreeMap::new(),
            platforms: BTreeMap::new(),
            clear_interval,
            last_cleared: now,
            generation: 0,
        }
    }

    pub fn shared(clear_interval: Duration, now: Instant) -> SharedBadHosts {
        Arc::new(Mutex::new(Self::new(clear_interval, now)))
    }

    /// Returns true if the host was not already marked bad.
    pub fn add_host(&mut self, host: &str, now: Instant) -> bool {
        let fresh = self.hosts.insert(host.to_string(), now).is_none();
        if fresh {
            warn!(host, "host added to bad host registry");
        }
        fresh
    }

    pub fn add_platform(&mut self, platform: &str, now: Instant) -> bool {
        let fresh = self.platforms.insert(platform.to_string(), now).is_none();
        if fresh {
            warn!(platform, "platform added to bad host registry: all hosts unreachable");
        }
        fresh
    }

    pub fn is_bad_host(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    pub fn is_bad_platform(&self, platform: &str) -> bool {
        self.platforms.contains_key(platform)
    }

    /// Successful contact: the host (and any platform entry that listed it)
    /// is usable again.
    pub fn remove_host(&mut self, host: &str, platform: Option<&str>) {
        if self.hosts.remove(host).is_some() {
            info!(host, "host removed from bad host registry after successful contact");
        }
        if let Some(p) = platform {
            self.platforms.remove(p);
        }
    }

    pub fn bad_hosts(&self) -> Vec<(String, Instant)> {
        self.hosts.iter().map(|(h, t)| (h.clone(), *t)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.platforms.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Empty the registry. Returns the number of entries dropped.
    pub fn clear(&mut self, now: Instant) -> usize {
        let dropped = self.hosts.len() + self.platforms.len();
        self.hosts.clear();
        self.platforms.clear();
        self.last_cleared = now;
        self.generation += 1;
        if dropped > 0 {
            info!(dropped, "bad host registry cleared");
        } else {
            debug!("bad host registry cleared (was empty)");
        }
        dropped
    }

    pub fn next_clear_at(&self) -> Instant {
        self.last_cleared + self.clear_interval
    }

    /// Clear if the interval has elapsed since the last clear.
    pub fn maybe_clear(&mut self, now: Instant) -> bool {
        if now >= self.next_clear_at() {
            self.clear(now);
            true
        } else {
            false
        }
    }
}

/// Lock the shared registry, recovering from a poisoned lock: the registry
/// holds no invariants a panicking writer could break.
pub fn lock(shared: &SharedBadHosts) -> MutexGuard<'_, BadHostRegistry> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
