// src/retry.rs

//! Delayed-retry scheduling driven by explicit clock readings.
//!
//! One [`EventRetryQueue`] serves every kind of timed follow-up in the
//! scheduler: job submission retries, execution retries, poll backoff,
//! execution time limit polls and event handler retries. Each key carries a
//! [`RetryPolicy`] (an ordered list of delays) and consumes one delay per
//! `schedule` call until the list is exhausted.
//!
//! The queue never reads the clock itself. Callers pass `now`, which keeps
//! the scheduler core deterministic under test.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// Ordered delay list for one key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    repeat_last: bool,
}

impl RetryPolicy {
    /// Each delay is used once; after the last one the key is exhausted.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            repeat_last: false,
        }
    }

    /// The last delay repeats forever (polling intervals).
    pub fn repeating(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            repeat_last: true,
        }
    }

    /// A policy that is exhausted from the start.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Total attempts allowed, `None` when the last delay repeats.
    pub fn max_attempts(&self) -> Option<usize> {
        if self.repeat_last && !self.delays.is_empty() {
            None
        } else {
            Some(self.delays.len())
        }
    }

    /// Delay for the zero-based `attempt`, or `None` once exhausted.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        match self.delays.get(attempt) {
            Some(d) => Some(*d),
            None if self.repeat_last => self.delays.last().copied(),
            None => None,
        }
    }
}

/// Result of asking the queue to schedule another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The key fires at `due`. `attempt` is 1-based; `remaining` is the
    /// number of further attempts after this one (`None` = unbounded).
    Scheduled {
        due: Instant,
        delay: Duration,
        attempt: usize,
        remaining: Option<usize>,
    },
    /// The delay list is used up; the caller should treat this as final.
    Exhausted { attempts: usize },
}

#[derive(Debug, Clone)]
struct RetryEntry {
    policy: RetryPolicy,
    consumed: usize,
    due: Option<Instant>,
}

/// Generic per-key retry timer.
#[derive(Debug, Clone)]
pub struct EventRetryQueue<K: Ord + Clone> {
    entries: BTreeMap<K, RetryEntry>,
}

impl<K: Ord + Clone + std::fmt::Debug> Default for EventRetryQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + std::fmt::Debug> EventRetryQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register (or replace) the policy for `key`, resetting its attempt
    /// count and cancelling any pending fire.
    pub fn set_policy(&mut self, key: K, policy: RetryPolicy) {
        self.entries.insert(
            key,
            RetryEntry {
                policy,
                consumed: 0,
                due: None,
            },
        );
    }

    pub fn has_policy(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Consume the next delay for `key` and arm its timer.
    ///
    /// A key with no registered policy is exhausted immediately.
    pub fn schedule(&mut self, key: &K, now: Instant) -> ScheduleOutcome {
        let Some(entry) = self.entries.get_mut(key) else {
            return ScheduleOutcome::Exhausted { attempts: 0 };
        };
        match entry.policy.delay_for(entry.consumed) {
            Some(delay) => {
                entry.consumed += 1;
                let due = now + delay;
                entry.due = Some(due);
                let remaining = entry
                    .policy
                    .max_attempts()
                    .map(|max| max.saturating_sub(entry.consumed));
                debug!(?key, ?delay, attempt = entry.consumed, ?remaining, "retry timer armed");
                ScheduleOutcome::Scheduled {
                    due,
                    delay,
                    attempt: entry.consumed,
                    remaining,
                }
            }
            None => {
                entry.due = None;
                ScheduleOutcome::Exhausted {
                    attempts: entry.consumed,
                }
            }
        }
    }

    /// Register `policy` if `key` has none yet, then [`schedule`](Self::schedule).
    pub fn schedule_with(&mut self, key: K, policy: impl FnOnce() -> RetryPolicy, now: Instant) -> ScheduleOutcome {
        if !self.entries.contains_key(&key) {
            self.set_policy(key.clone(), policy());
        }
        self.schedule(&key, now)
    }

    /// Remove and return every key whose timer is due at `now`, earliest
    /// first. The attempt count is kept so later `schedule` calls continue
    /// down the delay list.
    pub fn poll_due(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .entries
            .iter()
            .filter_map(|(k, e)| e.due.filter(|d| *d <= now).map(|d| (d, k.clone())))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, key) in &due {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.due = None;
            }
        }
        due.into_iter().map(|(_, k)| k).collect()
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.due).min()
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|e| e.due.is_some())
    }

    /// Attempts consumed so far for `key`.
    pub fn attempts(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, |e| e.consumed)
    }

    /// Disarm the timer but keep the attempt count.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => entry.due.take().is_some(),
            None => false,
        }
    }

    /// Forget `key` entirely.
    pub fn reset(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Forget every key matching `pred`.
    pub fn reset_where(&mut self, mut pred: impl FnMut(&K) -> bool) {
        self.entries.retain(|k, _| !pred(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn consumes_delays_in_order_then_exhausts() {
        let t0 = Instant::now();
        let mut q = EventRetryQueue::new();
        q.set_policy("job", RetryPolicy::new(vec![secs(0), secs(1), secs(1)]));

        assert!(matches!(
            q.schedule(&"job", t0),
            ScheduleOutcome::Scheduled { attempt: 1, remaining: Some(2), .. }
        ));
        assert_eq!(q.poll_due(t0), vec!["job"]);
        assert!(matches!(q.schedule(&"job", t0), ScheduleOutcome::Scheduled { attempt: 2, .. }));
        assert!(q.poll_due(t0).is_empty());
        assert_eq!(q.poll_due(t0 + secs(1)), vec!["job"]);
        assert!(matches!(q.schedule(&"job", t0), ScheduleOutcome::Scheduled { attempt: 3, remaining: Some(0), .. }));
        assert!(matches!(q.schedule(&"job", t0), ScheduleOutcome::Exhausted { attempts: 3 }));
    }

    #[test]
    fn repeating_policy_never_exhausts() {
        let t0 = Instant::now();
        let mut q = EventRetryQueue::new();
        q.set_policy(1u32, RetryPolicy::repeating(vec![secs(5), secs(10)]));
        for _ in 0..5 {
            assert!(matches!(q.schedule(&1, t0), ScheduleOutcome::Scheduled { remaining: None, .. }));
        }
        assert_eq!(q.next_deadline(), Some(t0 + secs(10)));
    }

    #[test]
    fn cancel_keeps_count_reset_forgets() {
        let t0 = Instant::now();
        let mut q = EventRetryQueue::new();
        q.schedule_with("k", || RetryPolicy::new(vec![secs(3)]), t0);
        assert!(q.cancel(&"k"));
        assert!(q.poll_due(t0 + secs(10)).is_empty());
        assert_eq!(q.attempts(&"k"), 1);
        q.reset(&"k");
        assert_eq!(q.attempts(&"k"), 0);
        assert!(matches!(q.schedule(&"k", t0), ScheduleOutcome::Exhausted { attempts: 0 }));
    }
}
