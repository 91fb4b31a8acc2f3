// src/pool/queues.rs

//! Queue limits: which queued tasks may start a submission now.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::model::{QueueConfig, DEFAULT_QUEUE};
use crate::task::{TaskId, TaskProxy, TaskStatus};

/// Global and per-queue admission limits.
///
/// - At most `max_active_submissions` tasks are `ready` (submission in
///   flight) at once.
/// - Each named queue caps its members that are `ready`, `submitted` or
///   `running`. Tasks naming an unknown queue use `default`.
/// - Manually triggered tasks skip both limits but still use up slots.
/// - Held tasks are never released.
#[derive(Debug, Clone)]
pub struct QueueSet {
    max_active_submissions: usize,
    limits: BTreeMap<String, usize>,
}

impl QueueSet {
    pub fn new(max_active_submissions: usize, queues: &BTreeMap<String, QueueConfig>) -> Self {
        let mut limits: BTreeMap<String, usize> =
            queues.iter().map(|(name, q)| (name.clone(), q.limit)).collect();
        limits.entry(DEFAULT_QUEUE.to_string()).or_insert(usize::MAX);
        Self {
            max_active_submissions,
            limits,
        }
    }

    pub fn max_active_submissions(&self) -> usize {
        self.max_active_submissions
    }

    fn queue_of<'a>(&'a self, task: &'a TaskProxy) -> &'a str {
        if self.limits.contains_key(&task.queue) {
            &task.queue
        } else {
            DEFAULT_QUEUE
        }
    }

    fn limit(&self, queue: &str) -> usize {
        self.limits.get(queue).copied().unwrap_or(usize::MAX)
    }

    /// Queued tasks to move to `ready` this pass, oldest point first.
    pub fn release<'a>(&self, tasks: impl IntoIterator<Item = &'a TaskProxy> + Clone) -> Vec<TaskId> {
        let mut submitting = 0usize;
        let mut active: BTreeMap<&str, usize> = BTreeMap::new();
        for task in tasks.clone() {
            let status = task.status();
            if status == TaskStatus::Ready {
                submitting += 1;
            }
            if status.is_active() {
                *active.entry(self.queue_of(task)).or_default() += 1;
            }
        }

        let mut released = Vec::new();
        for task in tasks {
            if task.status() != TaskStatus::Queued || task.is_held() {
                continue;
            }
            let queue = self.queue_of(task);
            let in_queue = active.get(queue).copied().unwrap_or(0);
            if !task.is_manually_triggered() {
                if submitting >= self.max_active_submissions {
                    debug!(task = %task.id, "submission limit reached");
                    continue;
                }
                if in_queue >= self.limit(queue) {
                    debug!(task = %task.id, queue, "queue limit reached");
                    continue;
                }
            }
            submitting += 1;
            *active.entry(queue).or_default() += 1;
            released.push(task.id.clone());
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;

    fn queued(name: &str, p: i64, queue: &str) -> TaskProxy {
        let mut t = TaskProxy::new(TaskId::new(name, CyclePoint::Integer(p)), queue);
        t.queue();
        t
    }

    fn names(ids: &[TaskId]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn named_queue_limit_applies_to_active_members() {
        let queues = BTreeMap::from([("big".to_string(), QueueConfig { limit: 1 })]);
        let set = QueueSet::new(10, &queues);
        let mut running = queued("a", 1, "big");
        running.begin_submit();
        let tasks = vec![running, queued("b", 1, "big"), queued("c", 1, "default"), queued("d", 2, "nope")];
        assert_eq!(names(&set.release(&tasks)), vec!["1/c", "2/d"]);
    }

    #[test]
    fn global_cap_counts_submissions_in_flight() {
        let set = QueueSet::new(2, &BTreeMap::new());
        let mut held = queued("h", 1, "default");
        held.hold();
        let mut triggered = queued("t", 3, "default");
        triggered.trigger();
        let tasks = vec![held, queued("a", 1, "default"), queued("b", 2, "default"), queued("c", 2, "default"), triggered];
        assert_eq!(names(&set.release(&tasks)), vec!["1/a", "2/b", "3/t"]);
    }
}
