// src/pool/task_pool.rs

//! The pool of live task proxies.
//!
//! Owns every spawned [`TaskProxy`] and decides, between job outcomes,
//! which tasks exist and which may run:
//!
//! 1. spawn up to the runahead limit;
//! 2. publish newly completed outputs straight to the tasks that wait on
//!    them, then re-evaluate only the tasks that changed;
//! 3. release queued tasks within the queue limits;
//! 4. drop finished tasks that fell behind the runahead base.
//!
//! Anything that mutates a proxy goes through [`TaskPool::get_mut`], which
//! marks it for re-evaluation on the next [`settle`](TaskPool::settle).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::model::RunaheadLimit;
use crate::cycling::CyclePoint;
use crate::errors::{CycloramaError, Result};
use crate::graph::{GraphExpander, WorkflowDefinition};
use crate::pool::broadcast::BroadcastStore;
use crate::pool::checkpoint::{Snapshot, SNAPSHOT_VERSION};
use crate::pool::ledger::OutputLedger;
use crate::pool::queues::QueueSet;
use crate::task::{OutputRef, TaskEvent, TaskId, TaskProxy, TaskStatus};

/// One row of the task query interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub point: CyclePoint,
    pub status: TaskStatus,
    pub held: bool,
    pub platform: Option<String>,
    pub host: Option<String>,
    pub submit_num: u32,
    pub job_id: Option<String>,
}

impl From<&TaskProxy> for TaskSummary {
    fn from(t: &TaskProxy) -> Self {
        Self {
            name: t.id.name.clone(),
            point: t.id.point,
            status: t.status(),
            held: t.is_held(),
            platform: t.platform.clone(),
            host: t.host.clone(),
            submit_num: t.submit_num(),
            job_id: t.job_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TaskPool {
    tasks: BTreeMap<TaskId, TaskProxy>,
    /// Upstream output -> tasks whose prerequisites mention it.
    dependents: BTreeMap<OutputRef, BTreeSet<TaskId>>,
    /// Tasks to re-evaluate on the next settle.
    dirty: BTreeSet<TaskId>,
    ledger: OutputLedger,
    expander: GraphExpander,
    runahead: RunaheadLimit,
    queues: QueueSet,
    broadcasts: BroadcastStore,
    /// Wall clock for `clock_expire`.
    clock: fn() -> DateTime<Utc>,
}

impl TaskPool {
    pub fn new(expander: GraphExpander, runahead: RunaheadLimit, queues: QueueSet) -> Self {
        Self {
            tasks: BTreeMap::new(),
            dependents: BTreeMap::new(),
            dirty: BTreeSet::new(),
            ledger: OutputLedger::new(),
            expander,
            runahead,
            queues,
            broadcasts: BroadcastStore::new(),
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        self.expander.definition()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskProxy> {
        self.tasks.values()
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskProxy> {
        self.tasks.get(id)
    }

    /// Mutable access; the task is re-evaluated on the next settle.
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskProxy> {
        let task = self.tasks.get_mut(id)?;
        self.dirty.insert(id.clone());
        Some(task)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ledger(&self) -> &OutputLedger {
        &self.ledger
    }

    pub fn broadcasts(&self) -> &BroadcastStore {
        &self.broadcasts
    }

    pub fn broadcasts_mut(&mut self) -> &mut BroadcastStore {
        &mut self.broadcasts
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.values().map(TaskSummary::from).collect()
    }

    // ---- runahead ----------------------------------------------------------

    /// Oldest point with unfinished business: a task not yet terminal, or
    /// one that finished incomplete. With nothing unfinished, the next
    /// point still to be spawned.
    pub fn runahead_base(&self) -> Option<CyclePoint> {
        self.tasks
            .values()
            .filter(|t| !t.status().is_terminal() || t.is_incomplete())
            .map(|t| t.id.point)
            .min()
            .or_else(|| self.expander.next_cycle_point())
    }

    /// Highest point the pool may spawn up to from `base`.
    pub fn runahead_limit(&self, base: CyclePoint) -> CyclePoint {
        match &self.runahead {
            RunaheadLimit::Interval(iv) => base.checked_add(iv).unwrap_or(base),
            RunaheadLimit::Cycles(n) => {
                let def = self.expander.definition();
                let mut point = base;
                for _ in 0..*n {
                    let next = def
                        .task_names()
                        .filter_map(|name| def.next_point(name, Some(point)))
                        .min();
                    match next {
                        Some(p) => point = p,
                        None => break,
                    }
                }
                point
            }
        }
    }

    // ---- spawning ------------------------------------------------------------

    /// Spawn every instance inside the runahead window. Returns how many
    /// were added.
    pub fn spawn(&mut self) -> usize {
        let Some(base) = self.runahead_base() else {
            return 0;
        };
        let limit = self.runahead_limit(base);
        let mut added = 0;
        for proxy in self.expander.spawn(limit) {
            if self.insert(proxy) {
                added += 1;
            }
        }
        added
    }

    /// Spawn one instance ahead of the window, for an operator trigger.
    pub fn spawn_task(&mut self, id: &TaskId) -> bool {
        if self.tasks.contains_key(id) {
            return true;
        }
        match self.expander.spawn_one(&id.name, id.point) {
            Some(proxy) => {
                info!(task = %id, "spawned on demand");
                self.insert(proxy)
            }
            None => false,
        }
    }

    /// Add a proxy, satisfying prerequisites from the ledger and indexing
    /// it under every output it refers to. Existing instances win.
    fn insert(&mut self, mut proxy: TaskProxy) -> bool {
        if self.tasks.contains_key(&proxy.id) {
            return false;
        }
        for output in referenced_outputs(&proxy) {
            if self.ledger.contains(&output) {
                proxy.satisfy(&output);
            }
            self.dependents
                .entry(output)
                .or_default()
                .insert(proxy.id.clone());
        }
        debug!(task = %proxy.id, status = %proxy.status(), "task added to pool");
        self.dirty.insert(proxy.id.clone());
        self.tasks.insert(proxy.id.clone(), proxy);
        true
    }

    fn drop_task(&mut self, id: &TaskId) {
        let Some(proxy) = self.tasks.remove(id) else {
            return;
        };
        for output in referenced_outputs(&proxy) {
            if let Some(ids) = self.dependents.get_mut(&output) {
                ids.remove(id);
                if ids.is_empty() {
                    self.dependents.remove(&output);
                }
            }
        }
        self.dirty.remove(id);
        debug!(task = %id, status = %proxy.status(), "task removed from pool");
    }

    // ---- propagation ------------------------------------------------------------

    fn publish(&mut self, output: OutputRef) {
        self.ledger.record(&output);
        let Some(ids) = self.dependents.get(&output) else {
            return;
        };
        for id in ids {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.satisfy(&output) {
                    debug!(task = %id, upstream = %output, "prerequisite satisfied");
                    self.dirty.insert(id.clone());
                }
            }
        }
    }

    /// Publish new outputs and re-evaluate changed tasks until nothing
    /// moves. Returns the task events raised along the way.
    pub fn settle(&mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        loop {
            let batch = std::mem::take(&mut self.dirty);
            if batch.is_empty() {
                break;
            }
            for id in batch {
                let Some(task) = self.tasks.get_mut(&id) else {
                    continue;
                };
                for output in task.take_new_outputs() {
                    self.publish(output);
                }
                self.update_readiness(&id);
                if let Some(task) = self.tasks.get_mut(&id) {
                    events.extend(task.take_events());
                }
            }
        }
        events
    }

    fn update_readiness(&mut self, id: &TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let status = task.status();
        if status.is_terminal() || status.is_active() {
            return;
        }
        if task.suicide_fired() {
            info!(task = %id, %status, "suicide trigger fired");
            task.remove("suicide trigger fired");
            return;
        }
        let would_run = match status {
            TaskStatus::Waiting => task.prerequisites_satisfied(),
            TaskStatus::Queued => true,
            _ => false,
        };
        let now = (self.clock)();
        if would_run && !task.is_held() && past_clock_expiry(self.expander.definition(), task, now) {
            info!(task = %id, "clock expired; skipping job");
            task.expire("clock expired; skipping job");
            self.dirty.insert(id.clone());
            return;
        }
        match status {
            TaskStatus::Waiting if task.prerequisites_satisfied() => {
                if !task.is_held() {
                    task.queue();
                }
            }
            TaskStatus::Waiting if !task.prerequisites_satisfiable() => {
                warn!(task = %id, "prerequisites can never be satisfied; removing task");
                task.remove("prerequisites can never be satisfied");
            }
            TaskStatus::Queued if !task.prerequisites_satisfied() => task.unqueue(),
            _ => {}
        }
    }

    /// Full prerequisite check of every task against the ledger, for
    /// restarts.
    pub fn rescan(&mut self) {
        let ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        for id in &ids {
            self.rescan_task(id);
        }
    }

    /// Re-satisfy one task's prerequisites from outputs already in the
    /// ledger. Needed after an operator reset, since those outputs are
    /// never published again.
    pub fn rescan_task(&mut self, id: &TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let awaited: Vec<OutputRef> = task.awaited_outputs().cloned().collect();
        for output in awaited {
            if self.ledger.contains(&output) {
                task.satisfy(&output);
            }
        }
        self.dirty.insert(id.clone());
    }

    /// Mark queued tasks whose clock expiry has passed for re-evaluation,
    /// so they expire on the next settle rather than wait for a queue slot.
    pub fn expire_overdue(&mut self) -> usize {
        let now = (self.clock)();
        let def = self.expander.definition();
        let overdue: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status() == TaskStatus::Queued && past_clock_expiry(def, t, now))
            .map(|t| t.id.clone())
            .collect();
        let n = overdue.len();
        self.dirty.extend(overdue);
        n
    }

    /// Spawn, settle and housekeep until the window stops moving.
    pub fn advance(&mut self) -> Vec<TaskEvent> {
        let mut events = self.settle();
        loop {
            let added = self.spawn();
            events.extend(self.settle());
            if added == 0 {
                break;
            }
        }
        self.housekeep();
        events
    }

    /// Queued tasks allowed to start a submission now.
    pub fn release_queued(&self) -> Vec<TaskId> {
        self.queues.release(self.tasks.values())
    }

    /// Drop finished tasks behind the runahead base, and ledger rows and
    /// broadcasts nothing can need any more.
    pub fn housekeep(&mut self) -> usize {
        let Some(base) = self.runahead_base() else {
            return 0;
        };
        let done: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.id.point < base && t.status().is_terminal() && !t.is_incomplete())
            .map(|t| t.id.clone())
            .collect();
        for id in &done {
            self.drop_task(id);
        }
        let def = Arc::clone(self.expander.definition());
        let pruned = self
            .ledger
            .prune_before(def.oldest_reference(base), &def.anchored_points());
        self.broadcasts.clear_before(base);
        if !done.is_empty() || pruned > 0 {
            debug!(removed = done.len(), pruned, %base, "housekeeping");
        }
        done.len()
    }

    // ---- whole-pool conditions ----------------------------------------------

    /// Nothing can move without outside help: no job in flight, no retry
    /// pending, nothing queued to submit, yet some task is unfinished.
    pub fn is_stalled(&self) -> bool {
        let mut unfinished = false;
        for t in self.tasks.values() {
            let status = t.status();
            if status.is_active() || status.is_retrying() || (status == TaskStatus::Queued && !t.is_held()) {
                return false;
            }
            if !status.is_terminal() || t.is_incomplete() {
                unfinished = true;
            }
        }
        unfinished
    }

    /// Every task has finished and nothing is left to spawn.
    pub fn is_idle(&self) -> bool {
        self.expander.is_exhausted() && self.tasks.values().all(|t| t.status().is_terminal())
    }

    /// Tasks that finished with an unexpected outcome.
    pub fn incomplete(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.is_incomplete())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Human-readable reasons for a stall, one line per stuck task.
    pub fn stall_report(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for t in self.tasks.values() {
            if t.is_incomplete() {
                lines.push(format!("{} finished incomplete ({})", t.id, t.status()));
            } else if t.status() == TaskStatus::Waiting {
                let awaited: Vec<String> = t.awaited_outputs().map(ToString::to_string).collect();
                let held = if t.is_held() { " (held)" } else { "" };
                lines.push(format!("{}{held} waiting on {}", t.id, awaited.join(", ")));
            } else if t.is_held() {
                lines.push(format!("{} held ({})", t.id, t.status()));
            }
        }
        lines
    }

    // ---- operator support ----------------------------------------------------

    /// Task ids matching any of `patterns`: globs over `point/name`, where
    /// the name may also be a family the task belongs to.
    pub fn matching(&self, patterns: &[String]) -> Result<Vec<TaskId>> {
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            let glob = Glob::new(p)
                .map_err(|e| CycloramaError::TaskNotFound(format!("bad task pattern '{p}': {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| CycloramaError::TaskNotFound(e.to_string()))?;
        let def = self.definition();
        Ok(self
            .tasks
            .values()
            .filter(|t| {
                set.is_match(t.id.to_string())
                    || def.task(&t.id.name).is_some_and(|d| {
                        d.ancestors
                            .iter()
                            .any(|fam| set.is_match(format!("{}/{fam}", t.id.point)))
                    })
            })
            .map(|t| t.id.clone())
            .collect())
    }

    /// Bring the ledger in line with a task's outputs after an operator
    /// command rewrote them.
    pub fn sync_ledger(&mut self, id: &TaskId) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        self.ledger.forget(id);
        for output in task.outputs().completed() {
            self.ledger.record(&OutputRef::new(id.clone(), output));
        }
    }

    // ---- checkpoint -------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        let def = self.expander.definition();
        Snapshot {
            version: SNAPSHOT_VERSION,
            initial_point: def.initial,
            tasks: self.tasks.values().cloned().collect(),
            ledger: self.ledger.entries(),
            spawned: def
                .task_names()
                .filter_map(|n| self.expander.spawned_up_to(n).map(|p| (n.to_string(), p)))
                .collect(),
            broadcasts: self.broadcasts.entries(),
        }
    }

    /// Replace the pool with a snapshot's contents. Tasks no longer in the
    /// workflow are dropped with a warning. Submissions that were in flight
    /// are queued again.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        let def = Arc::clone(self.expander.definition());
        if snapshot.initial_point != def.initial {
            return Err(CycloramaError::ConfigError(format!(
                "checkpoint initial cycle point {} does not match the workflow's {}",
                snapshot.initial_point, def.initial
            )));
        }
        self.tasks.clear();
        self.dependents.clear();
        self.dirty.clear();
        self.ledger = OutputLedger::from_entries(snapshot.ledger);
        self.broadcasts = BroadcastStore::from_entries(snapshot.broadcasts);
        for (name, point) in snapshot.spawned {
            if def.task(&name).is_some() {
                self.expander.mark_spawned(&TaskId::new(name, point));
            }
        }
        for mut task in snapshot.tasks {
            if def.task(&task.id.name).is_none() {
                warn!(task = %task.id, "task no longer in the workflow; dropped from checkpoint");
                continue;
            }
            task.restore_after_restart();
            self.insert(task);
        }
        self.rescan();
        info!(tasks = self.tasks.len(), "pool restored");
        Ok(())
    }
}

/// Every upstream output a proxy's prerequisites mention, satisfied or not.
/// Wall clock is past the task's cycle point plus its `clock_expire`
/// offset. Integer points never expire.
fn past_clock_expiry(def: &WorkflowDefinition, task: &TaskProxy, now: DateTime<Utc>) -> bool {
    let Some(offset) = def.task(&task.id.name).and_then(|d| d.runtime.clock_expire) else {
        return false;
    };
    match task.id.point.checked_add(&offset) {
        Some(CyclePoint::Calendar(at)) => now > at.and_utc(),
        _ => false,
    }
}

fn referenced_outputs(proxy: &TaskProxy) -> Vec<OutputRef> {
    proxy
        .prerequisites()
        .iter()
        .chain(proxy.suicide_prerequisites())
        .flat_map(|p| p.atoms().map(|(o, _)| o.clone()))
        .collect()
}
