// src/graph/expander.rs

//! Lazy expansion of the static workflow into task instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cycling::CyclePoint;
use crate::errors::Result;
use crate::graph::definition::{ResolvedExpr, TaskDef, TriggerTemplate, WorkflowDefinition};
use crate::task::outputs::TaskOutputs;
use crate::task::prerequisite::{AtomState, OutputRef, PrereqExpr, Prerequisite};
use crate::task::{TaskId, TaskProxy};

/// Produces task proxies for each task's points as the pool's window moves
/// forward.
///
/// Remembers the highest point spawned per task, so calling
/// [`spawn`](GraphExpander::spawn) again with the same (or a lower) bound
/// produces nothing new.
#[derive(Debug, Clone)]
pub struct GraphExpander {
    def: Arc<WorkflowDefinition>,
    spawned_up_to: BTreeMap<String, CyclePoint>,
}

impl GraphExpander {
    pub fn new(def: Arc<WorkflowDefinition>) -> Self {
        Self {
            def,
            spawned_up_to: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.def
    }

    /// Design-time check for dependency loops between instances.
    pub fn detect_cycles(&self) -> Result<()> {
        self.def.detect_cycles()
    }

    /// Every not-yet-spawned instance at or before `upper`, oldest first.
    pub fn spawn(&mut self, upper: CyclePoint) -> Vec<TaskProxy> {
        let def = Arc::clone(&self.def);
        let mut spawned = Vec::new();
        for task in def.tasks() {
            let mut next = self.next_unspawned(&task.name);
            while let Some(point) = next.filter(|p| *p <= upper) {
                spawned.push(self.build_proxy(task, point));
                self.spawned_up_to.insert(task.name.clone(), point);
                next = def.next_point(&task.name, Some(point));
            }
        }
        spawned.sort_by(|a, b| a.id.cmp(&b.id));
        if !spawned.is_empty() {
            debug!(count = spawned.len(), %upper, "spawned task instances");
        }
        spawned
    }

    /// Build the proxy for one instance without recording it as spawned.
    /// Returns `None` when `name` does not run at `point`.
    pub fn spawn_one(&self, name: &str, point: CyclePoint) -> Option<TaskProxy> {
        if !self.def.is_valid_point(name, point) {
            return None;
        }
        let task = self.def.task(name)?;
        Some(self.build_proxy(task, point))
    }

    /// Record instances restored from a checkpoint as already spawned.
    pub fn mark_spawned(&mut self, id: &TaskId) {
        let entry = self.spawned_up_to.entry(id.name.clone()).or_insert(id.point);
        if id.point > *entry {
            *entry = id.point;
        }
    }

    pub fn spawned_up_to(&self, name: &str) -> Option<CyclePoint> {
        self.spawned_up_to.get(name).copied()
    }

    fn next_unspawned(&self, name: &str) -> Option<CyclePoint> {
        self.def.next_point(name, self.spawned_up_to.get(name).copied())
    }

    /// Next point of `name` strictly after `after`.
    pub fn next_point(&self, name: &str, after: CyclePoint) -> Option<CyclePoint> {
        self.def.next_point(name, Some(after))
    }

    /// Earliest point any task has yet to spawn.
    pub fn next_cycle_point(&self) -> Option<CyclePoint> {
        self.def
            .task_names()
            .filter_map(|name| self.next_unspawned(name))
            .min()
    }

    pub fn is_valid_point(&self, name: &str, point: CyclePoint) -> bool {
        self.def.is_valid_point(name, point)
    }

    /// No task has points left to spawn.
    pub fn is_exhausted(&self) -> bool {
        self.next_cycle_point().is_none()
    }

    fn build_proxy(&self, task: &TaskDef, point: CyclePoint) -> TaskProxy {
        let id = TaskId::new(task.name.clone(), point);
        let mut prerequisites = Vec::new();
        let mut suicide = Vec::new();
        for trigger in self.def.triggers_at(task, point) {
            let prereq = self.instantiate(&id, trigger);
            if trigger.suicide {
                suicide.push(prereq);
            } else {
                prerequisites.push(prereq);
            }
        }
        TaskProxy::new(id, task.queue.clone())
            .with_outputs(
                TaskOutputs::new(&task.runtime.outputs),
                task.optional_outputs.clone(),
            )
            .with_prerequisites(prerequisites, suicide)
    }

    fn instantiate(&self, id: &TaskId, trigger: &TriggerTemplate) -> Prerequisite {
        let mut atoms = Vec::new();
        let expr = self.place(id, &trigger.expr, &mut atoms);
        Prerequisite::new(atoms, expr, trigger.label.clone())
    }

    fn place(&self, id: &TaskId, expr: &ResolvedExpr, atoms: &mut Vec<(OutputRef, AtomState)>) -> PrereqExpr {
        match expr {
            ResolvedExpr::Ref(r) => {
                let (point, state) = match r.point_for(id.point, self.def.initial) {
                    None => (id.point, AtomState::Unreachable),
                    Some(p) if p < self.def.initial => (p, AtomState::PreInitial),
                    Some(p) if self.def.is_valid_point(&r.task, p) => (p, AtomState::Unsatisfied),
                    Some(p) => (p, AtomState::Unreachable),
                };
                if state == AtomState::Unreachable {
                    warn!(
                        task = %id,
                        upstream = %format!("{point}/{}", r.task),
                        output = %r.output,
                        "prerequisite refers to a task instance that never exists"
                    );
                }
                atoms.push((OutputRef::new(TaskId::new(r.task.clone(), point), r.output.clone()), state));
                PrereqExpr::Atom(atoms.len() - 1)
            }
            ResolvedExpr::And(items) => {
                PrereqExpr::And(items.iter().map(|e| self.place(id, e, atoms)).collect())
            }
            ResolvedExpr::Or(items) => {
                PrereqExpr::Or(items.iter().map(|e| self.place(id, e, atoms)).collect())
            }
        }
    }
}
