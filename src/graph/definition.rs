// src/graph/definition.rs

//! The static workflow: task definitions, families and sequences.
//!
//! Built once at load time from the `[scheduling.graph]` strings and the
//! `[runtime]` namespaces. Namespace inheritance is flattened here so that
//! nothing at run time ever walks a family tree; family triggers are
//! expanded into plain per-member references.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, warn};

use crate::config::model::{RawNamespace, RawQueue, DEFAULT_QUEUE};
use crate::cycling::{
    parse_delay, parse_delays, parse_recurrence, CyclePoint, Interval, RecurrenceContext, Sequence,
};
use crate::errors::{CycloramaError, Result};
use crate::graph::parser::parse_graph;
use crate::graph::trigger::{AtomOffset, TriggerAtom, TriggerExpr};
use crate::platform::model::PlatformSpec;
use crate::task::outputs::{self, output_for_qualifier};
use crate::task::TaskId;
use crate::types::CyclingMode;

pub const ROOT_NAMESPACE: &str = "root";

/// Upper bound on task instances visited by the load-time cycle check.
const CYCLE_CHECK_NODE_LIMIT: usize = 20_000;

/// Instances per task used as starting points for the cycle check.
const CYCLE_CHECK_POINTS_PER_TASK: usize = 10;

/// Fully resolved runtime settings of one task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskRuntime {
    pub script: Option<String>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub platform: PlatformSpec,
    pub environment: BTreeMap<String, String>,
    pub execution_retry_delays: Vec<Duration>,
    pub submission_retry_delays: Vec<Duration>,
    pub execution_time_limit: Option<Duration>,
    /// Expire instead of submitting once the wall clock passes point + offset.
    pub clock_expire: Option<Interval>,
    /// Custom output name -> job message.
    pub outputs: BTreeMap<String, String>,
}

/// One referenced upstream output, before it is placed at a cycle point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRef {
    pub task: String,
    pub offset: AtomOffset,
    pub output: String,
}

impl TriggerRef {
    /// Cycle point the reference points at for a downstream task at `point`.
    pub fn point_for(&self, point: CyclePoint, initial: CyclePoint) -> Option<CyclePoint> {
        match &self.offset {
            AtomOffset::None => Some(point),
            AtomOffset::Relative(iv) => point.checked_add(iv),
            AtomOffset::Initial(None) => Some(initial),
            AtomOffset::Initial(Some(iv)) => initial.checked_add(iv),
        }
    }
}

impl fmt::Display for TriggerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task)?;
        match &self.offset {
            AtomOffset::None => {}
            AtomOffset::Relative(iv) => write!(f, "[{iv}]")?,
            AtomOffset::Initial(None) => write!(f, "[^]")?,
            AtomOffset::Initial(Some(iv)) => write!(f, "[^{iv}]")?,
        }
        write!(f, ":{}", self.output)
    }
}

/// A trigger expression with families expanded and qualifiers mapped to
/// output names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedExpr {
    Ref(TriggerRef),
    And(Vec<ResolvedExpr>),
    Or(Vec<ResolvedExpr>),
}

impl ResolvedExpr {
    pub fn refs(&self) -> Vec<&TriggerRef> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a TriggerRef>) {
        match self {
            ResolvedExpr::Ref(r) => out.push(r),
            ResolvedExpr::And(items) | ResolvedExpr::Or(items) => {
                for e in items {
                    e.collect(out);
                }
            }
        }
    }

    fn all(mut items: Vec<ResolvedExpr>) -> ResolvedExpr {
        if items.len() == 1 { items.remove(0) } else { ResolvedExpr::And(items) }
    }

    fn any(mut items: Vec<ResolvedExpr>) -> ResolvedExpr {
        if items.len() == 1 { items.remove(0) } else { ResolvedExpr::Or(items) }
    }
}

/// A trigger rule of one task, valid at the points of one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerTemplate {
    /// Index into [`WorkflowDefinition::sequences`].
    pub seq: usize,
    pub expr: ResolvedExpr,
    pub suicide: bool,
    /// Source text (`a & b => c`) for logs and queries.
    pub label: String,
}

/// Static definition of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDef {
    pub name: String,
    /// Sequences the task recurs on (indices, ascending).
    pub sequences: Vec<usize>,
    pub triggers: Vec<TriggerTemplate>,
    pub runtime: TaskRuntime,
    pub queue: String,
    /// Outputs marked `?` anywhere they are referenced.
    pub optional_outputs: BTreeSet<String>,
    /// Every namespace the task inherits from, nearest first.
    pub ancestors: Vec<String>,
}

/// The whole static workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub mode: CyclingMode,
    pub initial: CyclePoint,
    pub final_point: Option<CyclePoint>,
    sequences: Vec<Sequence>,
    tasks: BTreeMap<String, TaskDef>,
    /// Family name -> member task names.
    families: BTreeMap<String, Vec<String>>,
}

impl WorkflowDefinition {
    /// Compile graph strings and runtime namespaces into a definition.
    ///
    /// Fails on unparsable recurrences or triggers, references to unknown
    /// outputs, inheritance problems, and tasks that are referenced but
    /// never scheduled. Graph cycles are checked separately by
    /// [`detect_cycles`](Self::detect_cycles).
    pub fn build(
        mode: CyclingMode,
        initial: CyclePoint,
        final_point: Option<CyclePoint>,
        graph: &BTreeMap<String, String>,
        runtime: &BTreeMap<String, RawNamespace>,
        queues: &BTreeMap<String, RawQueue>,
    ) -> Result<Self> {
        let namespaces = Namespaces::new(runtime)?;
        let ctx = RecurrenceContext::new(mode, initial, final_point);
        let mut builder = GraphBuilder::new(&namespaces);

        for (expr, text) in graph {
            let seq = parse_recurrence(expr, &ctx)?;
            let seq_idx = builder.sequences.len();
            debug!(recurrence = %expr, sequence = %seq, "compiled recurrence");
            builder.sequences.push(seq);
            for edge in parse_graph(text, mode)? {
                builder.add_edge(seq_idx, edge.lhs.as_ref(), &edge.lhs_text, &edge.targets)?;
            }
        }
        builder.finish(mode, initial, final_point, queues)
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, idx: usize) -> Option<&Sequence> {
        self.sequences.get(idx)
    }

    pub fn task(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn families(&self) -> &BTreeMap<String, Vec<String>> {
        &self.families
    }

    pub fn family_members(&self, family: &str) -> Option<&[String]> {
        self.families.get(family).map(Vec::as_slice)
    }

    /// Task names matching a task or family name.
    pub fn expand_name(&self, name: &str) -> Vec<String> {
        if let Some(members) = self.families.get(name) {
            return members.clone();
        }
        if self.tasks.contains_key(name) {
            return vec![name.to_string()];
        }
        Vec::new()
    }

    /// Whether `name` runs at `point`.
    pub fn is_valid_point(&self, name: &str, point: CyclePoint) -> bool {
        self.tasks.get(name).is_some_and(|t| {
            t.sequences
                .iter()
                .any(|&i| self.sequences[i].contains(point))
        })
    }

    /// First point of `name` strictly after `after`, or its first point
    /// overall when `after` is `None`.
    pub fn next_point(&self, name: &str, after: Option<CyclePoint>) -> Option<CyclePoint> {
        let task = self.tasks.get(name)?;
        task.sequences
            .iter()
            .filter_map(|&i| {
                let seq = &self.sequences[i];
                match after {
                    Some(p) => seq.next_point(p),
                    None => seq.first_point(),
                }
            })
            .min()
    }

    /// Trigger rules of `task` that apply at `point`.
    pub fn triggers_at<'a>(
        &'a self,
        task: &'a TaskDef,
        point: CyclePoint,
    ) -> impl Iterator<Item = &'a TriggerTemplate> + 'a {
        task.triggers
            .iter()
            .filter(move |t| self.sequences[t.seq].contains(point))
    }

    /// Oldest point an instance at or after `from` can reference through a
    /// relative offset. Outputs older than this are never needed again,
    /// except at [`anchored_points`](Self::anchored_points).
    pub fn oldest_reference(&self, from: CyclePoint) -> CyclePoint {
        self.all_refs()
            .filter_map(|r| match &r.offset {
                AtomOffset::Relative(iv) if iv.is_negative() => from.checked_add(iv),
                _ => None,
            })
            .fold(from, CyclePoint::min)
    }

    /// Points referenced through the initial-point anchor (`foo[^]`).
    pub fn anchored_points(&self) -> BTreeSet<CyclePoint> {
        self.all_refs()
            .filter_map(|r| match &r.offset {
                AtomOffset::Initial(_) => r.point_for(self.initial, self.initial),
                _ => None,
            })
            .collect()
    }

    fn all_refs(&self) -> impl Iterator<Item = &TriggerRef> + '_ {
        self.tasks
            .values()
            .flat_map(|t| t.triggers.iter())
            .flat_map(|t| t.expr.refs())
    }

    /// Reject graphs in which a task instance depends on itself, directly
    /// or through other instances.
    ///
    /// The check walks concrete instances: each task's first few points
    /// and, transitively, every upstream instance they reference, up to a
    /// fixed node budget.
    pub fn detect_cycles(&self) -> Result<()> {
        let mut nodes = InstanceNodes::default();
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();

        for task in self.tasks.values() {
            let mut point = self.next_point(&task.name, None);
            for _ in 0..CYCLE_CHECK_POINTS_PER_TASK {
                let Some(p) = point else { break };
                let n = nodes.intern(TaskId::new(task.name.clone(), p));
                graph.add_node(n);
                point = self.next_point(&task.name, Some(p));
            }
        }

        while let Some((downstream, id)) = nodes.frontier.pop_front() {
            let Some(task) = self.tasks.get(&id.name) else { continue };
            for trigger in self.triggers_at(task, id.point) {
                for r in trigger.expr.refs() {
                    let Some(p) = r.point_for(id.point, self.initial) else { continue };
                    if p < self.initial || !self.is_valid_point(&r.task, p) {
                        continue;
                    }
                    let upstream_id = TaskId::new(r.task.clone(), p);
                    let upstream = match nodes.index.get(&upstream_id) {
                        Some(&i) => i,
                        None if nodes.ids.len() < CYCLE_CHECK_NODE_LIMIT => nodes.intern(upstream_id),
                        None => continue,
                    };
                    graph.add_edge(upstream, downstream, ());
                }
            }
        }

        match toposort(&graph, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => {
                let node = &nodes.ids[cycle.node_id()];
                Err(CycloramaError::GraphCycle(format!(
                    "cycle detected in task graph involving '{node}'"
                )))
            }
        }
    }
}

/// Task instances visited by the cycle check, numbered for the graph.
#[derive(Default)]
struct InstanceNodes {
    index: BTreeMap<TaskId, usize>,
    ids: Vec<TaskId>,
    frontier: VecDeque<(usize, TaskId)>,
}

impl InstanceNodes {
    fn intern(&mut self, id: TaskId) -> usize {
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.ids.len();
        self.index.insert(id.clone(), i);
        self.ids.push(id.clone());
        self.frontier.push_back((i, id));
        i
    }
}

// ---------------------------------------------------------------------------
// Namespace inheritance
// ---------------------------------------------------------------------------

/// A single inheritable setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Setting {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Sourced {
    value: Setting,
    origin: String,
}

/// The `[runtime]` namespace tree, flattened.
struct Namespaces {
    /// Namespace -> ancestors, nearest first.
    ancestors: BTreeMap<String, Vec<String>>,
    /// Namespace -> flattened settings (`script`, `environment.FOO`, ...).
    settings: BTreeMap<String, BTreeMap<String, Sourced>>,
    /// Namespaces with at least one child.
    families: BTreeSet<String>,
    has_root: bool,
}

fn own_settings(ns: &RawNamespace) -> BTreeMap<String, Setting> {
    let mut out = BTreeMap::new();
    let mut text = |key: &str, v: &Option<String>| {
        if let Some(v) = v {
            out.insert(key.to_string(), Setting::Text(v.clone()));
        }
    };
    text("script", &ns.script);
    text("pre_script", &ns.pre_script);
    text("post_script", &ns.post_script);
    text("platform", &ns.platform);
    text("execution_time_limit", &ns.execution_time_limit);
    text("clock_expire", &ns.clock_expire);
    if let Some(v) = &ns.execution_retry_delays {
        out.insert("execution_retry_delays".into(), Setting::List(v.clone()));
    }
    if let Some(v) = &ns.submission_retry_delays {
        out.insert("submission_retry_delays".into(), Setting::List(v.clone()));
    }
    for (k, v) in &ns.environment {
        out.insert(format!("environment.{k}"), Setting::Text(v.clone()));
    }
    for (k, v) in &ns.outputs {
        out.insert(format!("outputs.{k}"), Setting::Text(v.clone()));
    }
    out
}

impl Namespaces {
    fn new(runtime: &BTreeMap<String, RawNamespace>) -> Result<Self> {
        let has_root = runtime.contains_key(ROOT_NAMESPACE);
        let parents_of = |name: &str, ns: &RawNamespace| -> Vec<String> {
            if !ns.inherit.is_empty() {
                ns.inherit.clone()
            } else if has_root && name != ROOT_NAMESPACE {
                vec![ROOT_NAMESPACE.to_string()]
            } else {
                Vec::new()
            }
        };

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        let mut parents: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        let mut families = BTreeSet::new();
        for (name, ns) in runtime {
            graph.add_node(name.as_str());
            let ps = parents_of(name, ns);
            for p in &ps {
                let Some((parent, _)) = runtime.get_key_value(p) else {
                    return Err(CycloramaError::ConfigError(format!(
                        "namespace '{name}' inherits from undefined namespace '{p}'"
                    )));
                };
                graph.add_edge(parent.as_str(), name.as_str(), ());
                families.insert(p.clone());
            }
            parents.insert(name.as_str(), ps);
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            CycloramaError::ConfigError(format!(
                "namespace inheritance loop involving '{}'",
                cycle.node_id()
            ))
        })?;

        let mut ancestors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut settings: BTreeMap<String, BTreeMap<String, Sourced>> = BTreeMap::new();

        for name in order {
            let ps = &parents[name];
            let mut anc: Vec<String> = Vec::new();
            for p in ps {
                for a in std::iter::once(p).chain(ancestors[p].iter()) {
                    if !anc.contains(a) {
                        anc.push(a.clone());
                    }
                }
            }

            let mut flat: BTreeMap<String, Sourced> = own_settings(&runtime[name])
                .into_iter()
                .map(|(k, value)| {
                    (
                        k,
                        Sourced {
                            value,
                            origin: name.to_string(),
                        },
                    )
                })
                .collect();

            let inherited: BTreeSet<&String> = ps
                .iter()
                .flat_map(|p| settings[p].keys())
                .filter(|k| !flat.contains_key(*k))
                .collect();
            for key in inherited {
                let candidates: Vec<&Sourced> = ps.iter().filter_map(|p| settings[p].get(key)).collect();
                let chosen = resolve_inherited(name, key, &candidates, &ancestors)?;
                flat.insert(key.clone(), chosen);
            }

            ancestors.insert(name.to_string(), anc);
            settings.insert(name.to_string(), flat);
        }

        Ok(Self {
            ancestors,
            settings,
            families,
            has_root,
        })
    }

    fn is_family(&self, name: &str) -> bool {
        self.families.contains(name)
    }

    /// Task namespaces below `family`.
    fn leaves_under(&self, family: &str) -> Vec<String> {
        self.ancestors
            .iter()
            .filter(|(name, anc)| !self.families.contains(*name) && anc.iter().any(|a| a == family))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn ancestors_of(&self, task: &str) -> Vec<String> {
        match self.ancestors.get(task) {
            Some(a) => a.clone(),
            None if self.has_root => vec![ROOT_NAMESPACE.to_string()],
            None => Vec::new(),
        }
    }

    fn runtime_for(&self, task: &str, mode: CyclingMode) -> Result<TaskRuntime> {
        let empty = BTreeMap::new();
        let flat = match self.settings.get(task) {
            Some(s) => s,
            None if self.has_root => &self.settings[ROOT_NAMESPACE],
            None => &empty,
        };
        let text = |key: &str| -> Option<String> {
            match flat.get(key).map(|s| &s.value) {
                Some(Setting::Text(v)) => Some(v.clone()),
                _ => None,
            }
        };
        let list = |key: &str| -> Vec<String> {
            match flat.get(key).map(|s| &s.value) {
                Some(Setting::List(v)) => v.clone(),
                _ => Vec::new(),
            }
        };
        let prefixed = |prefix: &str| -> BTreeMap<String, String> {
            flat.iter()
                .filter_map(|(k, s)| {
                    let name = k.strip_prefix(prefix)?;
                    match &s.value {
                        Setting::Text(v) => Some((name.to_string(), v.clone())),
                        Setting::List(_) => None,
                    }
                })
                .collect()
        };

        let in_task = |e: CycloramaError| CycloramaError::ConfigError(format!("[runtime.{task}]: {e}"));
        let clock_expire = match (text("clock_expire"), mode) {
            (None, _) => None,
            (Some(_), CyclingMode::Integer) => {
                return Err(CycloramaError::ConfigError(format!(
                    "[runtime.{task}]: clock_expire needs datetime cycling"
                )))
            }
            (Some(s), mode) => Some(Interval::parse(&s, mode).map_err(in_task)?),
        };
        Ok(TaskRuntime {
            script: text("script"),
            pre_script: text("pre_script"),
            post_script: text("post_script"),
            platform: PlatformSpec::parse(text("platform").as_deref()),
            environment: prefixed("environment."),
            execution_retry_delays: parse_delays(&list("execution_retry_delays")).map_err(in_task)?,
            submission_retry_delays: parse_delays(&list("submission_retry_delays")).map_err(in_task)?,
            execution_time_limit: text("execution_time_limit")
                .map(|s| parse_delay(&s))
                .transpose()
                .map_err(in_task)?,
            clock_expire,
            outputs: prefixed("outputs."),
        })
    }
}

/// Pick the inherited value of `key` for `name` from its parents' values.
///
/// Equal values agree. Otherwise a value defined in a namespace that
/// descends from another candidate's namespace wins over it; any remaining
/// disagreement is a conflict.
fn resolve_inherited(
    name: &str,
    key: &str,
    candidates: &[&Sourced],
    ancestors: &BTreeMap<String, Vec<String>>,
) -> Result<Sourced> {
    let first = candidates[0];
    if candidates.iter().all(|c| c.value == first.value) {
        return Ok(first.clone());
    }
    let is_ancestor = |a: &str, of: &str| ancestors.get(of).is_some_and(|anc| anc.iter().any(|x| x == a));
    let most_derived: Vec<&Sourced> = candidates
        .iter()
        .copied()
        .filter(|c| !candidates.iter().any(|d| is_ancestor(&c.origin, &d.origin)))
        .collect();
    match most_derived.first() {
        Some(winner) if most_derived.iter().all(|c| c.value == winner.value) => Ok((*winner).clone()),
        _ => {
            let origins: Vec<String> = most_derived.iter().map(|c| c.origin.clone()).collect();
            Err(CycloramaError::InheritanceConflict(format!(
                "namespace '{name}' inherits different values of '{key}' from {} without overriding it",
                origins.join(" and ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Graph compilation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingTask {
    sequences: BTreeSet<usize>,
    triggers: Vec<TriggerTemplate>,
    optional_outputs: BTreeSet<String>,
}

struct GraphBuilder<'a> {
    namespaces: &'a Namespaces,
    sequences: Vec<Sequence>,
    tasks: BTreeMap<String, PendingTask>,
    /// Upstream references as (task, output, context) for later checks.
    references: Vec<(String, String, String)>,
}

impl<'a> GraphBuilder<'a> {
    fn new(namespaces: &'a Namespaces) -> Self {
        Self {
            namespaces,
            sequences: Vec::new(),
            tasks: BTreeMap::new(),
            references: Vec::new(),
        }
    }

    /// Task names a graph name stands for.
    fn expand(&self, name: &str) -> Result<Vec<String>> {
        if self.namespaces.is_family(name) {
            let members = self.namespaces.leaves_under(name);
            if members.is_empty() {
                return Err(CycloramaError::ConfigError(format!("family '{name}' has no member tasks")));
            }
            return Ok(members);
        }
        Ok(vec![name.to_string()])
    }

    fn task_mut(&mut self, name: &str) -> &mut PendingTask {
        self.tasks.entry(name.to_string()).or_default()
    }

    fn add_edge(
        &mut self,
        seq: usize,
        lhs: Option<&TriggerExpr>,
        lhs_text: &str,
        targets: &[crate::graph::trigger::Target],
    ) -> Result<()> {
        let resolved = match lhs {
            Some(expr) => {
                let resolved = self.resolve(expr, lhs_text)?;
                // Same-point upstream tasks recur on this sequence too.
                for atom in expr.atoms() {
                    if atom.offset == AtomOffset::None {
                        for t in self.expand(&atom.name)? {
                            self.task_mut(&t).sequences.insert(seq);
                        }
                    }
                }
                Some(resolved)
            }
            None => None,
        };

        for target in targets {
            for name in self.expand(&target.name)? {
                let task = self.task_mut(&name);
                task.sequences.insert(seq);
                if let Some(expr) = &resolved {
                    let bang = if target.suicide { "!" } else { "" };
                    task.triggers.push(TriggerTemplate {
                        seq,
                        expr: expr.clone(),
                        suicide: target.suicide,
                        label: format!("{lhs_text} => {bang}{name}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn resolve(&mut self, expr: &TriggerExpr, context: &str) -> Result<ResolvedExpr> {
        match expr {
            TriggerExpr::Atom(atom) => self.resolve_atom(atom, context),
            TriggerExpr::And(items) => Ok(ResolvedExpr::And(
                items.iter().map(|e| self.resolve(e, context)).collect::<Result<_>>()?,
            )),
            TriggerExpr::Or(items) => Ok(ResolvedExpr::Or(
                items.iter().map(|e| self.resolve(e, context)).collect::<Result<_>>()?,
            )),
        }
    }

    fn reference(&mut self, task: &str, offset: AtomOffset, qualifier: &str, optional: bool, context: &str) -> ResolvedExpr {
        let leaf = |output: &str| {
            ResolvedExpr::Ref(TriggerRef {
                task: task.to_string(),
                offset,
                output: output.to_string(),
            })
        };
        self.task_mut(task);
        let expr = if qualifier == "finish" || qualifier == "finished" {
            ResolvedExpr::Or(vec![leaf(outputs::SUCCEEDED), leaf(outputs::FAILED)])
        } else {
            leaf(output_for_qualifier(qualifier))
        };
        for r in expr.refs() {
            self.references
                .push((task.to_string(), r.output.clone(), context.to_string()));
        }
        if optional {
            let pending = self.task_mut(task);
            for r in expr.refs() {
                pending.optional_outputs.insert(r.output.clone());
            }
        }
        expr
    }

    fn resolve_atom(&mut self, atom: &TriggerAtom, context: &str) -> Result<ResolvedExpr> {
        let qualifier = atom.qualifier.as_deref();
        if self.namespaces.is_family(&atom.name) {
            let (base, all) = match qualifier {
                None => ("succeed", true),
                Some(q) => match (q.strip_suffix("-all"), q.strip_suffix("-any")) {
                    (Some(base), _) => (base, true),
                    (_, Some(base)) => (base, false),
                    _ => {
                        return Err(CycloramaError::InvalidTrigger(format!(
                            "{context}: family trigger '{}:{q}' needs an -all or -any qualifier",
                            atom.name
                        )));
                    }
                },
            };
            let members = self.expand(&atom.name)?;
            let items: Vec<ResolvedExpr> = members
                .iter()
                .map(|m| self.reference(m, atom.offset, base, atom.optional, context))
                .collect();
            return Ok(if all { ResolvedExpr::all(items) } else { ResolvedExpr::any(items) });
        }

        if let Some(q) = qualifier {
            if q.ends_with("-all") || q.ends_with("-any") {
                return Err(CycloramaError::InvalidTrigger(format!(
                    "{context}: '{}' is not a family; '{q}' qualifiers apply to families only",
                    atom.name
                )));
            }
        }
        Ok(self.reference(&atom.name, atom.offset, qualifier.unwrap_or("succeed"), atom.optional, context))
    }

    fn finish(
        self,
        mode: CyclingMode,
        initial: CyclePoint,
        final_point: Option<CyclePoint>,
        queues: &BTreeMap<String, RawQueue>,
    ) -> Result<WorkflowDefinition> {
        let namespaces = self.namespaces;
        let mut tasks = BTreeMap::new();

        for (name, pending) in self.tasks {
            if pending.sequences.is_empty() {
                return Err(CycloramaError::ConfigError(format!(
                    "task '{name}' is referenced in the graph but never scheduled on any recurrence"
                )));
            }
            let runtime = namespaces.runtime_for(&name, mode)?;
            let ancestors = namespaces.ancestors_of(&name);
            let queue = queue_for(&name, &ancestors, queues);
            tasks.insert(
                name.clone(),
                TaskDef {
                    name,
                    sequences: pending.sequences.into_iter().collect(),
                    triggers: pending.triggers,
                    runtime,
                    queue,
                    optional_outputs: pending.optional_outputs,
                    ancestors,
                },
            );
        }

        for (task, output, context) in &self.references {
            let def = tasks.get(task).ok_or_else(|| {
                CycloramaError::TaskNotFound(format!("{task} (referenced in '{context}')"))
            })?;
            if !outputs::is_standard(output) && !def.runtime.outputs.contains_key(output) {
                return Err(CycloramaError::InvalidTrigger(format!(
                    "{context}: task '{task}' has no output '{output}'"
                )));
            }
        }

        for (queue, cfg) in queues {
            for member in &cfg.members {
                if !tasks.contains_key(member) && !namespaces.is_family(member) {
                    return Err(CycloramaError::ConfigError(format!(
                        "queue '{queue}' lists unknown task or family '{member}'"
                    )));
                }
            }
        }

        let families: BTreeMap<String, Vec<String>> = namespaces
            .families
            .iter()
            .map(|f| {
                let members = namespaces
                    .leaves_under(f)
                    .into_iter()
                    .filter(|m| tasks.contains_key(m))
                    .collect();
                (f.clone(), members)
            })
            .collect();

        for name in namespaces.ancestors.keys() {
            if !namespaces.is_family(name) && !tasks.contains_key(name) {
                warn!(namespace = %name, "runtime namespace is not used in the graph");
            }
        }

        Ok(WorkflowDefinition {
            mode,
            initial,
            final_point,
            sequences: self.sequences,
            tasks,
            families,
        })
    }
}

/// Queue a task belongs to: a queue naming the task itself wins over one
/// naming a family; otherwise the nearest family wins.
fn queue_for(task: &str, ancestors: &[String], queues: &BTreeMap<String, RawQueue>) -> String {
    let listed = |member: &str| {
        queues
            .iter()
            .find(|(_, q)| q.members.iter().any(|m| m == member))
            .map(|(name, _)| name.clone())
    };
    std::iter::once(task)
        .chain(ancestors.iter().map(String::as_str))
        .find_map(listed)
        .unwrap_or_else(|| DEFAULT_QUEUE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(inherit: &[&str]) -> RawNamespace {
        RawNamespace {
            inherit: inherit.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn build(graph: &[(&str, &str)], runtime: BTreeMap<String, RawNamespace>) -> Result<WorkflowDefinition> {
        let graph = graph
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkflowDefinition::build(
            CyclingMode::Integer,
            CyclePoint::Integer(1),
            Some(CyclePoint::Integer(5)),
            &graph,
            &runtime,
            &BTreeMap::new(),
        )
    }

    #[test]
    fn lookback_covers_negative_offsets_and_anchors() {
        let def = build(&[("P1", "a[-P2] => a\nprep[^] => b"), ("R1", "prep")], BTreeMap::new()).unwrap();
        assert_eq!(def.oldest_reference(CyclePoint::Integer(4)), CyclePoint::Integer(2));
        assert_eq!(
            def.anchored_points().into_iter().collect::<Vec<_>>(),
            vec![CyclePoint::Integer(1)]
        );
    }

    #[test]
    fn tasks_join_sequences_from_both_sides() {
        let def = build(&[("P1", "a => b"), ("R1", "init")], BTreeMap::new()).unwrap();
        assert_eq!(def.task("a").unwrap().sequences, vec![0]);
        assert_eq!(def.task("b").unwrap().triggers.len(), 1);
        assert!(def.is_valid_point("init", CyclePoint::Integer(1)));
        assert!(!def.is_valid_point("init", CyclePoint::Integer(2)));
        assert_eq!(def.next_point("a", Some(CyclePoint::Integer(5))), None);
    }

    #[test]
    fn offset_only_references_must_be_scheduled() {
        let err = build(&[("P1", "a[-P1] => b")], BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CycloramaError::ConfigError(_)));
    }

    #[test]
    fn family_triggers_expand_to_members() {
        let mut runtime = BTreeMap::new();
        runtime.insert("FAM".to_string(), ns(&[]));
        for m in ["m1", "m2", "m3"] {
            runtime.insert(m.to_string(), ns(&["FAM"]));
        }
        let def = build(&[("P1", "FAM:succeed-all => after\nFAM:fail-any => oops")], runtime).unwrap();
        assert_eq!(def.family_members("FAM").unwrap(), &["m1", "m2", "m3"]);

        let after = def.task("after").unwrap();
        match &after.triggers[0].expr {
            ResolvedExpr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected conjunction, got {other:?}"),
        }
        let oops = def.task("oops").unwrap();
        assert!(matches!(&oops.triggers[0].expr, ResolvedExpr::Or(items) if items.len() == 3));
        assert!(def.is_valid_point("m2", CyclePoint::Integer(3)));

        let mut runtime = BTreeMap::new();
        runtime.insert("FAM".to_string(), ns(&[]));
        runtime.insert("m1".to_string(), ns(&["FAM"]));
        assert!(build(&[("P1", "FAM:succeed => x")], runtime).is_err());
    }

    #[test]
    fn custom_outputs_must_be_declared() {
        assert!(build(&[("P1", "a:ready => b")], BTreeMap::new()).is_err());

        let mut runtime = BTreeMap::new();
        let mut a = ns(&[]);
        a.outputs.insert("ready".into(), "data ready".into());
        runtime.insert("a".to_string(), a);
        let def = build(&[("P1", "a:ready? => b")], runtime).unwrap();
        assert!(def.task("a").unwrap().optional_outputs.contains("ready"));
        assert_eq!(def.task("a").unwrap().runtime.outputs["ready"], "data ready");
    }

    #[test]
    fn clock_expire_is_inherited_and_needs_datetime_cycling() {
        let mut runtime = BTreeMap::new();
        let mut obs = ns(&[]);
        obs.clock_expire = Some("PT6H".into());
        runtime.insert("OBS".to_string(), obs);
        runtime.insert("get_obs".to_string(), ns(&["OBS"]));

        let err = build(&[("P1", "get_obs")], runtime.clone()).unwrap_err();
        assert!(err.to_string().contains("clock_expire"), "{err}");

        let initial = CyclePoint::parse("2026-01-01", CyclingMode::Gregorian).unwrap();
        let graph = [("PT6H".to_string(), "get_obs".to_string())].into();
        let def = WorkflowDefinition::build(
            CyclingMode::Gregorian,
            initial,
            None,
            &graph,
            &runtime,
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(
            def.task("get_obs").unwrap().runtime.clock_expire,
            Some(Interval::parse("PT6H", CyclingMode::Gregorian).unwrap())
        );
    }

    #[test]
    fn inheritance_flattens_and_detects_conflicts() {
        let mut runtime = BTreeMap::new();
        let mut root = ns(&[]);
        root.script = Some("true".into());
        root.environment.insert("A".into(), "1".into());
        runtime.insert("root".to_string(), root);
        let mut hpc = ns(&[]);
        hpc.platform = Some("hpc".into());
        hpc.script = Some("run-hpc".into());
        runtime.insert("HPC".to_string(), hpc);
        let mut big = ns(&[]);
        big.environment.insert("B".into(), "2".into());
        runtime.insert("BIG".to_string(), big);
        runtime.insert("model".to_string(), ns(&["HPC", "BIG"]));

        let def = build(&[("P1", "model")], runtime.clone()).unwrap();
        let rt = &def.task("model").unwrap().runtime;
        // HPC descends from root, so its script wins over root's.
        assert_eq!(rt.script.as_deref(), Some("run-hpc"));
        assert_eq!(rt.platform, PlatformSpec::Named("hpc".into()));
        assert_eq!(rt.environment.len(), 2);
        assert_eq!(def.task("model").unwrap().ancestors, vec!["HPC", "root", "BIG"]);

        runtime.get_mut("BIG").unwrap().script = Some("run-big".into());
        let err = build(&[("P1", "model")], runtime.clone()).unwrap_err();
        assert!(matches!(err, CycloramaError::InheritanceConflict(_)));

        runtime.get_mut("model").unwrap().script = Some("mine".into());
        assert!(build(&[("P1", "model")], runtime).is_ok());
    }

    #[test]
    fn detects_instance_cycles() {
        let def = build(&[("P1", "a => a")], BTreeMap::new()).unwrap();
        assert!(matches!(def.detect_cycles(), Err(CycloramaError::GraphCycle(_))));

        let def = build(&[("P1", "a => b => c => a")], BTreeMap::new()).unwrap();
        assert!(def.detect_cycles().is_err());

        let def = build(&[("P1", "a[-P1] => a => b")], BTreeMap::new()).unwrap();
        assert!(def.detect_cycles().is_ok());
    }

    #[test]
    fn queue_membership_prefers_direct_listing() {
        let mut queues = BTreeMap::new();
        queues.insert(
            "big".to_string(),
            RawQueue {
                limit: 1,
                members: vec!["FAM".into()],
            },
        );
        queues.insert(
            "solo".to_string(),
            RawQueue {
                limit: 1,
                members: vec!["m2".into()],
            },
        );
        let ancestors = vec!["FAM".to_string()];
        assert_eq!(queue_for("m1", &ancestors, &queues), "big");
        assert_eq!(queue_for("m2", &ancestors, &queues), "solo");
        assert_eq!(queue_for("x", &[], &queues), DEFAULT_QUEUE);
    }
}
