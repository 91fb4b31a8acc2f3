// src/task/prerequisite.rs

//! Prerequisites: boolean expressions over upstream task outputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Reference to one output of one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub task: TaskId,
    pub output: String,
}

impl OutputRef {
    pub fn new(task: TaskId, output: impl Into<String>) -> Self {
        Self {
            task,
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task, self.output)
    }
}

/// Satisfaction state of a single referenced output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomState {
    Unsatisfied,
    Satisfied,
    /// The referenced point precedes the initial cycle point; counts as
    /// satisfied.
    PreInitial,
    /// The referenced task instance can never exist (past the final point or
    /// off its sequence); never satisfied.
    Unreachable,
}

impl AtomState {
    fn is_met(self) -> bool {
        matches!(self, AtomState::Satisfied | AtomState::PreInitial)
    }
}

/// Boolean structure over atom indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrereqExpr {
    Atom(usize),
    And(Vec<PrereqExpr>),
    Or(Vec<PrereqExpr>),
}

impl PrereqExpr {
    fn eval(&self, value: &impl Fn(usize) -> bool) -> bool {
        match self {
            PrereqExpr::Atom(i) => value(*i),
            PrereqExpr::And(items) => items.iter().all(|e| e.eval(value)),
            PrereqExpr::Or(items) => items.iter().any(|e| e.eval(value)),
        }
    }
}

/// One trigger rule as applied to one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    atoms: Vec<(OutputRef, AtomState)>,
    expr: PrereqExpr,
    /// Source trigger text, for logs and queries.
    label: String,
}

impl Prerequisite {
    pub fn new(atoms: Vec<(OutputRef, AtomState)>, expr: PrereqExpr, label: impl Into<String>) -> Self {
        debug_assert!(
            {
                let mut ok = true;
                check_indices(&expr, atoms.len(), &mut ok);
                ok
            },
            "prerequisite expression references a missing atom"
        );
        Self {
            atoms,
            expr,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn atoms(&self) -> impl Iterator<Item = (&OutputRef, AtomState)> {
        self.atoms.iter().map(|(r, s)| (r, *s))
    }

    pub fn is_satisfied(&self) -> bool {
        self.expr.eval(&|i| self.atoms[i].1.is_met())
    }

    /// False when no future output can satisfy the expression because the
    /// atoms it needs are unreachable.
    pub fn is_satisfiable(&self) -> bool {
        self.expr
            .eval(&|i| self.atoms[i].1 != AtomState::Unreachable)
    }

    /// Mark every atom referring to `output` satisfied. Returns whether
    /// anything changed.
    pub fn satisfy(&mut self, output: &OutputRef) -> bool {
        let mut changed = false;
        for (r, state) in self.atoms.iter_mut() {
            if r == output && *state == AtomState::Unsatisfied {
                *state = AtomState::Satisfied;
                changed = true;
            }
        }
        changed
    }

    /// Mark every atom satisfied (operator `trigger`/`reset`).
    pub fn satisfy_all(&mut self) {
        for (_, state) in self.atoms.iter_mut() {
            if *state == AtomState::Unsatisfied {
                *state = AtomState::Satisfied;
            }
        }
    }

    /// Return satisfied atoms to unsatisfied. Pre-initial and unreachable
    /// atoms keep their state.
    pub fn unsatisfy_all(&mut self) {
        for (_, state) in self.atoms.iter_mut() {
            if *state == AtomState::Satisfied {
                *state = AtomState::Unsatisfied;
            }
        }
    }

    /// Outputs still awaited.
    pub fn unsatisfied(&self) -> impl Iterator<Item = &OutputRef> {
        self.atoms
            .iter()
            .filter(|(_, s)| *s == AtomState::Unsatisfied)
            .map(|(r, _)| r)
    }
}

fn check_indices(expr: &PrereqExpr, len: usize, ok: &mut bool) {
    match expr {
        PrereqExpr::Atom(i) => *ok &= *i < len,
        PrereqExpr::And(items) | PrereqExpr::Or(items) => {
            for e in items {
                check_indices(e, len, ok);
            }
        }
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.is_satisfied() { "satisfied" } else { "unsatisfied" };
        write!(f, "{} ({mark})", self.label)
    }
}
