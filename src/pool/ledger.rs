// src/pool/ledger.rs

//! Record of every output published so far.
//!
//! Tasks leave the pool once finished, but instances spawned later may
//! still reference their outputs through intercycle offsets. New proxies
//! are checked against the ledger when they enter the pool.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cycling::CyclePoint;
use crate::task::{OutputRef, TaskId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLedger {
    outputs: BTreeMap<TaskId, BTreeSet<String>>,
}

/// Serialised form of one ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task: TaskId,
    pub outputs: BTreeSet<String>,
}

impl OutputLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the output was already recorded.
    pub fn record(&mut self, output: &OutputRef) -> bool {
        self.outputs
            .entry(output.task.clone())
            .or_default()
            .insert(output.output.clone())
    }

    pub fn contains(&self, output: &OutputRef) -> bool {
        self.outputs
            .get(&output.task)
            .is_some_and(|o| o.contains(&output.output))
    }

    pub fn outputs_of(&self, task: &TaskId) -> impl Iterator<Item = &str> {
        self.outputs
            .get(task)
            .into_iter()
            .flat_map(|o| o.iter().map(String::as_str))
    }

    /// Drop everything recorded for `task`, e.g. after a reset to waiting.
    pub fn forget(&mut self, task: &TaskId) {
        self.outputs.remove(task);
    }

    /// Drop rows older than `cutoff`, keeping `keep` points. Returns the
    /// number of rows removed.
    pub fn prune_before(&mut self, cutoff: CyclePoint, keep: &BTreeSet<CyclePoint>) -> usize {
        let before = self.outputs.len();
        self.outputs
            .retain(|id, _| id.point >= cutoff || keep.contains(&id.point));
        before - self.outputs.len()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.outputs
            .iter()
            .map(|(task, outputs)| LedgerEntry {
                task: task.clone(),
                outputs: outputs.clone(),
            })
            .collect()
    }

    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            outputs: entries.into_iter().map(|e| (e.task, e.outputs)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::outputs;

    fn out(name: &str, p: i64) -> OutputRef {
        OutputRef::new(TaskId::new(name, CyclePoint::Integer(p)), outputs::SUCCEEDED)
    }

    #[test]
    fn prune_keeps_anchored_points() {
        let mut ledger = OutputLedger::new();
        for p in 1..=5 {
            assert!(ledger.record(&out("a", p)));
        }
        assert!(!ledger.record(&out("a", 3)));

        let keep = BTreeSet::from([CyclePoint::Integer(1)]);
        assert_eq!(ledger.prune_before(CyclePoint::Integer(4), &keep), 2);
        assert!(ledger.contains(&out("a", 1)));
        assert!(!ledger.contains(&out("a", 2)));
        assert!(ledger.contains(&out("a", 4)));

        let restored = OutputLedger::from_entries(ledger.entries());
        assert_eq!(restored, ledger);
    }
}
