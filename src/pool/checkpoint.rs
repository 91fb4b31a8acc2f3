// src/pool/checkpoint.rs

//! Pool snapshots for restart.
//!
//! A snapshot holds every task proxy (identity, state, submit number,
//! prerequisite and output bookkeeping), the output ledger, how far each
//! task has been spawned, and the active broadcasts. It is written as JSON
//! after every step that changed the pool.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cycling::CyclePoint;
use crate::errors::{CycloramaError, Result};
use crate::fs::{self, FileSystem};
use crate::pool::broadcast::BroadcastEntry;
use crate::pool::ledger::LedgerEntry;
use crate::task::TaskProxy;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Initial cycle point of the workflow that wrote the snapshot.
    pub initial_point: CyclePoint,
    pub tasks: Vec<TaskProxy>,
    pub ledger: Vec<LedgerEntry>,
    /// Task name -> highest point spawned.
    pub spawned: BTreeMap<String, CyclePoint>,
    #[serde(default)]
    pub broadcasts: Vec<BroadcastEntry>,
}

impl Snapshot {
    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write_atomic(fs, path, &json)
            .with_context(|| format!("writing checkpoint {path:?}"))?;
        debug!(path = ?path, tasks = self.tasks.len(), "checkpoint written");
        Ok(())
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = fs
            .read_to_string(path)
            .with_context(|| format!("reading checkpoint {path:?}"))?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CycloramaError::ConfigError(format!(
                "checkpoint {path:?} has version {}, expected {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        info!(path = ?path, tasks = snapshot.tasks.len(), "checkpoint loaded");
        Ok(snapshot)
    }
}
