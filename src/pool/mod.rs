// src/pool/mod.rs

//! The task pool and the state it keeps between scheduler iterations.

pub mod broadcast;
pub mod checkpoint;
pub mod ledger;
pub mod queues;
pub mod task_pool;

pub use broadcast::{BroadcastPoint, BroadcastStore};
pub use checkpoint::Snapshot;
pub use ledger::OutputLedger;
pub use queues::QueueSet;
pub use task_pool::{TaskPool, TaskSummary};
