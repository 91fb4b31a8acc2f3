// src/graph/mod.rs

//! Graph strings, task definitions and their expansion into instances.

pub mod definition;
pub mod expander;
pub mod parser;
pub mod trigger;

pub use definition::{ResolvedExpr, TaskDef, TaskRuntime, TriggerRef, TriggerTemplate, WorkflowDefinition};
pub use expander::GraphExpander;
pub use parser::{parse_graph, GraphEdge};
pub use trigger::{parse_expr, AtomOffset, Target, TriggerAtom, TriggerExpr};
