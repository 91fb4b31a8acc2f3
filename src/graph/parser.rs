// src/graph/parser.rs

//! Graph strings: lines of `lhs => rhs` arrows.
//!
//! - `#` starts a comment;
//! - a line ending (or starting) with `=>`, `&` or `|`, or ending with `\`,
//!   continues onto the next one;
//! - chains `a => b => c` expand to one edge per arrow;
//! - a line without an arrow declares its tasks on the recurrence.

use crate::errors::{CycloramaError, Result};
use crate::graph::trigger::{parse_expr, parse_targets, Target, TriggerExpr};
use crate::types::CyclingMode;

/// One arrow of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// `None` for a bare task declaration.
    pub lhs: Option<TriggerExpr>,
    pub lhs_text: String,
    pub targets: Vec<Target>,
}

const CONTINUATION_OPS: [&str; 3] = ["=>", "&", "|"];

fn logical_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut buffer = String::new();

    for raw in text.lines() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let continues_prev = !buffer.is_empty()
            && (buffer.ends_with('\\')
                || CONTINUATION_OPS.iter().any(|op| buffer.ends_with(op))
                || CONTINUATION_OPS.iter().any(|op| line.starts_with(op)));
        if continues_prev {
            if buffer.ends_with('\\') {
                buffer.pop();
            }
            buffer.push(' ');
            buffer.push_str(line);
        } else {
            if !buffer.is_empty() {
                lines.push(std::mem::take(&mut buffer));
            }
            buffer.push_str(line);
        }
    }
    if !buffer.is_empty() {
        lines.push(buffer);
    }
    lines
}

/// Parse a graph string into edges.
pub fn parse_graph(text: &str, mode: CyclingMode) -> Result<Vec<GraphEdge>> {
    let mut edges = Vec::new();

    for line in logical_lines(text) {
        let segments: Vec<&str> = line.split("=>").map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CycloramaError::InvalidTrigger(format!(
                "{line}: dangling '=>'"
            )));
        }

        if segments.len() == 1 {
            edges.push(GraphEdge {
                lhs: None,
                lhs_text: String::new(),
                targets: parse_targets(segments[0], mode)?,
            });
            continue;
        }

        for pair in segments.windows(2) {
            let (lhs, rhs) = (pair[0], pair[1]);
            if lhs.contains('!') {
                return Err(CycloramaError::InvalidTrigger(format!(
                    "{lhs}: suicide markers are only allowed on the right-hand side"
                )));
            }
            edges.push(GraphEdge {
                lhs: Some(parse_expr(lhs, mode)?),
                lhs_text: lhs.to_string(),
                targets: parse_targets(rhs, mode)?,
            });
        }
    }

    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_and_continuations() {
        let graph = r#"
            # comment line
            a => b => c   # trailing comment
            x &
              y => z
            p
            => q
        "#;
        let edges = parse_graph(graph, CyclingMode::Integer).unwrap();
        assert_eq!(edges.len(), 4);
        assert_eq!(edges[0].lhs_text, "a");
        assert_eq!(edges[1].targets[0].name, "c");
        assert_eq!(edges[2].lhs_text, "x & y");
        assert_eq!(edges[3].targets[0].name, "q");
    }

    #[test]
    fn bare_declarations_and_suicide() {
        let edges = parse_graph("solo\nfoo:fail? => !bar", CyclingMode::Integer).unwrap();
        assert!(edges[0].lhs.is_none());
        assert!(edges[1].targets[0].suicide);
        assert!(parse_graph("!a => b", CyclingMode::Integer).is_err());
        assert!(parse_graph("a =>", CyclingMode::Integer).is_err());
    }
}
