// src/task/outputs.rs

//! Standard and custom task outputs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const SUBMITTED: &str = "submitted";
pub const SUBMIT_FAILED: &str = "submit-failed";
pub const STARTED: &str = "started";
pub const SUCCEEDED: &str = "succeeded";
pub const FAILED: &str = "failed";
pub const EXPIRED: &str = "expired";

pub const STANDARD_OUTPUTS: [&str; 6] = [SUBMITTED, SUBMIT_FAILED, STARTED, SUCCEEDED, FAILED, EXPIRED];

pub fn is_standard(output: &str) -> bool {
    STANDARD_OUTPUTS.contains(&output)
}

/// Map a trigger qualifier (`succeed`, `submit-fail`, ...) to the output it
/// refers to. Unknown qualifiers are taken to be custom output names.
pub fn output_for_qualifier(qualifier: &str) -> &str {
    match qualifier {
        "submit" | "submitted" => SUBMITTED,
        "submit-fail" | "submit-failed" => SUBMIT_FAILED,
        "start" | "started" => STARTED,
        "succeed" | "succeeded" => SUCCEEDED,
        "fail" | "failed" => FAILED,
        "expire" | "expired" => EXPIRED,
        other => other,
    }
}

/// Outputs reached by one task proxy, plus the custom outputs it may emit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputs {
    completed: BTreeSet<String>,
    /// Job message -> custom output name.
    custom: BTreeMap<String, String>,
    #[serde(skip)]
    unpublished: Vec<String>,
}

impl TaskOutputs {
    /// `custom` maps output names to the job message that completes them.
    pub fn new(custom: &BTreeMap<String, String>) -> Self {
        Self {
            completed: BTreeSet::new(),
            custom: custom
                .iter()
                .map(|(output, message)| (message.clone(), output.clone()))
                .collect(),
            unpublished: Vec::new(),
        }
    }

    pub fn knows(&self, output: &str) -> bool {
        is_standard(output) || self.custom.values().any(|o| o == output)
    }

    /// Custom output completed by a job message, if any.
    pub fn output_for_message(&self, message: &str) -> Option<&str> {
        self.custom.get(message.trim()).map(String::as_str)
    }

    /// Mark `output` complete. Returns `true` the first time only; newly
    /// completed outputs are queued for publication to dependents.
    pub fn complete(&mut self, output: &str) -> bool {
        if self.completed.insert(output.to_string()) {
            self.unpublished.push(output.to_string());
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self, output: &str) -> bool {
        self.completed.contains(output)
    }

    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    /// Outputs completed since the last call.
    pub fn take_unpublished(&mut self) -> Vec<String> {
        std::mem::take(&mut self.unpublished)
    }

    /// Forget a set of outputs (used when a retry or reset starts the task
    /// over).
    pub fn clear(&mut self, outputs: &[&str]) {
        for o in outputs {
            self.completed.remove(*o);
        }
    }

    pub fn clear_all(&mut self) {
        self.completed.clear();
        self.unpublished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_outputs_are_completed_by_message() {
        let mut custom = BTreeMap::new();
        custom.insert("file-ready".to_string(), "the file is ready".to_string());
        let mut outputs = TaskOutputs::new(&custom);

        assert_eq!(outputs.output_for_message("the file is ready"), Some("file-ready"));
        assert!(outputs.knows("file-ready"));
        assert!(outputs.complete("file-ready"));
        assert!(!outputs.complete("file-ready"));
        assert_eq!(outputs.take_unpublished(), vec!["file-ready".to_string()]);
        assert!(outputs.take_unpublished().is_empty());
    }

    #[test]
    fn qualifiers_map_to_outputs() {
        assert_eq!(output_for_qualifier("succeed"), SUCCEEDED);
        assert_eq!(output_for_qualifier("submit-fail"), SUBMIT_FAILED);
        assert_eq!(output_for_qualifier("x"), "x");
    }
}
