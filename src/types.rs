// src/types.rs

//! Small configuration-facing enums shared across modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How cycle points are represented for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclingMode {
    /// Plain integers: `1`, `2`, ... with intervals like `P1`.
    Integer,
    /// Proleptic Gregorian date-times with ISO 8601 durations.
    #[default]
    Gregorian,
}

/// Order in which hosts (or platforms of a group) are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMethod {
    /// Deterministic left-to-right order as written in the config.
    #[default]
    DefinitionOrder,
    /// Shuffled order, re-drawn for every selection.
    Random,
}

impl FromStr for SelectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "definition-order" | "definition order" => Ok(SelectionMethod::DefinitionOrder),
            "random" => Ok(SelectionMethod::Random),
            other => Err(format!(
                "invalid selection method: {other} (expected \"definition-order\" or \"random\")"
            )),
        }
    }
}

/// How job progress reaches the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationMethod {
    /// Jobs send messages back as they happen.
    #[default]
    Push,
    /// The scheduler polls job status files on a schedule.
    Poll,
}

/// Granularity at which a host-level failure consumes a candidate during
/// submission, poll and kill failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryUnit {
    /// Every host of every platform is a separate candidate.
    #[default]
    Host,
    /// One failed host rules out its whole platform; move to the next
    /// platform of the group.
    Platform,
    /// A single attempt per selection; any host failure fails the call and
    /// leaves recovery to the task's submission retry delays.
    Group,
}

impl fmt::Display for RetryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryUnit::Host => write!(f, "host"),
            RetryUnit::Platform => write!(f, "platform"),
            RetryUnit::Group => write!(f, "group"),
        }
    }
}

/// Severity attached to job messages and task event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" | "NORMAL" => Ok(Severity::Info),
            "WARN" | "WARNING" => Ok(Severity::Warning),
            "CRITICAL" | "ERROR" => Ok(Severity::Critical),
            other => Err(format!("invalid severity: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_method_parses_both_spellings() {
        assert_eq!(
            "definition order".parse::<SelectionMethod>().unwrap(),
            SelectionMethod::DefinitionOrder
        );
        assert_eq!("Random".parse::<SelectionMethod>().unwrap(), SelectionMethod::Random);
        assert!("fastest".parse::<SelectionMethod>().is_err());
    }

    #[test]
    fn severity_accepts_aliases() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("NORMAL".parse::<Severity>().unwrap(), Severity::Info);
    }
}
