// tests/config_loading.rs

use std::error::Error;
use std::sync::Arc;

use cyclorama::config::{load_and_validate, RunaheadLimit};
use cyclorama::cycling::{CyclePoint, Interval};
use cyclorama::errors::CycloramaError;
use cyclorama::graph::GraphExpander;
use cyclorama::platform::PlatformSpec;
use cyclorama::types::CyclingMode;

use cyclorama_test_utils::builders::{NamespaceBuilder, PlatformBuilder, WorkflowBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn cal(s: &str) -> CyclePoint {
    CyclePoint::parse(s, CyclingMode::Gregorian).unwrap()
}

#[test]
fn calendar_workflow_loads_from_disk() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = WorkflowBuilder::gregorian("2024-01-01T00:00Z")
        .final_point("2024-01-02T00:00Z")
        .runahead("PT12H")
        .graph("PT12H", "obs[-PT12H] => obs => forecast")
        .graph("R1/$", "forecast => archive")
        .scheduler("run_dir", "runs/latest")
        .write_to(dir.path());

    let cfg = load_and_validate(&path)?;

    assert_eq!(cfg.scheduling.mode, CyclingMode::Gregorian);
    assert_eq!(cfg.scheduling.initial, cal("20240101T00Z"));
    assert_eq!(cfg.scheduling.final_point, Some(cal("20240102T00Z")));
    assert!(matches!(cfg.scheduling.runahead, RunaheadLimit::Interval(_)));
    assert_eq!(cfg.scheduler.run_dir, dir.path().join("runs/latest"));
    assert_eq!(cfg.scheduler.source_dir, dir.path());

    let mut expander = GraphExpander::new(Arc::clone(&cfg.definition));
    let step = Interval::parse("PT12H", CyclingMode::Gregorian)?;
    let mut points = Vec::new();
    while let Some(p) = expander.next_cycle_point() {
        let mut names: Vec<String> = expander.spawn(p).into_iter().map(|t| t.id.name).collect();
        names.sort();
        points.push((p, names));
    }
    assert_eq!(points.len(), 3);
    assert_eq!(points[1].0, points[0].0 + step);
    assert_eq!(points[2].1, vec!["archive", "forecast", "obs"]);
    Ok(())
}

#[test]
fn family_settings_are_inherited_and_queues_accept_families() -> TestResult {
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "prep => MODELS\nMODELS:succeed-all => post")
        .platform("hpc", PlatformBuilder::new(&["login1"]).job_runner("slurm"))
        .namespace(
            "MODELS",
            NamespaceBuilder::new()
                .platform("hpc")
                .env("NPROC", "64")
                .execution_retry_delays(&["PT1M"]),
        )
        .namespace("ocean", NamespaceBuilder::new().inherit(&["MODELS"]).script("run-ocean"))
        .namespace("atmos", NamespaceBuilder::new().inherit(&["MODELS"]).env("NPROC", "128"))
        .queue("big", 1, &["MODELS"])
        .build();

    let ocean = cfg.definition.task("ocean").expect("ocean defined");
    assert_eq!(ocean.runtime.platform, PlatformSpec::Named("hpc".into()));
    assert_eq!(ocean.runtime.environment["NPROC"], "64");
    assert_eq!(ocean.runtime.execution_retry_delays.len(), 1);
    assert_eq!(ocean.queue, "big");
    assert!(ocean.ancestors.iter().any(|a| a == "MODELS"));

    let atmos = cfg.definition.task("atmos").expect("atmos defined");
    assert_eq!(atmos.runtime.environment["NPROC"], "128");
    assert_eq!(atmos.queue, "big");

    let prep = cfg.definition.task("prep").expect("prep defined");
    assert_eq!(prep.queue, "default");
    assert_eq!(prep.runtime.platform, PlatformSpec::Local);
    Ok(())
}

#[test]
fn conflicting_parents_must_be_resolved_by_the_child() {
    let err = WorkflowBuilder::integer(1)
        .graph("R1", "child")
        .namespace("A", NamespaceBuilder::new().script("run-a"))
        .namespace("B", NamespaceBuilder::new().script("run-b"))
        .namespace("child", NamespaceBuilder::new().inherit(&["A", "B"]))
        .try_build()
        .unwrap_err();
    assert!(matches!(err, CycloramaError::InheritanceConflict(_)), "got {err}");

    WorkflowBuilder::integer(1)
        .graph("R1", "child")
        .namespace("A", NamespaceBuilder::new().script("run-a"))
        .namespace("B", NamespaceBuilder::new().script("run-b"))
        .namespace("child", NamespaceBuilder::new().inherit(&["A", "B"]).script("run-child"))
        .build();
}

#[test]
fn cyclic_graph_is_rejected() {
    let err = WorkflowBuilder::integer(1)
        .graph("R1", "a => b => c\nc => a")
        .try_build()
        .unwrap_err();
    assert!(matches!(err, CycloramaError::GraphCycle(_)), "got {err}");
}

#[test]
fn intercycle_loops_are_not_cycles() {
    WorkflowBuilder::integer(1)
        .graph("P1", "a[-P1] => b => a")
        .build();
}

#[test]
fn unknown_platform_reference_is_rejected() {
    let result = WorkflowBuilder::integer(1)
        .graph("R1", "a")
        .namespace("a", NamespaceBuilder::new().platform("nowhere"))
        .try_build();
    assert!(result.is_err());
}

#[test]
fn malformed_toml_reports_a_parse_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flow.toml");
    std::fs::write(&path, "[scheduling\ninitial_cycle_point = 1\n")?;

    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, CycloramaError::TomlError(_)), "got {err}");
    Ok(())
}
