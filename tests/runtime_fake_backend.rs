// tests/runtime_fake_backend.rs

use std::error::Error;
use std::time::Duration;

use cyclorama::cycling::CyclePoint;
use cyclorama::engine::{ExitReason, OperatorCommand, RuntimeEvent, RuntimeOptions};
use cyclorama::task::{TaskEventKind, TaskId, TaskStatus};

use cyclorama_test_utils::builders::{NamespaceBuilder, WorkflowBuilder};
use cyclorama_test_utils::fake_backend::FakeOutcome;
use cyclorama_test_utils::harness::Harness;
use cyclorama_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn run_to_end() -> RuntimeOptions {
    RuntimeOptions {
        stop_when_idle: true,
        abort_on_stall: true,
        checkpoint: None,
    }
}

fn id(name: &str, point: i64) -> TaskId {
    TaskId::new(name, CyclePoint::Integer(point))
}

#[tokio::test]
async fn chain_runs_in_dependency_order() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a => b => c")
        .build();
    let harness = Harness::new(&cfg, run_to_end());
    let log = harness.log();
    let sink = harness.sink.clone();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["a", "b", "c"]);
    let kinds = sink.kinds_for(&id("c", 1));
    assert!(kinds.contains(&TaskEventKind::Succeeded), "events for 1/c: {kinds:?}");
    Ok(())
}

#[tokio::test]
async fn intercycle_dependency_runs_points_in_order() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("3")
        .runahead("P2")
        .graph("P1", "model[-P1] => model => post")
        .build();
    let harness = Harness::new(&cfg, run_to_end());
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    let keys = log.lock().unwrap().submitted_keys();
    let models: Vec<&str> = keys.iter().map(String::as_str).filter(|k| k.contains("/model/")).collect();
    assert_eq!(models, vec!["1/model/01", "2/model/01", "3/model/01"]);
    assert_eq!(keys.len(), 6);
    Ok(())
}

#[tokio::test]
async fn failed_job_is_retried_then_succeeds() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "flaky => after")
        .namespace("flaky", NamespaceBuilder::new().execution_retry_delays(&["PT0S"]))
        .build();
    let harness = Harness::new(&cfg, run_to_end()).script("flaky", [FakeOutcome::Fail("boom".into())]);
    let log = harness.log();
    let sink = harness.sink.clone();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    let log = log.lock().unwrap();
    assert_eq!(log.submitted_keys(), vec!["1/flaky/01", "1/flaky/02", "1/after/01"]);
    let tries: Vec<u32> = log.submitted.iter().map(|s| s.try_num).collect();
    assert_eq!(tries, vec![1, 2, 1]);
    assert!(sink.kinds_for(&id("flaky", 1)).contains(&TaskEventKind::Retry));
    Ok(())
}

#[tokio::test]
async fn submission_failures_use_submission_retries() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a")
        .namespace("a", NamespaceBuilder::new().submission_retry_delays(&["PT0S", "PT0S"]))
        .build();
    let harness = Harness::new(&cfg, run_to_end()).script(
        "a",
        [
            FakeOutcome::SubmitFail("queue closed".into()),
            FakeOutcome::SubmitFail("queue closed".into()),
        ],
    );
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_keys(), vec!["1/a/01", "1/a/02", "1/a/03"]);
    Ok(())
}

#[tokio::test]
async fn unhandled_failure_stalls_and_aborts() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a => b")
        .build();
    let harness = Harness::new(&cfg, run_to_end()).script("a", [FakeOutcome::Fail("exit 1".into())]);
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Stalled);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["a"]);
    Ok(())
}

#[tokio::test]
async fn failure_branch_runs_on_fail_trigger() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a? => b\na:fail? => recover\na:fail? => !b")
        .build();
    let harness = Harness::new(&cfg, run_to_end()).script("a", [FakeOutcome::Fail("exit 1".into())]);
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["a", "recover"]);
    Ok(())
}

fn family_of_three(graph: &str) -> WorkflowBuilder {
    let mut builder = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", graph)
        .namespace("FAM", NamespaceBuilder::new());
    for member in ["m1", "m2", "m3"] {
        builder = builder.namespace(member, NamespaceBuilder::new().inherit(&["FAM"]));
    }
    builder
}

#[tokio::test]
async fn family_succeed_all_releases_downstream_once() -> TestResult {
    init_tracing();
    let cfg = family_of_three("FAM:succeed-all => post").build();
    let harness = Harness::new(&cfg, run_to_end());
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    let mut names = log.lock().unwrap().submitted_names();
    assert_eq!(names.pop().as_deref(), Some("post"));
    names.sort();
    assert_eq!(names, vec!["m1", "m2", "m3"]);
    Ok(())
}

#[tokio::test]
async fn family_succeed_all_holds_downstream_when_a_member_fails() -> TestResult {
    init_tracing();
    let cfg = family_of_three("FAM:succeed-all => post").build();
    let harness = Harness::new(&cfg, run_to_end()).script("m2", [FakeOutcome::Fail("exit 1".into())]);
    let log = harness.log();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Stalled);
    let mut names = log.lock().unwrap().submitted_names();
    names.sort();
    assert_eq!(names, vec!["m1", "m2", "m3"]);
    Ok(())
}

#[tokio::test]
async fn suicide_on_failure_leaves_dependent_alone_when_upstream_succeeds() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "foo => bar\nfoo:fail? => !bar")
        .build();
    let harness = Harness::new(&cfg, run_to_end());
    let log = harness.log();
    let sink = harness.sink.clone();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["foo", "bar"]);
    let kinds = sink.kinds_for(&id("bar", 1));
    assert!(!kinds.contains(&TaskEventKind::Removed), "events for 1/bar: {kinds:?}");
    Ok(())
}

#[tokio::test]
async fn custom_output_triggers_downstream_before_success() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "fetch:data_ready => process")
        .namespace("fetch", NamespaceBuilder::new().output("data_ready", "data ready"))
        .build();
    let harness = Harness::new(&cfg, run_to_end())
        .script("fetch", [FakeOutcome::Messages(vec!["data ready".into()])]);
    let log = harness.log();
    let sink = harness.sink.clone();

    let reason = with_timeout(harness.spawn()).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["fetch", "process"]);
    let kinds = sink.kinds_for(&id("fetch", 1));
    assert!(
        kinds.iter().any(|k| matches!(k, TaskEventKind::Custom(msg) if msg == "data ready")),
        "events for 1/fetch: {kinds:?}"
    );
    Ok(())
}

#[tokio::test]
async fn held_task_waits_for_release() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a => b")
        .build();
    // A held task with satisfied prerequisites counts towards a stall.
    let options = RuntimeOptions {
        stop_when_idle: true,
        ..RuntimeOptions::default()
    };
    let harness = Harness::new(&cfg, options);
    let handle = harness.handle();
    let log = harness.log();
    // Processed before any job event from the first batch.
    harness.preload(RuntimeEvent::Command {
        command: OperatorCommand::Hold {
            tasks: vec!["*/b".into()],
        },
        reply: None,
    });
    let run = harness.spawn();

    with_timeout(async {
        loop {
            let tasks = handle.query().await.unwrap();
            let a_done = tasks.iter().all(|t| t.name != "a" || t.status == TaskStatus::Succeeded);
            if a_done {
                let b = tasks.iter().find(|t| t.name == "b").unwrap();
                assert!(b.held);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["a"]);

    assert_eq!(handle.release(&["1/b"]).await?, 1);
    let reason = with_timeout(run).await??;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn operator_kill_of_hanging_job_fails_the_task() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "sleeper")
        .namespace("sleeper", NamespaceBuilder::new().execution_retry_delays(&["PT0S"]))
        .build();
    let options = RuntimeOptions {
        stop_when_idle: true,
        abort_on_stall: false,
        checkpoint: None,
    };
    let harness = Harness::new(&cfg, options).script("sleeper", [FakeOutcome::Hang]);
    let handle = harness.handle();
    let log = harness.log();
    let run = harness.spawn();

    with_timeout(async {
        loop {
            let tasks = handle.query().await.unwrap();
            if tasks.iter().any(|t| t.name == "sleeper" && t.status == TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert_eq!(handle.kill(&["1/sleeper"]).await?, 1);
    with_timeout(async {
        loop {
            let tasks = handle.query().await.unwrap();
            if tasks.iter().any(|t| t.name == "sleeper" && t.status == TaskStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    // Killed jobs are not retried.
    assert_eq!(log.lock().unwrap().submitted_keys(), vec!["1/sleeper/01"]);

    handle.stop().await?;
    let reason = with_timeout(run).await??;
    assert_eq!(reason, ExitReason::Stopped);
    Ok(())
}

#[tokio::test]
async fn queue_limit_bounds_active_jobs() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "m1 & m2 & m3 => done")
        .queue("serial", 1, &["m1", "m2", "m3"])
        .build();
    let harness = Harness::new(&cfg, run_to_end()).script("m1", [FakeOutcome::Hang]);
    let handle = harness.handle();
    let log = harness.log();
    let run = harness.spawn();

    with_timeout(async {
        loop {
            let tasks = handle.query().await.unwrap();
            if tasks.iter().any(|t| t.name == "m1" && t.status == TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.lock().unwrap().submitted_names(), vec!["m1"]);

    handle.shutdown().await?;
    let reason = with_timeout(run).await??;
    assert_eq!(reason, ExitReason::ShutdownRequested);
    Ok(())
}
