// tests/checkpoint_restart.rs

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use cyclorama::cycling::CyclePoint;
use cyclorama::dispatch::{JobEvent, JobKey};
use cyclorama::engine::{CoreRuntime, ExitReason, RuntimeEvent, RuntimeOptions, SchedulerHandle};
use cyclorama::fs::RealFileSystem;
use cyclorama::platform::BadHostRegistry;
use cyclorama::pool::Snapshot;
use cyclorama::task::{TaskId, TaskStatus};
use cyclorama::types::Severity;

use cyclorama_test_utils::builders::{NamespaceBuilder, WorkflowBuilder};
use cyclorama_test_utils::fake_backend::FakeOutcome;
use cyclorama_test_utils::harness::Harness;
use cyclorama_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn options(checkpoint: PathBuf) -> RuntimeOptions {
    RuntimeOptions {
        stop_when_idle: true,
        abort_on_stall: false,
        checkpoint: Some(checkpoint),
    }
}

async fn wait_for(handle: &SchedulerHandle, name: &str, status: TaskStatus) {
    with_timeout(async {
        loop {
            let tasks = handle.query().await.unwrap();
            if tasks.iter().any(|t| t.name == name && t.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::test]
async fn restart_resumes_running_job_without_resubmitting_finished_tasks() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "a => b")
        .build();
    let path = PathBuf::from("/run/.service/checkpoint.json");

    // First run: a succeeds, b is still running at shutdown.
    let first = Harness::new(&cfg, options(path.clone())).script("b", [FakeOutcome::Hang]);
    let fs = first.fs.clone();
    let handle = first.handle();
    let run = first.spawn();
    wait_for(&handle, "b", TaskStatus::Running).await;
    handle.shutdown().await?;
    assert_eq!(with_timeout(run).await??, ExitReason::ShutdownRequested);

    let snapshot = Snapshot::load(&fs, &path)?;
    assert_eq!(snapshot.tasks.len(), 2);

    // Second run: the job's completion arrives after the restart.
    let second = Harness::new(&cfg, options(path.clone()))
        .with_fs(fs)
        .restore(snapshot);
    let log = second.log();
    let b = JobKey::new(TaskId::new("b", CyclePoint::Integer(1)), 1);
    second.preload(RuntimeEvent::Job(JobEvent::Message {
        key: b.clone(),
        message: "succeeded".into(),
        severity: Severity::Info,
        at: Utc::now(),
    }));

    assert_eq!(with_timeout(second.spawn()).await??, ExitReason::Completed);
    let log = log.lock().unwrap();
    assert!(log.submitted.is_empty(), "resubmitted: {:?}", log.submitted_keys());
    assert_eq!(log.polled.iter().map(|j| j.key.clone()).collect::<Vec<_>>(), vec![b]);
    Ok(())
}

#[tokio::test]
async fn restart_requeues_tasks_that_were_waiting_to_retry() -> TestResult {
    init_tracing();
    let cfg = WorkflowBuilder::integer(1)
        .final_point("1")
        .graph("R1", "slow")
        .namespace("slow", NamespaceBuilder::new().execution_retry_delays(&["PT1H"]))
        .build();
    let path = PathBuf::from("/run/checkpoint.json");

    let first = Harness::new(&cfg, options(path.clone())).script("slow", [FakeOutcome::Fail("oom".into())]);
    let fs = first.fs.clone();
    let handle = first.handle();
    let run = first.spawn();
    wait_for(&handle, "slow", TaskStatus::Retrying).await;
    handle.shutdown().await?;
    with_timeout(run).await??;

    let snapshot = Snapshot::load(&fs, &path)?;
    let second = Harness::new(&cfg, options(path)).with_fs(fs).restore(snapshot);
    let log = second.log();

    assert_eq!(with_timeout(second.spawn()).await??, ExitReason::Completed);
    // The hour-long delay is not waited out again; the next try runs at once.
    let log = log.lock().unwrap();
    assert_eq!(log.submitted_keys(), vec!["1/slow/02"]);
    assert_eq!(log.submitted[0].try_num, 2);
    Ok(())
}

#[test]
fn snapshot_survives_a_real_file_round_trip() -> TestResult {
    let cfg = WorkflowBuilder::integer(1)
        .final_point("2")
        .graph("P1", "a[-P1] => a")
        .build();
    let mut core = CoreRuntime::from_config(
        &cfg,
        Arc::new(cfg.platforms.clone()),
        BadHostRegistry::shared(Duration::from_secs(60), Instant::now()),
        RuntimeOptions::default(),
    );
    core.start(Instant::now());

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state").join("checkpoint.json");
    let snapshot = core.pool().snapshot();
    snapshot.save(&RealFileSystem, &path)?;

    let loaded = Snapshot::load(&RealFileSystem, &path)?;
    assert_eq!(loaded.tasks.len(), snapshot.tasks.len());
    assert_eq!(loaded.initial_point, snapshot.initial_point);
    Ok(())
}
