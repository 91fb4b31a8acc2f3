// src/lib.rs

pub mod cli;
pub mod config;
pub mod cycling;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod graph;
pub mod logging;
pub mod platform;
pub mod pool;
pub mod retry;
pub mod task;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::{default_config_path, load_and_validate, RunaheadLimit, WorkflowConfig};
use crate::dispatch::{
    InstallSet, JobDispatcher, PushStatusSource, RemoteContext, RemoteInit, SeenMessages, SshRunner,
};
use crate::engine::{CoreRuntime, ExitReason, Runtime, RuntimeEvent, RuntimeOptions};
use crate::fs::{FileSystem, RealFileSystem};
use crate::graph::GraphExpander;
use crate::platform::{BadHostRegistry, PlatformSelector, ShellResolver};
use crate::pool::Snapshot;
use crate::task::LoggingEventSink;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the task pool and the core scheduler
/// - the job dispatcher (platform selection, remote init, batch systems)
/// - the push-message inbox watcher
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading workflow {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg, args.dry_run_points);
        return Ok(());
    }

    let options = runtime_options(&args, &cfg);
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);

    let platforms = Arc::new(cfg.platforms.clone());
    let bad_hosts = BadHostRegistry::shared(cfg.scheduler.bad_hosts_clear_interval, Instant::now());
    let selector = PlatformSelector::new(
        Arc::clone(&platforms),
        Arc::clone(&bad_hosts),
        cfg.scheduler.retry_unit,
        cfg.scheduler.exhaustion_retry,
    );
    let install = InstallSet::collect(fs.as_ref(), &cfg.scheduler.source_dir, &cfg.scheduler.install)?;
    let ctx = RemoteContext {
        selector,
        runner: Arc::new(SshRunner::new(cfg.scheduler.remote_timeout)),
        ssh_command: cfg.scheduler.ssh_command.clone(),
        run_dir: cfg.scheduler.run_dir.clone(),
        permits: Arc::new(Semaphore::new(cfg.scheduler.process_pool_size)),
        events: rt_tx.clone(),
    };
    let seen = Arc::new(SeenMessages::new());
    let dispatcher = JobDispatcher::new(
        ctx,
        Arc::new(ShellResolver::new(cfg.scheduler.remote_timeout)),
        RemoteInit::new(install),
        Arc::clone(&seen),
    );

    // Messages from jobs on push platforms.
    let inbox = Arc::new(PushStatusSource::new(
        &cfg.scheduler.run_dir,
        cfg.scheduling.mode,
        Arc::clone(&fs),
        seen,
        rt_tx.clone(),
    ));
    let _inbox_watcher = inbox.spawn_watcher()?;

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let mut core = CoreRuntime::from_config(&cfg, platforms, bad_hosts, options.clone());
    if args.restart {
        let Some(path) = options.checkpoint.as_deref() else {
            bail!("--restart needs a checkpoint file");
        };
        let snapshot = Snapshot::load(fs.as_ref(), path)?;
        core.restore(snapshot)?;
        info!(path = %path.display(), "restarting from checkpoint");
    }

    // Construct the async IO shell around the core.
    let runtime = Runtime::new(
        core,
        rt_rx,
        &rt_tx,
        dispatcher,
        Arc::new(LoggingEventSink),
        fs,
        cfg.scheduler.main_loop_interval,
    );
    let reason = runtime.run().await?;
    info!(%reason, "workflow finished");
    if reason == ExitReason::Stalled {
        bail!("workflow stalled");
    }
    Ok(())
}

/// CLI flags switch the stop policies on; the config can too.
fn runtime_options(args: &CliArgs, cfg: &WorkflowConfig) -> RuntimeOptions {
    let checkpoint = if args.no_checkpoint {
        None
    } else {
        Some(
            args.checkpoint
                .clone()
                .unwrap_or_else(|| default_checkpoint(&cfg.scheduler.run_dir)),
        )
    };
    RuntimeOptions {
        stop_when_idle: args.stop_when_idle || cfg.scheduler.stop_when_idle,
        abort_on_stall: args.abort_on_stall || cfg.scheduler.abort_on_stall,
        checkpoint,
    }
}

fn default_checkpoint(run_dir: &std::path::Path) -> PathBuf {
    run_dir.join(".service").join("checkpoint.json")
}

/// Dry-run output: scheduling settings, platforms, and the task instances
/// of the first `points` cycle points with their prerequisites.
fn print_dry_run(cfg: &WorkflowConfig, points: usize) {
    let sched = &cfg.scheduling;
    println!("cyclorama dry-run");
    println!("  scheduling.cycling_mode = {:?}", sched.mode);
    println!("  scheduling.initial_cycle_point = {}", sched.initial);
    match sched.final_point {
        Some(fp) => println!("  scheduling.final_cycle_point = {fp}"),
        None => println!("  scheduling.final_cycle_point = (none)"),
    }
    match sched.runahead {
        RunaheadLimit::Cycles(n) => println!("  scheduling.runahead_limit = {n} cycles"),
        RunaheadLimit::Interval(i) => println!("  scheduling.runahead_limit = {i}"),
    }
    println!("  scheduling.max_active_submissions = {}", sched.max_active_submissions);
    for (name, q) in &sched.queues {
        println!("  queue {name}: limit {}", q.limit);
    }
    println!();

    println!("platforms:");
    for p in cfg.platforms.platforms() {
        println!(
            "  - {} ({:?}, {:?}) hosts: {}",
            p.name,
            p.batch_system,
            p.communication,
            p.hosts.join(", ")
        );
    }
    println!();

    let mut expander = GraphExpander::new(Arc::clone(&cfg.definition));
    for _ in 0..points {
        let Some(point) = expander.next_cycle_point() else {
            break;
        };
        println!("{point}:");
        for proxy in expander.spawn(point) {
            println!("  - {} [queue {}]", proxy.id.name, proxy.queue);
            for pre in proxy.prerequisites() {
                println!("      after {}", pre.label());
            }
        }
    }

    debug!("dry-run complete (no execution)");
}
