use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cyclorama::config::WorkflowConfig;
use cyclorama::engine::{CoreRuntime, ExitReason, Runtime, RuntimeEvent, RuntimeOptions, SchedulerHandle};
use cyclorama::fs::mock::MockFileSystem;
use cyclorama::fs::FileSystem;
use cyclorama::platform::BadHostRegistry;
use cyclorama::pool::Snapshot;
use cyclorama::task::MemoryEventSink;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::fake_backend::{FakeJobBackend, FakeJobLog, FakeOutcome};

/// A scheduler wired to a [`FakeJobBackend`], an in-memory event sink and
/// an in-memory filesystem.
pub struct Harness {
    core: CoreRuntime,
    tx: mpsc::Sender<RuntimeEvent>,
    rx: mpsc::Receiver<RuntimeEvent>,
    backend: FakeJobBackend,
    pub sink: MemoryEventSink,
    pub fs: MockFileSystem,
}

impl Harness {
    pub fn new(cfg: &WorkflowConfig, options: RuntimeOptions) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let platforms = Arc::new(cfg.platforms.clone());
        let bad_hosts = BadHostRegistry::shared(cfg.scheduler.bad_hosts_clear_interval, Instant::now());
        Self {
            core: CoreRuntime::from_config(cfg, platforms, bad_hosts, options),
            backend: FakeJobBackend::new(tx.clone()),
            tx,
            rx,
            sink: MemoryEventSink::new(),
            fs: MockFileSystem::new(),
        }
    }

    pub fn script(mut self, task: &str, outcomes: impl IntoIterator<Item = FakeOutcome>) -> Self {
        self.backend = self.backend.script(task, outcomes);
        self
    }

    /// Share a filesystem with an earlier run, e.g. to restart from its
    /// checkpoint.
    pub fn with_fs(mut self, fs: MockFileSystem) -> Self {
        self.fs = fs;
        self
    }

    pub fn restore(mut self, snapshot: Snapshot) -> Self {
        self.core.restore(snapshot).expect("restore snapshot");
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.tx.clone())
    }

    /// Queue an event ahead of everything the first iteration produces.
    pub fn preload(&self, event: RuntimeEvent) {
        self.tx.try_send(event).expect("preload event");
    }

    pub fn log(&self) -> Arc<Mutex<FakeJobLog>> {
        self.backend.log()
    }

    pub fn spawn(self) -> JoinHandle<cyclorama::errors::Result<ExitReason>> {
        let fs: Arc<dyn FileSystem> = Arc::new(self.fs);
        let runtime = Runtime::new(
            self.core,
            self.rx,
            &self.tx,
            self.backend,
            Arc::new(self.sink),
            fs,
            Duration::from_millis(20),
        );
        tokio::spawn(runtime.run())
    }
}
