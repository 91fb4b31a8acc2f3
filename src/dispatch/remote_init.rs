// src/dispatch/remote_init.rs

//! One-time remote setup per install target and host.
//!
//! Before the first job goes to a remote host, the run directory layout is
//! created there and the install set copied over. Concurrent submissions
//! to the same target wait on the same initialisation; a failed init is
//! not remembered, so the next submission tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::dispatch::install::InstallSet;
use crate::dispatch::remote::{RemoteError, RemoteRunner};
use crate::platform::model::PlatformDef;

type InitKey = (String, String);

#[derive(Debug, Default)]
pub struct RemoteInit {
    install: Arc<InstallSet>,
    done: Mutex<HashMap<InitKey, Arc<OnceCell<()>>>>,
}

impl RemoteInit {
    pub fn new(install: InstallSet) -> Self {
        Self {
            install: Arc::new(install),
            done: Mutex::new(HashMap::new()),
        }
    }

    pub fn install_set(&self) -> &InstallSet {
        &self.install
    }

    fn cell(&self, key: InitKey) -> Arc<OnceCell<()>> {
        let mut done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(done.entry(key).or_default())
    }

    /// Whether `platform`'s install target is initialised on `host`.
    pub fn is_initialised(&self, platform: &PlatformDef, host: &str) -> bool {
        let done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        done.get(&(platform.install_target.clone(), host.to_string()))
            .is_some_and(|c| c.initialized())
    }

    /// Initialise `platform`'s install target on `host` unless already done
    /// this run. Local platforms need nothing.
    pub async fn ensure(
        &self,
        runner: &dyn RemoteRunner,
        platform: &PlatformDef,
        host: &str,
        ssh_command: &[String],
        run_root: &str,
    ) -> Result<(), RemoteError> {
        if platform.is_local() {
            return Ok(());
        }
        let cell = self.cell((platform.install_target.clone(), host.to_string()));
        cell.get_or_try_init(|| async {
            debug!(
                install_target = %platform.install_target,
                host,
                files = self.install.files().len(),
                "remote init"
            );
            let out = runner.run(host, ssh_command, &self.install.script(run_root)).await?;
            if out.stdout.contains("[INSTALL] current") {
                info!(install_target = %platform.install_target, host, "remote install already current");
            } else {
                info!(install_target = %platform.install_target, host, "remote init complete");
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }
}
