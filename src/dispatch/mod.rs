// src/dispatch/mod.rs

//! Job dispatch: remote init, file install, batch submission, polling and
//! kill, with host failover through the platform selector.

pub mod batch_system;
pub mod dispatcher;
pub mod install;
pub mod job;
pub mod job_file;
pub mod remote;
pub mod remote_init;
pub mod status;

pub use batch_system::BatchSystemKind;
pub use dispatcher::{JobBackend, JobDispatcher, RemoteContext};
pub use install::InstallSet;
pub use job::{JobEvent, JobFailure, JobKey, JobRef, JobSpec};
pub use remote::{RemoteError, RemoteOutput, RemoteRunner, SshRunner};
pub use remote_init::RemoteInit;
pub use status::{JobStatusSource, PollStatusSource, PushStatusSource, SeenMessages};
