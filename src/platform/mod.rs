// src/platform/mod.rs

//! Platforms, host selection and the bad host registry.

pub mod bad_hosts;
pub mod model;
pub mod resolver;
pub mod selector;

pub use bad_hosts::{BadHostRegistry, SharedBadHosts};
pub use model::{PlatformDef, PlatformGroup, PlatformRegistry, PlatformSpec, LOCALHOST};
pub use resolver::{PlatformResolver, ShellResolver, StaticResolver};
pub use selector::{Candidate, PlatformSelector, SelectError, SelectionAttempt};
