// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{RawWorkflowConfig, WorkflowConfig};
use crate::errors::Result;

/// Load a workflow file and return the raw `RawWorkflowConfig`.
///
/// This only performs TOML deserialization; it does **not** perform
/// semantic validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkflowConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawWorkflowConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a workflow file and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` default functions).
/// - Parses cycle points, recurrences, graph strings and durations.
/// - Flattens runtime inheritance and checks platform references.
/// - Rejects cyclic dependency graphs.
///
/// The run directory and the install source directory are resolved
/// relative to the directory holding the file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkflowConfig> {
    let path = path.as_ref();
    let raw_config = load_from_path(path)?;
    let mut config = WorkflowConfig::try_from(raw_config)?;

    let root = config_root_dir(path);
    config.scheduler.run_dir = resolve(&root, &config.scheduler.run_dir);
    config.scheduler.source_dir = root;
    Ok(config)
}

/// Default workflow file: `flow.toml` in the current working directory,
/// unless `CYCLORAMA_CONFIG` names another one.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("CYCLORAMA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("flow.toml"))
}

/// Directory holding the config file; the current directory for a bare
/// file name.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_against_the_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        fs::write(
            &path,
            r#"
            [scheduler]
            run_dir = "run"

            [scheduling]
            cycling_mode = "integer"
            initial_cycle_point = "1"
            [scheduling.graph]
            R1 = "hello"
            "#,
        )
        .unwrap();

        let cfg = load_and_validate(&path).unwrap();
        assert_eq!(cfg.scheduler.run_dir, dir.path().join("run"));
        assert_eq!(cfg.scheduler.source_dir, dir.path());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_from_path("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, crate::errors::CycloramaError::IoError(_)));
    }
}
