// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `cyclorama`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cyclorama",
    version,
    about = "Run cycling workflows of dependent jobs on local and remote platforms.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow definition (TOML).
    ///
    /// Default: `flow.toml` in the current working directory, or
    /// `CYCLORAMA_CONFIG` when set.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CYCLORAMA_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the expanded graph, but don't run any jobs.
    #[arg(long)]
    pub dry_run: bool,

    /// Cycle points shown by `--dry-run`.
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub dry_run_points: usize,

    /// Exit once every task has finished and nothing is left to spawn.
    /// Overrides `[scheduler].stop_when_idle`.
    #[arg(long)]
    pub stop_when_idle: bool,

    /// Exit with an error when the workflow stalls.
    /// Overrides `[scheduler].abort_on_stall`.
    #[arg(long)]
    pub abort_on_stall: bool,

    /// Checkpoint file. Default: `checkpoint.json` under the run directory.
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Do not write checkpoints.
    #[arg(long, conflicts_with = "restart")]
    pub no_checkpoint: bool,

    /// Resume from the checkpoint instead of starting at the initial
    /// cycle point.
    #[arg(long)]
    pub restart: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_conflicts_with_no_checkpoint() {
        let args = CliArgs::try_parse_from(["cyclorama", "--restart", "--checkpoint", "cp.json"]).unwrap();
        assert!(args.restart);
        assert_eq!(args.checkpoint, Some(PathBuf::from("cp.json")));
        assert!(CliArgs::try_parse_from(["cyclorama", "--restart", "--no-checkpoint"]).is_err());
    }

    #[test]
    fn log_level_is_a_value_enum() {
        let args = CliArgs::try_parse_from(["cyclorama", "--log-level", "debug"]).unwrap();
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(CliArgs::try_parse_from(["cyclorama", "--log-level", "loud"]).is_err());
    }
}
