// src/logging.rs

//! Logging setup for `cyclorama` using `tracing` + `tracing-subscriber`.
//!
//! Filter resolution:
//! 1. `--log-level` CLI flag sets the level of every `cyclorama` module.
//! 2. Otherwise `CYCLORAMA_LOG` is read. A bare level ("debug", "warning")
//!    applies to the crate; anything else is taken as a full `EnvFilter`
//!    directive list, e.g. `cyclorama::dispatch=trace,cyclorama=info`.
//! 3. Default: `cyclorama=info`.
//!
//! Dependencies (notify, the ssh child processes) are held at `warn` unless
//! a directive names them. Logs go to STDERR; `--dry-run` output goes to
//! stdout.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "CYCLORAMA_LOG";

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let directives = resolve_directives(cli_level, std::env::var(LOG_ENV).ok().as_deref());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid {LOG_ENV} directives: {directives}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;

    Ok(())
}

fn resolve_directives(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    let crate_level = |level: tracing::Level| format!("warn,cyclorama={}", level.as_str().to_lowercase());
    if let Some(lvl) = cli_level {
        return crate_level(level_from_log_level(lvl));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => match parse_level_str(s) {
            Some(level) => crate_level(level),
            None => format!("warn,{s}"),
        },
        None => crate_level(tracing::Level::INFO),
    }
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.to_lowercase().as_str() {
        "error" | "critical" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_beats_environment() {
        assert_eq!(resolve_directives(Some(LogLevel::Trace), Some("error")), "warn,cyclorama=trace");
        assert_eq!(resolve_directives(None, Some(" Warning ")), "warn,cyclorama=warn");
        assert_eq!(resolve_directives(None, None), "warn,cyclorama=info");
    }

    #[test]
    fn environment_may_carry_full_directives() {
        let d = resolve_directives(None, Some("cyclorama::dispatch=trace"));
        assert_eq!(d, "warn,cyclorama::dispatch=trace");
        assert!(EnvFilter::try_new(&d).is_ok());
    }
}
