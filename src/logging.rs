// src/logging.rs

//! `tracing` subscriber setup.
//!
//! The level comes from `--log-level`, else from `TASKHOST_LOG` (any
//! `EnvFilter` directive, e.g. `taskhost::exec=debug`), else the role's
//! default. Everything is written to stderr: a helper turns into the task
//! and shares the task's stdout.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "TASKHOST_LOG";

/// Which side of the handoff this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Host,
    /// Quiet by default; its stderr becomes the task's stderr.
    Helper,
}

impl ProcessRole {
    fn default_directive(self) -> &'static str {
        match self {
            ProcessRole::Host => "info",
            ProcessRole::Helper => "warn",
        }
    }
}

pub fn init_logging(cli_level: Option<LogLevel>, role: ProcessRole) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(LOG_ENV).ok().as_deref(), role);

    fmt()
        .with_env_filter(filter)
        .with_target(role == ProcessRole::Host)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>, role: ProcessRole) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(directive(level));
    }
    env.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new(role.default_directive()))
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_beats_environment() {
        let filter = build_filter(Some(LogLevel::Debug), Some("error"), ProcessRole::Host);
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn helper_is_quiet_without_configuration() {
        assert_eq!(build_filter(None, None, ProcessRole::Helper).to_string(), "warn");
        assert_eq!(
            build_filter(None, Some("taskhost::exec=trace"), ProcessRole::Helper).to_string(),
            "taskhost::exec=trace"
        );
    }
}
