// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

use crate::types::{ConflictPolicy, SourceUnitId};

/// Command-line arguments for `taskhost`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskhost",
    version,
    about = "Build (when stale) and run source units as out-of-process tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workspace config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Taskhost.toml", global = true)]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKHOST_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Build the units if needed and run them, in order.
    Run(RunArgs),

    /// Report whether a unit's compiled artifact can be reused.
    Check {
        #[arg(value_name = "UNIT", value_parser = parse_unit)]
        unit: SourceUnitId,
    },

    /// Forget a unit's cache record so the next run rebuilds it.
    Forget {
        #[arg(value_name = "UNIT", value_parser = parse_unit)]
        unit: SourceUnitId,

        /// Also delete the cached artifact file.
        #[arg(long)]
        delete_artifact: bool,
    },

    /// Parse + validate the config and print the units, without running anything.
    DryRun,

    /// Helper mode: receive task parameters on the given pipe and run them.
    #[command(hide = true)]
    Helper {
        #[arg(value_name = "PIPE")]
        pipe: String,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Units to run, in request order.
    #[arg(value_name = "UNIT", required = true, value_parser = parse_unit)]
    pub units: Vec<SourceUnitId>,

    /// Override the units' `if_running` policy for these requests.
    #[arg(long, value_name = "POLICY", value_parser = parse_policy)]
    pub if_running: Option<ConflictPolicy>,

    /// Never queue a request behind a running instance.
    #[arg(long)]
    pub no_defer: bool,

    /// Treat the requests as programmatic rather than interactive runs.
    #[arg(long)]
    pub programmatic: bool,

    /// Return as soon as the requests were handled instead of waiting for
    /// the tasks to end.
    #[arg(long)]
    pub detach: bool,

    /// Arguments passed to every started task.
    #[arg(last = true, value_name = "ARGS")]
    pub args: Vec<String>,
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

fn parse_unit(s: &str) -> Result<SourceUnitId, String> {
    s.parse()
}

fn parse_policy(s: &str) -> Result<ConflictPolicy, String> {
    s.parse()
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_units_and_trailing_args() {
        let args = CliArgs::try_parse_from([
            "taskhost",
            "run",
            "3",
            "4",
            "--if-running",
            "wait",
            "--",
            "a",
            "b",
        ])
        .expect("valid command line");

        match args.command {
            Command::Run(run) => {
                assert_eq!(run.units, vec![SourceUnitId(3), SourceUnitId(4)]);
                assert_eq!(run.if_running, Some(ConflictPolicy::Wait));
                assert_eq!(run.args, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
