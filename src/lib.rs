// src/lib.rs

pub mod cache;
pub mod cli;
pub mod compile;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod types;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::cache::{CacheVerdict, EnvironmentStamp, FingerprintStore};
use crate::cli::{CliArgs, Command, RunArgs};
use crate::compile::CommandCompileStep;
use crate::config::{ConfigFile, load_and_validate, workspace_root_of};
use crate::engine::{
    RunRequest, Runtime, RuntimeEvent, RuntimeOptions, Scheduler, SchedulerConfig, TaskHost,
};
use crate::exec::{IntegrityLevel, OsLauncher, PoolConfig, PreloadedPool, ProcessLauncher};
use crate::fs::{FileSystem, RealFileSystem};
use crate::types::LaunchOutcome;
use crate::workspace::ConfigWorkspace;

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    if let Command::Helper { pipe } = &args.command {
        return exec::helper::run_helper(pipe).await;
    }

    let config_path = PathBuf::from(&args.config);
    let cfg = Arc::new(load_and_validate(&config_path)?);

    if let Command::DryRun = args.command {
        print_dry_run(&cfg);
        return Ok(0);
    }

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let root = workspace_root_of(&config_path);
    let root = fs.canonicalize(&root).unwrap_or(root);
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(OsLauncher::new(cfg.config.elevate_cmd.clone()));

    match args.command {
        Command::Run(run_args) => run_units(cfg, root, fs, launcher, run_args).await,
        Command::Check { unit } => {
            let (events_tx, _events_rx) = mpsc::channel(1);
            let host = build_host(cfg, root, fs, launcher, events_tx)?;
            match host.check(unit)? {
                CacheVerdict::UpToDate(compiled) => {
                    println!("unit {unit}: up to date ({})", compiled.artifact.display());
                    Ok(0)
                }
                CacheVerdict::Stale(reason) => {
                    println!("unit {unit}: stale ({reason})");
                    Ok(1)
                }
            }
        }
        Command::Forget {
            unit,
            delete_artifact,
        } => {
            let (events_tx, _events_rx) = mpsc::channel(1);
            let mut host = build_host(cfg, root, fs, launcher, events_tx)?;
            if host.forget(unit, delete_artifact)? {
                println!("unit {unit}: cache record removed");
            } else {
                println!("unit {unit}: no cache record");
            }
            Ok(0)
        }
        Command::DryRun | Command::Helper { .. } => Ok(0),
    }
}

/// Wire config, fingerprint store, compiler, pool and scheduler into a host.
///
/// `events` is the runtime channel the process watchers report exits on.
pub fn build_host(
    cfg: Arc<ConfigFile>,
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    launcher: Arc<dyn ProcessLauncher>,
    events: mpsc::Sender<RuntimeEvent>,
) -> Result<TaskHost> {
    let workspace = Arc::new(ConfigWorkspace::from_config(&cfg, &root));

    let stamp = EnvironmentStamp::current(fs.as_ref(), &root);
    let live_units = Arc::clone(&cfg);
    let store = FingerprintStore::open(
        root.join(&cfg.config.cache_dir),
        &root,
        stamp,
        Arc::clone(&fs),
        move |id| live_units.unit(id).is_some(),
    );
    debug!(?store, "fingerprint store ready");

    let compiler = CommandCompileStep::new(cfg.config.compile_cmd.as_deref(), Arc::clone(&fs))?;

    let host_pid = std::process::id();
    let pipe_dir = match &cfg.config.pipe_dir {
        Some(dir) => root.join(dir),
        None => std::env::temp_dir(),
    };
    let helper_program = std::env::current_exe().context("locating the taskhost executable")?;
    let pool = PreloadedPool::new(
        PoolConfig {
            pipe_dir,
            host_pid,
            helper_program,
        },
        Arc::clone(&launcher),
    );

    let scheduler = Scheduler::new(
        SchedulerConfig {
            workspace_root: root,
            host_pid,
            host_level: IntegrityLevel::detect(),
            privilege_control: cfg.config.privilege_control,
            terminate_timeout: cfg.config.terminate_timeout(),
        },
        pool,
        launcher,
        events,
    );

    Ok(TaskHost::new(
        cfg,
        workspace,
        fs,
        store,
        Box::new(compiler),
        scheduler,
    ))
}

async fn run_units(
    cfg: Arc<ConfigFile>,
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    launcher: Arc<dyn ProcessLauncher>,
    args: RunArgs,
) -> Result<i32> {
    // Every request is queued before the loop starts.
    let capacity = 64.max(args.units.len() + 8);
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(capacity);

    let host = build_host(cfg, root, fs, launcher, rt_tx.clone())?;

    // Ctrl-C → terminate running tasks and stop.
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

    let mut replies = Vec::with_capacity(args.units.len());
    for unit in &args.units {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = RunRequest {
            unit: *unit,
            args: args.args.clone(),
            interactive: !args.programmatic,
            allow_defer: !args.no_defer,
            policy_override: args.if_running,
            result_pipe: None,
        };
        rt_tx
            .send(RuntimeEvent::RunRequested {
                request,
                reply: Some(reply_tx),
            })
            .await?;
        replies.push((*unit, reply_rx));
    }
    drop(rt_tx);

    let options = RuntimeOptions {
        exit_when_idle: true,
        detach: args.detach,
    };
    Runtime::new(host, options, rt_rx).run().await?;

    let mut failed = 0usize;
    for (unit, mut reply) in replies {
        match reply.try_recv() {
            Ok(LaunchOutcome::Started(pid)) => debug!(unit = %unit, pid, "run started"),
            Ok(LaunchOutcome::Deferred) => debug!(unit = %unit, "run was deferred"),
            Ok(LaunchOutcome::NotStarted) | Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        info!(failed, "some requested units did not start");
        return Ok(1);
    }
    Ok(0)
}

/// Print the validated workspace without running anything.
fn print_dry_run(cfg: &ConfigFile) {
    println!("taskhost dry-run");
    println!("  config.cache_dir = {}", cfg.config.cache_dir.display());
    match &cfg.config.compile_cmd {
        Some(cmd) => println!("  config.compile_cmd = {cmd}"),
        None => println!("  config.compile_cmd = (copy source)"),
    }
    println!("  config.preload = {}", cfg.config.preload);
    println!("  config.privilege_control = {}", cfg.config.privilege_control);
    println!();

    let units: Vec<_> = cfg.units().collect();
    println!("units ({}):", units.len());
    for (id, unit) in units {
        println!("  - {id}: {}", unit.path.display());
        if let Some(options) = cfg.run_options(id) {
            println!(
                "      role: {}, if_running: {}, privilege: {}",
                options.role, options.conflict_policy, options.privilege
            );
        }
        print_refs("compile_with", &unit.compile_with);
        print_refs("libraries", &unit.libraries);
        if !unit.references.is_empty() {
            println!("      references: {:?}", unit.references);
        }
    }

    let projects: Vec<_> = cfg.projects().collect();
    if !projects.is_empty() {
        println!();
        println!("projects ({}):", projects.len());
        for (name, project) in projects {
            println!("  - {name}: main {} members {:?}", project.main, ids(&project.members));
        }
    }

    debug!("dry-run complete (no execution)");
}

fn print_refs(label: &str, refs: &[types::SourceUnitId]) {
    if !refs.is_empty() {
        println!("      {label}: {:?}", ids(refs));
    }
}

fn ids(refs: &[types::SourceUnitId]) -> Vec<u32> {
    refs.iter().map(|id| id.get()).collect()
}
