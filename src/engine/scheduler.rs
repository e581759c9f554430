// src/engine/scheduler.rs

//! Task scheduler: owns the running tasks, the waiting queue and the
//! preloaded helper pool.
//!
//! Only the runtime loop calls into the scheduler, one event at a time.
//! Process exits arrive as `TaskExited` events from the watchers; nothing
//! here is shared with another thread.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::compile::CompiledUnit;
use crate::errors::{LaunchStep, Result, TaskhostError};
use crate::exec::helper::task_env;
use crate::exec::{
    HandoffMessage, IntegrityLevel, PreloadedPool, ProcessLauncher, SpawnRequest, TaskProcess,
    Transition, WatchHandle, resolve_transition, watch,
};
use crate::types::{ConflictPolicy, LaunchFlags, LaunchOutcome, Role, SourceUnitId};

use super::policy::{self, Resolution};
use super::queue::{WaitQueue, WaitingTask};
use super::{RuntimeEvent, TaskId};

/// Host-wide scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workspace_root: PathBuf,
    pub host_pid: u32,
    pub host_level: IntegrityLevel,
    pub privilege_control: bool,
    /// Upper bound for an instance to exit after being asked to.
    pub terminate_timeout: Duration,
}

/// A compiled unit ready to be started.
#[derive(Debug)]
pub struct StartRequest {
    pub compiled: CompiledUnit,
    pub args: Vec<String>,
    pub interactive: bool,
    pub allow_defer: bool,
    /// Skip the conflict policy check (promoted waiting runs).
    pub ignore_policy: bool,
    pub result_pipe: Option<String>,
}

impl StartRequest {
    pub fn new(compiled: CompiledUnit) -> Self {
        Self {
            compiled,
            args: Vec::new(),
            interactive: true,
            allow_defer: true,
            ignore_policy: false,
            result_pipe: None,
        }
    }

    fn policy(&self) -> ConflictPolicy {
        self.compiled.options.conflict_policy
    }
}

/// A started task.
#[derive(Debug)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub unit: SourceUnitId,
    pub pid: u32,
    pub policy: ConflictPolicy,
    handle: WatchHandle,
}

impl RunningTask {
    pub fn is_alive(&self) -> bool {
        self.handle.is_running()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    /// Most recently started first.
    running: Vec<RunningTask>,
    waiting: WaitQueue,
    /// Tasks removed on confirmed termination whose exit event is still in
    /// flight.
    ended: HashSet<TaskId>,
    pool: PreloadedPool,
    launcher: Arc<dyn ProcessLauncher>,
    events: mpsc::Sender<RuntimeEvent>,
    next_task_id: TaskId,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running)
            .field("waiting", &self.waiting.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: PreloadedPool,
        launcher: Arc<dyn ProcessLauncher>,
        events: mpsc::Sender<RuntimeEvent>,
    ) -> Self {
        Self {
            config,
            running: Vec::new(),
            waiting: WaitQueue::new(),
            ended: HashSet::new(),
            pool,
            launcher,
            events,
            next_task_id: 1,
        }
    }

    /// Start a compiled unit, applying its conflict policy.
    pub async fn start(&mut self, request: StartRequest) -> LaunchOutcome {
        let unit = request.compiled.unit;
        let policy = request.policy();
        let mut restarted = false;

        loop {
            if request.ignore_policy
                || policy::can_run_now(policy, request.interactive, self.is_running(unit))
            {
                return self.launch(request).await;
            }

            match policy::resolve(policy, request.interactive, request.allow_defer) {
                Resolution::Cancel => {
                    debug!(unit = %unit, %policy, "already running; run cancelled");
                    return LaunchOutcome::NotStarted;
                }
                Resolution::Defer => {
                    info!(unit = %unit, "already running; run deferred until it exits");
                    self.waiting.push(WaitingTask { request });
                    return LaunchOutcome::Deferred;
                }
                Resolution::Warn => {
                    warn!(unit = %unit, name = %request.compiled.name, "already running");
                    return LaunchOutcome::NotStarted;
                }
                Resolution::End => {
                    self.end_tasks_of(unit).await;
                    return LaunchOutcome::NotStarted;
                }
                Resolution::Restart if restarted => {
                    error!(unit = %unit, "still running after restart; not started");
                    return LaunchOutcome::NotStarted;
                }
                Resolution::Restart => {
                    if !self.end_tasks_of(unit).await {
                        error!(
                            unit = %unit,
                            timeout_ms = self.config.terminate_timeout.as_millis() as u64,
                            "running instance did not exit; not restarted"
                        );
                        return LaunchOutcome::NotStarted;
                    }
                    restarted = true;
                }
            }
        }
    }

    /// Create the process for `request` and start watching it. Failures are
    /// reported here, once.
    async fn launch(&mut self, request: StartRequest) -> LaunchOutcome {
        let unit = request.compiled.unit;
        match self.create_process(&request).await {
            Ok(process) => {
                let task_id = self.next_task_id;
                self.next_task_id += 1;
                let pid = process.id();
                let handle = watch(task_id, process, self.events.clone());

                info!(unit = %unit, task_id, pid, name = %request.compiled.name, "task started");
                self.running.insert(
                    0,
                    RunningTask {
                        task_id,
                        unit,
                        pid,
                        policy: request.policy(),
                        handle,
                    },
                );
                LaunchOutcome::Started(pid)
            }
            Err(err) => {
                error!(unit = %unit, "{err}");
                LaunchOutcome::NotStarted
            }
        }
    }

    async fn create_process(&mut self, request: &StartRequest) -> Result<Box<dyn TaskProcess>> {
        let compiled = &request.compiled;
        let options = compiled.options;

        let (transition, level) = resolve_transition(
            self.config.host_level,
            options.privilege,
            self.config.privilege_control,
        )?;

        let mut flags = options.flags;
        flags.set(LaunchFlags::INTERACTIVE, request.interactive);
        flags.set(LaunchFlags::CAPTURE_OUTPUT, request.result_pipe.is_some());

        let message = HandoffMessage {
            artifact_name: compiled.name.clone(),
            artifact_path: compiled.artifact.clone(),
            flags,
            args: request.args.clone(),
            result_pipe: request.result_pipe.clone(),
            workspace_root: self.config.workspace_root.clone(),
            unit: compiled.unit,
            caller_pid: self.config.host_pid,
            caller_channel: 0,
        };

        match options.role {
            Role::Library => Err(TaskhostError::launch(
                compiled.unit,
                LaunchStep::Spawn,
                "libraries cannot be run",
            )),
            Role::Executable => {
                let mut spawn = SpawnRequest::new(&compiled.artifact, transition).args(request.args.clone());
                spawn.env = task_env(&message);
                spawn.current_dir = Some(self.config.workspace_root.clone());
                self.launcher
                    .spawn(&spawn)
                    .map_err(|e| TaskhostError::launch(compiled.unit, LaunchStep::Spawn, e))
            }
            Role::Script if flags.contains(LaunchFlags::PRELOADED) && transition != Transition::Elevate => {
                self.pool.launch_pooled(level, transition, &message).await
            }
            Role::Script => self.pool.launch_oneshot(transition, &message).await,
        }
    }

    /// Handle a `TaskExited` event: drop the task and start the next waiting
    /// run that can start.
    pub async fn on_process_exited(&mut self, task_id: TaskId, exit_code: i32) {
        if let Some(pos) = self.running.iter().position(|t| t.task_id == task_id) {
            let task = self.running.remove(pos);
            info!(unit = %task.unit, task_id, pid = task.pid, exit_code, "task exited");
        } else if self.ended.remove(&task_id) {
            debug!(task_id, exit_code, "ended task exited");
        } else {
            debug!(task_id, exit_code, "exit of unknown task ignored");
            return;
        }

        self.promote_waiting().await;
    }

    /// Start the first eligible waiting run. A run that fails to start is
    /// dropped and the next eligible one is tried.
    async fn promote_waiting(&mut self) {
        loop {
            let running = &self.running;
            let next = self.waiting.take_first_eligible(|w| {
                policy::can_run_now(
                    w.request.policy(),
                    w.request.interactive,
                    running.iter().any(|t| t.unit == w.unit()),
                )
            });

            let Some(WaitingTask { mut request }) = next else {
                break;
            };
            debug!(unit = %request.compiled.unit, remaining = self.waiting.len(), "promoting waiting run");
            request.ignore_policy = true;
            if self.launch(request).await.is_started() {
                break;
            }
        }
    }

    /// Terminate every instance of `unit`. Returns `false` if one of them is
    /// still alive after the terminate timeout.
    pub async fn end_tasks_of(&mut self, unit: SourceUnitId) -> bool {
        let ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|t| t.unit == unit)
            .map(|t| t.task_id)
            .collect();

        let mut all_gone = true;
        for id in ids {
            all_gone &= self.end_task(id).await;
        }
        all_gone
    }

    /// Terminate one task, waiting up to the terminate timeout.
    pub async fn end_task(&mut self, task_id: TaskId) -> bool {
        let Some(pos) = self.running.iter().position(|t| t.task_id == task_id) else {
            return true;
        };

        let timeout = self.config.terminate_timeout;
        if !self.running[pos].handle.terminate(timeout).await {
            warn!(task_id, pid = self.running[pos].pid, "task did not exit in time");
            return false;
        }

        let task = self.running.remove(pos);
        self.ended.insert(task.task_id);
        info!(unit = %task.unit, task_id, pid = task.pid, "task ended");
        true
    }

    /// Drop the waiting runs of `unit`.
    pub fn cancel_waiting(&mut self, unit: SourceUnitId) -> usize {
        let n = self.waiting.cancel_unit(unit);
        if n > 0 {
            info!(unit = %unit, cancelled = n, "cancelled waiting runs");
        }
        n
    }

    pub fn is_running(&self, unit: SourceUnitId) -> bool {
        self.running.iter().any(|t| t.unit == unit)
    }

    pub fn unit_of_process(&self, pid: u32) -> Option<SourceUnitId> {
        self.running.iter().find(|t| t.pid == pid).map(|t| t.unit)
    }

    /// Running tasks, most recently started first.
    pub fn running_tasks(&self) -> impl Iterator<Item = &RunningTask> {
        self.running.iter()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn pool(&self) -> &PreloadedPool {
        &self.pool
    }

    /// Preloaded helpers belong to the old display; discard them.
    pub fn on_display_changed(&mut self) {
        info!("display changed; discarding preloaded helpers");
        self.pool.teardown();
    }

    /// Ask every task to terminate without waiting, drop waiting runs and
    /// tear down the pool.
    pub fn shutdown(&mut self) {
        for task in &self.running {
            task.handle.request_kill();
        }
        let dropped = self.waiting.clear();
        info!(running = self.running.len(), dropped, "scheduler shut down");
        self.pool.teardown();
    }

    /// Nothing runs and nothing waits.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.waiting.is_empty()
    }
}
