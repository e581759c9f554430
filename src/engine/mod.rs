// src/engine/mod.rs

//! Orchestration engine for taskhost.
//!
//! This module ties together:
//! - the conflict policy applied when a unit is already running
//! - the FIFO of deferred runs
//! - the task scheduler that owns running tasks and the helper pool
//! - the host composing cache check, compile and scheduling
//! - the single-consumer runtime loop that reacts to:
//!   - run requests
//!   - process exits
//!   - display changes
//!   - shutdown signals

use tokio::sync::oneshot;

use crate::types::{ConflictPolicy, LaunchOutcome, SourceUnitId};

pub mod host;
pub mod policy;
pub mod queue;
pub mod runtime;
pub mod scheduler;

pub use host::TaskHost;
pub use policy::Resolution;
pub use queue::{WaitQueue, WaitingTask};
pub use runtime::Runtime;
pub use scheduler::{RunningTask, Scheduler, SchedulerConfig, StartRequest};

/// Identity of one started task, unique within a host.
pub type TaskId = u64;

/// A request to run a unit, as made by a caller.
#[derive(Debug)]
pub struct RunRequest {
    pub unit: SourceUnitId,
    pub args: Vec<String>,
    /// Started by a user rather than programmatically.
    pub interactive: bool,
    /// Whether a `wait` policy may queue the run.
    pub allow_defer: bool,
    /// Replaces the unit's configured conflict policy for this call.
    pub policy_override: Option<ConflictPolicy>,
    pub result_pipe: Option<String>,
}

impl RunRequest {
    /// Interactive run with defaults.
    pub fn new(unit: SourceUnitId) -> Self {
        Self {
            unit,
            args: Vec::new(),
            interactive: true,
            allow_defer: true,
            policy_override: None,
            result_pipe: None,
        }
    }
}

/// Options that influence how the runtime behaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Exit once nothing runs, nothing waits and no event is pending.
    pub exit_when_idle: bool,
    /// Exit once the pending events are handled, leaving started tasks
    /// running.
    pub detach: bool,
}

/// Events flowing into the runtime loop.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// Run a unit; the outcome is sent back on `reply` when present.
    RunRequested {
        request: RunRequest,
        reply: Option<oneshot::Sender<LaunchOutcome>>,
    },
    /// A watched process exited.
    TaskExited { task_id: TaskId, exit_code: i32 },
    /// The interactive display changed; preloaded helpers bound to the old
    /// one are discarded.
    DisplayChanged,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}
