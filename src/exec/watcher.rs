// src/exec/watcher.rs

//! One background wait per running process.
//!
//! The watcher owns the process handle. It never touches scheduler state:
//! the exit is reported as a single `TaskExited` event on the runtime
//! channel.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::engine::{RuntimeEvent, TaskId};

use super::process::TaskProcess;

/// Scheduler-side handle to a watched process.
#[derive(Debug)]
pub struct WatchHandle {
    kill_tx: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<Option<i32>>,
}

impl WatchHandle {
    pub fn is_running(&self) -> bool {
        self.exited.borrow().is_none()
    }

    /// Request termination without waiting.
    pub fn request_kill(&self) {
        // A closed channel means the watcher already saw the exit.
        let _ = self.kill_tx.send(());
    }

    /// Request termination and wait up to `timeout` for the exit.
    ///
    /// Returns `true` if the process is gone, including when it exited on its
    /// own in the meantime.
    pub async fn terminate(&mut self, timeout: Duration) -> bool {
        if self.kill_tx.send(()).is_err() {
            return true;
        }
        match tokio::time::timeout(timeout, self.exited.wait_for(Option::is_some)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

/// Watch `process` until it exits, posting exactly one
/// `RuntimeEvent::TaskExited` for `task_id`.
pub fn watch(
    task_id: TaskId,
    mut process: Box<dyn TaskProcess>,
    events: mpsc::Sender<RuntimeEvent>,
) -> WatchHandle {
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    let (exit_tx, exited) = watch::channel::<Option<i32>>(None);
    let pid = process.id();

    tokio::spawn(async move {
        let mut kill_open = true;

        let exit_code = loop {
            tokio::select! {
                res = process.wait() => {
                    break match res {
                        Ok(code) => code,
                        Err(err) => {
                            warn!(task_id, pid, error = %err, "waiting for process failed");
                            -1
                        }
                    };
                }

                req = kill_rx.recv(), if kill_open => {
                    match req {
                        Some(()) => {
                            info!(task_id, pid, "terminating process");
                            if let Err(err) = process.start_kill() {
                                debug!(task_id, pid, error = %err, "kill request failed; process may be gone");
                            }
                        }
                        None => kill_open = false,
                    }
                }
            }
        };

        debug!(task_id, pid, exit_code, "process exited");
        let _ = exit_tx.send(Some(exit_code));

        if events
            .send(RuntimeEvent::TaskExited { task_id, exit_code })
            .await
            .is_err()
        {
            debug!(task_id, "runtime gone; exit notification dropped");
        }
    });

    WatchHandle { kill_tx, exited }
}
