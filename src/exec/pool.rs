// src/exec/pool.rs

//! Preloaded helper processes, one slot per privilege level.
//!
//! A slot owns a pipe endpoint and at most one idle helper connected (or
//! connecting) to it. Claiming hands the run parameters to that helper and
//! immediately starts a replacement on a blocking thread. The replacement is
//! delivered over a oneshot channel kept in the slot and received by the next
//! claim, so only the runtime loop ever takes a helper out of a slot.
//!
//! Discarding a slot closes that channel: a replacement already delivered is
//! killed on the spot, one still being started is killed by its blocking
//! thread once the send fails.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{LaunchStep, Result, TaskhostError};

use super::handoff::HandoffMessage;
use super::launcher::{ProcessLauncher, SpawnRequest};
use super::pipe::{ONESHOT_SLOT, PipeServer};
use super::privilege::{PrivilegeLevel, Transition};
use super::process::TaskProcess;

type SpawnResult = io::Result<Box<dyn TaskProcess>>;

/// Static pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory for socket files (unix).
    pub pipe_dir: PathBuf,
    pub host_pid: u32,
    /// Program started as helper, with `helper <endpoint>` as arguments.
    pub helper_program: PathBuf,
}

struct PreloadedSlot {
    transition: Transition,
    pipe: PipeServer,
    /// The idle helper, possibly still being started.
    idle: Option<oneshot::Receiver<SpawnResult>>,
}

impl PreloadedSlot {
    fn new(transition: Transition, pipe: PipeServer) -> Self {
        Self {
            transition,
            pipe,
            idle: None,
        }
    }

    /// Kill the idle helper, whether it is running yet or not.
    fn discard_idle(&mut self, level: PrivilegeLevel) {
        let Some(mut pending) = self.idle.take() else {
            return;
        };
        pending.close();
        if let Ok(Ok(mut helper)) = pending.try_recv() {
            debug!(slot = %level, pid = helper.id(), "killing idle helper");
            let _ = helper.start_kill();
        }
    }
}

/// Pool of preloaded helpers.
pub struct PreloadedPool {
    config: PoolConfig,
    launcher: Arc<dyn ProcessLauncher>,
    slots: BTreeMap<PrivilegeLevel, PreloadedSlot>,
    cold_starts: u64,
}

impl fmt::Debug for PreloadedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadedPool")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .field("cold_starts", &self.cold_starts)
            .finish_non_exhaustive()
    }
}

impl PreloadedPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            launcher,
            slots: BTreeMap::new(),
            cold_starts: 0,
        }
    }

    /// Number of helpers started synchronously because no idle one was
    /// available.
    pub fn cold_starts(&self) -> u64 {
        self.cold_starts
    }

    /// Whether `level` has an idle helper, running or being started.
    pub fn is_hot(&self, level: PrivilegeLevel) -> bool {
        self.slots.get(&level).is_some_and(|s| s.idle.is_some())
    }

    fn helper_request(&self, endpoint: String, transition: Transition) -> SpawnRequest {
        SpawnRequest::new(&self.config.helper_program, transition).args(["helper".to_string(), endpoint])
    }

    /// Hand `message` to the idle helper of `level` (cold-starting one if
    /// needed) and start its replacement. Returns the claimed process, which
    /// now runs the task.
    ///
    /// Any failure tears the slot down; the next claim starts from scratch.
    pub async fn launch_pooled(
        &mut self,
        level: PrivilegeLevel,
        transition: Transition,
        message: &HandoffMessage,
    ) -> Result<Box<dyn TaskProcess>> {
        let unit = message.unit;

        if self
            .slots
            .get(&level)
            .is_some_and(|s| s.transition != transition)
        {
            self.teardown_slot(level);
        }

        if !self.slots.contains_key(&level) {
            let pipe = PipeServer::create(&self.config.pipe_dir, self.config.host_pid, level.slot_index())
                .map_err(|e| TaskhostError::launch(unit, LaunchStep::Claim, e))?;
            debug!(slot = %level, endpoint = %pipe.endpoint(), "created preloaded slot");
            self.slots.insert(level, PreloadedSlot::new(transition, pipe));
        }

        let mut helper = match self.claim_idle(level).await {
            Some(helper) => helper,
            None => {
                let endpoint = match self.slots.get(&level) {
                    Some(slot) => slot.pipe.endpoint(),
                    None => {
                        return Err(TaskhostError::launch(unit, LaunchStep::Claim, "slot vanished"));
                    }
                };
                let request = self.helper_request(endpoint, transition);
                match self.launcher.spawn(&request) {
                    Ok(helper) => {
                        self.cold_starts += 1;
                        info!(slot = %level, pid = helper.id(), "cold-started helper");
                        helper
                    }
                    Err(err) => {
                        self.teardown_slot(level);
                        return Err(TaskhostError::launch(unit, LaunchStep::Spawn, err));
                    }
                }
            }
        };

        let handoff = match self.slots.get_mut(&level) {
            Some(slot) => slot.pipe.handoff(helper.as_mut(), message).await,
            None => return Err(TaskhostError::launch(unit, LaunchStep::Claim, "slot vanished")),
        };

        if let Err(err) = handoff {
            let _ = helper.start_kill();
            self.teardown_slot(level);
            return Err(TaskhostError::launch(unit, err.step(), err));
        }

        info!(slot = %level, pid = helper.id(), unit = %unit, "handed task to preloaded helper");
        self.replenish(level);
        Ok(helper)
    }

    /// Take the slot's idle helper, waiting for it if it is still being
    /// started. A dead helper is dropped together with the slot's pipe.
    async fn claim_idle(&mut self, level: PrivilegeLevel) -> Option<Box<dyn TaskProcess>> {
        let slot = self.slots.get_mut(&level)?;
        let pending = slot.idle.take()?;

        let mut helper = match pending.await {
            Ok(Ok(helper)) => helper,
            Ok(Err(err)) => {
                warn!(slot = %level, error = %err, "replacement helper failed to start");
                return None;
            }
            Err(_) => {
                warn!(slot = %level, "replacement helper task ended without a result");
                return None;
            }
        };

        match helper.try_wait() {
            Ok(None) => Some(helper),
            status => {
                debug!(slot = %level, pid = helper.id(), ?status, "idle helper is gone; rebuilding slot");
                let transition = slot.transition;
                self.teardown_slot(level);
                match PipeServer::create(&self.config.pipe_dir, self.config.host_pid, level.slot_index()) {
                    Ok(pipe) => {
                        self.slots.insert(level, PreloadedSlot::new(transition, pipe));
                    }
                    Err(err) => warn!(slot = %level, error = %err, "could not recreate slot pipe"),
                }
                None
            }
        }
    }

    /// Start a replacement helper for `level` in the background.
    fn replenish(&mut self, level: PrivilegeLevel) {
        let Some(slot) = self.slots.get(&level) else {
            return;
        };
        let request = self.helper_request(slot.pipe.endpoint(), slot.transition);
        let launcher = Arc::clone(&self.launcher);

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            if let Err(Ok(mut orphan)) = tx.send(launcher.spawn(&request)) {
                debug!(slot = %level, pid = orphan.id(), "slot discarded while starting; killing replacement");
                let _ = orphan.start_kill();
            }
        });
        if let Some(slot) = self.slots.get_mut(&level) {
            slot.idle = Some(rx);
        }
        debug!(slot = %level, "starting replacement helper");
    }

    /// Start a helper on a temporary pipe, hand it `message` and return it.
    /// Used for units that may not use the pool.
    pub async fn launch_oneshot(
        &mut self,
        transition: Transition,
        message: &HandoffMessage,
    ) -> Result<Box<dyn TaskProcess>> {
        let unit = message.unit;
        let mut pipe = PipeServer::create(&self.config.pipe_dir, self.config.host_pid, ONESHOT_SLOT)
            .map_err(|e| TaskhostError::launch(unit, LaunchStep::Spawn, e))?;

        let request = self.helper_request(pipe.endpoint(), transition);
        let mut helper = self
            .launcher
            .spawn(&request)
            .map_err(|e| TaskhostError::launch(unit, LaunchStep::Spawn, e))?;

        if let Err(err) = pipe.handoff(helper.as_mut(), message).await {
            let _ = helper.start_kill();
            return Err(TaskhostError::launch(unit, err.step(), err));
        }
        Ok(helper)
    }

    fn teardown_slot(&mut self, level: PrivilegeLevel) {
        if let Some(mut slot) = self.slots.remove(&level) {
            slot.discard_idle(level);
            debug!(slot = %level, "tore down preloaded slot");
        }
    }

    /// Kill all idle helpers and drop every slot.
    pub fn teardown(&mut self) {
        let levels: Vec<_> = self.slots.keys().copied().collect();
        if !levels.is_empty() {
            info!(?levels, "tearing down preloaded helpers");
        }
        for level in levels {
            self.teardown_slot(level);
        }
    }
}

impl Drop for PreloadedPool {
    fn drop(&mut self) {
        for (level, slot) in self.slots.iter_mut() {
            slot.discard_idle(*level);
        }
    }
}
