// src/engine/host.rs

//! Check-or-compile in front of the scheduler.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::{CacheChecker, CacheVerdict, FingerprintStore, StaleReason};
use crate::compile::{CompileJob, CompileStep, CompiledUnit};
use crate::config::ConfigFile;
use crate::errors::{Result, TaskhostError};
use crate::fs::FileSystem;
use crate::types::{LaunchOutcome, Role, SourceUnitId};
use crate::workspace::Workspace;

use super::RunRequest;
use super::scheduler::{Scheduler, StartRequest};

/// One workspace's host: config, fingerprint store, compiler and scheduler.
pub struct TaskHost {
    config: Arc<ConfigFile>,
    workspace: Arc<dyn Workspace>,
    fs: Arc<dyn FileSystem>,
    store: FingerprintStore,
    compiler: Box<dyn CompileStep>,
    scheduler: Scheduler,
}

impl TaskHost {
    pub fn new(
        config: Arc<ConfigFile>,
        workspace: Arc<dyn Workspace>,
        fs: Arc<dyn FileSystem>,
        store: FingerprintStore,
        compiler: Box<dyn CompileStep>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            config,
            workspace,
            fs,
            store,
            compiler,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Run a unit: resolve its project, reuse or rebuild the artifact, then
    /// hand it to the scheduler. Every failure is reported here.
    pub async fn run_unit(&mut self, request: RunRequest) -> LaunchOutcome {
        let target = self
            .workspace
            .project_of(request.unit)
            .map(|p| p.main)
            .unwrap_or(request.unit);
        if target != request.unit {
            debug!(unit = %request.unit, main = %target, "running project main unit");
        }

        let Some(options) = self.config.run_options(target) else {
            error!(unit = %target, "unit is not part of the workspace");
            return LaunchOutcome::NotStarted;
        };
        if options.role == Role::Library {
            error!(unit = %target, "unit is a library and cannot be run");
            return LaunchOutcome::NotStarted;
        }

        let mut compiled = match self.compile_if_needed(target).await {
            Ok(compiled) => compiled,
            Err(err) => {
                error!(unit = %target, "{err}");
                return LaunchOutcome::NotStarted;
            }
        };
        if let Some(policy) = request.policy_override {
            compiled.options.conflict_policy = policy;
        }

        self.scheduler
            .start(StartRequest {
                compiled,
                args: request.args,
                interactive: request.interactive,
                allow_defer: request.allow_defer,
                ignore_policy: false,
                result_pipe: request.result_pipe,
            })
            .await
    }

    /// Whether `unit`'s artifact can be reused as is. Never writes.
    pub fn check(&self, unit: SourceUnitId) -> Result<CacheVerdict> {
        let job = CompileJob::plan(&self.config, self.workspace.as_ref(), &self.store, unit)?;
        Ok(self.verdict(&job))
    }

    fn verdict(&self, job: &CompileJob) -> CacheVerdict {
        let verdict = CacheChecker::new(&self.store, self.workspace.as_ref(), self.fs.as_ref()).check(job.unit);
        match verdict {
            CacheVerdict::UpToDate(_) if self.store.get(job.unit) != Some(&job.expected_record()) => {
                CacheVerdict::Stale(StaleReason::ConfigChanged)
            }
            other => other,
        }
    }

    /// Return the cached artifact, compiling first when it is stale.
    pub async fn compile_if_needed(&mut self, unit: SourceUnitId) -> Result<CompiledUnit> {
        let job = CompileJob::plan(&self.config, self.workspace.as_ref(), &self.store, unit)?;

        let reason = match self.verdict(&job) {
            CacheVerdict::UpToDate(compiled) => return Ok(compiled),
            CacheVerdict::Stale(reason) => reason,
        };

        info!(unit = %unit, name = %job.name, %reason, "compiling");
        let output = self.compiler.compile(&job).await?;
        if let Err(err) = self.store.put(unit, output.to_record()) {
            warn!(unit = %unit, error = %err, "could not persist fingerprint; next run recompiles");
        }
        Ok(output.compiled_unit(&job))
    }

    /// Forget `unit`'s cache record, optionally deleting its artifact.
    pub fn forget(&mut self, unit: SourceUnitId, delete_artifact: bool) -> Result<bool> {
        if self.config.unit(unit).is_none() && self.store.get(unit).is_none() {
            return Err(TaskhostError::UnknownUnit(unit));
        }
        Ok(self.store.remove(unit, delete_artifact)?)
    }
}
