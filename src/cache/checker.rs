// src/cache/checker.rs

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use blake3::Hasher;
use tracing::debug;

use crate::cache::record::{CacheRecord, DependencyRef};
use crate::cache::store::FingerprintStore;
use crate::compile::CompiledUnit;
use crate::fs::FileSystem;
use crate::types::SourceUnitId;
use crate::workspace::Workspace;

/// Why a unit must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NotInWorkspace,
    NoRecord,
    ArtifactMissing(PathBuf),
    DependencyMissing(PathBuf),
    DependencyNewer(PathBuf),
    /// A recorded dependency id the workspace no longer knows.
    UnknownDependency(SourceUnitId),
    /// Project membership changed, or the unit became (or stopped being)
    /// part of a project.
    ProjectChanged,
    LibraryStale {
        library: SourceUnitId,
        reason: Box<StaleReason>,
    },
    /// A library reference leads back to a unit already being checked.
    LibraryCycle(SourceUnitId),
    /// The recorded options or dependencies differ from the current config.
    ConfigChanged,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NotInWorkspace => f.write_str("not part of the workspace"),
            StaleReason::NoRecord => f.write_str("never compiled"),
            StaleReason::ArtifactMissing(p) => write!(f, "artifact {} is missing", p.display()),
            StaleReason::DependencyMissing(p) => write!(f, "dependency {} is missing", p.display()),
            StaleReason::DependencyNewer(p) => {
                write!(f, "{} is newer than the artifact", p.display())
            }
            StaleReason::UnknownDependency(id) => write!(f, "dependency unit {id} no longer exists"),
            StaleReason::ProjectChanged => f.write_str("project membership changed"),
            StaleReason::LibraryStale { library, reason } => {
                write!(f, "library {library} is stale: {reason}")
            }
            StaleReason::LibraryCycle(id) => write!(f, "library reference cycle through unit {id}"),
            StaleReason::ConfigChanged => f.write_str("unit configuration changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheVerdict {
    UpToDate(CompiledUnit),
    Stale(StaleReason),
}

impl CacheVerdict {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, CacheVerdict::UpToDate(_))
    }
}

/// Hash over a project's member ids; independent of member order.
pub fn project_members_hash(members: impl IntoIterator<Item = SourceUnitId>) -> String {
    let mut ids: Vec<u32> = members.into_iter().map(SourceUnitId::get).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Hasher::new();
    for id in ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Decides whether a unit's last artifact can be reused.
///
/// Only stats files; never writes. Any doubt means stale.
pub struct CacheChecker<'a> {
    store: &'a FingerprintStore,
    workspace: &'a dyn Workspace,
    fs: &'a dyn FileSystem,
}

impl<'a> CacheChecker<'a> {
    pub fn new(
        store: &'a FingerprintStore,
        workspace: &'a dyn Workspace,
        fs: &'a dyn FileSystem,
    ) -> Self {
        Self {
            store,
            workspace,
            fs,
        }
    }

    pub fn check(&self, unit: SourceUnitId) -> CacheVerdict {
        let mut visiting = vec![unit];
        match self.check_unit(unit, &mut visiting) {
            Ok(compiled) => {
                debug!(unit = %unit, artifact = %compiled.artifact.display(), "cache is up to date");
                CacheVerdict::UpToDate(compiled)
            }
            Err(reason) => {
                debug!(unit = %unit, %reason, "cache is stale");
                CacheVerdict::Stale(reason)
            }
        }
    }

    fn check_unit(
        &self,
        unit: SourceUnitId,
        visiting: &mut Vec<SourceUnitId>,
    ) -> Result<CompiledUnit, StaleReason> {
        let source = self
            .workspace
            .file_path(unit)
            .ok_or(StaleReason::NotInWorkspace)?;
        let record = self.store.get(unit).ok_or(StaleReason::NoRecord)?;

        let artifact = self.store.resolve_artifact(unit, record);
        let built = self
            .fs
            .modified(&artifact)
            .map_err(|_| StaleReason::ArtifactMissing(artifact.clone()))?;

        self.not_newer(&source, built)?;
        self.check_dependencies(unit, record, built, visiting)?;
        self.check_project(unit, record, built)?;

        Ok(CompiledUnit {
            unit,
            name: self.workspace.display_name(unit),
            artifact,
            options: record.options,
        })
    }

    fn check_dependencies(
        &self,
        unit: SourceUnitId,
        record: &CacheRecord,
        built: SystemTime,
        visiting: &mut Vec<SourceUnitId>,
    ) -> Result<(), StaleReason> {
        for dep in &record.dependencies {
            match dep {
                DependencyRef::External(path) => {
                    let path = if path.is_absolute() {
                        path.clone()
                    } else {
                        self.workspace.root().join(path)
                    };
                    self.not_newer(&path, built)?;
                }
                DependencyRef::Library(lib) => {
                    self.check_library(unit, *lib, built, visiting)?;
                }
                other => {
                    let Some(id) = other.unit() else { continue };
                    let path = self
                        .workspace
                        .file_path(id)
                        .ok_or(StaleReason::UnknownDependency(id))?;
                    self.not_newer(&path, built)?;
                }
            }
        }
        Ok(())
    }

    /// A library is checked as a unit of its own (as its project's main
    /// unit when it belongs to a project); its artifact must not be newer
    /// than ours.
    fn check_library(
        &self,
        unit: SourceUnitId,
        lib: SourceUnitId,
        built: SystemTime,
        visiting: &mut Vec<SourceUnitId>,
    ) -> Result<(), StaleReason> {
        if !self.workspace.contains(lib) {
            return Err(StaleReason::UnknownDependency(lib));
        }
        let target = self
            .workspace
            .project_of(lib)
            .map(|p| p.main)
            .unwrap_or(lib);
        if target == unit || visiting.contains(&target) {
            return Err(StaleReason::LibraryCycle(target));
        }

        visiting.push(target);
        let result = self.check_unit(target, visiting);
        visiting.pop();

        let compiled = result.map_err(|reason| StaleReason::LibraryStale {
            library: target,
            reason: Box::new(reason),
        })?;
        self.not_newer(&compiled.artifact, built)
    }

    fn check_project(
        &self,
        unit: SourceUnitId,
        record: &CacheRecord,
        built: SystemTime,
    ) -> Result<(), StaleReason> {
        let project = self.workspace.project_of(unit);
        let current = project.as_ref().map(|p| project_members_hash(p.all_units()));
        if current != record.project_hash {
            return Err(StaleReason::ProjectChanged);
        }

        if let Some(project) = project {
            for member in project.all_units().filter(|id| *id != unit) {
                let path = self
                    .workspace
                    .file_path(member)
                    .ok_or(StaleReason::UnknownDependency(member))?;
                self.not_newer(&path, built)?;
            }
        }
        Ok(())
    }

    fn not_newer(&self, path: &Path, built: SystemTime) -> Result<(), StaleReason> {
        let modified = self
            .fs
            .modified(path)
            .map_err(|_| StaleReason::DependencyMissing(path.to_path_buf()))?;
        if modified > built {
            return Err(StaleReason::DependencyNewer(path.to_path_buf()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_hash_ignores_member_order() {
        let a = project_members_hash([SourceUnitId(3), SourceUnitId(1), SourceUnitId(2)]);
        let b = project_members_hash([SourceUnitId(1), SourceUnitId(2), SourceUnitId(3)]);
        let c = project_members_hash([SourceUnitId(1), SourceUnitId(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
