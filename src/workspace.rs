// src/workspace.rs

//! The workspace model: which files exist, where they live and how they are
//! grouped into projects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ConfigFile;
use crate::types::SourceUnitId;

/// A multi-file project: the main unit plus the other member files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub main: SourceUnitId,
    pub members: Vec<SourceUnitId>,
}

impl Project {
    /// Main unit first, then members.
    pub fn all_units(&self) -> impl Iterator<Item = SourceUnitId> + '_ {
        std::iter::once(self.main).chain(self.members.iter().copied())
    }
}

/// Read-only view of the workspace. Ids are assigned here, never invented by
/// the cache or the scheduler.
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;

    /// Absolute path of a unit's source file.
    fn file_path(&self, id: SourceUnitId) -> Option<PathBuf>;

    fn contains(&self, id: SourceUnitId) -> bool {
        self.file_path(id).is_some()
    }

    /// The project `id` belongs to (as main or member), if any.
    fn project_of(&self, id: SourceUnitId) -> Option<Project>;

    /// Short human-readable name used in reports and as artifact name.
    fn display_name(&self, id: SourceUnitId) -> String {
        self.file_path(id)
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| format!("unit {id}"))
    }
}

/// Workspace built from the `[unit.*]` and `[project.*]` config sections.
#[derive(Debug, Clone)]
pub struct ConfigWorkspace {
    root: PathBuf,
    files: BTreeMap<SourceUnitId, PathBuf>,
    projects: Vec<Project>,
}

impl ConfigWorkspace {
    pub fn from_config(cfg: &ConfigFile, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let files = cfg
            .units()
            .map(|(id, unit)| (id, root.join(&unit.path)))
            .collect();
        let projects = cfg
            .projects()
            .map(|(_, p)| Project {
                main: p.main,
                members: p.members.clone(),
            })
            .collect();

        Self {
            root,
            files,
            projects,
        }
    }
}

impl Workspace for ConfigWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, id: SourceUnitId) -> Option<PathBuf> {
        self.files.get(&id).cloned()
    }

    fn project_of(&self, id: SourceUnitId) -> Option<Project> {
        self.projects
            .iter()
            .find(|p| p.main == id || p.members.contains(&id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, RawConfigFile, UnitConfig};

    #[test]
    fn members_resolve_to_their_project() {
        let mut raw = RawConfigFile {
            config: Default::default(),
            unit: BTreeMap::new(),
            project: BTreeMap::new(),
        };
        raw.unit.insert("1".into(), UnitConfig::new("app/main.sh"));
        raw.unit.insert("2".into(), UnitConfig::new("app/util.sh"));
        raw.unit.insert("3".into(), UnitConfig::new("solo.sh"));
        raw.project.insert(
            "app".into(),
            ProjectConfig {
                main: SourceUnitId(1),
                members: vec![SourceUnitId(2)],
            },
        );
        let cfg = ConfigFile::try_from(raw).unwrap();
        let ws = ConfigWorkspace::from_config(&cfg, "/ws");

        assert_eq!(ws.project_of(SourceUnitId(2)).map(|p| p.main), Some(SourceUnitId(1)));
        assert!(ws.project_of(SourceUnitId(3)).is_none());
        assert_eq!(ws.file_path(SourceUnitId(3)), Some(PathBuf::from("/ws/solo.sh")));
        assert_eq!(ws.display_name(SourceUnitId(1)), "main");
        assert!(!ws.contains(SourceUnitId(9)));
    }
}
