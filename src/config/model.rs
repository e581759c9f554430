// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{
    ConflictPolicy, LaunchFlags, Platform, PrivilegeRequirement, Role, RunOptions, SourceUnitId,
};

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// cache_dir = ".compiled"
/// compile_cmd = "cc {source} -o {output}"
///
/// [unit.1]
/// path = "tools/hello.c"
/// role = "executable"
/// if_running = "wait"
///
/// [project.app]
/// main = 1
/// members = [2, 3]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Units keyed by their id (`[unit.<id>]`).
    #[serde(default)]
    pub unit: BTreeMap<String, UnitConfig>,

    /// Multi-file projects keyed by name (`[project.<name>]`).
    #[serde(default)]
    pub project: BTreeMap<String, ProjectConfig>,
}

/// Validated configuration. Only constructed through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    units: BTreeMap<SourceUnitId, UnitConfig>,
    projects: BTreeMap<String, ProjectConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        units: BTreeMap<SourceUnitId, UnitConfig>,
        projects: BTreeMap<String, ProjectConfig>,
    ) -> Self {
        Self {
            config,
            units,
            projects,
        }
    }

    pub fn units(&self) -> impl Iterator<Item = (SourceUnitId, &UnitConfig)> {
        self.units.iter().map(|(id, unit)| (*id, unit))
    }

    pub fn unit(&self, id: SourceUnitId) -> Option<&UnitConfig> {
        self.units.get(&id)
    }

    pub fn projects(&self) -> impl Iterator<Item = (&str, &ProjectConfig)> {
        self.projects.iter().map(|(name, p)| (name.as_str(), p))
    }

    /// Run options of a unit, with `preloaded` falling back to
    /// `[config].preload`.
    pub fn run_options(&self, id: SourceUnitId) -> Option<RunOptions> {
        let unit = self.units.get(&id)?;
        let mut flags = LaunchFlags::empty();
        if unit.preloaded.unwrap_or(self.config.preload) {
            flags |= LaunchFlags::PRELOADED;
        }
        Some(RunOptions {
            role: unit.role,
            conflict_policy: unit.if_running,
            privilege: unit.privilege,
            platform: unit.platform,
            flags,
        })
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Directory (relative to the workspace root) holding the fingerprint
    /// store and convention-named artifacts.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Shell command template that compiles one unit.
    ///
    /// Placeholders: `{source}`, `{output}`, `{unit}`, `{root}`. When unset,
    /// compiling copies the source file to the artifact path.
    #[serde(default)]
    pub compile_cmd: Option<String>,

    /// Directory for pipe endpoints on unix. Defaults to the system temp dir.
    #[serde(default)]
    pub pipe_dir: Option<PathBuf>,

    /// Keep idle helper processes warm for units that allow it.
    #[serde(default = "default_true")]
    pub preload: bool,

    /// Bounded wait after a termination request.
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,

    /// When false, every unit starts at the host's own level.
    #[serde(default = "default_true")]
    pub privilege_control: bool,

    /// Program (plus leading args) used to request elevation.
    #[serde(default = "default_elevate_cmd")]
    pub elevate_cmd: Vec<String>,
}

impl ConfigSection {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".compiled")
}

fn default_true() -> bool {
    true
}

fn default_terminate_timeout_ms() -> u64 {
    500
}

fn default_elevate_cmd() -> Vec<String> {
    vec!["sudo".to_string()]
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            compile_cmd: None,
            pipe_dir: None,
            preload: true,
            terminate_timeout_ms: default_terminate_timeout_ms(),
            privilege_control: true,
            elevate_cmd: default_elevate_cmd(),
        }
    }
}

/// `[unit.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    /// Source file, relative to the workspace root.
    pub path: PathBuf,

    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub if_running: ConflictPolicy,

    #[serde(default)]
    pub privilege: PrivilegeRequirement,

    #[serde(default)]
    pub platform: Platform,

    /// Whether the unit may use the preloaded helper pool; falls back to
    /// `[config].preload`.
    #[serde(default)]
    pub preloaded: Option<bool>,

    /// Explicit artifact path; otherwise the artifact lives in the cache dir.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Units compiled together with this one.
    #[serde(default)]
    pub compile_with: Vec<SourceUnitId>,

    /// Library units referenced by this one.
    #[serde(default)]
    pub libraries: Vec<SourceUnitId>,

    #[serde(default)]
    pub resources: Vec<SourceUnitId>,

    #[serde(default)]
    pub files: Vec<SourceUnitId>,

    #[serde(default)]
    pub icon: Option<SourceUnitId>,

    #[serde(default)]
    pub manifest: Option<SourceUnitId>,

    #[serde(default)]
    pub sign_key: Option<SourceUnitId>,

    /// External files (absolute, or relative to the workspace root).
    #[serde(default)]
    pub references: Vec<PathBuf>,
}

impl UnitConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: Role::default(),
            if_running: ConflictPolicy::default(),
            privilege: PrivilegeRequirement::default(),
            platform: Platform::default(),
            preloaded: None,
            output: None,
            compile_with: Vec::new(),
            libraries: Vec::new(),
            resources: Vec::new(),
            files: Vec::new(),
            icon: None,
            manifest: None,
            sign_key: None,
            references: Vec::new(),
        }
    }

    /// Every unit id this unit depends on, in declaration order.
    pub fn referenced_units(&self) -> impl Iterator<Item = SourceUnitId> + '_ {
        self.compile_with
            .iter()
            .chain(&self.libraries)
            .chain(&self.resources)
            .chain(&self.files)
            .chain(self.icon.iter())
            .chain(self.manifest.iter())
            .chain(self.sign_key.iter())
            .copied()
    }
}

/// `[project.<name>]` section: a main unit plus the other member files.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub main: SourceUnitId,
    #[serde(default)]
    pub members: Vec<SourceUnitId>,
}
