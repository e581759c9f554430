use std::collections::BTreeMap;
use std::path::PathBuf;

use taskhost::config::{ConfigFile, ConfigSection, ProjectConfig, RawConfigFile, UnitConfig};
use taskhost::errors::Result;
use taskhost::types::{ConflictPolicy, PrivilegeRequirement, Role, SourceUnitId};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                unit: BTreeMap::new(),
                project: BTreeMap::new(),
            },
        }
    }

    pub fn with_unit(mut self, id: u32, unit: UnitConfig) -> Self {
        self.config.unit.insert(id.to_string(), unit);
        self
    }

    pub fn with_project(mut self, name: &str, main: u32, members: &[u32]) -> Self {
        self.config.project.insert(
            name.to_string(),
            ProjectConfig {
                main: SourceUnitId(main),
                members: members.iter().copied().map(SourceUnitId).collect(),
            },
        );
        self
    }

    pub fn compile_cmd(mut self, cmd: &str) -> Self {
        self.config.config.compile_cmd = Some(cmd.to_string());
        self
    }

    pub fn pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.config.pipe_dir = Some(dir.into());
        self
    }

    pub fn preload(mut self, val: bool) -> Self {
        self.config.config.preload = val;
        self
    }

    pub fn terminate_timeout_ms(mut self, ms: u64) -> Self {
        self.config.config.terminate_timeout_ms = ms;
        self
    }

    pub fn privilege_control(mut self, val: bool) -> Self {
        self.config.config.privilege_control = val;
        self
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `UnitConfig`.
pub struct UnitConfigBuilder {
    unit: UnitConfig,
}

impl UnitConfigBuilder {
    pub fn new(path: &str) -> Self {
        Self {
            unit: UnitConfig::new(path),
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.unit.role = role;
        self
    }

    pub fn if_running(mut self, policy: ConflictPolicy) -> Self {
        self.unit.if_running = policy;
        self
    }

    pub fn privilege(mut self, privilege: PrivilegeRequirement) -> Self {
        self.unit.privilege = privilege;
        self
    }

    pub fn preloaded(mut self, val: bool) -> Self {
        self.unit.preloaded = Some(val);
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.unit.output = Some(PathBuf::from(path));
        self
    }

    pub fn compile_with(mut self, id: u32) -> Self {
        self.unit.compile_with.push(SourceUnitId(id));
        self
    }

    pub fn library(mut self, id: u32) -> Self {
        self.unit.libraries.push(SourceUnitId(id));
        self
    }

    pub fn file(mut self, id: u32) -> Self {
        self.unit.files.push(SourceUnitId(id));
        self
    }

    pub fn reference(mut self, path: &str) -> Self {
        self.unit.references.push(PathBuf::from(path));
        self
    }

    pub fn build(self) -> UnitConfig {
        self.unit
    }
}
