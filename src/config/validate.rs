// src/config/validate.rs

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::compile::{CommandTemplate, KNOWN_PLACEHOLDERS};
use crate::config::model::{ConfigFile, RawConfigFile, UnitConfig};
use crate::errors::{Result, TaskhostError};
use crate::types::SourceUnitId;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TaskhostError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let units = parse_unit_ids(&raw)?;
        validate_global_config(&raw)?;
        validate_unit_references(&units)?;
        validate_projects(&raw, &units)?;
        validate_library_graph(&units)?;
        Ok(ConfigFile::new_unchecked(raw.config, units, raw.project))
    }
}

fn parse_unit_ids(cfg: &RawConfigFile) -> Result<BTreeMap<SourceUnitId, UnitConfig>> {
    if cfg.unit.is_empty() {
        return Err(TaskhostError::ConfigError(
            "config must contain at least one [unit.<id>] section".to_string(),
        ));
    }

    let mut units = BTreeMap::new();
    for (key, unit) in cfg.unit.iter() {
        let id: SourceUnitId = key
            .parse()
            .map_err(|e: String| TaskhostError::ConfigError(format!("[unit.{key}]: {e}")))?;
        if units.insert(id, unit.clone()).is_some() {
            return Err(TaskhostError::ConfigError(format!(
                "unit id {id} is declared more than once"
            )));
        }
    }
    Ok(units)
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.terminate_timeout_ms == 0 {
        return Err(TaskhostError::ConfigError(
            "[config].terminate_timeout_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.config.elevate_cmd.is_empty() {
        return Err(TaskhostError::ConfigError(
            "[config].elevate_cmd must name a program".to_string(),
        ));
    }

    if let Some(template) = &cfg.config.compile_cmd {
        let template = CommandTemplate::parse(template)?;
        for name in template.placeholders() {
            if !KNOWN_PLACEHOLDERS.contains(&name) {
                return Err(TaskhostError::ConfigError(format!(
                    "[config].compile_cmd uses unknown placeholder {{{name}}} (known: {})",
                    KNOWN_PLACEHOLDERS.join(", ")
                )));
            }
        }
    }

    Ok(())
}

fn validate_unit_references(units: &BTreeMap<SourceUnitId, UnitConfig>) -> Result<()> {
    for (id, unit) in units.iter() {
        for dep in unit.referenced_units() {
            if !units.contains_key(&dep) {
                return Err(TaskhostError::ConfigError(format!(
                    "unit {id} references unknown unit {dep}"
                )));
            }
            if dep == *id {
                return Err(TaskhostError::ConfigError(format!(
                    "unit {id} cannot reference itself"
                )));
            }
        }
    }
    Ok(())
}

fn validate_projects(
    cfg: &RawConfigFile,
    units: &BTreeMap<SourceUnitId, UnitConfig>,
) -> Result<()> {
    let mut owner: HashMap<SourceUnitId, &str> = HashMap::new();

    for (name, project) in cfg.project.iter() {
        if project.members.contains(&project.main) {
            return Err(TaskhostError::ConfigError(format!(
                "project '{name}' lists its main unit {} as a member",
                project.main
            )));
        }
        for id in std::iter::once(&project.main).chain(&project.members) {
            if !units.contains_key(id) {
                return Err(TaskhostError::ConfigError(format!(
                    "project '{name}' lists unknown unit {id}"
                )));
            }
            if let Some(other) = owner.insert(*id, name.as_str()) {
                return Err(TaskhostError::ConfigError(format!(
                    "unit {id} belongs to both project '{other}' and project '{name}'"
                )));
            }
        }
    }
    Ok(())
}

fn validate_library_graph(units: &BTreeMap<SourceUnitId, UnitConfig>) -> Result<()> {
    // Edge direction: library -> user.
    let mut graph: DiGraphMap<u32, ()> = DiGraphMap::new();

    for id in units.keys() {
        graph.add_node(id.get());
    }

    for (id, unit) in units.iter() {
        for lib in unit.libraries.iter() {
            graph.add_edge(lib.get(), id.get(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(TaskhostError::ConfigError(format!(
            "library references form a cycle involving unit {}",
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{ConfigSection, ProjectConfig};

    fn raw(units: Vec<(&str, UnitConfig)>) -> RawConfigFile {
        RawConfigFile {
            config: ConfigSection::default(),
            unit: units
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            project: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_non_numeric_unit_keys() {
        let err = ConfigFile::try_from(raw(vec![("main", UnitConfig::new("a.sh"))])).unwrap_err();
        assert!(err.to_string().contains("[unit.main]"));
    }

    #[test]
    fn rejects_library_cycles() {
        let mut a = UnitConfig::new("a.sh");
        a.libraries.push(SourceUnitId(2));
        let mut b = UnitConfig::new("b.sh");
        b.libraries.push(SourceUnitId(1));

        let err = ConfigFile::try_from(raw(vec![("1", a), ("2", b)])).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_unit_in_two_projects() {
        let mut cfg = raw(vec![
            ("1", UnitConfig::new("a.sh")),
            ("2", UnitConfig::new("b.sh")),
            ("3", UnitConfig::new("c.sh")),
        ]);
        cfg.project.insert(
            "one".into(),
            ProjectConfig {
                main: SourceUnitId(1),
                members: vec![SourceUnitId(3)],
            },
        );
        cfg.project.insert(
            "two".into(),
            ProjectConfig {
                main: SourceUnitId(2),
                members: vec![SourceUnitId(3)],
            },
        );

        let err = ConfigFile::try_from(cfg).unwrap_err();
        assert!(err.to_string().contains("belongs to both"));
    }

    #[test]
    fn rejects_unknown_compile_placeholder() {
        let mut cfg = raw(vec![("1", UnitConfig::new("a.c"))]);
        cfg.config.compile_cmd = Some("cc {source} -o {target}".into());

        let err = ConfigFile::try_from(cfg).unwrap_err();
        assert!(err.to_string().contains("{target}"));
    }
}
