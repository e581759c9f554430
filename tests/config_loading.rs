mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use taskhost::config::load_and_validate;
use taskhost::errors::TaskhostError;
use taskhost::types::{ConflictPolicy, LaunchFlags, PrivilegeRequirement, Role, SourceUnitId};

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> Result<tempfile::NamedTempFile, Box<dyn Error>> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

#[test]
fn demo_workspace_config_loads() -> TestResult {
    init_tracing();

    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cfg = load_and_validate(manifest.join("demos/taskhost.toml"))?;

    assert_eq!(cfg.units().count(), 6);
    assert_eq!(cfg.config.terminate_timeout_ms, 750);
    assert_eq!(cfg.config.elevate_cmd, vec!["sudo".to_string(), "-n".to_string()]);

    let greet = cfg.run_options(SourceUnitId(1)).ok_or("unit 1 missing")?;
    assert_eq!(greet.role, Role::Script);
    assert_eq!(greet.conflict_policy, ConflictPolicy::WaitRestart);
    assert!(greet.flags.contains(LaunchFlags::PRELOADED));

    let backup = cfg.run_options(SourceUnitId(2)).ok_or("unit 2 missing")?;
    assert_eq!(backup.privilege, PrivilegeRequirement::Admin);

    let (name, project) = cfg.projects().next().ok_or("project missing")?;
    assert_eq!(name, "app");
    assert_eq!(project.main, SourceUnitId(10));

    Ok(())
}

#[test]
fn defaults_apply_to_a_minimal_config() -> TestResult {
    init_tracing();
    let file = write_config("[unit.7]\npath = \"hello.sh\"\n")?;

    let cfg = load_and_validate(file.path())?;
    let options = cfg.run_options(SourceUnitId(7)).ok_or("unit 7 missing")?;

    assert_eq!(options.role, Role::Script);
    assert_eq!(options.conflict_policy, ConflictPolicy::WarnRestart);
    assert_eq!(options.privilege, PrivilegeRequirement::Inherit);
    assert!(options.flags.contains(LaunchFlags::PRELOADED));
    assert_eq!(cfg.config.cache_dir, PathBuf::from(".compiled"));
    assert!(cfg.config.privilege_control);

    Ok(())
}

#[test]
fn unit_level_preload_overrides_the_global_default() -> TestResult {
    init_tracing();
    let file = write_config(
        "[config]\npreload = false\n\n[unit.1]\npath = \"a.sh\"\npreloaded = true\n\n[unit.2]\npath = \"b.sh\"\n",
    )?;

    let cfg = load_and_validate(file.path())?;
    let flags = |id| cfg.run_options(SourceUnitId(id)).map(|o| o.flags);

    assert_eq!(flags(1), Some(LaunchFlags::PRELOADED));
    assert_eq!(flags(2), Some(LaunchFlags::empty()));

    Ok(())
}

#[test]
fn invalid_configs_are_rejected() -> TestResult {
    init_tracing();

    let cases = [
        ("", "at least one"),
        ("[unit.1]\npath = \"a.sh\"\nfiles = [9]\n", "unknown unit 9"),
        ("[unit.1]\npath = \"a.sh\"\nlibraries = [1]\n", "itself"),
        (
            "[config]\nterminate_timeout_ms = 0\n\n[unit.1]\npath = \"a.sh\"\n",
            "terminate_timeout_ms",
        ),
        (
            "[config]\nelevate_cmd = []\n\n[unit.1]\npath = \"a.sh\"\n",
            "elevate_cmd",
        ),
        (
            "[unit.1]\npath = \"a.sh\"\n\n[project.app]\nmain = 4\n",
            "unknown unit 4",
        ),
        (
            "[unit.1]\npath = \"a.sh\"\n\n[project.app]\nmain = 1\nmembers = [1]\n",
            "main unit 1",
        ),
    ];

    for (contents, expected) in cases {
        let file = write_config(contents)?;
        match load_and_validate(file.path()) {
            Err(TaskhostError::ConfigError(msg)) => {
                assert!(msg.contains(expected), "{msg:?} should mention {expected:?}");
            }
            other => panic!("expected a config error for {contents:?}, got {other:?}"),
        }
    }

    Ok(())
}

#[test]
fn unknown_policy_name_is_a_parse_error() -> TestResult {
    init_tracing();
    let file = write_config("[unit.1]\npath = \"a.sh\"\nif_running = \"sometimes\"\n")?;

    assert!(matches!(
        load_and_validate(file.path()),
        Err(TaskhostError::TomlError(_))
    ));

    Ok(())
}
