// src/exec/launcher.rs

use std::fmt;
use std::io;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use super::privilege::Transition;
use super::process::{OsProcess, TaskProcess};

/// Everything needed to create one process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub transition: Transition,
}

impl SpawnRequest {
    pub fn new(program: impl Into<PathBuf>, transition: Transition) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            transition,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Creates processes. Synchronous: callers that must not block run it on a
/// blocking thread.
pub trait ProcessLauncher: Send + Sync + fmt::Debug {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn TaskProcess>>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Clone)]
pub struct OsLauncher {
    elevate_cmd: Vec<String>,
}

impl OsLauncher {
    pub fn new(elevate_cmd: Vec<String>) -> Self {
        Self { elevate_cmd }
    }

    fn command_for(&self, request: &SpawnRequest) -> io::Result<Command> {
        let mut cmd = match request.transition {
            Transition::SameLevel => {
                let mut cmd = Command::new(&request.program);
                cmd.args(&request.args);
                cmd
            }
            Transition::Elevate => {
                let (program, leading) = self.elevate_cmd.split_first().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "no elevation command configured")
                })?;
                let mut cmd = Command::new(program);
                cmd.args(leading).arg(&request.program).args(&request.args);
                cmd
            }
            Transition::DeElevate => {
                let mut cmd = Command::new(&request.program);
                cmd.args(&request.args);
                de_elevate(&mut cmd)?;
                cmd
            }
            Transition::InheritUiAccess => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "UI access inheritance is not available on this platform",
                ));
            }
        };

        cmd.envs(request.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &request.current_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

impl ProcessLauncher for OsLauncher {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn TaskProcess>> {
        let mut cmd = self.command_for(request)?;
        let child = cmd.spawn()?;
        let process = OsProcess::new(child)?;
        debug!(
            pid = process.id(),
            program = %request.program.display(),
            transition = ?request.transition,
            "spawned process"
        );
        Ok(Box::new(process))
    }
}

/// Drop to the user that invoked the elevated host (`SUDO_UID`/`SUDO_GID`).
#[cfg(unix)]
fn de_elevate(cmd: &mut Command) -> io::Result<()> {
    let id_from_env = |key: &str| -> io::Result<u32> {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot de-elevate: {key} does not name the invoking user"),
                )
            })
    };
    let uid = id_from_env("SUDO_UID")?;
    let gid = id_from_env("SUDO_GID")?;
    cmd.uid(uid).gid(gid);
    Ok(())
}

#[cfg(not(unix))]
fn de_elevate(_cmd: &mut Command) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "de-elevation is not available on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elevation_prefixes_the_configured_command() {
        let launcher = OsLauncher::new(vec!["env".into(), "TASKHOST_ELEVATED=1".into()]);
        let request = SpawnRequest::new("sh", Transition::Elevate)
            .args(["-c", "test \"$TASKHOST_ELEVATED\" = 1"]);

        let mut process = launcher.spawn(&request).unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ui_access_is_refused() {
        let launcher = OsLauncher::new(vec!["sudo".into()]);
        let request = SpawnRequest::new("true", Transition::InheritUiAccess);
        let err = launcher.spawn(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
