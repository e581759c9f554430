// src/exec/helper.rs

//! Helper side of the preloaded launch: `taskhost helper <endpoint>`.
//!
//! The helper connects to the host's pipe, reads one handoff message and
//! then becomes the task.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use super::handoff::HandoffMessage;
use super::pipe::connect;

pub const ENV_WORKSPACE: &str = "TASKHOST_WORKSPACE";
pub const ENV_UNIT: &str = "TASKHOST_UNIT";
pub const ENV_CALLER_PID: &str = "TASKHOST_CALLER_PID";
pub const ENV_CHANNEL: &str = "TASKHOST_CHANNEL";
pub const ENV_FLAGS: &str = "TASKHOST_FLAGS";
pub const ENV_RESULT_PIPE: &str = "TASKHOST_RESULT_PIPE";
pub const ENV_NAME: &str = "TASKHOST_NAME";

/// Wait for the handoff on `endpoint`, then run the artifact.
///
/// On unix the helper replaces itself with the artifact, so this only returns
/// on failure. Elsewhere it returns the artifact's exit code.
pub async fn run_helper(endpoint: &str) -> Result<i32> {
    let mut stream = connect(endpoint)
        .await
        .with_context(|| format!("connecting to host pipe {endpoint}"))?;
    let message = HandoffMessage::read_from(&mut stream)
        .await
        .context("reading handoff message")?;
    drop(stream);

    debug!(
        unit = %message.unit,
        artifact = %message.artifact_path.display(),
        "received handoff"
    );

    let command = task_command(&message);
    exec(command, &message)
}

/// Environment a task starts with, whether started by a helper or directly.
pub fn task_env(message: &HandoffMessage) -> Vec<(String, String)> {
    let mut env = vec![
        (ENV_NAME.to_string(), message.artifact_name.clone()),
        (
            ENV_WORKSPACE.to_string(),
            message.workspace_root.to_string_lossy().into_owned(),
        ),
        (ENV_UNIT.to_string(), message.unit.to_string()),
        (ENV_CALLER_PID.to_string(), message.caller_pid.to_string()),
        (ENV_CHANNEL.to_string(), message.caller_channel.to_string()),
        (ENV_FLAGS.to_string(), message.flags.bits().to_string()),
    ];
    if let Some(pipe) = &message.result_pipe {
        env.push((ENV_RESULT_PIPE.to_string(), pipe.clone()));
    }
    env
}

/// Command line and environment the task runs with.
pub fn task_command(message: &HandoffMessage) -> Command {
    let mut cmd = Command::new(&message.artifact_path);
    cmd.args(&message.args)
        .current_dir(&message.workspace_root)
        .envs(task_env(message));
    cmd
}

#[cfg(unix)]
fn exec(mut command: Command, message: &HandoffMessage) -> Result<i32> {
    use std::os::unix::process::CommandExt;

    let err = command.exec();
    Err(err).with_context(|| format!("executing {}", message.artifact_path.display()))
}

#[cfg(not(unix))]
fn exec(mut command: Command, message: &HandoffMessage) -> Result<i32> {
    let status = command
        .status()
        .with_context(|| format!("executing {}", message.artifact_path.display()))?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaunchFlags, SourceUnitId};
    use std::ffi::OsStr;
    use std::path::PathBuf;

    #[test]
    fn task_environment_carries_the_handoff() {
        let message = HandoffMessage {
            artifact_name: "hello".into(),
            artifact_path: PathBuf::from("/ws/.compiled/4.bin"),
            flags: LaunchFlags::INTERACTIVE,
            args: vec!["x".into()],
            result_pipe: Some("res".into()),
            workspace_root: PathBuf::from("/ws"),
            unit: SourceUnitId(4),
            caller_pid: 10,
            caller_channel: 0,
        };

        let cmd = task_command(&message);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&(OsStr::new(ENV_UNIT), Some(OsStr::new("4")))));
        assert!(envs.contains(&(OsStr::new(ENV_FLAGS), Some(OsStr::new("2")))));
        assert!(envs.contains(&(OsStr::new(ENV_RESULT_PIPE), Some(OsStr::new("res")))));
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), vec![OsStr::new("x")]);
    }
}
