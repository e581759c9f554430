// src/exec/process.rs

//! Handles to started OS processes.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;

use tokio::process::Child;

/// A started process that can be waited on and killed.
///
/// Production code wraps a tokio [`Child`] in [`OsProcess`]; tests provide
/// fakes whose exit they control.
pub trait TaskProcess: Send + fmt::Debug {
    fn id(&self) -> u32;

    /// Wait for exit and return the exit code.
    fn wait(&mut self) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + '_>>;

    /// Exit code if the process already exited.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Request termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;
}

/// A real child process.
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
    pid: u32,
}

impl OsProcess {
    pub fn new(child: Child) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its id was read"))?;
        Ok(Self { child, pid })
    }
}

impl TaskProcess for OsProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + '_>> {
        Box::pin(async move { self.child.wait().await.map(exit_code) })
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            // Already reaped: nothing left to kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Exit code of a status; a signal-terminated process reports `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn reports_exit_code_and_kills() {
        let child = Command::new("sh").arg("-c").arg("exit 3").spawn().unwrap();
        let mut p = OsProcess::new(child).unwrap();
        assert_eq!(p.wait().await.unwrap(), 3);

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut p = OsProcess::new(child).unwrap();
        p.start_kill().unwrap();
        assert_eq!(p.wait().await.unwrap(), 128 + 9);
    }
}
