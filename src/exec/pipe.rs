// src/exec/pipe.rs

//! Local pipe endpoints used to hand run parameters to a helper.
//!
//! Unix uses a socket file `<dir>/taskhost-<pid>-<slot>.sock`; Windows uses
//! the named pipe `\\.\pipe\taskhost-<pid>-<slot>`.

use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::errors::LaunchStep;

use super::handoff::{HandoffError, HandoffMessage};
use super::process::TaskProcess;

/// Upper bound for a helper to connect once it is running.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Slot index used for pipes of one-off (non-pooled) helper launches.
pub const ONESHOT_SLOT: u32 = 100;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("helper exited with code {0} before connecting")]
    HelperExited(i32),

    #[error("waiting for the helper to connect: {0}")]
    Connect(io::Error),

    #[error("writing the handoff message: {0}")]
    Write(io::Error),

    #[error(transparent)]
    Encode(#[from] HandoffError),
}

impl PipeError {
    pub fn step(&self) -> LaunchStep {
        match self {
            PipeError::HelperExited(_) | PipeError::Connect(_) => LaunchStep::Connect,
            PipeError::Write(_) | PipeError::Encode(_) => LaunchStep::Write,
        }
    }
}

pub fn pipe_name(host_pid: u32, slot: u32) -> String {
    format!("taskhost-{host_pid}-{slot}")
}

#[cfg(unix)]
pub use unix::PipeServer;

#[cfg(windows)]
pub use windows::PipeServer;

/// Connect to a host's pipe as a helper, retrying while it is not ready.
pub async fn connect(endpoint: &str) -> io::Result<Box<dyn AsyncRead + Unpin + Send>> {
    const ATTEMPTS: u32 = 50;
    const BACKOFF: Duration = Duration::from_millis(20);

    let mut attempt = 0;
    loop {
        match connect_once(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt + 1 < ATTEMPTS && is_retryable(&err) => {
                attempt += 1;
                debug!(endpoint, attempt, error = %err, "pipe not ready; retrying");
                tokio::time::sleep(BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(unix)]
async fn connect_once(endpoint: &str) -> io::Result<Box<dyn AsyncRead + Unpin + Send>> {
    let stream = tokio::net::UnixStream::connect(endpoint).await?;
    Ok(Box::new(stream))
}

#[cfg(unix)]
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(windows)]
async fn connect_once(endpoint: &str) -> io::Result<Box<dyn AsyncRead + Unpin + Send>> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new()
        .read(true)
        .write(false)
        .open(endpoint)?;
    Ok(Box::new(client))
}

#[cfg(windows)]
fn is_retryable(err: &io::Error) -> bool {
    const ERROR_FILE_NOT_FOUND: i32 = 2;
    const ERROR_PIPE_BUSY: i32 = 231;
    matches!(err.raw_os_error(), Some(ERROR_PIPE_BUSY | ERROR_FILE_NOT_FOUND))
}

/// Race the helper's connection against its exit, then write the message and
/// close our end.
async fn send_when_connected<S, C>(
    process: &mut dyn TaskProcess,
    accept: C,
    message: &HandoffMessage,
) -> Result<S, PipeError>
where
    S: tokio::io::AsyncWrite + Unpin,
    C: std::future::Future<Output = io::Result<S>>,
{
    let bytes = message.encode()?;

    let mut stream = tokio::select! {
        res = tokio::time::timeout(CONNECT_TIMEOUT, accept) => match res {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(PipeError::Connect(err)),
            Err(_) => {
                return Err(PipeError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "helper did not connect in time",
                )));
            }
        },
        res = process.wait() => {
            return Err(PipeError::HelperExited(res.unwrap_or(-1)));
        }
    };

    stream.write_all(&bytes).await.map_err(PipeError::Write)?;
    stream.flush().await.map_err(PipeError::Write)?;
    Ok(stream)
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixListener;

    /// Listening end of a slot's socket. The socket file is removed on drop.
    #[derive(Debug)]
    pub struct PipeServer {
        path: PathBuf,
        listener: UnixListener,
    }

    impl PipeServer {
        pub fn create(dir: &Path, host_pid: u32, slot: u32) -> io::Result<Self> {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.sock", pipe_name(host_pid, slot)));
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let listener = UnixListener::bind(&path)?;
            Ok(Self { path, listener })
        }

        /// Argument handed to a helper so it can connect.
        pub fn endpoint(&self) -> String {
            self.path.to_string_lossy().into_owned()
        }

        pub async fn handoff(
            &mut self,
            process: &mut dyn TaskProcess,
            message: &HandoffMessage,
        ) -> Result<(), PipeError> {
            let accept = async { self.listener.accept().await.map(|(stream, _)| stream) };
            let mut stream = send_when_connected(process, accept, message).await?;
            if let Err(err) = stream.shutdown().await {
                debug!(error = %err, "helper closed the pipe first");
            }
            Ok(())
        }
    }

    impl Drop for PipeServer {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    /// One named pipe; a fresh server instance is created after every
    /// handoff.
    #[derive(Debug)]
    pub struct PipeServer {
        name: String,
        server: Option<NamedPipeServer>,
    }

    fn create_instance(name: &str, first: bool) -> io::Result<NamedPipeServer> {
        ServerOptions::new()
            .first_pipe_instance(first)
            .access_inbound(false)
            .access_outbound(true)
            .reject_remote_clients(true)
            .create(name)
    }

    impl PipeServer {
        pub fn create(_dir: &Path, host_pid: u32, slot: u32) -> io::Result<Self> {
            let name = format!(r"\\.\pipe\{}", pipe_name(host_pid, slot));
            let server = create_instance(&name, true)?;
            Ok(Self {
                name,
                server: Some(server),
            })
        }

        pub fn endpoint(&self) -> String {
            self.name.clone()
        }

        pub async fn handoff(
            &mut self,
            process: &mut dyn TaskProcess,
            message: &HandoffMessage,
        ) -> Result<(), PipeError> {
            let server = match self.server.take() {
                Some(server) => server,
                None => create_instance(&self.name, false).map_err(PipeError::Connect)?,
            };
            let accept = async move { server.connect().await.map(|()| server) };
            let server = send_when_connected(process, accept, message).await?;
            if let Err(err) = server.disconnect() {
                debug!(error = %err, "disconnecting pipe failed");
            }

            match create_instance(&self.name, false) {
                Ok(next) => self.server = Some(next),
                Err(err) => debug!(error = %err, "could not pre-create next pipe instance"),
            }
            Ok(())
        }
    }
}
