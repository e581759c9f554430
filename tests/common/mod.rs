#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use taskhost::build_host;
use taskhost::config::ConfigFile;
use taskhost::engine::{RuntimeEvent, TaskHost, TaskId};
use taskhost::fs::mock::MockFileSystem;

pub use taskhost_test_utils::builders;
pub use taskhost_test_utils::fake_launcher::FakeLauncher;
pub use taskhost_test_utils::{init_tracing, with_timeout};

pub const ROOT: &str = "/ws";

pub fn root() -> PathBuf {
    PathBuf::from(ROOT)
}

/// A host over an in-memory workspace and fake processes.
pub struct Harness {
    pub fs: MockFileSystem,
    pub launcher: FakeLauncher,
    pub host: TaskHost,
    pub events_rx: mpsc::Receiver<RuntimeEvent>,
    pub events_tx: mpsc::Sender<RuntimeEvent>,
    cfg: Arc<ConfigFile>,
}

impl Harness {
    /// Build a host for `cfg`, creating every unit's source file.
    pub fn new(cfg: ConfigFile) -> Self {
        let fs = MockFileSystem::new();
        for (_, unit) in cfg.units() {
            fs.add_file(root().join(&unit.path), format!("source of {}", unit.path.display()));
        }
        Self::with_fs(cfg, fs, FakeLauncher::new())
    }

    pub fn with_fs(cfg: ConfigFile, fs: MockFileSystem, launcher: FakeLauncher) -> Self {
        let cfg = Arc::new(cfg);
        let (tx, events_rx) = mpsc::channel(64);
        let host = build_host(
            Arc::clone(&cfg),
            root(),
            Arc::new(fs.clone()),
            Arc::new(launcher.clone()),
            tx.clone(),
        )
        .expect("host builds");
        Self {
            fs,
            launcher,
            host,
            events_rx,
            events_tx: tx,
            cfg,
        }
    }

    /// A fresh host over the same files, as after a restart of the program.
    pub fn reopen(self) -> Self {
        let cfg = (*self.cfg).clone();
        Self::with_fs(cfg, self.fs, self.launcher)
    }

    /// Same files, new config.
    pub fn reopen_with(self, cfg: ConfigFile) -> Self {
        Self::with_fs(cfg, self.fs, self.launcher)
    }

    pub fn source(&self, rel: &str) -> PathBuf {
        root().join(rel)
    }

    pub fn artifact(&self, unit: u32) -> PathBuf {
        root().join(".compiled").join(format!("{unit}.bin"))
    }

    /// Wait for the next exit event and hand it to the scheduler.
    pub async fn deliver_next_exit(&mut self) -> (TaskId, i32) {
        loop {
            match self.events_rx.recv().await {
                Some(RuntimeEvent::TaskExited { task_id, exit_code }) => {
                    self.host
                        .scheduler_mut()
                        .on_process_exited(task_id, exit_code)
                        .await;
                    return (task_id, exit_code);
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        use taskhost::fs::FileSystem;
        self.fs.is_file(path)
    }
}
