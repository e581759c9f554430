use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use taskhost::exec::pipe::connect;
use taskhost::exec::{HandoffMessage, ProcessLauncher, SpawnRequest, TaskProcess};

/// Exit code a fake process reports after being killed.
pub const KILLED_EXIT_CODE: i32 = 137;

const FIRST_PID: u32 = 1000;

#[derive(Debug, Default)]
struct LauncherState {
    spawned: Vec<(u32, SpawnRequest)>,
    exits: BTreeMap<u32, Arc<watch::Sender<Option<i32>>>>,
    handoffs: Vec<(u32, HandoffMessage)>,
    next_pid: u32,
    /// Processes spawned from now on ignore kill requests.
    stubborn: bool,
    /// Spawning fails from now on.
    failing: bool,
    /// Spawn calls so far, failed ones included.
    attempts: usize,
    /// Zero-based spawn calls that fail.
    failing_attempts: BTreeSet<usize>,
    /// Helpers spawned from now on exit at once without connecting.
    dead_helpers: bool,
}

/// A fake launcher that:
/// - records every spawn request
/// - hands out [`FakeProcess`]es whose exit the test controls
/// - for helper requests (`helper <endpoint>`), connects to the endpoint and
///   records the received handoff, like a real helper would.
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap()
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.lock().spawned.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn spawn_count(&self) -> usize {
        self.lock().spawned.len()
    }

    /// Handoff messages received by fake helpers, with the helper's pid.
    pub fn handoffs(&self) -> Vec<(u32, HandoffMessage)> {
        self.lock().handoffs.clone()
    }

    pub fn set_stubborn(&self, stubborn: bool) {
        self.lock().stubborn = stubborn;
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Make the `attempt`-th spawn call (zero-based, counting failures) fail.
    pub fn fail_spawn(&self, attempt: usize) {
        self.lock().failing_attempts.insert(attempt);
    }

    pub fn set_dead_helpers(&self, dead: bool) {
        self.lock().dead_helpers = dead;
    }

    /// Let process `pid` exit with `code`.
    pub fn exit(&self, pid: u32, code: i32) {
        if let Some(tx) = self.lock().exits.get(&pid) {
            set_exit(tx, code);
        }
    }

    /// Whether process `pid` has not exited yet.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.lock()
            .exits
            .get(&pid)
            .is_some_and(|tx| tx.borrow().is_none())
    }

    fn act_as_helper(&self, pid: u32, endpoint: String) {
        let launcher = self.clone();
        tokio::runtime::Handle::current().spawn(async move {
            let Ok(mut stream) = connect(&endpoint).await else {
                return;
            };
            if let Ok(message) = HandoffMessage::read_from(&mut stream).await {
                launcher.lock().handoffs.push((pid, message));
            }
        });
    }
}

fn set_exit(tx: &watch::Sender<Option<i32>>, code: i32) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn TaskProcess>> {
        let mut state = self.lock();
        let attempt = state.attempts;
        state.attempts += 1;
        if state.failing || state.failing_attempts.contains(&attempt) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake spawn failure"));
        }

        let pid = FIRST_PID + state.next_pid;
        state.next_pid += 1;

        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        state.exits.insert(pid, Arc::clone(&tx));
        state.spawned.push((pid, request.clone()));
        let stubborn = state.stubborn;
        let dead_helpers = state.dead_helpers;
        drop(state);

        if let [mode, endpoint] = request.args.as_slice() {
            if mode == "helper" {
                if dead_helpers {
                    set_exit(&tx, 1);
                } else {
                    self.act_as_helper(pid, endpoint.clone());
                }
            }
        }

        Ok(Box::new(FakeProcess {
            pid,
            exit: tx,
            exited: rx,
            stubborn,
        }))
    }
}

/// A process that exits when the test (or a kill request) says so.
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    exit: Arc<watch::Sender<Option<i32>>>,
    exited: watch::Receiver<Option<i32>>,
    stubborn: bool,
}

impl TaskProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = io::Result<i32>> + Send + '_>> {
        Box::pin(async move {
            self.exited
                .wait_for(Option::is_some)
                .await
                .map(|code| (*code).unwrap_or(-1))
                .map_err(|_| io::Error::other("fake process control dropped"))
        })
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(*self.exited.borrow())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        if !self.stubborn {
            set_exit(&self.exit, KILLED_EXIT_CODE);
        }
        Ok(())
    }
}
