// src/exec/mod.rs

//! Process execution: privilege transitions, process creation, the
//! preloaded helper pool with its pipe handoff, and exit watching.

pub mod handoff;
pub mod helper;
pub mod launcher;
pub mod pipe;
pub mod pool;
pub mod privilege;
pub mod process;
pub mod watcher;

pub use handoff::HandoffMessage;
pub use launcher::{OsLauncher, ProcessLauncher, SpawnRequest};
pub use pool::{PoolConfig, PreloadedPool};
pub use privilege::{IntegrityLevel, PrivilegeLevel, Transition, resolve_transition};
pub use process::{OsProcess, TaskProcess};
pub use watcher::{WatchHandle, watch};
