// src/exec/privilege.rs

use std::fmt;

use crate::errors::{Result, TaskhostError};
use crate::types::PrivilegeRequirement;

/// Privilege level of the running host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityLevel {
    Low,
    Medium,
    High,
    /// Medium with UI access rights.
    UiAccess,
    System,
    Unknown,
}

impl IntegrityLevel {
    /// Level of the current process: root is `High`, anything else `Medium`.
    #[cfg(unix)]
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            IntegrityLevel::High
        } else {
            IntegrityLevel::Medium
        }
    }

    #[cfg(not(unix))]
    pub fn detect() -> Self {
        IntegrityLevel::Medium
    }
}

/// Privilege level a task runs at; one preloaded slot exists per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrivilegeLevel {
    Normal,
    Elevated,
    UiPrivileged,
}

impl PrivilegeLevel {
    pub fn slot_index(self) -> u32 {
        match self {
            PrivilegeLevel::Normal => 0,
            PrivilegeLevel::Elevated => 1,
            PrivilegeLevel::UiPrivileged => 2,
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrivilegeLevel::Normal => "normal",
            PrivilegeLevel::Elevated => "elevated",
            PrivilegeLevel::UiPrivileged => "ui-privileged",
        })
    }
}

/// How a process is created to reach its target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SameLevel,
    Elevate,
    DeElevate,
    InheritUiAccess,
}

/// Pick the transition (and pool slot) for a unit's privilege requirement.
///
/// An explicit requirement from a host level that cannot perform the
/// transition is an error.
pub fn resolve_transition(
    host: IntegrityLevel,
    requirement: PrivilegeRequirement,
    control_enabled: bool,
) -> Result<(Transition, PrivilegeLevel)> {
    use IntegrityLevel as H;
    use PrivilegeRequirement as R;

    if !control_enabled {
        return Ok((Transition::SameLevel, PrivilegeLevel::Normal));
    }

    let resolved = match (requirement, host) {
        (R::Inherit, H::High) => (Transition::SameLevel, PrivilegeLevel::Elevated),
        (R::Inherit, H::UiAccess) => (Transition::InheritUiAccess, PrivilegeLevel::UiPrivileged),
        (R::Inherit, _) => (Transition::SameLevel, PrivilegeLevel::Normal),

        (R::Admin, H::Medium | H::UiAccess) => (Transition::Elevate, PrivilegeLevel::Elevated),
        (R::Admin, H::High) => (Transition::SameLevel, PrivilegeLevel::Elevated),

        (R::User, H::High) => (Transition::DeElevate, PrivilegeLevel::Normal),
        (R::User, H::Medium | H::UiAccess) => (Transition::SameLevel, PrivilegeLevel::Normal),

        (R::Admin | R::User, H::Low | H::System | H::Unknown) => {
            return Err(TaskhostError::Privilege(format!(
                "cannot start a '{requirement}' task from a host running at {host:?} level"
            )));
        }
    };
    Ok(resolved)
}
