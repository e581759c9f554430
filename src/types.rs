// src/types.rs

//! Shared value types: unit identities and the run options recorded for a
//! compiled unit.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::Deserialize;

/// Stable identity of a compilable file, assigned by the workspace model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct SourceUnitId(pub u32);

impl SourceUnitId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceUnitId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(SourceUnitId)
            .map_err(|_| format!("invalid source unit id: {s:?}"))
    }
}

/// What kind of artifact a unit compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Hosted by a helper process that receives its parameters over a pipe.
    #[default]
    Script,
    /// A standalone executable started directly.
    Executable,
    /// Only referenced by other units; never runnable on its own.
    Library,
}

/// Rule applied when a run is requested while an instance of the same unit
/// may still be running.
///
/// Each `*Restart` variant behaves like its base policy, except that an
/// interactive run upgrades it to [`ConflictPolicy::Restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    WarnRestart,
    Warn,
    CancelRestart,
    Cancel,
    WaitRestart,
    Wait,
    RunRestart,
    Run,
    Restart,
    End,
    EndRestart,
}

/// Privilege the started process must run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeRequirement {
    /// Same level as the host.
    #[default]
    Inherit,
    /// Normal user level, even from an elevated host.
    User,
    /// Elevated level.
    Admin,
}

/// Target platform recorded for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Native,
    X64,
    X86,
    Arm64,
}

bitflags! {
    /// Behaviour flags handed to the started task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LaunchFlags: u32 {
        /// The unit may be started through the preloaded helper pool.
        const PRELOADED = 1;
        /// Started by an interactive run command.
        const INTERACTIVE = 1 << 1;
        /// The caller wants the task's result on a result pipe.
        const CAPTURE_OUTPUT = 1 << 2;
    }
}

/// Everything that decides how a compiled unit is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub role: Role,
    pub conflict_policy: ConflictPolicy,
    pub privilege: PrivilegeRequirement,
    pub platform: Platform,
    pub flags: LaunchFlags,
}

/// Generates `as_str` / `FromStr` for the tag enums so the cache descriptor,
/// the CLI and error messages share one spelling.
macro_rules! tag_names {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(format!(concat!("invalid ", $what, ": {}"), other)),
                }
            }
        }
    };
}

tag_names!(Role, "role", {
    Script => "script",
    Executable => "executable",
    Library => "library",
});

tag_names!(ConflictPolicy, "if_running policy", {
    WarnRestart => "warn_restart",
    Warn => "warn",
    CancelRestart => "cancel_restart",
    Cancel => "cancel",
    WaitRestart => "wait_restart",
    Wait => "wait",
    RunRestart => "run_restart",
    Run => "run",
    Restart => "restart",
    End => "end",
    EndRestart => "end_restart",
});

tag_names!(PrivilegeRequirement, "privilege requirement", {
    Inherit => "inherit",
    User => "user",
    Admin => "admin",
});

tag_names!(Platform, "platform", {
    Native => "native",
    X64 => "x64",
    X86 => "x86",
    Arm64 => "arm64",
});

/// Result of asking the scheduler to start a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A process was started (or a preloaded one claimed); carries its pid.
    Started(u32),
    /// Queued behind a running instance; will start when it exits.
    Deferred,
    /// Nothing was started.
    NotStarted,
}

impl LaunchOutcome {
    /// Sentinel returned by [`LaunchOutcome::code`] for deferred runs.
    pub const DEFERRED_CODE: i64 = -1;

    /// Numeric form: the pid, [`Self::DEFERRED_CODE`], or `0`.
    pub fn code(self) -> i64 {
        match self {
            LaunchOutcome::Started(pid) => i64::from(pid),
            LaunchOutcome::Deferred => Self::DEFERRED_CODE,
            LaunchOutcome::NotStarted => 0,
        }
    }

    pub fn is_started(self) -> bool {
        matches!(self, LaunchOutcome::Started(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names_round_trip_through_from_str() {
        for policy in [
            ConflictPolicy::WarnRestart,
            ConflictPolicy::Wait,
            ConflictPolicy::EndRestart,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>(), Ok(policy));
        }
        assert!("sometimes".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn outcome_codes_keep_deferred_distinct_from_pids() {
        assert_eq!(LaunchOutcome::Started(42).code(), 42);
        assert_eq!(LaunchOutcome::Deferred.code(), -1);
        assert_eq!(LaunchOutcome::NotStarted.code(), 0);
    }
}
