// src/engine/policy.rs

//! What to do when a unit is requested while an instance may be running.

use crate::types::ConflictPolicy;

/// Action for a run that cannot start right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the request silently.
    Cancel,
    /// Queue the request until the running instance exits.
    Defer,
    /// Report that the unit is already running.
    Warn,
    /// Terminate the running instance, then start.
    Restart,
    /// Terminate the running instance and start nothing.
    End,
}

/// Whether a run may start next to the current instances.
pub fn can_run_now(policy: ConflictPolicy, interactive: bool, has_live_instance: bool) -> bool {
    match policy {
        ConflictPolicy::Run => true,
        ConflictPolicy::RunRestart if !interactive => true,
        _ => !has_live_instance,
    }
}

/// Resolve a policy for a run that [`can_run_now`] rejected.
pub fn resolve(policy: ConflictPolicy, interactive: bool, allow_defer: bool) -> Resolution {
    use ConflictPolicy::*;

    let effective = match policy {
        WarnRestart | CancelRestart | WaitRestart | RunRestart | EndRestart if interactive => {
            Restart
        }
        EndRestart => End,
        WarnRestart => Warn,
        CancelRestart => Cancel,
        WaitRestart => Wait,
        RunRestart => Run,
        other => other,
    };

    match effective {
        Cancel => Resolution::Cancel,
        Wait if allow_defer => Resolution::Defer,
        Restart => Resolution::Restart,
        End => Resolution::End,
        _ => Resolution::Warn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConflictPolicy::*;

    #[test]
    fn run_ignores_live_instances() {
        assert!(can_run_now(Run, true, true));
        assert!(can_run_now(RunRestart, false, true));
        assert!(!can_run_now(RunRestart, true, true));
        assert!(!can_run_now(Warn, false, true));
        assert!(can_run_now(Warn, false, false));
    }

    #[test]
    fn restart_variants_upgrade_interactive_runs() {
        for policy in [WarnRestart, CancelRestart, WaitRestart, RunRestart, EndRestart] {
            assert_eq!(resolve(policy, true, true), Resolution::Restart, "{policy}");
        }
    }

    #[test]
    fn restart_variants_fall_back_to_their_base() {
        assert_eq!(resolve(WarnRestart, false, true), Resolution::Warn);
        assert_eq!(resolve(CancelRestart, false, true), Resolution::Cancel);
        assert_eq!(resolve(WaitRestart, false, true), Resolution::Defer);
        assert_eq!(resolve(EndRestart, false, true), Resolution::End);
    }

    #[test]
    fn plain_policies() {
        assert_eq!(resolve(Cancel, true, true), Resolution::Cancel);
        assert_eq!(resolve(Wait, true, true), Resolution::Defer);
        assert_eq!(resolve(Restart, false, true), Resolution::Restart);
        assert_eq!(resolve(End, true, true), Resolution::End);
        assert_eq!(resolve(Warn, true, true), Resolution::Warn);
    }

    #[test]
    fn wait_without_deferral_warns() {
        assert_eq!(resolve(Wait, false, false), Resolution::Warn);
        assert_eq!(resolve(WaitRestart, false, false), Resolution::Warn);
    }
}
