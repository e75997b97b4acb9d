//! Pure per-module state machine
//!
//! `transition(state, event) -> (state, actions)` with no I/O. The dispatcher
//! executes the returned actions. Unhandled (state, event) pairs leave the
//! state unchanged and return a single `Reject` action; this never panics.

use serde::{Deserialize, Serialize};

use swarm_core::FailureType;

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Spec requested, no source yet
    Pending,
    /// Producer is generating or fixing source
    Drafting,
    /// Lint/compile/simulate running
    Verifying,
    /// Verification failed; correction attached
    Failing,
    /// Functional verification succeeded
    Passed,
    /// Physical-design flow running
    Hardening,
    /// Hardening failed; correction attached
    PhysFailing,
    /// Layout produced
    Done,
    /// Stopped by the governor
    Halted,
}

impl ModuleState {
    /// No further transitions are accepted
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Done | ModuleState::Halted)
    }

    /// A tool stage is in flight for the module
    pub fn is_busy(&self) -> bool {
        matches!(self, ModuleState::Verifying | ModuleState::Hardening)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Drafting => "Drafting",
            Self::Verifying => "Verifying",
            Self::Failing => "Failing",
            Self::Passed => "Passed",
            Self::Hardening => "Hardening",
            Self::PhysFailing => "PhysFailing",
            Self::Done => "Done",
            Self::Halted => "Halted",
        };
        write!(f, "{}", name)
    }
}

/// Events driving a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModuleEvent {
    SpecWritten,
    /// New source version; `fix` when the producer tagged it as a correction fix
    SourceWritten { fix: bool },
    ToolPassed,
    ToolFailed { failure_type: FailureType },
    HardeningRequested,
    /// A module this one depends on got new source
    UpstreamChanged { upstream: String },
    GovernorHalt { reason: String },
}

/// Side effects for the dispatcher to carry out, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleAction {
    /// Ask the source producer for a fresh draft
    RequestSource { reason: String },
    /// Ask the source producer to fix the attached correction
    RequestFix,
    RunVerification,
    RunHardening,
    /// Number the failure's correction record and consult the governor
    AttachCorrection,
    MarkPassed,
    MarkDone,
    /// Drop pass/done markers after a regression
    ClearMarkers,
    /// Hold the event until the running tool finishes
    Defer,
    Log { message: String },
    Reject { reason: String },
}

/// Pure transition function
pub fn transition(state: ModuleState, event: ModuleEvent) -> (ModuleState, Vec<ModuleAction>) {
    use ModuleAction as A;
    use ModuleEvent as E;
    use ModuleState as S;

    match (state, event) {
        // Terminal states absorb everything
        (s, e) if s.is_terminal() => (
            s,
            vec![A::Reject {
                reason: format!("{} is terminal, ignoring {:?}", s, e),
            }],
        ),

        (s, E::GovernorHalt { reason }) => (
            S::Halted,
            vec![A::Log {
                message: format!("Halted from {}: {}", s, reason),
            }],
        ),

        // Busy states queue writes until the tool returns
        (s, E::SpecWritten | E::SourceWritten { .. } | E::HardeningRequested | E::UpstreamChanged { .. })
            if s.is_busy() =>
        {
            (s, vec![A::Defer])
        }

        (S::Pending, E::SpecWritten) => (
            S::Drafting,
            vec![A::RequestSource {
                reason: "spec written".to_string(),
            }],
        ),
        // Source ahead of its spec waits for the spec
        (S::Pending, E::SourceWritten { .. }) => (S::Pending, vec![A::Defer]),

        (S::Drafting, E::SpecWritten) => (
            S::Drafting,
            vec![A::RequestSource {
                reason: "spec revised".to_string(),
            }],
        ),
        (S::Drafting | S::Failing | S::PhysFailing | S::Passed, E::SourceWritten { fix }) => (
            S::Verifying,
            vec![
                A::Log {
                    message: if fix {
                        format!("Fix applied in {}, re-verifying", state)
                    } else {
                        format!("New source in {}, verifying", state)
                    },
                },
                A::RunVerification,
            ],
        ),

        (S::Verifying, E::ToolPassed) => (S::Passed, vec![A::MarkPassed]),
        (S::Verifying, E::ToolFailed { .. }) => {
            (S::Failing, vec![A::AttachCorrection, A::RequestFix])
        }

        (S::Failing | S::PhysFailing, E::SpecWritten) => (
            S::Drafting,
            vec![A::RequestSource {
                reason: "spec revised".to_string(),
            }],
        ),

        (S::Passed, E::HardeningRequested) => (S::Hardening, vec![A::RunHardening]),
        (S::Passed, E::SpecWritten) => (
            S::Drafting,
            vec![
                A::ClearMarkers,
                A::RequestSource {
                    reason: "spec revised after pass".to_string(),
                },
            ],
        ),
        (S::Passed, E::UpstreamChanged { upstream }) => (
            S::Drafting,
            vec![
                A::ClearMarkers,
                A::RequestSource {
                    reason: format!("upstream module {} changed", upstream),
                },
            ],
        ),

        (S::Hardening, E::ToolPassed) => (S::Done, vec![A::MarkDone]),
        (S::Hardening, E::ToolFailed { .. }) => {
            (S::PhysFailing, vec![A::AttachCorrection, A::RequestFix])
        }

        // Modules not yet passed re-verify on their own; nothing to demote
        (s, E::UpstreamChanged { upstream }) => (
            s,
            vec![A::Log {
                message: format!("upstream {} changed while {}", upstream, s),
            }],
        ),

        (s, e) => (
            s,
            vec![A::Reject {
                reason: format!("{} cannot handle {:?}", s, e),
            }],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ModuleEvent {
        ModuleEvent::SourceWritten { fix: false }
    }

    fn failed() -> ModuleEvent {
        ModuleEvent::ToolFailed {
            failure_type: FailureType::Syntax,
        }
    }

    #[test]
    fn test_happy_path_to_done() {
        let (s, a) = transition(ModuleState::Pending, ModuleEvent::SpecWritten);
        assert_eq!(s, ModuleState::Drafting);
        assert!(matches!(a[0], ModuleAction::RequestSource { .. }));

        let (s, a) = transition(s, source());
        assert_eq!(s, ModuleState::Verifying);
        assert_eq!(a.last(), Some(&ModuleAction::RunVerification));

        let (s, a) = transition(s, ModuleEvent::ToolPassed);
        assert_eq!(s, ModuleState::Passed);
        assert_eq!(a, vec![ModuleAction::MarkPassed]);

        let (s, a) = transition(s, ModuleEvent::HardeningRequested);
        assert_eq!(s, ModuleState::Hardening);
        assert_eq!(a, vec![ModuleAction::RunHardening]);

        let (s, a) = transition(s, ModuleEvent::ToolPassed);
        assert_eq!(s, ModuleState::Done);
        assert_eq!(a, vec![ModuleAction::MarkDone]);
    }

    #[test]
    fn test_failure_and_retry() {
        let (s, a) = transition(ModuleState::Verifying, failed());
        assert_eq!(s, ModuleState::Failing);
        assert_eq!(a, vec![ModuleAction::AttachCorrection, ModuleAction::RequestFix]);

        let (s, _) = transition(s, ModuleEvent::SourceWritten { fix: true });
        assert_eq!(s, ModuleState::Verifying);
    }

    #[test]
    fn test_physical_failure_reverifies() {
        let (s, a) = transition(ModuleState::Hardening, failed());
        assert_eq!(s, ModuleState::PhysFailing);
        assert_eq!(a[0], ModuleAction::AttachCorrection);

        let (s, a) = transition(s, ModuleEvent::SourceWritten { fix: true });
        assert_eq!(s, ModuleState::Verifying);
        assert!(a.contains(&ModuleAction::RunVerification));
        assert!(!a.contains(&ModuleAction::RunHardening));
    }

    #[test]
    fn test_busy_states_defer_writes() {
        for busy in [ModuleState::Verifying, ModuleState::Hardening] {
            let (s, a) = transition(busy, source());
            assert_eq!(s, busy);
            assert_eq!(a, vec![ModuleAction::Defer]);
        }
    }

    #[test]
    fn test_upstream_change_demotes_only_passed() {
        let upstream = || ModuleEvent::UpstreamChanged {
            upstream: "m0".to_string(),
        };
        let (s, a) = transition(ModuleState::Passed, upstream());
        assert_eq!(s, ModuleState::Drafting);
        assert_eq!(a[0], ModuleAction::ClearMarkers);

        let (s, _) = transition(ModuleState::Done, upstream());
        assert_eq!(s, ModuleState::Done);

        let (s, a) = transition(ModuleState::Failing, upstream());
        assert_eq!(s, ModuleState::Failing);
        assert!(matches!(a[0], ModuleAction::Log { .. }));
    }

    #[test]
    fn test_governor_halt_from_any_non_terminal() {
        for state in [
            ModuleState::Pending,
            ModuleState::Drafting,
            ModuleState::Verifying,
            ModuleState::Failing,
            ModuleState::Passed,
            ModuleState::Hardening,
            ModuleState::PhysFailing,
        ] {
            let (s, _) = transition(
                state,
                ModuleEvent::GovernorHalt {
                    reason: "stagnant".to_string(),
                },
            );
            assert_eq!(s, ModuleState::Halted);
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for state in [ModuleState::Halted, ModuleState::Done] {
            let (s, a) = transition(state, source());
            assert_eq!(s, state);
            assert!(matches!(a[0], ModuleAction::Reject { .. }));
        }
    }

    #[test]
    fn test_invalid_events_are_rejected() {
        let (s, a) = transition(ModuleState::Pending, ModuleEvent::ToolPassed);
        assert_eq!(s, ModuleState::Pending);
        assert!(matches!(a[0], ModuleAction::Reject { .. }));

        let (s, a) = transition(ModuleState::Failing, ModuleEvent::HardeningRequested);
        assert_eq!(s, ModuleState::Failing);
        assert!(matches!(a[0], ModuleAction::Reject { .. }));
    }

    #[test]
    fn test_source_before_spec_is_deferred() {
        let (s, a) = transition(ModuleState::Pending, source());
        assert_eq!(s, ModuleState::Pending);
        assert_eq!(a, vec![ModuleAction::Defer]);
    }
}
