//! Retry/Budget Governor
//!
//! Consulted after every correction record is attached. Checks, in order
//! (first met wins):
//!
//! 1. Stagnation: the same failure signature `retry_limit` times in a row
//! 2. Attempt cap: `max_attempts` failed rounds, any signature
//! 3. Budget: spend has reached the module's cap
//! 4. Diminishing returns: the metric barely moved while spend is past
//!    `diminishing_fraction` of the cap

use serde::{Deserialize, Serialize};

use swarm_core::config::GovernorConfig;
use swarm_core::{CorrectionRecord, FailureType};

use crate::registry::ModuleRecord;

/// Why the governor stopped a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    Stagnant { signature: String, retry_count: u32 },
    AttemptLimit { attempts: u32 },
    BudgetExhausted { spent: f64, cap: f64 },
    DiminishingReturns { improvement: f64, spent: f64, cap: f64 },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stagnant {
                signature,
                retry_count,
            } => write!(
                f,
                "stagnant: signature {} failed {} times in a row",
                signature, retry_count
            ),
            Self::AttemptLimit { attempts } => {
                write!(f, "attempt limit: {} failed attempts", attempts)
            }
            Self::BudgetExhausted { spent, cap } => {
                write!(f, "budget exhausted: spent {:.1} of {:.1}", spent, cap)
            }
            Self::DiminishingReturns {
                improvement,
                spent,
                cap,
            } => write!(
                f,
                "diminishing returns: improvement {:.4} with {:.1} of {:.1} spent",
                improvement, spent, cap
            ),
        }
    }
}

/// Governor verdict
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorAction {
    Continue,
    Escalate(EscalationReason),
}

/// Stateless policy over a module record
#[derive(Debug, Clone)]
pub struct Governor {
    config: GovernorConfig,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    /// Decide whether the module may retry after `correction`
    ///
    /// `record` must already reflect the correction (retry tracker, failed
    /// attempt count, budget). `previous_metric` is the metric of the failure
    /// before this one.
    pub fn evaluate(
        &self,
        record: &ModuleRecord,
        correction: &CorrectionRecord,
        previous_metric: Option<f64>,
    ) -> GovernorAction {
        if correction.retry_count >= self.config.retry_limit {
            return GovernorAction::Escalate(EscalationReason::Stagnant {
                signature: correction.signature.clone(),
                retry_count: correction.retry_count,
            });
        }

        if record.failed_attempts >= self.config.max_attempts {
            return GovernorAction::Escalate(EscalationReason::AttemptLimit {
                attempts: record.failed_attempts,
            });
        }

        if record.budget.exhausted() {
            return GovernorAction::Escalate(EscalationReason::BudgetExhausted {
                spent: record.budget.spent,
                cap: record.budget.cap,
            });
        }

        if let (Some(previous), Some(current)) = (previous_metric, correction.metric) {
            let improvement = improvement(correction.failure_type, previous, current);
            let threshold = self.config.diminishing_fraction * record.budget.cap;
            if improvement < self.config.min_improvement && record.budget.spent >= threshold {
                return GovernorAction::Escalate(EscalationReason::DiminishingReturns {
                    improvement,
                    spent: record.budget.spent,
                    cap: record.budget.cap,
                });
            }
        }

        GovernorAction::Continue
    }
}

/// Progress between two failure metrics, positive when things got better
///
/// Slack improves upward; EVM and violation counts improve downward.
fn improvement(failure_type: FailureType, previous: f64, current: f64) -> f64 {
    match failure_type {
        FailureType::TimingSetup | FailureType::Congestion => current - previous,
        _ => previous - current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::ToolStage;

    fn governor() -> Governor {
        Governor::new(GovernorConfig {
            retry_limit: 3,
            max_attempts: 8,
            min_improvement: 0.01,
            diminishing_fraction: 0.8,
        })
    }

    fn correction(retry_count: u32) -> CorrectionRecord {
        let mut c = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Syntax);
        c.retry_count = retry_count;
        c
    }

    #[test]
    fn test_continue_under_limits() {
        let record = ModuleRecord::new("m1", 100.0);
        assert_eq!(
            governor().evaluate(&record, &correction(2), None),
            GovernorAction::Continue
        );
    }

    #[test]
    fn test_stagnation_escalates_at_limit() {
        let record = ModuleRecord::new("m1", 100.0);
        let action = governor().evaluate(&record, &correction(3), None);
        assert!(matches!(
            action,
            GovernorAction::Escalate(EscalationReason::Stagnant { retry_count: 3, .. })
        ));
    }

    #[test]
    fn test_attempt_cap_across_signatures() {
        let mut record = ModuleRecord::new("m1", 100.0);
        record.failed_attempts = 8;
        let action = governor().evaluate(&record, &correction(1), None);
        assert_eq!(
            action,
            GovernorAction::Escalate(EscalationReason::AttemptLimit { attempts: 8 })
        );
    }

    #[test]
    fn test_stagnation_wins_over_budget() {
        let mut record = ModuleRecord::new("m1", 10.0);
        record.budget.charge(20.0);
        let action = governor().evaluate(&record, &correction(3), None);
        assert!(matches!(
            action,
            GovernorAction::Escalate(EscalationReason::Stagnant { .. })
        ));

        let action = governor().evaluate(&record, &correction(1), None);
        assert!(matches!(
            action,
            GovernorAction::Escalate(EscalationReason::BudgetExhausted { .. })
        ));
    }

    #[test]
    fn test_diminishing_returns_needs_high_spend() {
        let mut record = ModuleRecord::new("m1", 100.0);
        let mut c = CorrectionRecord::new("m1", ToolStage::Harden, FailureType::TimingSetup)
            .with_metric(-0.300);
        c.retry_count = 1;

        record.budget.charge(50.0);
        assert_eq!(
            governor().evaluate(&record, &c, Some(-0.305)),
            GovernorAction::Continue
        );

        record.budget.charge(35.0);
        assert!(matches!(
            governor().evaluate(&record, &c, Some(-0.305)),
            GovernorAction::Escalate(EscalationReason::DiminishingReturns { .. })
        ));

        // Real progress keeps going even late in the budget
        assert_eq!(
            governor().evaluate(&record, &c, Some(-0.9)),
            GovernorAction::Continue
        );
    }

    #[test]
    fn test_improvement_direction() {
        assert!(improvement(FailureType::TimingSetup, -0.5, -0.2) > 0.0);
        assert!(improvement(FailureType::Functional, 5.0, 2.0) > 0.0);
        assert!(improvement(FailureType::DrcViolation, 3.0, 7.0) < 0.0);
    }
}
