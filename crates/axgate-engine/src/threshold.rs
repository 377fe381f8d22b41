//! Threshold evaluation for single-metric constraints.
//!
//! Pure comparison logic: one observed value against one constraint. The
//! hard bound is checked first and strictly dominates the soft bound; a
//! non-finite observation is itself a hard breach (fail-closed).

use axgate_domain::{ComplianceStatus, Constraint, PolicyAction};

/// Verdict for one value/constraint comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdVerdict {
    /// Breach severity.
    pub status: ComplianceStatus,

    /// Action mandated by the matching severity policy.
    pub action: PolicyAction,

    /// Human-readable explanation.
    pub detail: String,
}

impl ThresholdVerdict {
    /// Normalized score contribution: compliant 1.0, soft breach 0.5,
    /// hard breach 0.0.
    pub fn score(&self) -> f64 {
        match self.status {
            ComplianceStatus::Compliant => 1.0,
            ComplianceStatus::SoftBreach => 0.5,
            ComplianceStatus::HardBreach => 0.0,
        }
    }

    /// Whether the check passes. A soft breach passes only when its
    /// mandated action lets the run proceed.
    pub fn passed(&self) -> bool {
        match self.status {
            ComplianceStatus::Compliant => true,
            ComplianceStatus::SoftBreach => !self.action.is_halt(),
            ComplianceStatus::HardBreach => false,
        }
    }
}

/// Threshold constraint evaluator.
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    /// Compare `value` against `constraint`.
    ///
    /// Order of evaluation:
    /// 1. Non-finite values (NaN, infinities) are hard breaches.
    /// 2. Hard bound; on violation the soft bound is not consulted.
    /// 3. Soft bound, when present.
    pub fn evaluate(value: f64, constraint: &Constraint) -> ThresholdVerdict {
        if !value.is_finite() {
            return ThresholdVerdict {
                status: ComplianceStatus::HardBreach,
                action: constraint.severity_policy.hard,
                detail: format!(
                    "{}: non-finite observation ({value}), failing closed",
                    constraint.metric_id
                ),
            };
        }

        if !constraint.operator.holds(value, constraint.hard_bound) {
            return ThresholdVerdict {
                status: ComplianceStatus::HardBreach,
                action: constraint.severity_policy.hard,
                detail: format!(
                    "{}={} violates hard bound {} {}",
                    constraint.metric_id,
                    value,
                    constraint.operator.symbol(),
                    constraint.hard_bound
                ),
            };
        }

        if let Some(soft_bound) = constraint.soft_bound {
            if !constraint.operator.holds(value, soft_bound) {
                return ThresholdVerdict {
                    status: ComplianceStatus::SoftBreach,
                    action: constraint.severity_policy.soft,
                    detail: format!(
                        "{}={} violates soft bound {} {} (hard bound satisfied)",
                        constraint.metric_id,
                        value,
                        constraint.operator.symbol(),
                        soft_bound
                    ),
                };
            }
        }

        ThresholdVerdict {
            status: ComplianceStatus::Compliant,
            action: PolicyAction::Pass,
            detail: format!(
                "{}={} satisfies {} {}",
                constraint.metric_id,
                value,
                constraint.operator.symbol(),
                constraint.hard_bound
            ),
        }
    }
}
