//! Axiom combination for policy checks.
//!
//! An overall pass requires every axiom to hold: utility attestation
//! (observed utility meets its threshold), context attestation (the
//! execution context is verified), and axiomatic integrity (no veto flag
//! asserted). On failure the reported reason is not the first condition
//! evaluated but the highest-priority failing one - every condition is
//! evaluated before the reason is selected, because a lower-priority
//! condition may well be declared first.

use axgate_domain::{
    AxiomCriteria, EvaluationContext, HaltDecision, ReasonCode, DEFAULT_PRECEDENCE,
};

/// Resolved inputs for one axiom combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxiomInputs {
    /// Observed utility metric.
    pub utility: f64,

    /// Minimum utility required.
    pub utility_threshold: f64,

    /// Execution-context attestation flag.
    pub attested: bool,

    /// PVLM veto.
    pub pre_validation_miss: bool,

    /// MPAM veto.
    pub manifest_policy_miss: bool,

    /// ADTM veto.
    pub deviation_threshold_miss: bool,
}

impl AxiomInputs {
    /// Resolve inputs from a context per the check's criteria.
    ///
    /// Fail-closed resolution: a missing or mis-typed utility metric reads
    /// as NaN (failing the utility axiom), a missing attestation flag reads
    /// as unattested, and a missing veto flag reads as asserted.
    pub fn resolve(criteria: &AxiomCriteria, context: &EvaluationContext) -> Self {
        Self {
            utility: context.number(&criteria.utility_metric).unwrap_or(f64::NAN),
            utility_threshold: criteria.utility_threshold,
            attested: context.flag(&criteria.attestation_flag).unwrap_or(false),
            pre_validation_miss: context.flag(&criteria.pre_validation_flag).unwrap_or(true),
            manifest_policy_miss: context.flag(&criteria.manifest_policy_flag).unwrap_or(true),
            deviation_threshold_miss: context.flag(&criteria.deviation_flag).unwrap_or(true),
        }
    }

    /// Whether the condition behind `code` is failing.
    fn fails(&self, code: ReasonCode) -> bool {
        match code {
            ReasonCode::PreValidationMiss => self.pre_validation_miss,
            ReasonCode::AttestationFailed => !self.attested,
            ReasonCode::ManifestPolicyMiss => self.manifest_policy_miss,
            ReasonCode::DeviationThresholdMiss => self.deviation_threshold_miss,
            // NaN compares false, so a missing metric fails this axiom.
            ReasonCode::UtilityBelowThreshold => !(self.utility >= self.utility_threshold),
        }
    }
}

/// Combines axiom verdicts into a single halt decision.
pub struct AxiomCombinator;

impl AxiomCombinator {
    /// Evaluate every condition, then select the single highest-priority
    /// failing one per `precedence`. All conditions holding yields a pass
    /// with no reason code.
    ///
    /// A failing condition absent from `precedence` still fails the
    /// decision; its reason is chosen by intrinsic priority as a fallback.
    pub fn combine(inputs: &AxiomInputs, precedence: &[ReasonCode]) -> HaltDecision {
        // Exhaustive evaluation first; selection strictly second.
        let failing: Vec<ReasonCode> = DEFAULT_PRECEDENCE
            .iter()
            .copied()
            .filter(|code| inputs.fails(*code))
            .collect();

        if failing.is_empty() {
            return HaltDecision::pass();
        }

        for code in precedence {
            if failing.contains(code) {
                return HaltDecision::halt(*code);
            }
        }

        // Precedence list did not name any failing condition; fall back to
        // intrinsic priority so the decision still fails closed.
        let reason = failing
            .into_iter()
            .min_by_key(|code| code.priority())
            .unwrap_or(ReasonCode::UtilityBelowThreshold);
        HaltDecision::halt(reason)
    }

    /// Resolve criteria against a context and combine under the default
    /// precedence.
    pub fn evaluate(criteria: &AxiomCriteria, context: &EvaluationContext) -> HaltDecision {
        let inputs = AxiomInputs::resolve(criteria, context);
        Self::combine(&inputs, &DEFAULT_PRECEDENCE)
    }
}
