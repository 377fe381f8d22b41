//! Gating domain schema definitions
//!
//! The manifest is a declarative tree of checks. Check criteria are a tagged
//! sum type, so "a recursive check has children, an atomic check does not"
//! is structural rather than a runtime convention. Criteria carry their own
//! SHA256 digests for memoization identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{GatingError, Result};

// ============================================================================
// 1. POLICY ACTIONS AND COMPLIANCE STATUS
// ============================================================================

/// Mandated action reported alongside a verdict.
///
/// The engine never executes these itself; an external enforcement
/// component decides what a `Halt` actually does to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Pass,
    LogAndProceed,
    SilentDegrade,
    Halt,
}

impl PolicyAction {
    /// Whether this action triggers fail-fast in the runner.
    pub fn is_halt(&self) -> bool {
        matches!(self, PolicyAction::Halt)
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyAction::Pass => write!(f, "pass"),
            PolicyAction::LogAndProceed => write!(f, "log_and_proceed"),
            PolicyAction::SilentDegrade => write!(f, "silent_degrade"),
            PolicyAction::Halt => write!(f, "halt"),
        }
    }
}

/// Compliance severity of a threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    SoftBreach,
    HardBreach,
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceStatus::Compliant => write!(f, "compliant"),
            ComplianceStatus::SoftBreach => write!(f, "soft_breach"),
            ComplianceStatus::HardBreach => write!(f, "hard_breach"),
        }
    }
}

// ============================================================================
// 2. CONSTRAINTS
// ============================================================================

/// Numeric comparison operator for constraints.
///
/// An unsupported operator string fails manifest deserialization, which is
/// where configuration errors belong - not mid-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl ComparisonOp {
    /// Whether `value op bound` holds.
    pub fn holds(&self, value: f64, bound: f64) -> bool {
        match self {
            ComparisonOp::Gt => value > bound,
            ComparisonOp::Lt => value < bound,
            ComparisonOp::Ge => value >= bound,
            ComparisonOp::Le => value <= bound,
            ComparisonOp::Eq => value == bound,
        }
    }

    /// The operator's source symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Gt => ">",
            ComparisonOp::Lt => "<",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Le => "<=",
            ComparisonOp::Eq => "==",
        }
    }
}

/// Mandated actions per breach severity.
///
/// Setting `soft` to `Halt` opts this one constraint into soft-triggered
/// fail-fast; there is no global soft-halt rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityPolicy {
    #[serde(default = "default_hard_action")]
    pub hard: PolicyAction,

    #[serde(default = "default_soft_action")]
    pub soft: PolicyAction,
}

fn default_hard_action() -> PolicyAction {
    PolicyAction::Halt
}

fn default_soft_action() -> PolicyAction {
    PolicyAction::LogAndProceed
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            hard: default_hard_action(),
            soft: default_soft_action(),
        }
    }
}

/// A single threshold constraint over one observed metric.
///
/// The hard bound strictly dominates the soft bound: a value violating
/// `hard_bound` is always a hard breach, even if it also violates
/// `soft_bound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Context key holding the observed value.
    pub metric_id: String,

    /// Comparison the value must satisfy against each bound.
    pub operator: ComparisonOp,

    /// Bound whose violation is a hard breach.
    pub hard_bound: f64,

    /// Optional stricter bound whose violation (with the hard bound
    /// satisfied) is a soft breach.
    #[serde(default)]
    pub soft_bound: Option<f64>,

    /// Mandated actions per severity.
    #[serde(default)]
    pub severity_policy: SeverityPolicy,
}

// ============================================================================
// 3. AXIOM CRITERIA (policy checks)
// ============================================================================

/// Context bindings for a policy check's axiom calculus.
///
/// Names the context keys feeding each axiom: the utility metric and its
/// threshold (Axiom I), the attestation flag (Axiom II), and the three
/// integrity veto flags (Axiom III).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxiomCriteria {
    /// Context key for the observed utility metric.
    pub utility_metric: String,

    /// Minimum utility required for Axiom I to hold.
    pub utility_threshold: f64,

    /// Context key for the execution-context attestation flag.
    pub attestation_flag: String,

    /// Context key for the PVLM veto (pre-validation logic miss).
    pub pre_validation_flag: String,

    /// Context key for the MPAM veto (manifest policy axiom miss).
    pub manifest_policy_flag: String,

    /// Context key for the ADTM veto (axiomatic deviation threshold miss).
    pub deviation_flag: String,
}

impl AxiomCriteria {
    /// All context keys this criteria reads, for memoization scoping.
    pub fn context_keys(&self) -> Vec<&str> {
        vec![
            self.utility_metric.as_str(),
            self.attestation_flag.as_str(),
            self.pre_validation_flag.as_str(),
            self.manifest_policy_flag.as_str(),
            self.deviation_flag.as_str(),
        ]
    }
}

// ============================================================================
// 4. HALT REASONS
// ============================================================================

/// Reason codes for a failed axiom decision, in fixed precedence order.
///
/// When several conditions fail at once, the single highest-priority one is
/// reported: PVLM outranks a failed attestation, which outranks MPAM, which
/// outranks ADTM, which outranks a plain utility-threshold miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PreValidationMiss,
    AttestationFailed,
    ManifestPolicyMiss,
    DeviationThresholdMiss,
    UtilityBelowThreshold,
}

/// Fixed reason precedence, highest priority first.
pub const DEFAULT_PRECEDENCE: [ReasonCode; 5] = [
    ReasonCode::PreValidationMiss,
    ReasonCode::AttestationFailed,
    ReasonCode::ManifestPolicyMiss,
    ReasonCode::DeviationThresholdMiss,
    ReasonCode::UtilityBelowThreshold,
];

impl ReasonCode {
    /// Numeric priority, 0 = highest.
    pub fn priority(&self) -> u8 {
        match self {
            ReasonCode::PreValidationMiss => 0,
            ReasonCode::AttestationFailed => 1,
            ReasonCode::ManifestPolicyMiss => 2,
            ReasonCode::DeviationThresholdMiss => 3,
            ReasonCode::UtilityBelowThreshold => 4,
        }
    }

    /// Human-readable description carried into result details.
    pub fn describe(&self) -> &'static str {
        match self {
            ReasonCode::PreValidationMiss => "PVLM: pre-validation logic miss",
            ReasonCode::AttestationFailed => "ECVM: execution context attestation failed",
            ReasonCode::ManifestPolicyMiss => "MPAM: manifest policy axiom miss",
            ReasonCode::DeviationThresholdMiss => "ADTM: axiomatic deviation threshold miss",
            ReasonCode::UtilityBelowThreshold => "utility metric below required threshold",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Deterministic pass/fail decision from one axiom combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaltDecision {
    /// Whether every axiom held.
    pub passed: bool,

    /// Highest-priority failing condition, when `passed` is false.
    pub reason: Option<ReasonCode>,

    /// Priority of `reason`; `u8::MAX` when passed.
    pub priority: u8,
}

impl HaltDecision {
    /// An all-axioms-hold decision.
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            priority: u8::MAX,
        }
    }

    /// A failed decision with its selected reason.
    pub fn halt(reason: ReasonCode) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            priority: reason.priority(),
        }
    }
}

// ============================================================================
// 5. CHECKS AND MANIFESTS
// ============================================================================

/// Check criteria, dispatched exhaustively by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckSpec {
    /// Snapshot metric compared against a constraint.
    Static { constraint: Constraint },

    /// Live metric compared against a constraint. Memoization keys on the
    /// metric's current value, so a refreshed context re-evaluates it.
    Dynamic { constraint: Constraint },

    /// Axiom calculus over named context flags and metrics.
    Policy { axioms: AxiomCriteria },

    /// Weighted aggregation over child checks.
    Recursive {
        pass_threshold: f64,
        children: Vec<Check>,
    },
}

impl CheckSpec {
    /// The kind tag as a string, for logs and details.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CheckSpec::Static { .. } => "static",
            CheckSpec::Dynamic { .. } => "dynamic",
            CheckSpec::Policy { .. } => "policy",
            CheckSpec::Recursive { .. } => "recursive",
        }
    }
}

/// A single named unit of evaluation within a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Unique id within the manifest (including nested children).
    pub check_id: String,

    /// Aggregation weight when nested under a recursive check.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Explicit memoization scope: the context keys this check reads.
    /// Empty means "derive from the check kind".
    #[serde(default)]
    pub context_keys: Vec<String>,

    #[serde(flatten)]
    pub spec: CheckSpec,
}

fn default_weight() -> f64 {
    1.0
}

impl Check {
    /// SHA256 digest of the serialized criteria (for a recursive check this
    /// covers the whole subtree). Part of the memoization key identity.
    pub fn criteria_digest(&self) -> String {
        // Serialization of these types cannot realistically fail; if it
        // ever does, the error text still feeds the digest so distinct
        // specs cannot silently collapse onto one key.
        let serialized = serde_json::to_string(&self.spec).unwrap_or_else(|e| {
            debug_assert!(false, "check spec failed to serialize: {e}");
            format!("!unserializable:{e}")
        });
        let mut hasher = Sha256::new();
        hasher.update(self.check_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The context keys that participate in this check's memoization key.
    ///
    /// An explicit `context_keys` list wins. Otherwise: a dynamic check keys
    /// on its metric, a policy check on its named flags and metrics, and
    /// static/recursive checks on criteria alone.
    pub fn memo_context_keys(&self) -> Vec<&str> {
        if !self.context_keys.is_empty() {
            return self.context_keys.iter().map(String::as_str).collect();
        }
        match &self.spec {
            CheckSpec::Dynamic { constraint } => vec![constraint.metric_id.as_str()],
            CheckSpec::Policy { axioms } => axioms.context_keys(),
            CheckSpec::Static { .. } | CheckSpec::Recursive { .. } => Vec::new(),
        }
    }
}

/// The declarative tree of checks for one gating run.
///
/// Loaded and schema-validated externally; the engine borrows it read-only
/// for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest identity.
    pub id: String,

    /// Manifest revision.
    pub version: String,

    /// Root checks, evaluated in declaration order.
    pub checks: Vec<Check>,
}

impl Manifest {
    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Structural validation: non-empty check list, unique ids across the
    /// whole tree, non-negative finite weights, recursive checks with at
    /// least one child and a pass threshold inside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.checks.is_empty() {
            return Err(GatingError::EmptyManifest(self.id.clone()));
        }

        let mut seen = HashSet::new();
        for check in &self.checks {
            validate_check(check, &mut seen)?;
        }
        debug!(
            manifest_id = %self.id,
            version = %self.version,
            checks = seen.len(),
            "manifest validated"
        );
        Ok(())
    }
}

fn validate_check(check: &Check, seen: &mut HashSet<String>) -> Result<()> {
    if !seen.insert(check.check_id.clone()) {
        return Err(GatingError::DuplicateCheckId(check.check_id.clone()));
    }

    if !check.weight.is_finite() || check.weight < 0.0 {
        return Err(GatingError::InvalidWeight {
            check_id: check.check_id.clone(),
            weight: check.weight,
        });
    }

    if let CheckSpec::Recursive {
        pass_threshold,
        children,
    } = &check.spec
    {
        if children.is_empty() {
            return Err(GatingError::EmptyRecursiveCheck(check.check_id.clone()));
        }
        if !pass_threshold.is_finite() || !(0.0..=1.0).contains(pass_threshold) {
            return Err(GatingError::InvalidPassThreshold {
                check_id: check.check_id.clone(),
                threshold: *pass_threshold,
            });
        }
        for child in children {
            validate_check(child, seen)?;
        }
    }
    Ok(())
}

// ============================================================================
// 6. CHECK RESULTS
// ============================================================================

/// Outcome of evaluating one check against one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Id of the evaluated check.
    pub check_id: String,

    /// Overall pass/fail.
    pub passed: bool,

    /// Normalized score in [0, 1].
    pub score: f64,

    /// Action mandated by the verdict; `Halt` triggers fail-fast.
    pub mandated_action: PolicyAction,

    /// Human-readable verdict detail.
    pub details: String,

    /// When this result was computed.
    pub timestamp: DateTime<Utc>,

    /// Whether this result came from the memoization store.
    pub cached: bool,
}

impl CheckResult {
    /// Build a freshly computed result.
    pub fn new(
        check_id: impl Into<String>,
        passed: bool,
        score: f64,
        mandated_action: PolicyAction,
        details: impl Into<String>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            passed,
            score: score.clamp(0.0, 1.0),
            mandated_action,
            details: details.into(),
            timestamp: Utc::now(),
            cached: false,
        }
    }

    /// Build a fail-closed violation result (score 0).
    pub fn violation(
        check_id: impl Into<String>,
        details: impl Into<String>,
        mandated_action: PolicyAction,
    ) -> Self {
        Self::new(check_id, false, 0.0, mandated_action, details)
    }

    /// Mark this result as served from cache.
    pub fn as_cached(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Whether this result triggers fail-fast.
    pub fn is_halt(&self) -> bool {
        self.mandated_action.is_halt()
    }
}
