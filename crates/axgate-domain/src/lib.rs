//! axgate Gating Domain Model
//!
//! Defines the declarative gating vocabulary shared by the engine and its
//! callers:
//! - Manifest: the tree of named checks for one gating run
//! - Check / CheckSpec: a single unit of evaluation (static, dynamic,
//!   policy, recursive), dispatched exhaustively by kind
//! - Constraint: one threshold with hard/soft bounds and per-severity
//!   mandated actions
//! - EvaluationContext: immutable runtime inputs for one run
//! - CheckResult / HaltDecision / PolicyAction: reported verdicts; the
//!   engine never executes actions itself
//!
//! Per-check failures are never errors: the engine recovers them into
//! fail-closed `CheckResult`s. `GatingError` covers only structurally
//! broken manifests, where no partial result would be meaningful.

pub mod context;
pub mod error;
pub mod schema;

pub use context::{ContextValue, EvaluationContext};
pub use error::{GatingError, Result};
pub use schema::{
    AxiomCriteria, Check, CheckResult, CheckSpec, ComparisonOp, ComplianceStatus, Constraint,
    HaltDecision, Manifest, PolicyAction, ReasonCode, SeverityPolicy, DEFAULT_PRECEDENCE,
};

/// axgate domain version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
