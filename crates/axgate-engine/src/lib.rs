//! axgate-engine - policy gating evaluation engine
//!
//! Evaluates a manifest of gating checks against an evaluation context:
//! - Threshold verdicts with hard/soft bounds and configurable severity
//! - Axiom combination with precedence-ordered halt reasons
//! - Memoized, single-flight check execution with timeouts and a
//!   recursion depth guard
//! - Concurrency-bounded runs with manifest-ordered results and
//!   fail-fast halting

pub mod axiom;
pub mod executor;
pub mod memo;
pub mod runner;
pub mod telemetry;
pub mod threshold;

// Re-export key types
pub use axiom::{AxiomCombinator, AxiomInputs};
pub use executor::{CheckExecutor, ExecutorLimits};
pub use memo::MemoStore;
pub use runner::{GatingRunner, RunOptions, RunReport};
pub use threshold::{ThresholdEvaluator, ThresholdVerdict};

/// Engine crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
