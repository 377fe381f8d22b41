//! Single-check execution: memo consult, kind dispatch, recursion guard.
//!
//! Every failure mode here is recovered into a fail-closed `CheckResult`;
//! nothing below the runner returns an error. Cancellation is observed
//! cooperatively at well-defined checkpoints: before a check starts and
//! after each recursive child batch. Cancelled placeholders are never
//! allowed to persist in the memoization store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use axgate_domain::{
    AxiomCriteria, Check, CheckResult, CheckSpec, Constraint, EvaluationContext, PolicyAction,
};

use crate::axiom::AxiomCombinator;
use crate::memo::MemoStore;
use crate::threshold::ThresholdEvaluator;

/// Detail prefix for results synthesized when the run was cancelled.
/// Such results are discarded by the runner and evicted from the memo store.
pub const CANCELLED_DETAIL: &str = "CANCELLED";

/// Detail prefix for per-check timeout violations.
pub const TIMEOUT_DETAIL: &str = "TIMEOUT";

/// Detail prefix for recursion-guard violations.
pub const RECURSION_DETAIL: &str = "RECURSION_LIMIT_EXCEEDED";

/// Execution limits shared by every check in one run.
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    /// Budget for one check, including memo waits and its whole subtree.
    pub per_check_timeout: Duration,

    /// Maximum recursion depth before evaluation is refused (reported,
    /// not crashed).
    pub max_recursion_depth: usize,

    /// Bound on concurrent child evaluations under a recursive check.
    pub max_concurrency: usize,

    /// Action mandated by a timeout violation. `Halt` makes timeouts
    /// fail-fast.
    pub timeout_action: PolicyAction,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            per_check_timeout: Duration::from_secs(30),
            max_recursion_depth: 32,
            max_concurrency: 4,
            timeout_action: PolicyAction::LogAndProceed,
        }
    }
}

/// Evaluates one check node against one context.
pub struct CheckExecutor {
    memo: Arc<MemoStore>,
    limits: ExecutorLimits,
    cancel: watch::Receiver<bool>,
}

impl CheckExecutor {
    /// Build an executor over a shared memo store and a run-scoped
    /// cancellation signal.
    pub fn new(memo: Arc<MemoStore>, limits: ExecutorLimits, cancel: watch::Receiver<bool>) -> Self {
        Self {
            memo,
            limits,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Evaluate `check` at recursion depth `depth` (0 for root checks).
    pub async fn execute(
        &self,
        check: &Check,
        context: &EvaluationContext,
        depth: usize,
    ) -> CheckResult {
        self.execute_inner(check, context, depth).await
    }

    fn execute_inner<'a>(
        &'a self,
        check: &'a Check,
        context: &'a EvaluationContext,
        depth: usize,
    ) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            if self.cancelled() {
                return CheckResult::violation(
                    &check.check_id,
                    format!("{CANCELLED_DETAIL}: run aborted before this check started"),
                    PolicyAction::SilentDegrade,
                );
            }

            if depth > self.limits.max_recursion_depth {
                return CheckResult::violation(
                    &check.check_id,
                    format!(
                        "{RECURSION_DETAIL}: depth {depth} exceeds limit {}",
                        self.limits.max_recursion_depth
                    ),
                    PolicyAction::Halt,
                );
            }

            let key = MemoStore::canonical_key(check, context);
            let outcome = tokio::time::timeout(
                self.limits.per_check_timeout,
                self.memo
                    .get_or_compute(&key, || self.dispatch(check, context, depth)),
            )
            .await;

            match outcome {
                Ok((result, was_cached)) => {
                    // A result synthesized under cancellation is a
                    // placeholder, not a verdict; evict it so a later run
                    // recomputes.
                    if !was_cached && result.details.starts_with(CANCELLED_DETAIL) {
                        self.memo.invalidate(&key).await;
                    }
                    debug!(
                        check_id = %result.check_id,
                        passed = result.passed,
                        cached = result.cached,
                        "check evaluated"
                    );
                    result
                }
                Err(_) => CheckResult::violation(
                    &check.check_id,
                    format!(
                        "{TIMEOUT_DETAIL}: evaluation exceeded {}ms",
                        self.limits.per_check_timeout.as_millis()
                    ),
                    self.limits.timeout_action,
                ),
            }
        })
    }

    async fn dispatch(
        &self,
        check: &Check,
        context: &EvaluationContext,
        depth: usize,
    ) -> CheckResult {
        match &check.spec {
            CheckSpec::Static { constraint } | CheckSpec::Dynamic { constraint } => {
                threshold_result(&check.check_id, constraint, context)
            }
            CheckSpec::Policy { axioms } => policy_result(&check.check_id, axioms, context),
            CheckSpec::Recursive {
                pass_threshold,
                children,
            } => {
                self.recursive_result(&check.check_id, *pass_threshold, children, context, depth)
                    .await
            }
        }
    }

    /// Evaluate all children concurrently (bounded), then fold their
    /// weighted scores into one verdict. A child whose mandated action is
    /// `Halt` cannot be averaged away: it fails the parent and propagates
    /// the halt.
    async fn recursive_result(
        &self,
        check_id: &str,
        pass_threshold: f64,
        children: &[Check],
        context: &EvaluationContext,
        depth: usize,
    ) -> CheckResult {
        if children.is_empty() {
            return CheckResult::violation(
                check_id,
                "recursive check has no children",
                PolicyAction::Halt,
            );
        }

        let mut child_futures = Vec::with_capacity(children.len());
        for (i, child) in children.iter().enumerate() {
            child_futures.push(async move { (i, self.execute_inner(child, context, depth + 1).await) });
        }
        let mut indexed: Vec<(usize, CheckResult)> = stream::iter(child_futures)
            .buffer_unordered(self.limits.max_concurrency.max(1))
            .collect()
            .await;
        indexed.sort_unstable_by_key(|(i, _)| *i);

        // Checkpoint between child batch and aggregation.
        if self.cancelled() {
            return CheckResult::violation(
                check_id,
                format!("{CANCELLED_DETAIL}: run aborted during child evaluation"),
                PolicyAction::SilentDegrade,
            );
        }

        let mut total_weight = 0.0;
        let mut weighted_score = 0.0;
        let mut child_halted = false;
        let mut failing: Vec<String> = Vec::new();

        for (i, result) in &indexed {
            let weight = children[*i].weight;
            total_weight += weight;
            weighted_score += result.score * weight;
            if result.is_halt() {
                child_halted = true;
            }
            if !result.passed {
                failing.push(result.check_id.clone());
            }
        }

        if total_weight <= 0.0 {
            return CheckResult::violation(
                check_id,
                "recursive check has zero total child weight",
                PolicyAction::Halt,
            );
        }

        let score = weighted_score / total_weight;
        let passed = score >= pass_threshold && !child_halted;

        let action = if child_halted {
            PolicyAction::Halt
        } else if passed {
            PolicyAction::Pass
        } else {
            PolicyAction::LogAndProceed
        };

        let details = if failing.is_empty() {
            format!(
                "weighted score {score:.4} >= threshold {pass_threshold} ({} children)",
                children.len()
            )
        } else {
            format!(
                "weighted score {score:.4} vs threshold {pass_threshold}; failing children: {}",
                failing.join(", ")
            )
        };

        CheckResult::new(check_id, passed, score, action, details)
    }
}

/// Resolve the constraint's metric from the context and evaluate it.
/// A missing or non-numeric metric is a hard breach (fail-closed).
fn threshold_result(
    check_id: &str,
    constraint: &Constraint,
    context: &EvaluationContext,
) -> CheckResult {
    match context.number(&constraint.metric_id) {
        Some(value) => {
            let verdict = ThresholdEvaluator::evaluate(value, constraint);
            CheckResult::new(
                check_id,
                verdict.passed(),
                verdict.score(),
                verdict.action,
                verdict.detail,
            )
        }
        None => CheckResult::violation(
            check_id,
            format!(
                "metric '{}' missing or non-numeric in context; failing closed",
                constraint.metric_id
            ),
            constraint.severity_policy.hard,
        ),
    }
}

/// Run the axiom calculus; any failing axiom mandates an integrity halt.
fn policy_result(
    check_id: &str,
    axioms: &AxiomCriteria,
    context: &EvaluationContext,
) -> CheckResult {
    let decision = AxiomCombinator::evaluate(axioms, context);
    if decision.passed {
        CheckResult::new(check_id, true, 1.0, PolicyAction::Pass, "all axioms hold")
    } else {
        let detail = decision
            .reason
            .map(|r| r.describe().to_string())
            .unwrap_or_else(|| "axiom failure".to_string());
        CheckResult::violation(check_id, detail, PolicyAction::Halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axgate_domain::{ComparisonOp, SeverityPolicy};

    fn constraint(metric: &str, hard: f64) -> Constraint {
        Constraint {
            metric_id: metric.to_string(),
            operator: ComparisonOp::Le,
            hard_bound: hard,
            soft_bound: None,
            severity_policy: SeverityPolicy::default(),
        }
    }

    fn static_check(id: &str, metric: &str, hard: f64) -> Check {
        Check {
            check_id: id.to_string(),
            weight: 1.0,
            context_keys: Vec::new(),
            spec: CheckSpec::Static {
                constraint: constraint(metric, hard),
            },
        }
    }

    fn executor_with(
        limits: ExecutorLimits,
    ) -> (CheckExecutor, Arc<MemoStore>, watch::Sender<bool>) {
        let memo = Arc::new(MemoStore::new(64));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            CheckExecutor::new(Arc::clone(&memo), limits, cancel_rx),
            memo,
            cancel_tx,
        )
    }

    fn executor() -> (CheckExecutor, Arc<MemoStore>, watch::Sender<bool>) {
        executor_with(ExecutorLimits {
            per_check_timeout: Duration::from_secs(5),
            ..ExecutorLimits::default()
        })
    }

    #[tokio::test]
    async fn test_static_check_passes() {
        let (exec, _, _tx) = executor();
        let ctx = EvaluationContext::new().with_number("latency_ms", 100.0);

        let result = exec
            .execute(&static_check("lat", "latency_ms", 1000.0), &ctx, 0)
            .await;
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert!(!result.cached);
    }

    #[tokio::test]
    async fn test_missing_metric_fails_closed() {
        let (exec, _, _tx) = executor();
        let result = exec
            .execute(
                &static_check("lat", "latency_ms", 1000.0),
                &EvaluationContext::new(),
                0,
            )
            .await;
        assert!(!result.passed);
        assert!(result.is_halt(), "default hard action is halt");
        assert!(result.details.contains("missing"));
    }

    #[tokio::test]
    async fn test_policy_check_halts_on_veto() {
        let (exec, _, _tx) = executor();
        let check = Check {
            check_id: "finality".to_string(),
            weight: 1.0,
            context_keys: Vec::new(),
            spec: CheckSpec::Policy {
                axioms: AxiomCriteria {
                    utility_metric: "temm".to_string(),
                    utility_threshold: 90.0,
                    attestation_flag: "ecvm".to_string(),
                    pre_validation_flag: "pvlm".to_string(),
                    manifest_policy_flag: "mpam".to_string(),
                    deviation_flag: "adtm".to_string(),
                },
            },
        };
        let ctx = EvaluationContext::new()
            .with_number("temm", 95.0)
            .with_flag("ecvm", true)
            .with_flag("pvlm", true)
            .with_flag("mpam", false)
            .with_flag("adtm", false);

        let result = exec.execute(&check, &ctx, 0).await;
        assert!(!result.passed);
        assert!(result.is_halt());
        assert!(result.details.contains("PVLM"));
    }

    #[tokio::test]
    async fn test_recursive_weighted_aggregation() {
        // Children score 1, 0, 1 with weights 1, 1, 2:
        // (1*1 + 0*1 + 1*2) / 4 = 0.75, passing at threshold 0.6.
        let lenient = SeverityPolicy {
            hard: PolicyAction::LogAndProceed,
            soft: PolicyAction::LogAndProceed,
        };
        let child = |id: &str, metric: &str, weight: f64| Check {
            check_id: id.to_string(),
            weight,
            context_keys: Vec::new(),
            spec: CheckSpec::Static {
                constraint: Constraint {
                    severity_policy: lenient,
                    ..constraint(metric, 100.0)
                },
            },
        };
        let parent = Check {
            check_id: "rollup".to_string(),
            weight: 1.0,
            context_keys: Vec::new(),
            spec: CheckSpec::Recursive {
                pass_threshold: 0.6,
                children: vec![
                    child("c1", "m1", 1.0),
                    child("c2", "m2", 1.0),
                    child("c3", "m3", 2.0),
                ],
            },
        };
        let ctx = EvaluationContext::new()
            .with_number("m1", 50.0) // compliant -> 1.0
            .with_number("m2", 500.0) // hard breach -> 0.0
            .with_number("m3", 50.0); // compliant -> 1.0

        let (exec, _, _tx) = executor();
        let result = exec.execute(&parent, &ctx, 0).await;

        assert!((result.score - 0.75).abs() < 1e-9);
        assert!(result.passed);
        assert!(!result.is_halt());
        assert!(result.details.contains("c2"), "failing child is named");
    }

    #[tokio::test]
    async fn test_recursive_child_halt_propagates() {
        // Default severity: the breached child mandates Halt, which cannot
        // be averaged away even though the weighted score would pass.
        let parent = Check {
            check_id: "rollup".to_string(),
            weight: 1.0,
            context_keys: Vec::new(),
            spec: CheckSpec::Recursive {
                pass_threshold: 0.5,
                children: vec![
                    static_check("ok1", "m1", 100.0),
                    static_check("ok2", "m2", 100.0),
                    static_check("bad", "m3", 100.0),
                ],
            },
        };
        let ctx = EvaluationContext::new()
            .with_number("m1", 10.0)
            .with_number("m2", 10.0)
            .with_number("m3", 500.0);

        let (exec, _, _tx) = executor();
        let result = exec.execute(&parent, &ctx, 0).await;

        assert!(!result.passed);
        assert!(result.is_halt());
    }

    #[tokio::test]
    async fn test_depth_guard_reports_violation() {
        let (exec, _, _tx) = executor();
        let ctx = EvaluationContext::new().with_number("m1", 1.0);
        let check = static_check("deep", "m1", 100.0);

        let result = exec.execute(&check, &ctx, 33).await;
        assert!(!result.passed);
        assert!(result.details.starts_with(RECURSION_DETAIL));
        assert!(result.is_halt());
    }

    #[tokio::test]
    async fn test_nested_tree_beyond_depth_limit_fails_closed() {
        let leaf = static_check("leaf", "m1", 100.0);
        let mut tree = leaf;
        for level in 0..4 {
            tree = Check {
                check_id: format!("level-{level}"),
                weight: 1.0,
                context_keys: Vec::new(),
                spec: CheckSpec::Recursive {
                    pass_threshold: 0.5,
                    children: vec![tree],
                },
            };
        }

        let (exec, _, _tx) = executor_with(ExecutorLimits {
            max_recursion_depth: 2,
            per_check_timeout: Duration::from_secs(5),
            ..ExecutorLimits::default()
        });
        let ctx = EvaluationContext::new().with_number("m1", 1.0);

        let result = exec.execute(&tree, &ctx, 0).await;
        assert!(!result.passed);
        assert!(result.is_halt(), "depth violation propagates as halt");
    }

    #[tokio::test]
    async fn test_second_execution_is_cached() {
        let (exec, _, _tx) = executor();
        let ctx = EvaluationContext::new().with_number("latency_ms", 100.0);
        let check = static_check("lat", "latency_ms", 1000.0);

        let first = exec.execute(&check, &ctx, 0).await;
        let second = exec.execute(&check, &ctx, 0).await;

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.passed, second.passed);
        assert_eq!(first.score, second.score);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_not_memoized() {
        let (exec, memo, tx) = executor();
        let ctx = EvaluationContext::new().with_number("latency_ms", 100.0);
        let check = static_check("lat", "latency_ms", 1000.0);

        tx.send(true).unwrap();
        let cancelled = exec.execute(&check, &ctx, 0).await;
        assert!(cancelled.details.starts_with(CANCELLED_DETAIL));
        assert_eq!(memo.len().await, 0, "cancel checkpoint precedes the store");

        // A fresh, uncancelled executor over the same store computes cleanly.
        let (_, fresh_rx) = watch::channel(false);
        let fresh = CheckExecutor::new(
            memo,
            ExecutorLimits {
                per_check_timeout: Duration::from_secs(5),
                ..ExecutorLimits::default()
            },
            fresh_rx,
        );
        let result = fresh.execute(&check, &ctx, 0).await;
        assert!(result.passed);
        assert!(!result.cached);
    }

    #[tokio::test]
    async fn test_timeout_fails_closed() {
        let (exec, memo, _tx) = executor_with(ExecutorLimits {
            per_check_timeout: Duration::from_millis(50),
            timeout_action: PolicyAction::Halt,
            ..ExecutorLimits::default()
        });
        let ctx = EvaluationContext::new().with_number("latency_ms", 100.0);
        let check = static_check("lat", "latency_ms", 1000.0);

        // Occupy the check's memo slot with a computation that never
        // finishes, so the executor blocks on single-flight resolution.
        let key = MemoStore::canonical_key(&check, &ctx);
        let blocker = {
            let memo = Arc::clone(&memo);
            tokio::spawn(async move {
                memo.get_or_compute(&key, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    CheckResult::new("lat", true, 1.0, PolicyAction::Pass, "late")
                })
                .await
            })
        };
        // Let the blocker claim the slot first.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = exec.execute(&check, &ctx, 0).await;
        assert!(!result.passed);
        assert!(result.details.starts_with(TIMEOUT_DETAIL));
        assert!(result.is_halt(), "timeout action was configured to halt");

        blocker.abort();
    }
}
