//! Gating run orchestration: bounded concurrency, ordered aggregation,
//! fail-fast cancellation.
//!
//! Root checks are spawned as independently cancellable tasks gated by a
//! semaphore. Results are placed by manifest index, never appended in
//! completion order, so the output order always matches the manifest
//! regardless of scheduling. A worker that computes a halt-class result
//! sets the shared cancellation signal before releasing its permit, so no
//! later check can start in the window before the runner observes the
//! halt; in-flight checks are then aborted and already-completed siblings
//! preserved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use axgate_domain::{
    CheckResult, EvaluationContext, GatingError, Manifest, PolicyAction, Result,
};

use crate::executor::{CheckExecutor, ExecutorLimits, CANCELLED_DETAIL};
use crate::memo::MemoStore;

/// Options for one gating run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum concurrently-evaluating root checks (>= 1).
    pub max_concurrency: usize,

    /// Budget per check, subtree included (> 0).
    pub per_check_timeout: Duration,

    /// Recursion depth guard.
    pub max_recursion_depth: usize,

    /// Action mandated by timeout violations.
    pub timeout_action: PolicyAction,

    /// Memoization store capacity.
    pub memo_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            per_check_timeout: Duration::from_secs(30),
            max_recursion_depth: 32,
            timeout_action: PolicyAction::LogAndProceed,
            memo_capacity: 1024,
        }
    }
}

impl RunOptions {
    fn validate(&self) -> Result<()> {
        if self.max_concurrency < 1 {
            return Err(GatingError::InvalidOptions(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.per_check_timeout.is_zero() {
            return Err(GatingError::InvalidOptions(
                "per_check_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            per_check_timeout: self.per_check_timeout,
            max_recursion_depth: self.max_recursion_depth,
            max_concurrency: self.max_concurrency,
            timeout_action: self.timeout_action,
        }
    }
}

/// Outcome of one complete gating run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identity.
    pub run_id: Uuid,

    /// Manifest that was evaluated.
    pub manifest_id: String,

    /// Manifest revision.
    pub manifest_version: String,

    /// Results in manifest declaration order. Partial when halted.
    pub results: Vec<CheckResult>,

    /// Id of the check whose halt-class result stopped the run early.
    pub halted_at: Option<String>,

    /// Whether the run completed with every check passing.
    pub passed: bool,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Total wall-clock duration.
    pub duration_ms: u64,
}

impl RunReport {
    /// Number of checks that passed.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Number of checks that failed.
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    /// Whether the run stopped early on a halt-class result.
    pub fn halted(&self) -> bool {
        self.halted_at.is_some()
    }
}

/// Orchestrates execution of a manifest's root checks.
///
/// The memoization store is scoped to the runner and shared across its
/// runs, so an identical `(check, context slice)` pair evaluated in a
/// later run is served from cache.
pub struct GatingRunner {
    options: RunOptions,
    memo: Arc<MemoStore>,
}

impl GatingRunner {
    /// Create a runner. Fails on structurally invalid options.
    pub fn new(options: RunOptions) -> Result<Self> {
        options.validate()?;
        let memo = Arc::new(MemoStore::new(options.memo_capacity));
        Ok(Self { options, memo })
    }

    /// Handle to the runner's memoization store (e.g. to pre-warm it or to
    /// share it with another runner).
    pub fn memo_store(&self) -> Arc<MemoStore> {
        Arc::clone(&self.memo)
    }

    /// Evaluate every root check of `manifest` against `context`.
    ///
    /// Returns a report whose `results` follow manifest order. Only a
    /// structurally broken manifest is an error; per-check failures are
    /// results. On a halt-class result the report is partial and
    /// `halted_at` names the offending check.
    pub async fn run(
        &self,
        manifest: &Manifest,
        context: &EvaluationContext,
    ) -> Result<RunReport> {
        manifest.validate()?;

        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let total = manifest.checks.len();

        info!(
            run_id = %run_id,
            manifest_id = %manifest.id,
            checks = total,
            max_concurrency = self.options.max_concurrency,
            "starting gating run"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let executor = Arc::new(CheckExecutor::new(
            Arc::clone(&self.memo),
            self.options.limits(),
            cancel_rx,
        ));
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency));
        let context = Arc::new(context.clone());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, CheckResult)>();

        let mut handles = Vec::with_capacity(total);
        for (idx, check) in manifest.checks.iter().enumerate() {
            let check = check.clone();
            let executor = Arc::clone(&executor);
            let semaphore = Arc::clone(&semaphore);
            let context = Arc::clone(&context);
            let tx = result_tx.clone();
            let cancel_tx = Arc::clone(&cancel_tx);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = executor.execute(&check, &context, 0).await;
                // Signal before this task's permit is released, so the
                // next queued check observes the halt at its cancellation
                // checkpoint instead of slipping through while the runner
                // is still dequeuing this result.
                if result.is_halt() {
                    let _ = cancel_tx.send(true);
                }
                let _ = tx.send((idx, result));
            }));
        }
        drop(result_tx);

        let mut slots: Vec<Option<CheckResult>> = vec![None; total];
        let mut received = 0;
        let mut halted_at: Option<String> = None;

        while received < total {
            match result_rx.recv().await {
                Some((idx, result)) => {
                    received += 1;
                    let is_halt = result.is_halt();
                    let check_id = result.check_id.clone();
                    slots[idx] = Some(result);

                    if is_halt {
                        warn!(check_id = %check_id, "halt-class result, failing fast");
                        let _ = cancel_tx.send(true);
                        halted_at = Some(check_id);
                        break;
                    }
                }
                None => break,
            }
        }

        if halted_at.is_some() {
            // Best-effort cancellation: abandon in-flight work, but keep
            // siblings that had already completed before the halt landed.
            for handle in &handles {
                handle.abort();
            }
            while let Ok((idx, result)) = result_rx.try_recv() {
                if !result.details.starts_with(CANCELLED_DETAIL) {
                    slots[idx] = Some(result);
                }
            }
        } else {
            // A task that ended without reporting panicked; fail closed.
            for (idx, handle) in handles.into_iter().enumerate() {
                if let Err(join_err) = handle.await {
                    if slots[idx].is_none() {
                        slots[idx] = Some(CheckResult::violation(
                            manifest.checks[idx].check_id.clone(),
                            format!("evaluation task failed: {join_err}"),
                            PolicyAction::Halt,
                        ));
                    }
                }
            }
        }

        let results: Vec<CheckResult> = slots.into_iter().flatten().collect();
        let passed = halted_at.is_none() && results.iter().all(|r| r.passed);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            passed,
            halted = halted_at.is_some(),
            results = results.len(),
            duration_ms,
            "gating run finished"
        );

        Ok(RunReport {
            run_id,
            manifest_id: manifest.id.clone(),
            manifest_version: manifest.version.clone(),
            results,
            halted_at,
            passed,
            started_at,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axgate_domain::{Check, CheckSpec, ComparisonOp, Constraint, SeverityPolicy};

    fn le_check(id: &str, metric: &str, hard: f64) -> Check {
        Check {
            check_id: id.to_string(),
            weight: 1.0,
            context_keys: Vec::new(),
            spec: CheckSpec::Static {
                constraint: Constraint {
                    metric_id: metric.to_string(),
                    operator: ComparisonOp::Le,
                    hard_bound: hard,
                    soft_bound: None,
                    severity_policy: SeverityPolicy::default(),
                },
            },
        }
    }

    fn manifest(checks: Vec<Check>) -> Manifest {
        Manifest {
            id: "m-test".to_string(),
            version: "1".to_string(),
            checks,
        }
    }

    fn runner(max_concurrency: usize) -> GatingRunner {
        GatingRunner::new(RunOptions {
            max_concurrency,
            per_check_timeout: Duration::from_secs(5),
            ..RunOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_results_follow_manifest_order() {
        let checks: Vec<Check> = (0..8)
            .map(|i| le_check(&format!("check-{i}"), "m", 100.0))
            .collect();
        let m = manifest(checks);
        let ctx = EvaluationContext::new().with_number("m", 1.0);

        let report = runner(3).run(&m, &ctx).await.unwrap();

        assert_eq!(report.results.len(), 8);
        for (i, result) in report.results.iter().enumerate() {
            assert_eq!(result.check_id, format!("check-{i}"));
        }
        assert!(report.passed);
        assert!(!report.halted());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_scheduling() {
        // Five checks, sequential execution; #2 hard-breaches and halts.
        let m = manifest(vec![
            le_check("check-1", "ok", 100.0),
            le_check("check-2", "bad", 100.0),
            le_check("check-3", "ok", 100.0),
            le_check("check-4", "ok", 100.0),
            le_check("check-5", "ok", 100.0),
        ]);
        let ctx = EvaluationContext::new()
            .with_number("ok", 1.0)
            .with_number("bad", 500.0);

        let r = runner(1);
        let report = r.run(&m, &ctx).await.unwrap();

        assert_eq!(report.results.len(), 2, "only #1 and #2 produced results");
        assert_eq!(report.halted_at.as_deref(), Some("check-2"));
        assert!(!report.passed);

        // Checks #3..#5 never started, so nothing was memoized for them.
        assert_eq!(r.memo_store().len().await, 2);
    }

    #[tokio::test]
    async fn test_halt_blocks_next_queued_check_from_executing() {
        // Sequential halt at the first check: the queued successors must
        // be stopped at their cancellation checkpoints, not evaluated in
        // the window between the halting worker finishing and the runner
        // dequeuing its result.
        let m = manifest(vec![
            le_check("first", "bad", 100.0),
            le_check("second", "ok", 100.0),
            le_check("third", "ok", 100.0),
        ]);
        let ctx = EvaluationContext::new()
            .with_number("ok", 1.0)
            .with_number("bad", 500.0);

        let r = runner(1);
        let report = r.run(&m, &ctx).await.unwrap();

        assert_eq!(report.halted_at.as_deref(), Some("first"));
        assert_eq!(report.results.len(), 1, "no successor produced a result");
        assert_eq!(
            r.memo_store().len().await,
            1,
            "queued checks were never evaluated"
        );
    }

    #[tokio::test]
    async fn test_empty_manifest_is_an_error() {
        let m = manifest(vec![]);
        let err = runner(1).run(&m, &EvaluationContext::new()).await;
        assert!(matches!(err, Err(GatingError::EmptyManifest(_))));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let zero_conc = GatingRunner::new(RunOptions {
            max_concurrency: 0,
            ..RunOptions::default()
        });
        assert!(matches!(zero_conc, Err(GatingError::InvalidOptions(_))));

        let zero_timeout = GatingRunner::new(RunOptions {
            per_check_timeout: Duration::ZERO,
            ..RunOptions::default()
        });
        assert!(matches!(zero_timeout, Err(GatingError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let m = manifest(vec![
            le_check("a", "m", 100.0),
            le_check("b", "m", 100.0),
        ]);
        let ctx = EvaluationContext::new().with_number("m", 1.0);
        let r = runner(2);

        let first = r.run(&m, &ctx).await.unwrap();
        let second = r.run(&m, &ctx).await.unwrap();

        assert!(first.results.iter().all(|res| !res.cached));
        assert!(second.results.iter().all(|res| res.cached));
        for (a, b) in first.results.iter().zip(&second.results) {
            assert_eq!(a.passed, b.passed);
            assert_eq!(a.score, b.score);
        }
    }

    #[tokio::test]
    async fn test_soft_halt_opt_in_triggers_fail_fast() {
        let mut check = le_check("latency", "latency_ms", 1000.0);
        if let CheckSpec::Static { constraint } = &mut check.spec {
            constraint.soft_bound = Some(500.0);
            constraint.severity_policy.soft = PolicyAction::Halt;
        }
        let m = manifest(vec![check, le_check("after", "ok", 100.0)]);
        let ctx = EvaluationContext::new()
            .with_number("latency_ms", 700.0) // soft band only
            .with_number("ok", 1.0);

        let report = runner(1).run(&m, &ctx).await.unwrap();
        assert_eq!(report.halted_at.as_deref(), Some("latency"));
        assert_eq!(report.results.len(), 1);
    }

    #[tokio::test]
    async fn test_refreshed_context_reevaluates_dynamic_checks() {
        let check = Check {
            spec: CheckSpec::Dynamic {
                constraint: Constraint {
                    metric_id: "latency_ms".to_string(),
                    operator: ComparisonOp::Le,
                    hard_bound: 100.0,
                    soft_bound: None,
                    severity_policy: SeverityPolicy::default(),
                },
            },
            ..le_check("latency", "latency_ms", 100.0)
        };
        let m = manifest(vec![check]);
        let r = runner(1);

        let degraded = EvaluationContext::new().with_number("latency_ms", 500.0);
        let report = r.run(&m, &degraded).await.unwrap();
        assert!(!report.passed);

        // A refreshed context is a new run with a new memo identity.
        let recovered = EvaluationContext::new().with_number("latency_ms", 50.0);
        let report = r.run(&m, &recovered).await.unwrap();
        assert!(report.passed);
        assert!(!report.results[0].cached);
    }

    #[tokio::test]
    async fn test_report_counts() {
        let lenient = SeverityPolicy {
            hard: PolicyAction::LogAndProceed,
            soft: PolicyAction::LogAndProceed,
        };
        let mut failing = le_check("bad", "bad", 100.0);
        if let CheckSpec::Static { constraint } = &mut failing.spec {
            constraint.severity_policy = lenient;
        }
        let m = manifest(vec![le_check("good", "ok", 100.0), failing]);
        let ctx = EvaluationContext::new()
            .with_number("ok", 1.0)
            .with_number("bad", 500.0);

        let report = runner(2).run(&m, &ctx).await.unwrap();
        assert_eq!(report.passed_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert!(!report.passed);
        assert!(!report.halted(), "lenient breach does not fail fast");
    }
}
