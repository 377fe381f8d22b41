//! axgate - manifest-driven policy gating from the command line
//!
//! ## Commands
//!
//! - `run`: evaluate a manifest against a context and report the verdict
//! - `validate`: structurally check a manifest without evaluating it
//!
//! Exit codes: 0 when every check passes, 1 when checks fail without a
//! halt, 2 when the run halted early, and the usual error exit on
//! configuration or I/O problems.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use axgate_domain::{EvaluationContext, Manifest, PolicyAction};
use axgate_engine::{telemetry, GatingRunner, RunOptions, RunReport};

#[derive(Parser)]
#[command(name = "axgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Axiomatic policy gating engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a manifest against an evaluation context
    Run {
        /// Path to the manifest JSON file
        #[arg(short, long)]
        manifest: PathBuf,

        /// Path to the context JSON file (an object of metrics and flags)
        #[arg(short, long)]
        context: Option<PathBuf>,

        /// Maximum concurrently-evaluating root checks
        #[arg(long, default_value = "4", env = "AXGATE_CONCURRENCY")]
        concurrency: usize,

        /// Per-check timeout in milliseconds
        #[arg(long, default_value = "30000", env = "AXGATE_TIMEOUT_MS")]
        timeout_ms: u64,

        /// Recursion depth limit for nested checks
        #[arg(long, default_value = "32")]
        max_depth: usize,

        /// Treat a per-check timeout as a halting violation
        #[arg(long)]
        timeout_halts: bool,

        /// Memoization store capacity
        #[arg(long, default_value = "1024")]
        memo_capacity: usize,

        /// Print the full run report as JSON instead of a summary
        #[arg(long)]
        report_json: bool,
    },

    /// Structurally validate a manifest without evaluating it
    Validate {
        /// Path to the manifest JSON file
        #[arg(short, long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.verbose, cli.json);

    let code = match cli.command {
        Commands::Run {
            manifest,
            context,
            concurrency,
            timeout_ms,
            max_depth,
            timeout_halts,
            memo_capacity,
            report_json,
        } => {
            let options = RunOptions {
                max_concurrency: concurrency,
                per_check_timeout: Duration::from_millis(timeout_ms),
                max_recursion_depth: max_depth,
                timeout_action: if timeout_halts {
                    PolicyAction::Halt
                } else {
                    PolicyAction::LogAndProceed
                },
                memo_capacity,
            };
            cmd_run(&manifest, context.as_deref(), options, report_json).await?
        }
        Commands::Validate { manifest } => cmd_validate(&manifest)?,
    };

    std::process::exit(code);
}

async fn cmd_run(
    manifest_path: &Path,
    context_path: Option<&Path>,
    options: RunOptions,
    report_json: bool,
) -> Result<i32> {
    let manifest = load_manifest(manifest_path)?;
    let context = match context_path {
        Some(path) => load_context(path)?,
        None => EvaluationContext::new(),
    };

    let runner = GatingRunner::new(options)?;
    let report = runner.run(&manifest, &context).await?;

    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    info!(
        run_id = %report.run_id,
        passed = report.passed,
        halted = report.halted(),
        "gating run complete"
    );

    Ok(exit_code(&report))
}

fn cmd_validate(manifest_path: &Path) -> Result<i32> {
    let manifest = load_manifest(manifest_path)?;
    println!(
        "Manifest '{}' (version {}) is valid: {} root check(s)",
        manifest.id,
        manifest.version,
        manifest.checks.len()
    );
    Ok(0)
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
    let manifest = Manifest::from_json(&raw)
        .with_context(|| format!("Invalid manifest: {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("Manifest failed validation: {}", path.display()))?;
    Ok(manifest)
}

fn load_context(path: &Path) -> Result<EvaluationContext> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid context file: {}", path.display()))
}

fn print_summary(report: &RunReport) {
    println!(
        "Gating run {} on manifest '{}' (version {})",
        report.run_id, report.manifest_id, report.manifest_version
    );
    for result in &report.results {
        let marker = if result.passed { "PASS" } else { "FAIL" };
        let cached = if result.cached { " (cached)" } else { "" };
        println!(
            "  [{marker}] {} score={:.2}{cached} - {}",
            result.check_id, result.score, result.details
        );
    }
    if let Some(check_id) = &report.halted_at {
        println!("HALTED at '{check_id}' after {} result(s)", report.results.len());
    }
    println!(
        "{}: {} passed, {} failed ({} ms)",
        if report.passed { "PASSED" } else { "FAILED" },
        report.passed_count(),
        report.failed_count(),
        report.duration_ms
    );
}

/// 0 = all checks passed, 1 = failures without a halt, 2 = halted early.
fn exit_code(report: &RunReport) -> i32 {
    if report.passed {
        0
    } else if report.halted() {
        2
    } else {
        1
    }
}
