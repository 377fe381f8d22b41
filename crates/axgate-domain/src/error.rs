//! Error types for gating domain operations
//!
//! Only structural manifest problems surface as errors. Everything that
//! goes wrong for a single check during a run is recovered into a failed
//! `CheckResult` by the engine (fail-closed), never thrown.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatingError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest '{0}' has no checks")]
    EmptyManifest(String),

    #[error("Duplicate check id: {0}")]
    DuplicateCheckId(String),

    #[error("Check '{check_id}' has invalid weight {weight}")]
    InvalidWeight { check_id: String, weight: f64 },

    #[error("Recursive check '{0}' has no children")]
    EmptyRecursiveCheck(String),

    #[error("Recursive check '{check_id}' has invalid pass threshold {threshold}")]
    InvalidPassThreshold { check_id: String, threshold: f64 },

    #[error("Invalid run options: {0}")]
    InvalidOptions(String),
}

/// Result type for gating domain operations
pub type Result<T> = std::result::Result<T, GatingError>;
