//! Evaluation context - the immutable runtime inputs for one gating run.
//!
//! A context is prepared once by an external telemetry collector and never
//! mutated mid-run. If refreshed values are needed, the caller builds a new
//! context and starts a new run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single context entry: a metric, a flag, or an opaque identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Flag(b) => write!(f, "{b}"),
            ContextValue::Number(n) => write!(f, "{n}"),
            ContextValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Immutable key/value inputs for one gating run.
///
/// Backed by a `BTreeMap` so iteration order (and anything derived from it,
/// like memoization keys) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationContext {
    values: BTreeMap<String, ContextValue>,
}

impl EvaluationContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from pre-collected values.
    pub fn from_values(values: BTreeMap<String, ContextValue>) -> Self {
        Self { values }
    }

    /// Builder-style insertion, used when assembling a context before a run.
    pub fn with(mut self, key: impl Into<String>, value: ContextValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Builder-style numeric insertion.
    pub fn with_number(self, key: impl Into<String>, value: f64) -> Self {
        self.with(key, ContextValue::Number(value))
    }

    /// Builder-style flag insertion.
    pub fn with_flag(self, key: impl Into<String>, value: bool) -> Self {
        self.with(key, ContextValue::Flag(value))
    }

    /// Raw lookup.
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    /// Numeric lookup. Returns `None` for missing or non-numeric entries;
    /// the engine treats both as a fail-closed violation.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(ContextValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Boolean flag lookup.
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(ContextValue::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Render the named slice of the context in a canonical form.
    ///
    /// Keys are sorted and rendered as `key=value` records separated by
    /// NUL bytes; missing keys are rendered as `key=?` so that adding a
    /// previously-absent key changes the rendering. Used by the memoization
    /// store to key entries on exactly the fields a check reads.
    pub fn canonical_slice(&self, keys: &[&str]) -> String {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut out = String::new();
        for key in sorted {
            out.push_str(key);
            out.push('=');
            match self.values.get(key) {
                Some(value) => out.push_str(&value.to_string()),
                None => out.push('?'),
            }
            out.push('\0');
        }
        out
    }
}
