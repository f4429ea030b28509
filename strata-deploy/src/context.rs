//! Explicit run context: metrics, execution warnings and the run outcome.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::config::DeployMode;

/// Prefix of metric keys that record non-fatal problems.
pub const WARNINGS_PREFIX: &str = "warnings";

/// Metrics collected over one deployment.
#[derive(Debug, Default)]
pub struct DeployMetrics {
    metrics: Mutex<BTreeMap<String, Value>>,
}

impl DeployMetrics {
    /// Empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric, replacing any earlier value.
    pub fn add_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.metrics.lock().insert(key.into(), value.into());
    }

    /// Append a value to a list metric.
    pub fn add_list_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut metrics = self.metrics.lock();
        let entry = metrics
            .entry(key.into())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(values) => values.push(value.into()),
            other => {
                let previous = std::mem::take(other);
                *other = Value::Array(vec![previous, value.into()]);
            }
        }
    }

    /// Value recorded under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.metrics.lock().get(key).cloned()
    }

    /// Snapshot of every metric as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.metrics.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// State shared with deploy behaviors while commands execute.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    mode: DeployMode,
    warnings: Mutex<Vec<String>>,
}

impl ExecutionContext {
    /// Context for a run in the given mode.
    pub fn new(mode: DeployMode) -> Self {
        Self {
            mode,
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Mode of the run.
    pub fn mode(&self) -> DeployMode {
        self.mode
    }

    /// Record a warning to report at the end of the run.
    pub fn add_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    /// Warnings collected so far.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeployOutcome {
    /// Execute commands that ran.
    pub executed: usize,
    /// Audit-only commands that were applied.
    pub audited: usize,
    /// Commands deferred by the changeset selection.
    pub deferred: usize,
    /// Whether the run stopped after printing the changeset.
    pub preview: bool,
    pub rollback: bool,
    /// Warnings raised during execution and advisory changeset warnings.
    pub warnings: Vec<String>,
    /// Snapshot of the collected metrics.
    pub metrics: Value,
    pub duration_ms: i64,
}

impl DeployOutcome {
    /// Whether anything changed in the target or the audit trail.
    pub fn has_changes(&self) -> bool {
        self.executed > 0 || self.audited > 0
    }

    /// One-line summary of the run.
    pub fn summary(&self) -> String {
        if self.preview {
            return format!(
                "Preview: {} to execute, {} audit-only, {} deferred",
                self.executed, self.audited, self.deferred
            );
        }

        let mut parts = Vec::new();
        if self.executed > 0 {
            parts.push(format!("{} executed", self.executed));
        }
        if self.audited > 0 {
            parts.push(format!("{} audit-only", self.audited));
        }
        if self.deferred > 0 {
            parts.push(format!("{} deferred", self.deferred));
        }
        if !self.warnings.is_empty() {
            parts.push(format!("{} warnings", self.warnings.len()));
        }

        if parts.is_empty() {
            "No changes deployed".to_string()
        } else {
            format!("{} in {}ms", parts.join(", "), self.duration_ms)
        }
    }
}
