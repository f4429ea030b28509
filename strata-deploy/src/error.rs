//! Error types for the deploy engine.

use thiserror::Error;

use crate::change::ChangeKey;

/// Result type alias for deploy operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// A command that failed during execution, kept for the aggregate report.
#[derive(Debug)]
pub struct FailedChange {
    /// Description of the failed command.
    pub description: String,
    /// Change keys carried by the failed command.
    pub change_keys: Vec<ChangeKey>,
    /// The error raised by the command.
    pub error: DeployError,
}

impl FailedChange {
    /// Message of the innermost error in the source chain.
    pub fn root_cause_message(&self) -> String {
        root_cause_message(&self.error)
    }
}

/// A command that was not attempted because something it needs already failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    /// Description of the skipped command.
    pub description: String,
    /// Failed object names or change keys that caused the skip.
    pub blocked_by: Vec<String>,
}

/// Errors that can occur while calculating or executing a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid environment or argument setup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two source or two deployed changes share the same key.
    #[error("Duplicate change key {key}: {side} change could not be set again\n  first:  {first}\n  second: {second}")]
    DuplicateChangeKey {
        /// The conflicting key.
        key: ChangeKey,
        /// Which side of the pair was set twice ("source" or "deployed").
        side: &'static str,
        /// Display string of the change already in the pair.
        first: String,
        /// Display string of the rejected change.
        second: String,
    },

    /// A change refers to a change type the platform does not register.
    #[error("Unknown change type '{0}'")]
    UnknownChangeType(String),

    /// The dependency graph contains cycles.
    #[error("{message}")]
    Cycle {
        /// Rendered report of every cycle.
        message: String,
        /// Vertex labels of each cycle.
        cycles: Vec<Vec<String>>,
    },

    /// A subset sort referenced vertices not present in the graph.
    #[error("Unsortable graph: {0}")]
    UnsortableGraph(String),

    /// Two members of one parallel group depend on each other.
    #[error("Parallel group '{group}' contains dependent changes: {dependent} depends on {dependency}")]
    ParallelGroupDependency {
        /// The parallel group tag.
        group: String,
        /// Label of the dependent change.
        dependent: String,
        /// Label of the change it depends on.
        dependency: String,
    },

    /// The changeset carries fatal warnings.
    #[error("Found exceptions:\n{}", .0.join("\n"))]
    FatalWarnings(Vec<String>),

    /// A deployed change was edited in source.
    #[error("Hash mismatch for change {key}: deployed {deployed}, source {source_hash}")]
    HashMismatch {
        /// Key of the edited change.
        key: ChangeKey,
        /// Hash recorded in the audit trail.
        deployed: String,
        /// Hash of the source definition.
        source_hash: String,
    },

    /// Audit trail read or write error.
    #[error("Audit error: {0}")]
    Audit(String),

    /// Lock acquisition failed.
    #[error("Failed to acquire audit lock: {0}")]
    LockFailed(String),

    /// A single command failed against the target store.
    #[error("Execution error: {0}")]
    Execution(String),

    /// One or more commands failed; the run finished the remaining work first.
    #[error("{message}")]
    DeployFailed {
        /// Rendered aggregate report.
        message: String,
        /// Every failed command.
        failures: Vec<FailedChange>,
        /// Every command skipped because of an earlier failure.
        skipped: Vec<SkippedChange>,
    },

    /// Schemas disagree on whether the run is a rollback.
    #[error("The following schemas were calculated for rollback {rollback:?}, though the rest were not {regular:?}; cannot proceed in this mixed mode")]
    MixedRollback {
        /// Schemas that need a rollback.
        rollback: Vec<String>,
        /// Schemas that do not.
        regular: Vec<String>,
    },

    /// Configuration file error.
    #[error("Config file error: {0}")]
    ConfigFile(String),
}

impl DeployError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an audit error.
    pub fn audit(msg: impl Into<String>) -> Self {
        Self::Audit(msg.into())
    }

    /// Create a lock failed error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a config file error.
    pub fn config_file(msg: impl Into<String>) -> Self {
        Self::ConfigFile(msg.into())
    }

    /// Whether this error was raised before any execution started because of bad input.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::DuplicateChangeKey { .. }
                | Self::UnknownChangeType(_)
                | Self::Cycle { .. }
                | Self::UnsortableGraph(_)
                | Self::ParallelGroupDependency { .. }
                | Self::MixedRollback { .. }
        )
    }

    /// Check if this is a recoverable error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockFailed(_))
    }
}

/// Walk the source chain of an error and return the innermost message.
pub fn root_cause_message(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeType, ObjectKey};

    #[test]
    fn test_error_display() {
        let err = DeployError::UnknownChangeType("WIDGET".to_string());
        assert!(err.to_string().contains("WIDGET"));
    }

    #[test]
    fn test_hash_mismatch_display() {
        let err = DeployError::HashMismatch {
            key: ChangeKey::new(ObjectKey::new("s", "t", ChangeType::table()), "c1"),
            deployed: "abc".to_string(),
            source_hash: "xyz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("xyz"));
    }

    #[test]
    fn test_fatal_warnings_display() {
        let err = DeployError::FatalWarnings(vec!["one".into(), "two".into()]);
        assert_eq!(err.to_string(), "Found exceptions:\none\ntwo");
    }

    #[test]
    fn test_classification() {
        assert!(DeployError::config("no schemas").is_configuration());
        assert!(DeployError::lock_failed("timeout").is_recoverable());
        assert!(!DeployError::execution("boom").is_configuration());
        assert!(!DeployError::audit("down").is_recoverable());
    }

    #[test]
    fn test_root_cause_message() {
        let err = DeployError::Io(std::io::Error::other("disk gone"));
        assert_eq!(root_cause_message(&err), "disk gone");
    }
}
