//! Commands produced by the changeset calculators.
//!
//! Every command is one of three kinds: an [`ExecuteCommand`] that touches the target store, an
//! [`AuditCommand`] that only updates the audit trail, or a [`ChangeWarning`] that is reported and,
//! when fatal, blocks the run.

use std::collections::BTreeSet;
use std::fmt;

use crate::change::{Change, ChangeKey, ObjectKey};

/// What an execute command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAction {
    /// Deploy one change.
    Deploy { change: Change, reason: Option<String> },
    /// Deploy the members of one connected component, in order.
    DeployGroup { changes: Vec<Change> },
    /// Run the rollback of one change.
    Undeploy { change: Change, reason: String },
    /// Drop the object the change belongs to.
    DropObject { change: Change },
    /// Deploy independent changes concurrently.
    ParallelDeploy {
        schema: String,
        changes: Vec<Change>,
        threads: usize,
    },
}

/// A command that runs against the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteCommand {
    pub action: ExecuteAction,
    /// Whether the command belongs to the drop phase.
    pub drop: bool,
}

impl ExecuteCommand {
    /// Deploy a single change.
    pub fn deploy(change: Change) -> Self {
        Self::new(ExecuteAction::Deploy { change, reason: None })
    }

    /// Deploy a single change, noting why it was selected.
    pub fn deploy_with_reason(change: Change, reason: impl Into<String>) -> Self {
        Self::new(ExecuteAction::Deploy {
            change,
            reason: Some(reason.into()),
        })
    }

    /// Deploy a set of rerunnable objects as one unit.
    pub fn deploy_group(changes: Vec<Change>) -> Self {
        Self::new(ExecuteAction::DeployGroup { changes })
    }

    /// Undo a change with its rollback content.
    pub fn undeploy(change: Change, reason: impl Into<String>) -> Self {
        Self::new(ExecuteAction::Undeploy {
            change,
            reason: reason.into(),
        })
    }

    /// Drop the change's object; ordered in the drop phase.
    pub fn drop_object(change: Change) -> Self {
        Self::new(ExecuteAction::DropObject { change }).with_drop(true)
    }

    /// Deploy changes concurrently over at most `threads` workers.
    pub fn parallel_deploy(schema: impl Into<String>, changes: Vec<Change>, threads: usize) -> Self {
        Self::new(ExecuteAction::ParallelDeploy {
            schema: schema.into(),
            changes,
            threads: threads.max(1),
        })
    }

    fn new(action: ExecuteAction) -> Self {
        Self { action, drop: false }
    }

    /// Set whether the command is ordered in the drop phase.
    pub fn with_drop(mut self, drop: bool) -> Self {
        self.drop = drop;
        self
    }

    /// The changes carried by this command.
    pub fn changes(&self) -> &[Change] {
        match &self.action {
            ExecuteAction::Deploy { change, .. }
            | ExecuteAction::Undeploy { change, .. }
            | ExecuteAction::DropObject { change } => std::slice::from_ref(change),
            ExecuteAction::DeployGroup { changes } | ExecuteAction::ParallelDeploy { changes, .. } => changes,
        }
    }

    /// Objects touched by this command, deduplicated.
    pub fn object_keys(&self) -> BTreeSet<&ObjectKey> {
        self.changes().iter().map(Change::object_key).collect()
    }

    /// Keys of the changes this command carries.
    pub fn change_keys(&self) -> Vec<ChangeKey> {
        self.changes().iter().map(|c| c.key.clone()).collect()
    }

    /// Keys of every change the command's changes depend on.
    pub fn dependency_keys(&self) -> BTreeSet<&ChangeKey> {
        self.changes().iter().flat_map(|c| c.dependent_changes.iter()).collect()
    }

    /// Data-load ordering: the single change's order, or the default when the command has zero or
    /// several changes.
    pub fn order(&self) -> i32 {
        match self.changes() {
            [change] => change.order,
            _ => crate::change::DEFAULT_CHANGE_ORDER,
        }
    }

    /// Whether this command loads static data.
    pub fn is_static_data(&self) -> bool {
        self.changes().first().is_some_and(|c| c.change_type().is_static_data())
    }

    /// Short name of the action kind.
    pub fn kind_name(&self) -> &'static str {
        match self.action {
            ExecuteAction::Deploy { .. } => "Deploy",
            ExecuteAction::DeployGroup { .. } => "DeployGroup",
            ExecuteAction::Undeploy { .. } => "Undeploy",
            ExecuteAction::DropObject { .. } => "DropObject",
            ExecuteAction::ParallelDeploy { .. } => "ParallelDeploy",
        }
    }

    /// Description used in logs and failure reports.
    pub fn description(&self) -> String {
        match &self.action {
            ExecuteAction::Deploy { change, reason } => match reason {
                Some(reason) => format!("Deploy: {}; Reason: {}", change.display_string(), reason),
                None => format!("Deploy: {}", change.display_string()),
            },
            ExecuteAction::DeployGroup { changes } => format!(
                "Deploy group: {}",
                changes.iter().map(Change::display_string).collect::<Vec<_>>().join(", ")
            ),
            ExecuteAction::Undeploy { change, reason } => {
                format!("Undeploy: {}; Reason: {}", change.display_string(), reason)
            }
            ExecuteAction::DropObject { change } => format!("Drop object: {}", change.display_string()),
            ExecuteAction::ParallelDeploy {
                schema,
                changes,
                threads,
            } => format!(
                "Parallel deploy of {} changes in schema {} with {} threads: {}",
                changes.len(),
                schema,
                threads,
                changes.iter().map(Change::label).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for ExecuteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// A command that only updates the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditCommand {
    /// Rewrite the audit entry for a change without executing anything.
    UpdateAuditTableOnly { change: Change, reason: String },
    /// Stop tracking a change.
    Unmanage { change: Change, reason: String },
    /// Record a baseline and delete the audit entries it replaces.
    Baseline { baseline: Change, replaced: Vec<Change> },
}

impl AuditCommand {
    /// Record the change in the audit trail without executing it.
    pub fn update_audit_only(change: Change, reason: impl Into<String>) -> Self {
        Self::UpdateAuditTableOnly {
            change,
            reason: reason.into(),
        }
    }

    /// Stop tracking the change in the audit trail.
    pub fn unmanage(change: Change, reason: impl Into<String>) -> Self {
        Self::Unmanage {
            change,
            reason: reason.into(),
        }
    }

    /// The primary change of the command.
    pub fn change(&self) -> &Change {
        match self {
            Self::UpdateAuditTableOnly { change, .. } | Self::Unmanage { change, .. } => change,
            Self::Baseline { baseline, .. } => baseline,
        }
    }

    /// Human readable description for the changeset listing.
    pub fn description(&self) -> String {
        match self {
            Self::UpdateAuditTableOnly { change, reason } => {
                format!("Audit only: {}; Reason: {}", change.display_string(), reason)
            }
            Self::Unmanage { change, reason } => {
                format!("Unmanage: {}; Reason: {}", change.display_string(), reason)
            }
            Self::Baseline { baseline, replaced } => format!(
                "Baseline: {} replacing [{}]",
                baseline.display_string(),
                replaced.iter().map(Change::change_name).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for AuditCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// A diagnostic produced while calculating the changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeWarning {
    /// A deployed change was modified in source.
    HashMismatch { source: Change, deployed: Change },
    /// Every change of the object is new and the last one drops it.
    AlreadyDropped { change: Change },
    /// A rollback was requested but the deployed change has no rollback script.
    Unrolledback { change: Change },
    /// A deployed change disappeared from source without a baseline replacing it.
    ImproperlyRemoved { change: Change },
    /// The change is inactive in both source and audit trail.
    CurrentDeactivation { change: Change },
    /// A baseline names changes that were never deployed.
    IncompleteBaseline { baseline: Change, missing: BTreeSet<String> },
}

impl ChangeWarning {
    /// Fatal warnings stop the run before anything executes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::ImproperlyRemoved { .. } | Self::IncompleteBaseline { .. }
        )
    }

    /// The change this audit command records.
    pub fn change(&self) -> &Change {
        match self {
            Self::HashMismatch { source: change, .. }
            | Self::AlreadyDropped { change }
            | Self::Unrolledback { change }
            | Self::ImproperlyRemoved { change }
            | Self::CurrentDeactivation { change }
            | Self::IncompleteBaseline { baseline: change, .. } => change,
        }
    }

    /// Stable name for metrics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::HashMismatch { .. } => "HashMismatch",
            Self::AlreadyDropped { .. } => "AlreadyDropped",
            Self::Unrolledback { .. } => "Unrolledback",
            Self::ImproperlyRemoved { .. } => "ImproperlyRemoved",
            Self::CurrentDeactivation { .. } => "CurrentDeactivation",
            Self::IncompleteBaseline { .. } => "IncompleteBaseline",
        }
    }

    /// Human readable description for the changeset listing.
    pub fn description(&self) -> String {
        match self {
            Self::HashMismatch { source, deployed } => format!(
                "Change has been modified since it was deployed: {}; deployed hash [{}], source hash [{}]. \
                 Deployed changes must not be edited; add a new change instead",
                source.display_string(),
                deployed.content_hash,
                source.content_hash
            ),
            Self::AlreadyDropped { change } => format!(
                "Object was already dropped and never deployed here; its changes can be removed from source: {}",
                change.display_string()
            ),
            Self::Unrolledback { change } => format!(
                "Change could not be rolled back as it has no rollback script: {}",
                change.display_string()
            ),
            Self::ImproperlyRemoved { change } => format!(
                "Deployed change was removed from source without a baseline replacing it: {}",
                change.display_string()
            ),
            Self::CurrentDeactivation { change } => format!(
                "Change is inactive in source and in the audit trail; it can be removed from source: {}",
                change.display_string()
            ),
            Self::IncompleteBaseline { baseline, missing } => format!(
                "Baseline {} replaces changes that were not deployed: [{}]",
                baseline.display_string(),
                missing.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for ChangeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Output of a changeset calculator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeCommand {
    Execute(ExecuteCommand),
    Audit(AuditCommand),
    Warning(ChangeWarning),
}

impl From<ExecuteCommand> for ChangeCommand {
    fn from(command: ExecuteCommand) -> Self {
        Self::Execute(command)
    }
}

impl From<AuditCommand> for ChangeCommand {
    fn from(command: AuditCommand) -> Self {
        Self::Audit(command)
    }
}

impl From<ChangeWarning> for ChangeCommand {
    fn from(warning: ChangeWarning) -> Self {
        Self::Warning(warning)
    }
}
