//! Changeset calculation: from deployed and source changes to sorted command buckets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::calculator::ChangeTypeCalculator;
use crate::change::{Change, ChangeType};
use crate::command::{AuditCommand, ChangeCommand, ChangeWarning, ExecuteCommand};
use crate::error::{DeployError, DeployResult};
use crate::graph::GraphEnricher;
use crate::pair::ChangePairs;
use crate::platform::Platform;
use crate::sorter::ChangeCommandSorter;

/// Which changeset-tagged commands run in this deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChangesetSelection {
    /// Only commands with at least one untagged change.
    #[default]
    Default,
    /// Untagged commands plus those tagged with one of the names.
    Named(BTreeSet<String>),
    /// Every command regardless of tag.
    All,
}

impl ChangesetSelection {
    /// Select the given changeset names.
    pub fn named(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    /// Whether the command runs now rather than being deferred.
    pub fn includes(&self, command: &ExecuteCommand) -> bool {
        match self {
            Self::All => true,
            Self::Default => command.changes().iter().any(|c| c.changeset.is_none()),
            Self::Named(names) => command
                .changes()
                .iter()
                .any(|c| c.changeset.as_ref().is_none_or(|tag| names.contains(tag))),
        }
    }
}

/// The calculated work of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    /// Execute commands to run, in order.
    pub inserts: Vec<ExecuteCommand>,
    /// Execute commands held back by the changeset selection.
    pub deferred: Vec<ExecuteCommand>,
    /// Audit-only commands.
    pub audit_changes: Vec<AuditCommand>,
    /// Diagnostics; fatal ones block the run.
    pub warnings: Vec<ChangeWarning>,
}

impl Changeset {
    /// Whether anything would touch the target store or the audit trail.
    pub fn is_deployment_needed(&self) -> bool {
        !self.inserts.is_empty() || !self.audit_changes.is_empty()
    }

    /// Warnings that block the deployment.
    pub fn fatal_warnings(&self) -> impl Iterator<Item = &ChangeWarning> {
        self.warnings.iter().filter(|w| w.is_fatal())
    }

    /// Fail when any warning is fatal.
    pub fn validate_for_deployment(&self) -> DeployResult<()> {
        let fatal: Vec<String> = self.fatal_warnings().map(ChangeWarning::description).collect();
        if fatal.is_empty() {
            Ok(())
        } else {
            Err(DeployError::FatalWarnings(fatal))
        }
    }
}

/// Pairs, classifies and orders changes into a [`Changeset`].
#[derive(Debug, Clone)]
pub struct ChangesetCreator {
    calculator: ChangeTypeCalculator,
    sorter: ChangeCommandSorter,
}

impl ChangesetCreator {
    /// Creator using the platform's change types, parallelizing deploys over `parallel_threads`.
    pub fn new(platform: Arc<dyn Platform>, parallel_threads: usize) -> Self {
        let converter = Arc::clone(&platform);
        let enricher = GraphEnricher::new(Arc::new(move |name: &str| converter.convert_db_object_name(name)));
        Self {
            calculator: ChangeTypeCalculator::new(enricher, parallel_threads),
            sorter: ChangeCommandSorter::new(platform),
        }
    }

    /// Calculate the changeset between what is deployed and what the source declares.
    pub fn determine_changeset(
        &self,
        deployed: Vec<Change>,
        sources: &[Change],
        rollback: bool,
        init_allowed: bool,
        selection: &ChangesetSelection,
    ) -> DeployResult<Changeset> {
        // Grouped by type name; the source definition of a type wins over the audited one.
        let mut by_type: BTreeMap<String, (ChangeType, Vec<Change>, Vec<Change>)> = BTreeMap::new();
        for change in sources {
            let change_type = change.change_type();
            by_type
                .entry(change_type.name.clone())
                .or_insert_with(|| (change_type.clone(), Vec::new(), Vec::new()))
                .2
                .push(change.clone());
        }
        for change in deployed {
            let change_type = change.change_type();
            by_type
                .entry(change_type.name.clone())
                .or_insert_with(|| (change_type.clone(), Vec::new(), Vec::new()))
                .1
                .push(change);
        }

        let mut commands = Vec::new();
        for (change_type, type_deployed, type_sources) in by_type.into_values() {
            let pairs = ChangePairs::build(type_deployed, type_sources)?;
            debug!(change_type = %change_type, pairs = pairs.len(), "Calculating commands");
            commands.extend(
                self.calculator
                    .calculate(&change_type, pairs, sources, rollback, init_allowed)?,
            );
        }

        let mut execute = Vec::new();
        let mut changeset = Changeset::default();
        for command in commands {
            match command {
                ChangeCommand::Execute(command) => execute.push(command),
                ChangeCommand::Audit(command) => changeset.audit_changes.push(command),
                ChangeCommand::Warning(warning) => changeset.warnings.push(warning),
            }
        }

        for command in self.sorter.sort(execute, rollback)? {
            if selection.includes(&command) {
                changeset.inserts.push(command);
            } else {
                changeset.deferred.push(command);
            }
        }

        info!(
            inserts = changeset.inserts.len(),
            deferred = changeset.deferred.len(),
            audit = changeset.audit_changes.len(),
            warnings = changeset.warnings.len(),
            "Calculated changeset"
        );
        Ok(changeset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::content_hash;
    use crate::platform::GenericPlatform;

    fn creator() -> ChangesetCreator {
        ChangesetCreator::new(Arc::new(GenericPlatform::default()), 5)
    }

    fn table(object: &str, change: &str, order: i32, content: &str) -> Change {
        Change::incremental(ChangeType::table(), "s1", object, change, order, content)
    }

    #[test]
    fn test_identical_sides_produce_nothing() {
        let sources = vec![
            table("t1", "c1", 1, "create table t1"),
            Change::rerunnable(ChangeType::view(), "s1", "v1", "select 1"),
        ];
        let changeset = creator()
            .determine_changeset(sources.clone(), &sources, false, false, &ChangesetSelection::Default)
            .unwrap();
        assert_eq!(changeset, Changeset::default());
        assert!(!changeset.is_deployment_needed());
    }

    #[test]
    fn test_buckets_are_partitioned() {
        let deployed_edit = table("t1", "c1", 1, "create table t1");
        let source_edit = table("t1", "c1", 1, "create table t1 (id int)");
        let new_change = table("t2", "c1", 1, "create table t2");
        let sources = vec![source_edit, new_change];

        let changeset = creator()
            .determine_changeset(vec![deployed_edit], &sources, false, false, &ChangesetSelection::Default)
            .unwrap();
        assert_eq!(changeset.inserts.len(), 1);
        assert_eq!(changeset.warnings.len(), 1);
        assert!(matches!(
            changeset.validate_for_deployment(),
            Err(DeployError::FatalWarnings(messages)) if messages[0].contains(&content_hash("create table t1"))
        ));
    }

    #[test]
    fn test_changeset_tags_defer_commands() {
        let tagged = table("t1", "c1", 1, "create table t1").with_changeset("phase2");
        let plain = table("t2", "c1", 1, "create table t2");
        let sources = vec![tagged, plain];

        let default = creator()
            .determine_changeset(vec![], &sources, false, false, &ChangesetSelection::Default)
            .unwrap();
        assert_eq!(default.inserts.len(), 1);
        assert_eq!(default.deferred.len(), 1);
        assert_eq!(default.deferred[0].changes()[0].object_name(), "t1");

        let named = creator()
            .determine_changeset(vec![], &sources, false, false, &ChangesetSelection::named(["phase2"]))
            .unwrap();
        assert_eq!(named.inserts.len(), 2);
        assert!(named.deferred.is_empty());

        let other = creator()
            .determine_changeset(vec![], &sources, false, false, &ChangesetSelection::named(["phase3"]))
            .unwrap();
        assert_eq!(other.deferred.len(), 1);

        let all = creator()
            .determine_changeset(vec![], &sources, false, false, &ChangesetSelection::All)
            .unwrap();
        assert_eq!(all.inserts.len(), 2);
    }

    #[test]
    fn test_removed_view_is_dropped_before_adds() {
        let deployed = vec![Change::rerunnable(ChangeType::view(), "s1", "old_view", "select 1")];
        let sources = vec![table("t1", "c1", 1, "create table t1")];
        let changeset = creator()
            .determine_changeset(deployed, &sources, false, false, &ChangesetSelection::Default)
            .unwrap();
        let kinds: Vec<&str> = changeset.inserts.iter().map(ExecuteCommand::kind_name).collect();
        assert_eq!(kinds, vec!["DropObject", "Deploy"]);
    }
}
