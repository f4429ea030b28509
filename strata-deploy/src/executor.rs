//! Execution of a calculated changeset with per-object failure isolation.
//!
//! Commands run in changeset order. A failing command does not stop the run: its objects and
//! change keys are remembered, later commands touching those objects or depending on those changes
//! are skipped, and everything else still executes. The run then fails with one aggregate error.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::change::{Change, ChangeKey};
use crate::changeset::Changeset;
use crate::command::{AuditCommand, ExecuteAction, ExecuteCommand};
use crate::config::DeployMode;
use crate::context::{DeployMetrics, ExecutionContext};
use crate::error::{DeployError, DeployResult, FailedChange, SkippedChange};
use crate::history::{ChangeAuditDao, DeployExecution};
use crate::onboarding::OnboardingStrategy;

/// Applies changes to the target store.
#[async_trait::async_trait]
pub trait DeployBehavior: Send + Sync {
    /// Apply the change's content.
    async fn deploy(&self, change: &Change, context: &ExecutionContext) -> DeployResult<()>;

    /// Run the change's rollback content.
    async fn undeploy(&self, change: &Change, context: &ExecutionContext) -> DeployResult<()>;

    /// Drop the object the change belongs to.
    async fn drop_object(&self, change: &Change, context: &ExecutionContext) -> DeployResult<()>;
}

/// Counts of what an execution applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
    pub audited: usize,
}

/// Runs changesets against a deploy behavior and the audit trail.
pub struct DeployExecutor<'a> {
    behavior: &'a dyn DeployBehavior,
    audit_dao: &'a dyn ChangeAuditDao,
    onboarding: &'a dyn OnboardingStrategy,
    metrics: &'a DeployMetrics,
}

#[derive(Default)]
struct FailureTracker {
    failures: Vec<FailedChange>,
    skipped: Vec<SkippedChange>,
    /// `schema:object` keys of failed objects.
    failed_objects: BTreeSet<String>,
    /// Plain names of failed objects, for onboarding.
    failed_object_names: BTreeSet<String>,
    failed_keys: BTreeSet<ChangeKey>,
}

impl FailureTracker {
    /// Failed objects or change keys that block the command, if any.
    fn blockers(&self, command: &ExecuteCommand) -> Vec<String> {
        let objects: Vec<String> = command
            .object_keys()
            .into_iter()
            .map(|key| key.db_object_key())
            .filter(|key| self.failed_objects.contains(key))
            .collect();
        if !objects.is_empty() {
            return objects;
        }
        command
            .dependency_keys()
            .into_iter()
            .filter(|key| self.failed_keys.contains(*key))
            .map(ChangeKey::label)
            .collect()
    }

    fn record(&mut self, command: &ExecuteCommand, error: DeployError) {
        for change in command.changes() {
            self.failed_objects.insert(change.object_key().db_object_key());
            self.failed_object_names.insert(change.object_name().to_string());
            self.failed_keys.insert(change.key.clone());
        }
        self.failures.push(FailedChange {
            description: command.description(),
            change_keys: command.change_keys(),
            error,
        });
    }

    fn into_error(self) -> Option<DeployError> {
        if self.failures.is_empty() {
            return None;
        }
        let mut message = String::from("Failed deploying the following artifacts.\n");
        let failures: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}\n    Root Exception Message: {}", f.description, f.root_cause_message()))
            .collect();
        message.push_str(&failures.join("\n"));
        if !self.skipped.is_empty() {
            message.push_str("\nSkipped the following artifacts as something they need failed first:\n");
            let skipped: Vec<String> = self
                .skipped
                .iter()
                .map(|s| format!("    {}; blocked by [{}]", s.description, s.blocked_by.join(", ")))
                .collect();
            message.push_str(&skipped.join("\n"));
        }
        Some(DeployError::DeployFailed {
            message,
            failures: self.failures,
            skipped: self.skipped,
        })
    }
}

impl<'a> DeployExecutor<'a> {
    /// Executor over the given collaborators.
    pub fn new(
        behavior: &'a dyn DeployBehavior,
        audit_dao: &'a dyn ChangeAuditDao,
        onboarding: &'a dyn OnboardingStrategy,
        metrics: &'a DeployMetrics,
    ) -> Self {
        Self {
            behavior,
            audit_dao,
            onboarding,
            metrics,
        }
    }

    /// Mark audit-only commands, then run every insert.
    ///
    /// `executions` holds the in-progress deploy execution of each schema.
    pub async fn execute(
        &self,
        changeset: &Changeset,
        mode: DeployMode,
        executions: &BTreeMap<String, DeployExecution>,
        context: &ExecutionContext,
    ) -> DeployResult<ExecutionReport> {
        let mut report = ExecutionReport::default();
        for command in &changeset.audit_changes {
            debug!(command = %command, "Marking audit table");
            self.mark_audit(command, executions).await?;
            report.audited += 1;
        }

        let mut tracker = FailureTracker::default();
        for command in &changeset.inserts {
            let blockers = tracker.blockers(command);
            if !blockers.is_empty() {
                info!(
                    command = %command,
                    blocked_by = %blockers.join(", "),
                    "Skipping artifact as something it needs previously failed deploying"
                );
                tracker.skipped.push(SkippedChange {
                    description: command.description(),
                    blocked_by: blockers,
                });
                continue;
            }

            info!(command = %command, "Attempting to deploy");
            let started = Instant::now();
            let outcome = match self.apply(command, mode, context).await {
                Ok(()) => self.mark_execute(command, executions).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    info!(
                        command = %command,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Successfully {} artifact",
                        mode.deploy_verb()
                    );
                    report.executed += 1;
                    for change in command.changes() {
                        if let Err(err) = self.onboarding.handle_success(change).await {
                            warn!(change = %change.key, error = %err, "Onboarding could not handle success");
                            context.add_warning(format!("onboarding: {err}"));
                        }
                    }
                }
                Err(err) => {
                    error!(
                        command = %command,
                        duration_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "Failed to deploy artifact; continuing and failing the run at the end"
                    );
                    for change in command.changes() {
                        if let Err(onboarding_err) = self
                            .onboarding
                            .handle_exception(change, &err, &tracker.failed_object_names)
                            .await
                        {
                            warn!(change = %change.key, error = %onboarding_err, "Onboarding could not handle failure");
                            context.add_warning(format!("onboarding: {onboarding_err}"));
                        }
                    }
                    tracker.record(command, err);
                }
            }
        }

        if !tracker.failures.is_empty() {
            self.metrics.add_metric("exceptionCount", tracker.failures.len());
        }
        if !tracker.skipped.is_empty() {
            self.metrics.add_metric("skippedCount", tracker.skipped.len());
        }
        match tracker.into_error() {
            Some(err) => {
                error!("{}", err);
                Err(err)
            }
            None => Ok(report),
        }
    }

    /// Run the command against the target; init mode only records it.
    async fn apply(&self, command: &ExecuteCommand, mode: DeployMode, context: &ExecutionContext) -> DeployResult<()> {
        if mode == DeployMode::ForceInit {
            return Ok(());
        }
        match &command.action {
            ExecuteAction::Deploy { change, .. } => self.behavior.deploy(change, context).await,
            ExecuteAction::DeployGroup { changes } => {
                for change in changes {
                    self.behavior.deploy(change, context).await?;
                }
                Ok(())
            }
            ExecuteAction::Undeploy { change, .. } => self.behavior.undeploy(change, context).await,
            ExecuteAction::DropObject { change } => self.behavior.drop_object(change, context).await,
            ExecuteAction::ParallelDeploy { changes, threads, .. } => {
                let results: Vec<DeployResult<()>> = stream::iter(changes.iter())
                    .map(|change| self.behavior.deploy(change, context))
                    .buffer_unordered((*threads).max(1))
                    .collect()
                    .await;
                let errors: Vec<String> = results
                    .into_iter()
                    .filter_map(Result::err)
                    .map(|err| err.to_string())
                    .collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(DeployError::execution(format!(
                        "{} of {} parallel changes failed: {}",
                        errors.len(),
                        changes.len(),
                        errors.join("; ")
                    )))
                }
            }
        }
    }

    async fn mark_execute(
        &self,
        command: &ExecuteCommand,
        executions: &BTreeMap<String, DeployExecution>,
    ) -> DeployResult<()> {
        match &command.action {
            ExecuteAction::Deploy { change, .. } => self.manage(change, executions).await,
            ExecuteAction::DeployGroup { changes } | ExecuteAction::ParallelDeploy { changes, .. } => {
                for change in changes {
                    self.manage(change, executions).await?;
                }
                Ok(())
            }
            ExecuteAction::Undeploy { change, .. } => self.audit_dao.delete_change(change).await,
            ExecuteAction::DropObject { change } => self.audit_dao.delete_object_changes(change).await,
        }
    }

    async fn mark_audit(&self, command: &AuditCommand, executions: &BTreeMap<String, DeployExecution>) -> DeployResult<()> {
        match command {
            AuditCommand::UpdateAuditTableOnly { change, .. } => {
                let execution = execution_for(change, executions)?;
                self.audit_dao.update_or_insert_change(change, execution).await
            }
            AuditCommand::Unmanage { change, .. } => self.audit_dao.delete_change(change).await,
            AuditCommand::Baseline { baseline, replaced } => {
                let execution = execution_for(baseline, executions)?;
                self.audit_dao.insert_new_change(baseline, execution).await?;
                for change in replaced {
                    self.audit_dao.delete_change(change).await?;
                }
                Ok(())
            }
        }
    }

    /// Record a deployed change: rerunnable changes replace their entry, incremental ones are
    /// inserted, and incremental drops forget their object.
    async fn manage(&self, change: &Change, executions: &BTreeMap<String, DeployExecution>) -> DeployResult<()> {
        if change.is_rerunnable() {
            let execution = execution_for(change, executions)?;
            self.audit_dao.update_or_insert_change(change, execution).await
        } else if change.is_drop() {
            self.audit_dao.delete_object_changes(change).await
        } else {
            let execution = execution_for(change, executions)?;
            self.audit_dao.insert_new_change(change, execution).await
        }
    }
}

fn execution_for<'e>(change: &Change, executions: &'e BTreeMap<String, DeployExecution>) -> DeployResult<&'e DeployExecution> {
    executions
        .get(change.schema())
        .ok_or_else(|| DeployError::audit(format!("no deploy execution was started for schema {}", change.schema())))
}
