//! Deployer: the end-to-end flow from source changes to an executed, audited changeset.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::change::{Change, ChangeKey};
use crate::changeset::{Changeset, ChangesetCreator};
use crate::config::{DeployArgs, DeployConfig};
use crate::context::{DeployMetrics, DeployOutcome, ExecutionContext, WARNINGS_PREFIX};
use crate::error::{DeployError, DeployResult};
use crate::executor::{DeployBehavior, DeployExecutor, ExecutionReport};
use crate::graph::GraphEnricher;
use crate::history::{
    ChangeAuditDao, DeployExecution, DeployExecutionDao, DeployExecutionStatus, acquire_lock_with_retry,
};
use crate::onboarding::{DisabledOnboarding, EnabledOnboarding, OnboardingStrategy};
use crate::platform::Platform;
use crate::rollback::RollbackDetector;
use crate::text::TextDependencyExtractor;

/// Work that runs after the main deployment, whether or not it succeeded.
#[async_trait::async_trait]
pub trait PostDeployAction: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn run(&self, changeset: &Changeset, context: &ExecutionContext) -> DeployResult<()>;
}

/// Deploys source changes against one environment.
pub struct Deployer {
    platform: Arc<dyn Platform>,
    config: DeployConfig,
    audit_dao: Arc<dyn ChangeAuditDao>,
    execution_dao: Arc<dyn DeployExecutionDao>,
    behavior: Arc<dyn DeployBehavior>,
    post_deploy_actions: Vec<Arc<dyn PostDeployAction>>,
}

impl Deployer {
    /// Create a deployer with the default configuration.
    pub fn new(
        platform: Arc<dyn Platform>,
        audit_dao: Arc<dyn ChangeAuditDao>,
        execution_dao: Arc<dyn DeployExecutionDao>,
        behavior: Arc<dyn DeployBehavior>,
    ) -> Self {
        Self {
            platform,
            config: DeployConfig::default(),
            audit_dao,
            execution_dao,
            behavior,
            post_deploy_actions: Vec::new(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: DeployConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an action to run after the main deploy.
    pub fn with_post_deploy_action(mut self, action: Arc<dyn PostDeployAction>) -> Self {
        self.post_deploy_actions.push(action);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Calculate and, unless previewing, execute the changeset for `sources`.
    pub async fn deploy(&self, sources: Vec<Change>, args: &DeployArgs) -> DeployResult<DeployOutcome> {
        let start = Instant::now();
        let metrics = DeployMetrics::new();
        let result = self.deploy_with_metrics(sources, args, &metrics).await;

        metrics.add_metric("runtimeMillis", start.elapsed().as_millis() as u64);
        metrics.add_metric("success", result.is_ok());
        match result {
            Ok(mut outcome) => {
                outcome.duration_ms = start.elapsed().as_millis() as i64;
                outcome.metrics = metrics.to_json();
                info!(summary = %outcome.summary(), "Deployment finished");
                Ok(outcome)
            }
            Err(err) => {
                error!(error = %err, "Deployment failed");
                Err(err)
            }
        }
    }

    async fn deploy_with_metrics(
        &self,
        sources: Vec<Change>,
        args: &DeployArgs,
        metrics: &DeployMetrics,
    ) -> DeployResult<DeployOutcome> {
        self.config.validate()?;
        record_args(args, metrics);

        let registry = self.platform.change_types();
        for change in &sources {
            registry.validate(change)?;
        }

        let schemas = self.schemas(&sources);
        let onboarding = self.onboarding(args);
        onboarding.validate_source_dirs(&self.config.source_dirs, &schemas).await?;

        let rollback = self.determine_rollback(args, &schemas, metrics).await?;
        let sources = self.resolve_dependencies(sources, rollback)?;
        let mode = args.deploy_mode();
        let creator = ChangesetCreator::new(Arc::clone(&self.platform), self.config.parallel_threads);

        if args.preview {
            let deployed = registry.bind(self.audit_dao.deployed_changes().await?)?;
            let changeset = creator.determine_changeset(
                deployed,
                &sources,
                rollback,
                mode.is_init_allowed_on_hash_exceptions(),
                &args.changesets,
            )?;
            print_changeset(&changeset, mode.deploy_verb());
            record_changeset(&changeset, metrics);
            changeset.validate_for_deployment()?;
            info!("Preview mode: stopping before execution");
            return Ok(DeployOutcome {
                executed: changeset.inserts.len(),
                audited: changeset.audit_changes.len(),
                deferred: changeset.deferred.len(),
                preview: true,
                rollback,
                warnings: advisory_warnings(&changeset),
                ..Default::default()
            });
        }

        let _lock = acquire_lock_with_retry(
            self.audit_dao.as_ref(),
            self.config.lock_retry_interval(),
            self.config.lock_max_attempts,
        )
        .await?;
        self.audit_dao.init().await?;
        self.execution_dao.init().await?;

        let deployed = registry.bind(self.audit_dao.deployed_changes().await?)?;
        let changeset = creator.determine_changeset(
            deployed,
            &sources,
            rollback,
            mode.is_init_allowed_on_hash_exceptions(),
            &args.changesets,
        )?;
        print_changeset(&changeset, mode.deploy_verb());
        record_changeset(&changeset, metrics);
        changeset.validate_for_deployment()?;

        let mut outcome = DeployOutcome {
            deferred: changeset.deferred.len(),
            rollback,
            ..Default::default()
        };
        if !changeset.is_deployment_needed() {
            info!("No changes to deploy");
            outcome.warnings = advisory_warnings(&changeset);
            return Ok(outcome);
        }

        let mut executions = self.start_executions(&changeset, args, rollback).await?;
        let context = ExecutionContext::new(mode);
        let executor = DeployExecutor::new(self.behavior.as_ref(), self.audit_dao.as_ref(), onboarding.as_ref(), metrics);
        let main_result = executor.execute(&changeset, mode, &executions, &context).await;
        let result = self.run_post_deploy(main_result, &changeset, &context).await;

        let status = if result.is_ok() {
            DeployExecutionStatus::Succeeded
        } else {
            DeployExecutionStatus::Failed
        };
        let finish_result = self.finish_executions(&mut executions, status).await;
        let report: ExecutionReport = match (result, finish_result) {
            (Ok(report), Ok(())) => report,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), finished) => {
                if let Err(finish_err) = finished {
                    error!(error = %finish_err, "Could not mark deploy executions as failed");
                }
                return Err(err);
            }
        };

        for warning in context.warnings() {
            metrics.add_list_metric(format!("{WARNINGS_PREFIX}.execution"), warning);
        }
        outcome.executed = report.executed;
        outcome.audited = report.audited;
        outcome.warnings = advisory_warnings(&changeset);
        outcome.warnings.extend(context.warnings());
        Ok(outcome)
    }

    /// Schemas from the configuration plus any the sources mention.
    fn schemas(&self, sources: &[Change]) -> Vec<String> {
        let mut schemas: BTreeSet<String> = self.config.schemas.iter().cloned().collect();
        schemas.extend(sources.iter().map(|c| c.schema().to_string()));
        schemas.into_iter().collect()
    }

    fn onboarding(&self, args: &DeployArgs) -> Box<dyn OnboardingStrategy> {
        if args.onboarding {
            Box::new(EnabledOnboarding::new(self.config.exception_dir.clone()))
        } else {
            Box::new(DisabledOnboarding::new(self.config.exception_dir.clone()))
        }
    }

    async fn determine_rollback(
        &self,
        args: &DeployArgs,
        schemas: &[String],
        metrics: &DeployMetrics,
    ) -> DeployResult<bool> {
        let Some(version) = args.product_version.as_deref().filter(|_| self.config.rollback_detection) else {
            return Ok(args.rollback);
        };

        if args.rollback {
            warn!(
                product_version = version,
                "Rollback was requested explicitly although it can be detected from the product version; \
                 consider omitting the rollback flag"
            );
            metrics.add_metric("rollbackExplicitWithDetection", true);
        }
        let detected = RollbackDetector
            .determine_rollback(version, schemas, self.execution_dao.as_ref())
            .await?;
        metrics.add_metric("rollbackDetected", detected);
        if detected {
            info!(product_version = version, "Detected a rollback to an earlier product version");
        }
        Ok(args.rollback || detected)
    }

    /// Discover dependencies and record, on every change, the keys of the changes it depends on.
    fn resolve_dependencies(&self, mut sources: Vec<Change>, rollback: bool) -> DeployResult<Vec<Change>> {
        let platform = Arc::clone(&self.platform);
        TextDependencyExtractor::new(move |name| platform.convert_db_object_name(name)).enrich(&mut sources);

        let platform = Arc::clone(&self.platform);
        let enricher = GraphEnricher::new(Arc::new(move |name: &str| platform.convert_db_object_name(name)));
        let graph = enricher.build_graph(sources, rollback)?;

        let dependencies: Vec<BTreeSet<ChangeKey>> = graph
            .indices()
            .map(|index| {
                graph
                    .dependencies_of(index)
                    .into_iter()
                    .map(|dependency| graph.vertex(dependency).key.clone())
                    .collect()
            })
            .collect();
        let mut changes = graph.into_vertices();
        for (change, dependent_changes) in changes.iter_mut().zip(dependencies) {
            change.dependent_changes = dependent_changes;
        }
        Ok(changes)
    }

    /// Persist an in-progress execution for every schema the changeset touches.
    async fn start_executions(
        &self,
        changeset: &Changeset,
        args: &DeployArgs,
        rollback: bool,
    ) -> DeployResult<BTreeMap<String, DeployExecution>> {
        let mut schemas: BTreeSet<&str> = changeset
            .inserts
            .iter()
            .flat_map(|command| command.changes().iter().map(Change::schema))
            .collect();
        schemas.extend(changeset.audit_changes.iter().map(|command| command.change().schema()));

        let mut executions = BTreeMap::new();
        for schema in schemas {
            let mut execution = DeployExecution::new(schema, &self.config.executor_id, &self.config.tool_version)
                .with_init(args.init_only)
                .with_rollback(rollback);
            if let Some(requester) = &self.config.requester_id {
                execution = execution.with_requester(requester);
            }
            if let Some(version) = &args.product_version {
                execution = execution.with_product_version(version);
            }
            if let Some(reason) = &args.reason {
                execution = execution.with_reason(reason);
            }
            self.execution_dao.persist_new(&mut execution).await?;
            info!(schema, id = ?execution.id, "Started deploy execution");
            executions.insert(schema.to_string(), execution);
        }
        Ok(executions)
    }

    async fn finish_executions(
        &self,
        executions: &mut BTreeMap<String, DeployExecution>,
        status: DeployExecutionStatus,
    ) -> DeployResult<()> {
        let mut first_error = None;
        for execution in executions.values_mut() {
            execution.status = status;
            if let Err(err) = self.execution_dao.update(execution).await {
                error!(schema = %execution.schema, error = %err, "Could not update deploy execution");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run every post-deploy action; the main failure wins over post-deploy failures.
    async fn run_post_deploy(
        &self,
        main_result: DeployResult<ExecutionReport>,
        changeset: &Changeset,
        context: &ExecutionContext,
    ) -> DeployResult<ExecutionReport> {
        let mut post_error: Option<DeployError> = None;
        for action in &self.post_deploy_actions {
            info!(action = action.name(), "Running post-deploy action");
            if let Err(err) = action.run(changeset, context).await {
                error!(action = action.name(), error = %err, "Post-deploy action failed");
                post_error.get_or_insert(err);
            }
        }

        match (main_result, post_error) {
            (Ok(report), None) => Ok(report),
            (Ok(_), Some(post)) => Err(post),
            (Err(main), Some(post)) => {
                warn!(error = %post, "Ignoring the post-deploy failure as the main deployment already failed");
                Err(main)
            }
            (Err(main), None) => Err(main),
        }
    }
}

fn record_args(args: &DeployArgs, metrics: &DeployMetrics) {
    metrics.add_metric("args.rollback", args.rollback);
    metrics.add_metric("args.preview", args.preview);
    metrics.add_metric("args.initOnly", args.init_only);
    metrics.add_metric("args.onboarding", args.onboarding);
    if let Some(version) = &args.product_version {
        metrics.add_metric("args.productVersion", version.as_str());
    }
}

fn record_changeset(changeset: &Changeset, metrics: &DeployMetrics) {
    metrics.add_metric("changeset.executeCount", changeset.inserts.len());
    metrics.add_metric("changeset.auditCount", changeset.audit_changes.len());
    metrics.add_metric("changeset.warningCount", changeset.warnings.len());
    metrics.add_metric("changeset.deferredCount", changeset.deferred.len());

    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for warning in &changeset.warnings {
        *counts.entry(warning.kind_name()).or_default() += 1;
    }
    let counts: Map<String, Value> = counts
        .into_iter()
        .map(|(kind, count)| (kind.to_string(), Value::from(count)))
        .collect();
    metrics.add_metric("changeset.warningTypeCounts", Value::Object(counts));
}

fn advisory_warnings(changeset: &Changeset) -> Vec<String> {
    changeset
        .warnings
        .iter()
        .filter(|warning| !warning.is_fatal())
        .map(|warning| warning.description())
        .collect()
}

/// Log the changeset bucket by bucket.
fn print_changeset(changeset: &Changeset, verb: &str) {
    if !changeset.inserts.is_empty() {
        info!("The following changes will be {}:", verb);
        for (position, command) in changeset.inserts.iter().enumerate() {
            info!("  {}. {}", position + 1, command);
        }
    }
    if !changeset.audit_changes.is_empty() {
        info!("The following changes will only be recorded in the audit table:");
        for command in &changeset.audit_changes {
            info!("  {}", command);
        }
    }
    if !changeset.deferred.is_empty() {
        info!("The following changes are deferred to a later changeset:");
        for command in &changeset.deferred {
            info!("  {}", command);
        }
    }
    for warning in &changeset.warnings {
        if warning.is_fatal() {
            error!("  {}", warning);
        } else {
            warn!("  {}", warning);
        }
    }
    if !changeset.is_deployment_needed() {
        info!("No changes detected in the source compared to the audit table");
    }
}
