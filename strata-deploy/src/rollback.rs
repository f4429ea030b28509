//! Rollback detection from the product versions recorded on past deploy executions.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::history::{DeployExecution, DeployExecutionDao};

const NO_VERSION: &str = "no-version-available";

/// Decides whether deploying a product version rolls the environment back.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackDetector;

impl RollbackDetector {
    /// Whether every schema needs a rollback to reach `product_version`.
    ///
    /// Fails when some schemas need a rollback and others do not.
    pub async fn determine_rollback(
        &self,
        product_version: &str,
        schemas: &[String],
        execution_dao: &dyn DeployExecutionDao,
    ) -> DeployResult<bool> {
        let mut flags: BTreeMap<&str, bool> = BTreeMap::new();
        for schema in schemas {
            info!(product_version, schema = %schema, "Checking rollback status");
            let executions = execution_dao.deploy_executions(schema).await?;
            flags.insert(schema, Self::determine_rollback_for_schema(product_version, &executions)?);
        }

        let (rollback, regular): (Vec<_>, Vec<_>) = flags.iter().partition(|(_, rollback)| **rollback);
        if !rollback.is_empty() && !regular.is_empty() {
            return Err(DeployError::MixedRollback {
                rollback: rollback.into_iter().map(|(s, _)| s.to_string()).collect(),
                regular: regular.into_iter().map(|(s, _)| s.to_string()).collect(),
            });
        }
        Ok(!rollback.is_empty())
    }

    /// Whether an earlier active deployment carries the version while the latest does not.
    pub fn determine_rollback_for_schema(
        product_version: &str,
        executions: &[DeployExecution],
    ) -> DeployResult<bool> {
        debug!(count = executions.len(), "Found deploy executions for this schema");
        let active = Self::active_deployments(executions)?;
        debug!(count = active.len(), "Found active deploy executions for this schema");

        let Some((latest, earlier)) = active.split_last() else {
            return Ok(false);
        };
        if version_of(latest) == product_version {
            return Ok(false);
        }
        Ok(earlier.iter().any(|execution| version_of(execution) == product_version))
    }

    /// Replay executions by id: regular deploys push, rollbacks pop back to their version.
    pub fn active_deployments(executions: &[DeployExecution]) -> DeployResult<Vec<&DeployExecution>> {
        let mut sorted: Vec<&DeployExecution> = executions.iter().collect();
        sorted.sort_by_key(|execution| execution.id);

        let mut stack: Vec<&DeployExecution> = Vec::new();
        for execution in sorted {
            if !execution.rollback {
                stack.push(execution);
                continue;
            }
            loop {
                let Some(previous) = stack.pop() else {
                    return Err(DeployError::audit(format!(
                        "Found a rollback deployment without the corresponding version: {} (execution {:?})",
                        version_of(execution),
                        execution.id
                    )));
                };
                if version_of(previous) == version_of(execution) {
                    stack.push(execution);
                    break;
                }
            }
        }
        Ok(stack)
    }
}

fn version_of(execution: &DeployExecution) -> &str {
    execution.product_version.as_deref().unwrap_or(NO_VERSION)
}
