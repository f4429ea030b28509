//! Audit trail and deploy execution tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::change::Change;
use crate::error::{DeployError, DeployResult};

/// Name of the audit table holding deployed changes.
pub const CHANGE_AUDIT_TABLE_NAME: &str = "ARTIFACTDEPLOYMENT";

/// Name of the table holding deploy executions.
pub const DEPLOY_EXECUTION_TABLE_NAME: &str = "ARTIFACTEXECUTION";

/// Lifecycle of a deploy execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployExecutionStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl DeployExecutionStatus {
    /// Single character code stored in the execution table.
    pub fn code(self) -> char {
        match self {
            Self::InProgress => 'I',
            Self::Succeeded => 'S',
            Self::Failed => 'F',
        }
    }

    /// Parse the single-character status code stored in the execution table.
    pub fn from_code(code: char) -> DeployResult<Self> {
        match code {
            'I' => Ok(Self::InProgress),
            'S' => Ok(Self::Succeeded),
            'F' => Ok(Self::Failed),
            other => Err(DeployError::audit(format!("unknown deploy execution status code '{other}'"))),
        }
    }

    /// Whether the execution has finished.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for DeployExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One invocation of the deployer against one schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployExecution {
    /// Assigned when the execution is persisted.
    pub id: Option<u64>,
    pub status: DeployExecutionStatus,
    pub schema: String,
    pub deploy_time: DateTime<Utc>,
    pub executor_id: String,
    pub tool_version: String,
    /// Whether the run only initialized the audit trail.
    pub init: bool,
    pub rollback: bool,
    pub requester_id: Option<String>,
    pub product_version: Option<String>,
    pub reason: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DeployExecution {
    /// Create a new in-progress execution for a schema.
    pub fn new(schema: impl Into<String>, executor_id: impl Into<String>, tool_version: impl Into<String>) -> Self {
        Self {
            id: None,
            status: DeployExecutionStatus::InProgress,
            schema: schema.into(),
            deploy_time: Utc::now(),
            executor_id: executor_id.into(),
            tool_version: tool_version.into(),
            init: false,
            rollback: false,
            requester_id: None,
            product_version: None,
            reason: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Mark the execution as init-only.
    pub fn with_init(mut self, init: bool) -> Self {
        self.init = init;
        self
    }

    /// Mark the execution as a rollback.
    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback = rollback;
        self
    }

    /// Set the requester.
    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    /// Set the product version.
    pub fn with_product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into());
        self
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a free-form attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Override the deploy time.
    pub fn with_deploy_time(mut self, deploy_time: DateTime<Utc>) -> Self {
        self.deploy_time = deploy_time;
        self
    }
}

/// Store of the changes already applied to the target.
#[async_trait::async_trait]
pub trait ChangeAuditDao: Send + Sync {
    /// Create the audit table if it does not exist.
    async fn init(&self) -> DeployResult<()>;

    /// Name of the container holding the audit table.
    fn audit_container_name(&self) -> &str {
        CHANGE_AUDIT_TABLE_NAME
    }

    /// Changes already deployed. Returns nothing when the audit table was never initialized.
    async fn deployed_changes(&self) -> DeployResult<Vec<Change>>;

    /// Record a change that must not already be tracked.
    async fn insert_new_change(&self, change: &Change, execution: &DeployExecution) -> DeployResult<()>;

    /// Record a change, replacing the entry with the same key.
    async fn update_or_insert_change(&self, change: &Change, execution: &DeployExecution) -> DeployResult<()>;

    /// Forget the change with the same key.
    async fn delete_change(&self, change: &Change) -> DeployResult<()>;

    /// Forget every change of the change's object.
    async fn delete_object_changes(&self, change: &Change) -> DeployResult<()>;

    /// Acquire an exclusive lock for the deployment.
    async fn acquire_lock(&self) -> DeployResult<AuditLock>;
}

/// Store of deploy executions.
#[async_trait::async_trait]
pub trait DeployExecutionDao: Send + Sync {
    /// Create the execution table if it does not exist.
    async fn init(&self) -> DeployResult<()>;

    /// Persist a new execution and assign its id.
    async fn persist_new(&self, execution: &mut DeployExecution) -> DeployResult<()>;

    /// Persist changes to an existing execution.
    async fn update(&self, execution: &DeployExecution) -> DeployResult<()>;

    /// All executions of a schema, ordered by id.
    async fn deploy_executions(&self, schema: &str) -> DeployResult<Vec<DeployExecution>>;

    /// The most recent execution of a schema.
    async fn latest_deploy_execution(&self, schema: &str) -> DeployResult<Option<DeployExecution>> {
        Ok(self
            .deploy_executions(schema)
            .await?
            .into_iter()
            .max_by_key(|execution| execution.id))
    }
}

/// Deployment lock, released when dropped.
pub struct AuditLock {
    lock_id: i64,
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl AuditLock {
    /// Guard for `lock_id` that calls `release` when dropped.
    pub fn new(lock_id: i64, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            lock_id,
            release_fn: Some(Box::new(release)),
        }
    }

    /// The held lock id.
    pub fn id(&self) -> i64 {
        self.lock_id
    }
}

impl fmt::Debug for AuditLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLock").field("lock_id", &self.lock_id).finish()
    }
}

impl Drop for AuditLock {
    fn drop(&mut self) {
        if let Some(release) = self.release_fn.take() {
            release();
        }
    }
}

/// Acquire the audit lock, retrying recoverable failures every `interval`.
///
/// Gives up after `max_attempts` tries with the last error.
pub async fn acquire_lock_with_retry(
    dao: &dyn ChangeAuditDao,
    interval: Duration,
    max_attempts: u32,
) -> DeployResult<AuditLock> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match dao.acquire_lock().await {
            Ok(lock) => {
                info!(attempt, lock_id = lock.id(), "Acquired audit lock");
                return Ok(lock);
            }
            Err(err) if err.is_recoverable() && attempt < max_attempts => {
                warn!(attempt, error = %err, "Audit lock is held elsewhere; retrying in {:?}", interval);
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// SQL for initializing the audit tables (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "ARTIFACTDEPLOYMENT" (
    artifactfilename VARCHAR(255) NOT NULL,
    artifacttype VARCHAR(255),
    objectname VARCHAR(255),
    active INTEGER,
    changetype VARCHAR(255),
    contenthash VARCHAR(255),
    dbschema VARCHAR(255),
    deploy_user_id VARCHAR(32),
    time_inserted TIMESTAMP WITH TIME ZONE,
    time_updated TIMESTAMP WITH TIME ZONE,
    rollbackcontent TEXT,
    insertdeployid BIGINT,
    updatedeployid BIGINT,
    PRIMARY KEY (artifactfilename, objectname, dbschema)
);

CREATE TABLE IF NOT EXISTS "ARTIFACTEXECUTION" (
    id BIGINT NOT NULL PRIMARY KEY,
    status CHAR(1) NOT NULL,
    deploytime TIMESTAMP WITH TIME ZONE NOT NULL,
    executorid VARCHAR(128) NOT NULL,
    toolversion VARCHAR(32) NOT NULL,
    init_command INTEGER NOT NULL,
    rollback_command INTEGER NOT NULL,
    requesterid VARCHAR(128),
    reason VARCHAR(128),
    productversion VARCHAR(255),
    dbschema VARCHAR(255)
);

CREATE TABLE IF NOT EXISTS "ARTIFACTEXECUTIONATTR" (
    deployexecutionid BIGINT NOT NULL,
    attrname VARCHAR(128) NOT NULL,
    attrvalue VARCHAR(128) NOT NULL
);
"#;

/// SQL for advisory lock (PostgreSQL).
pub const POSTGRES_LOCK_SQL: &str = "SELECT pg_try_advisory_lock(51705170)";
pub const POSTGRES_UNLOCK_SQL: &str = "SELECT pg_advisory_unlock(51705170)";
