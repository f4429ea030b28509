//! In-memory audit trail, execution store and deploy behavior.
//!
//! Used for previews against a fresh target and throughout the tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::change::{Change, ChangeKey};
use crate::context::ExecutionContext;
use crate::error::{DeployError, DeployResult};
use crate::executor::DeployBehavior;
use crate::history::{AuditLock, ChangeAuditDao, DeployExecution, DeployExecutionDao};

/// An audit row: the change plus the executions that wrote it.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub change: Change,
    pub insert_execution_id: Option<u64>,
    pub update_execution_id: Option<u64>,
}

#[derive(Debug, Default)]
struct AuditState {
    initialized: bool,
    entries: BTreeMap<ChangeKey, AuditEntry>,
}

/// Audit trail kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditDao {
    state: Arc<Mutex<AuditState>>,
    locked: Arc<Mutex<bool>>,
}

impl InMemoryAuditDao {
    /// Empty audit trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an already initialized audit trail holding `changes`.
    pub fn with_deployed(changes: impl IntoIterator<Item = Change>) -> Self {
        let dao = Self::new();
        {
            let mut state = dao.state.lock();
            state.initialized = true;
            for change in changes {
                state.entries.insert(
                    change.key.clone(),
                    AuditEntry {
                        change,
                        insert_execution_id: None,
                        update_execution_id: None,
                    },
                );
            }
        }
        dao
    }

    /// Current audit rows in key order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Whether `init` has been called.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

#[async_trait::async_trait]
impl ChangeAuditDao for InMemoryAuditDao {
    async fn init(&self) -> DeployResult<()> {
        self.state.lock().initialized = true;
        Ok(())
    }

    async fn deployed_changes(&self) -> DeployResult<Vec<Change>> {
        let state = self.state.lock();
        if !state.initialized {
            return Ok(Vec::new());
        }
        Ok(state.entries.values().map(|e| e.change.clone()).collect())
    }

    async fn insert_new_change(&self, change: &Change, execution: &DeployExecution) -> DeployResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&change.key) {
            if existing.change.content_hash != change.content_hash {
                return Err(DeployError::HashMismatch {
                    key: change.key.clone(),
                    deployed: existing.change.content_hash.clone(),
                    source_hash: change.content_hash.clone(),
                });
            }
            return Err(DeployError::audit(format!("change {} is already tracked", change.key)));
        }
        debug!(change = %change.key, "Inserting audit entry");
        state.entries.insert(
            change.key.clone(),
            AuditEntry {
                change: change.clone(),
                insert_execution_id: execution.id,
                update_execution_id: execution.id,
            },
        );
        Ok(())
    }

    async fn update_or_insert_change(&self, change: &Change, execution: &DeployExecution) -> DeployResult<()> {
        let mut state = self.state.lock();
        let insert_execution_id = state
            .entries
            .get(&change.key)
            .map_or(execution.id, |existing| existing.insert_execution_id);
        debug!(change = %change.key, "Updating audit entry");
        state.entries.insert(
            change.key.clone(),
            AuditEntry {
                change: change.clone(),
                insert_execution_id,
                update_execution_id: execution.id,
            },
        );
        Ok(())
    }

    async fn delete_change(&self, change: &Change) -> DeployResult<()> {
        self.state.lock().entries.remove(&change.key);
        Ok(())
    }

    async fn delete_object_changes(&self, change: &Change) -> DeployResult<()> {
        let object_key = change.object_key();
        self.state
            .lock()
            .entries
            .retain(|key, _| &key.object_key != object_key);
        Ok(())
    }

    async fn acquire_lock(&self) -> DeployResult<AuditLock> {
        let mut locked = self.locked.lock();
        if *locked {
            return Err(DeployError::lock_failed("in-memory audit lock is already held"));
        }
        *locked = true;
        let flag = Arc::clone(&self.locked);
        Ok(AuditLock::new(0, move || *flag.lock() = false))
    }
}

#[derive(Debug, Default)]
struct ExecutionState {
    initialized: bool,
    next_id: u64,
    executions: Vec<DeployExecution>,
}

/// Deploy execution store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeployExecutionDao {
    state: Arc<Mutex<ExecutionState>>,
}

impl InMemoryDeployExecutionDao {
    /// Empty execution store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with persisted executions; ids must already be assigned.
    pub fn with_executions(executions: impl IntoIterator<Item = DeployExecution>) -> Self {
        let dao = Self::new();
        {
            let mut state = dao.state.lock();
            state.initialized = true;
            state.executions.extend(executions);
            state.next_id = state.executions.iter().filter_map(|e| e.id).max().unwrap_or(0);
        }
        dao
    }

    /// Every execution in insertion order.
    pub fn all(&self) -> Vec<DeployExecution> {
        self.state.lock().executions.clone()
    }
}

#[async_trait::async_trait]
impl DeployExecutionDao for InMemoryDeployExecutionDao {
    async fn init(&self) -> DeployResult<()> {
        self.state.lock().initialized = true;
        Ok(())
    }

    async fn persist_new(&self, execution: &mut DeployExecution) -> DeployResult<()> {
        if execution.id.is_some() {
            return Err(DeployError::audit(format!(
                "deploy execution for schema {} was already persisted",
                execution.schema
            )));
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        execution.id = Some(state.next_id);
        state.executions.push(execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &DeployExecution) -> DeployResult<()> {
        let mut state = self.state.lock();
        let existing = state
            .executions
            .iter_mut()
            .find(|e| e.id.is_some() && e.id == execution.id)
            .ok_or_else(|| DeployError::audit(format!("deploy execution {:?} was never persisted", execution.id)))?;
        *existing = execution.clone();
        Ok(())
    }

    async fn deploy_executions(&self, schema: &str) -> DeployResult<Vec<DeployExecution>> {
        let state = self.state.lock();
        if !state.initialized {
            return Ok(Vec::new());
        }
        let mut executions: Vec<DeployExecution> =
            state.executions.iter().filter(|e| e.schema == schema).cloned().collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }
}

/// What an [`InMemoryDeployBehavior`] was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedOperation {
    Deploy,
    Undeploy,
    Drop,
}

/// Deploy behavior that records operations instead of running them.
///
/// Objects registered with [`fail_on`](Self::fail_on) fail every operation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeployBehavior {
    applied: Arc<Mutex<Vec<(AppliedOperation, Change)>>>,
    failing_objects: BTreeSet<String>,
}

impl InMemoryDeployBehavior {
    /// Behavior that succeeds on every object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation on the named object.
    pub fn fail_on(mut self, object_name: impl Into<String>) -> Self {
        self.failing_objects.insert(object_name.into());
        self
    }

    /// Every recorded operation in call order.
    pub fn applied(&self) -> Vec<(AppliedOperation, Change)> {
        self.applied.lock().clone()
    }

    /// Content that would have run, in call order.
    pub fn statements(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|(operation, change)| match operation {
                AppliedOperation::Deploy | AppliedOperation::Undeploy => change.content_to_execute().to_string(),
                AppliedOperation::Drop => format!("DROP {} {}", change.change_type(), change.object_name()),
            })
            .collect()
    }

    /// Objects deployed, in call order.
    pub fn deployed_objects(&self) -> Vec<String> {
        self.objects(AppliedOperation::Deploy)
    }

    /// Objects undeployed, in call order.
    pub fn undeployed_objects(&self) -> Vec<String> {
        self.objects(AppliedOperation::Undeploy)
    }

    /// Objects dropped, in call order.
    pub fn dropped_objects(&self) -> Vec<String> {
        self.objects(AppliedOperation::Drop)
    }

    fn objects(&self, wanted: AppliedOperation) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .filter(|(operation, _)| *operation == wanted)
            .map(|(_, change)| change.object_name().to_string())
            .collect()
    }

    fn record(&self, operation: AppliedOperation, change: &Change) -> DeployResult<()> {
        if self.failing_objects.contains(change.object_name()) {
            return Err(DeployError::execution(format!(
                "simulated failure on {}",
                change.object_key()
            )));
        }
        self.applied.lock().push((operation, change.clone()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeployBehavior for InMemoryDeployBehavior {
    async fn deploy(&self, change: &Change, _context: &ExecutionContext) -> DeployResult<()> {
        self.record(AppliedOperation::Deploy, change)
    }

    async fn undeploy(&self, change: &Change, _context: &ExecutionContext) -> DeployResult<()> {
        self.record(AppliedOperation::Undeploy, change)
    }

    async fn drop_object(&self, change: &Change, _context: &ExecutionContext) -> DeployResult<()> {
        self.record(AppliedOperation::Drop, change)
    }
}
