//! Integration tests for the end-to-end deploy flow.
//!
//! These tests run the deployer against the in-memory audit trail, execution store and deploy
//! behavior, covering ordering, failure isolation and the changeset warning scenarios.

use std::sync::Arc;

use strata::deploy::{
    AppliedOperation, Change, ChangeType, ChangesetSelection, CodeDependency, DeployArgs, DeployConfig,
    DeployError, DeployExecutionStatus, Deployer, GenericPlatform, InMemoryAuditDao, InMemoryDeployBehavior,
    InMemoryDeployExecutionDao,
};

struct Environment {
    audit: InMemoryAuditDao,
    executions: InMemoryDeployExecutionDao,
    behavior: InMemoryDeployBehavior,
}

impl Environment {
    fn new() -> Self {
        Self::with_behavior(InMemoryDeployBehavior::new())
    }

    fn with_behavior(behavior: InMemoryDeployBehavior) -> Self {
        init_tracing();
        Self {
            audit: InMemoryAuditDao::new(),
            executions: InMemoryDeployExecutionDao::new(),
            behavior,
        }
    }

    fn deployer(&self) -> Deployer {
        Deployer::new(
            Arc::new(GenericPlatform::default()),
            Arc::new(self.audit.clone()),
            Arc::new(self.executions.clone()),
            Arc::new(self.behavior.clone()),
        )
        .with_config(DeployConfig::new().with_schema("app").with_lock_retry(0, 1))
    }

    /// `object.change` for every deployed change, in execution order.
    fn deployed_labels(&self) -> Vec<String> {
        self.behavior
            .applied()
            .into_iter()
            .filter(|(operation, _)| *operation == AppliedOperation::Deploy)
            .map(|(_, change)| format!("{}.{}", change.object_name(), change.change_name()))
            .collect()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn table(object: &str, change: &str, order: i32, content: &str) -> Change {
    Change::incremental(ChangeType::table(), "app", object, change, order, content)
}

fn view(object: &str, content: &str) -> Change {
    Change::rerunnable(ChangeType::view(), "app", object, content)
}

#[tokio::test]
async fn test_dependent_tables_deploy_in_dependency_order() {
    let env = Environment::new();
    let sources = vec![
        table("bTab", "2", 2, "alter table bTab add fk").with_dependencies([CodeDependency::explicit("aTab.3")]),
        table("aTab", "3", 3, "alter table aTab add z"),
        table("bTab", "1", 1, "create table bTab"),
        table("aTab", "2", 2, "alter table aTab add y"),
        table("aTab", "1", 1, "create table aTab"),
    ];

    let outcome = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap();
    assert_eq!(outcome.executed, 5);

    let order = env.deployed_labels();
    let pos = |label: &str| order.iter().position(|l| l == label).unwrap();
    assert!(pos("aTab.1") < pos("aTab.2"));
    assert!(pos("aTab.2") < pos("aTab.3"));
    assert!(pos("aTab.3") < pos("bTab.2"));
    assert!(pos("bTab.1") < pos("bTab.2"));
}

#[tokio::test]
async fn test_explicit_rollback_undoes_changes_in_reverse_order() {
    let env = Environment::new();
    let release = vec![
        table("aTab", "1", 1, "create table aTab"),
        table("aTab", "2", 2, "alter table aTab add x").with_rollback("alter table aTab drop x"),
        table("aTab", "3", 3, "alter table aTab add y").with_rollback("alter table aTab drop y"),
        table("aTab", "4", 4, "alter table aTab add z").with_rollback("alter table aTab drop z"),
    ];
    env.deployer().deploy(release.clone(), &DeployArgs::new()).await.unwrap();
    assert_eq!(env.deployed_labels(), vec!["aTab.1", "aTab.2", "aTab.3", "aTab.4"]);

    let outcome = env
        .deployer()
        .deploy(release[..1].to_vec(), &DeployArgs::new().rollback(true))
        .await
        .unwrap();
    assert!(outcome.rollback);

    let undone: Vec<String> = env
        .behavior
        .applied()
        .into_iter()
        .filter(|(operation, _)| *operation == AppliedOperation::Undeploy)
        .map(|(_, change)| change.content_to_execute().to_string())
        .collect();
    assert_eq!(
        undone,
        vec!["alter table aTab drop z", "alter table aTab drop y", "alter table aTab drop x"]
    );
    assert_eq!(env.audit.entries().len(), 1);
}

#[tokio::test]
async fn test_execution_order_is_deterministic() {
    let sources = || {
        vec![
            view("v_orders", "select * from orders join customers"),
            table("orders", "1", 1, "create table orders"),
            table("customers", "1", 1, "create table customers"),
            view("v_summary", "select * from v_orders"),
            table("orders", "2", 2, "alter table orders add customer_id"),
        ]
    };

    let first = Environment::new();
    first.deployer().deploy(sources(), &DeployArgs::new()).await.unwrap();
    for _ in 0..3 {
        let again = Environment::new();
        again.deployer().deploy(sources(), &DeployArgs::new()).await.unwrap();
        assert_eq!(again.behavior.statements(), first.behavior.statements());
    }

    let order = first.deployed_labels();
    let pos = |label: &str| order.iter().position(|l| l == label).unwrap();
    assert!(pos("orders.2") < pos("v_orders.n/a"));
    assert!(pos("customers.1") < pos("v_orders.n/a"));
    assert!(pos("v_orders.n/a") < pos("v_summary.n/a"));
}

#[tokio::test]
async fn test_redeploying_unchanged_sources_is_noop() {
    let env = Environment::new();
    let sources = vec![table("t", "1", 1, "create table t"), view("v", "select * from t")];

    env.deployer().deploy(sources.clone(), &DeployArgs::new()).await.unwrap();
    let applied = env.behavior.applied().len();

    let outcome = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap();
    assert!(!outcome.has_changes());
    assert_eq!(outcome.summary(), "No changes deployed");
    assert_eq!(env.behavior.applied().len(), applied);
}

#[tokio::test]
async fn test_independent_failure_does_not_block_others() {
    let env = Environment::with_behavior(InMemoryDeployBehavior::new().fail_on("b"));
    let sources = vec![
        table("a", "1", 1, "create table a"),
        table("b", "1", 1, "create table b"),
        table("c", "1", 1, "create table c"),
    ];

    let err = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap_err();
    let DeployError::DeployFailed { message, failures, skipped } = err else {
        panic!("expected an aggregate failure");
    };
    assert_eq!(failures.len(), 1);
    assert!(skipped.is_empty());
    assert!(message.contains("Object [b]"));
    assert!(message.contains("Root Exception Message: Execution error: simulated failure"));

    assert_eq!(env.behavior.deployed_objects(), vec!["a", "c"]);
    let audited: Vec<String> = env.audit.entries().iter().map(|e| e.change.object_name().to_string()).collect();
    assert_eq!(audited, vec!["a", "c"]);
    assert_eq!(env.executions.all()[0].status, DeployExecutionStatus::Failed);
    assert!(!env.audit.is_locked());
}

#[tokio::test]
async fn test_dependents_of_failed_change_are_skipped() {
    let env = Environment::with_behavior(InMemoryDeployBehavior::new().fail_on("a"));
    let sources = vec![
        table("a", "init", 1, "create table a"),
        view("v", "select * from a"),
        table("other", "init", 1, "create table other"),
    ];

    let err = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap_err();
    let DeployError::DeployFailed { failures, skipped, .. } = err else {
        panic!("expected an aggregate failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].description.contains("Object [v]"));
    assert_eq!(skipped[0].blocked_by, vec!["[a.init]"]);
    assert_eq!(env.behavior.deployed_objects(), vec!["other"]);
}

#[tokio::test]
async fn test_changed_view_is_redeployed() {
    let env = Environment::new();
    env.deployer()
        .deploy(vec![view("v", "select 1")], &DeployArgs::new())
        .await
        .unwrap();

    let outcome = env
        .deployer()
        .deploy(vec![view("v", "select 2")], &DeployArgs::new())
        .await
        .unwrap();
    assert_eq!(outcome.executed, 1);
    assert!(outcome.warnings.is_empty());
    assert_eq!(env.behavior.statements(), vec!["select 1", "select 2"]);

    let entries = env.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].change.content, "select 2");
    assert_eq!(entries[0].insert_execution_id, Some(1));
    assert_eq!(entries[0].update_execution_id, Some(2));
}

#[tokio::test]
async fn test_edited_incremental_change_blocks_deployment() {
    let env = Environment::new();
    let original = table("t", "1", 1, "create table t (a int)");
    let original_hash = original.content_hash.clone();
    env.deployer().deploy(vec![original], &DeployArgs::new()).await.unwrap();

    let edited = table("t", "1", 1, "create table t (a bigint)");
    let edited_hash = edited.content_hash.clone();
    let err = env
        .deployer()
        .deploy(vec![edited, table("u", "1", 1, "create table u")], &DeployArgs::new())
        .await
        .unwrap_err();

    let DeployError::FatalWarnings(messages) = &err else {
        panic!("expected fatal warnings, got {err:?}");
    };
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains(&original_hash));
    assert!(messages[0].contains(&edited_hash));
    assert!(err.to_string().starts_with("Found exceptions:\n"));
    assert_eq!(env.behavior.deployed_objects(), vec!["t"]);
}

#[tokio::test]
async fn test_init_only_accepts_edited_change() {
    let env = Environment::new();
    env.deployer()
        .deploy(vec![table("t", "1", 1, "create table t (a int)")], &DeployArgs::new())
        .await
        .unwrap();

    let outcome = env
        .deployer()
        .deploy(vec![table("t", "1", 1, "create table t (a bigint)")], &DeployArgs::new().init_only(true))
        .await
        .unwrap();
    assert_eq!(outcome.audited, 1);
    assert_eq!(env.audit.entries()[0].change.content, "create table t (a bigint)");
    assert_eq!(env.behavior.applied().len(), 1);
}

#[tokio::test]
async fn test_incomplete_baseline_is_fatal() {
    let env = Environment::new();
    env.deployer()
        .deploy(vec![table("t", "c1", 1, "create table t")], &DeployArgs::new())
        .await
        .unwrap();

    let baseline = table("t", "bl", 1, "create table t (a int)").with_baselined_changes(["c1", "c2"]);
    let err = env.deployer().deploy(vec![baseline], &DeployArgs::new()).await.unwrap_err();
    let DeployError::FatalWarnings(messages) = err else {
        panic!("expected fatal warnings");
    };
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("[c2]"));
}

#[tokio::test]
async fn test_complete_baseline_replaces_audit_rows() {
    let env = Environment::new();
    env.deployer()
        .deploy(
            vec![table("t", "c1", 1, "create table t"), table("t", "c2", 2, "alter table t add a")],
            &DeployArgs::new(),
        )
        .await
        .unwrap();

    let baseline = table("t", "bl", 1, "create table t (a int)").with_baselined_changes(["c1", "c2"]);
    let outcome = env.deployer().deploy(vec![baseline], &DeployArgs::new()).await.unwrap();
    assert_eq!(outcome.audited, 1);
    assert_eq!(outcome.executed, 0);

    let names: Vec<String> = env.audit.entries().iter().map(|e| e.change.change_name().to_string()).collect();
    assert_eq!(names, vec!["bl"]);
}

#[tokio::test]
async fn test_cycle_is_reported_before_execution() {
    let env = Environment::new();
    let sources = vec![view("v1", "select * from v2"), view("v2", "select * from v1")];

    let err = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap_err();
    let DeployError::Cycle { cycles, message } = err else {
        panic!("expected a cycle error");
    };
    assert_eq!(cycles.len(), 1);
    assert!(message.contains("v1"));
    assert!(message.contains("v2"));
    assert!(env.behavior.applied().is_empty());
    assert!(env.executions.all().is_empty());
}

#[tokio::test]
async fn test_duplicate_source_key_is_rejected() {
    let env = Environment::new();
    let sources = vec![
        table("t", "1", 1, "create table t"),
        table("t", "1", 1, "create table t (again)"),
    ];
    let err = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap_err();
    assert!(matches!(err, DeployError::DuplicateChangeKey { side: "source", .. }));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_tagged_changes_wait_for_their_changeset() {
    let env = Environment::new();
    let sources = vec![
        table("t", "1", 1, "create table t"),
        table("later", "1", 1, "create table later").with_changeset("release2"),
    ];

    let outcome = env.deployer().deploy(sources.clone(), &DeployArgs::new()).await.unwrap();
    assert_eq!(outcome.executed, 1);
    assert_eq!(outcome.deferred, 1);
    assert_eq!(env.behavior.deployed_objects(), vec!["t"]);

    let outcome = env
        .deployer()
        .deploy(sources, &DeployArgs::new().changesets(ChangesetSelection::named(["release2"])))
        .await
        .unwrap();
    assert_eq!(outcome.executed, 1);
    assert_eq!(outcome.deferred, 0);
    assert_eq!(env.behavior.deployed_objects(), vec!["t", "later"]);
}

#[tokio::test]
async fn test_parallel_group_deploys_together() {
    let env = Environment::new();
    let sources = vec![
        table("p1", "1", 1, "create table p1").with_parallel_group("bulk"),
        table("p2", "1", 1, "create table p2").with_parallel_group("bulk"),
        table("p3", "1", 1, "create table p3").with_parallel_group("bulk"),
    ];

    let outcome = env.deployer().deploy(sources, &DeployArgs::new()).await.unwrap();
    assert_eq!(outcome.executed, 1);
    let mut deployed = env.behavior.deployed_objects();
    deployed.sort();
    assert_eq!(deployed, vec!["p1", "p2", "p3"]);
    assert_eq!(env.audit.entries().len(), 3);
}

#[tokio::test]
async fn test_removed_view_is_dropped() {
    let env = Environment::new();
    env.deployer()
        .deploy(vec![view("keep", "select 1"), view("gone", "select 2")], &DeployArgs::new())
        .await
        .unwrap();

    env.deployer()
        .deploy(vec![view("keep", "select 1")], &DeployArgs::new())
        .await
        .unwrap();
    assert_eq!(env.behavior.dropped_objects(), vec!["gone"]);
    let remaining: Vec<String> = env.audit.entries().iter().map(|e| e.change.object_name().to_string()).collect();
    assert_eq!(remaining, vec!["keep"]);
}
