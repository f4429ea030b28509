//! Integration tests for onboarding deployments that relocate failing source files.

use std::path::Path;
use std::sync::Arc;

use strata::deploy::{
    Change, ChangeType, DeployArgs, DeployConfig, DeployError, Deployer, GenericPlatform, InMemoryAuditDao,
    InMemoryDeployBehavior, InMemoryDeployExecutionDao,
};
use tempfile::TempDir;

fn deployer(audit: &InMemoryAuditDao, behavior: &InMemoryDeployBehavior) -> Deployer {
    Deployer::new(
        Arc::new(GenericPlatform::default()),
        Arc::new(audit.clone()),
        Arc::new(InMemoryDeployExecutionDao::new()),
        Arc::new(behavior.clone()),
    )
    .with_config(DeployConfig::new().with_schema("app").with_lock_retry(0, 1))
}

fn table_from(path: &Path, object: &str) -> Change {
    Change::incremental(ChangeType::table(), "app", object, "init", 1, format!("create table {object}"))
        .with_file_location(path)
}

#[tokio::test]
async fn test_failing_file_moves_to_exceptions_and_back() {
    let dir = TempDir::new().unwrap();
    let table_dir = dir.path().join("app").join("table");
    tokio::fs::create_dir_all(&table_dir).await.unwrap();
    let original = table_dir.join("broken.sql");
    tokio::fs::write(&original, "create table broken").await.unwrap();

    let audit = InMemoryAuditDao::new();
    let failing = InMemoryDeployBehavior::new().fail_on("broken");
    let err = deployer(&audit, &failing)
        .deploy(vec![table_from(&original, "broken")], &DeployArgs::new().onboarding(true))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::DeployFailed { .. }));

    let moved = table_dir.join("exceptions").join("broken.sql");
    let report = table_dir.join("exceptions").join("broken.sql.exception");
    assert!(!original.exists());
    assert!(moved.exists());
    let report_text = tokio::fs::read_to_string(&report).await.unwrap();
    assert!(report_text.contains("simulated failure"));

    let fixed = InMemoryDeployBehavior::new();
    deployer(&audit, &fixed)
        .deploy(vec![table_from(&moved, "broken")], &DeployArgs::new().onboarding(true))
        .await
        .unwrap();
    assert!(original.exists());
    assert!(!moved.exists());
    assert!(!report.exists());
}

#[tokio::test]
async fn test_dependent_failure_goes_to_dependent_exceptions() {
    let dir = TempDir::new().unwrap();
    let table_dir = dir.path().join("app").join("table");
    let view_dir = dir.path().join("app").join("view");
    tokio::fs::create_dir_all(&table_dir).await.unwrap();
    tokio::fs::create_dir_all(&view_dir).await.unwrap();
    let table_file = table_dir.join("base.sql");
    let view_file = view_dir.join("v_base.sql");
    tokio::fs::write(&table_file, "create table base").await.unwrap();
    tokio::fs::write(&view_file, "create view v_base as select * from base").await.unwrap();

    // No declared dependencies, so the view is attempted instead of skipped.
    let behavior = InMemoryDeployBehavior::new().fail_on("base").fail_on("v_base");
    let sources = vec![
        table_from(&table_file, "base"),
        Change::rerunnable(ChangeType::view(), "app", "v_base", "create view v_base as select * from base")
            .with_file_location(&view_file)
            .with_dependencies([]),
    ];
    let err = deployer(&InMemoryAuditDao::new(), &behavior)
        .deploy(sources, &DeployArgs::new().onboarding(true))
        .await
        .unwrap_err();
    let DeployError::DeployFailed { failures, .. } = err else {
        panic!("expected an aggregate failure");
    };
    assert_eq!(failures.len(), 2);

    assert!(table_dir.join("exceptions").join("base.sql").exists());
    assert!(view_dir.join("dependentExceptions").join("v_base.sql").exists());
}
