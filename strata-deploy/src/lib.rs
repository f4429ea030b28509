//! # strata-deploy
//!
//! Changeset calculation and deployment engine for database schema objects.
//!
//! This crate provides functionality for:
//! - Pairing source change definitions with the audit trail of deployed changes
//! - Dependency discovery from change content and dependency graph construction
//! - Per-strategy changeset calculation (incremental, rerunnable, grouped)
//! - Deterministic ordering of drops, adds and static data loads
//! - Execution with per-object failure isolation and an aggregate failure report
//! - Audit trail and deploy execution tracking, rollback detection and onboarding
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ Source       │────▶│ Dependency     │────▶│ Change Pairs │
//! │ Changes      │     │ Graph          │     └──────────────┘
//! └──────────────┘     └────────────────┘            │
//!                                                    ▼
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ Audit Trail  │◀────│ Executor       │◀────│ Changeset    │
//! └──────────────┘     └────────────────┘     │ (sorted)     │
//!                                             └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_deploy::{
//!     Change, ChangeType, DeployArgs, DeployConfig, Deployer, GenericPlatform, InMemoryAuditDao,
//!     InMemoryDeployBehavior, InMemoryDeployExecutionDao,
//! };
//!
//! async fn deploy() -> strata_deploy::DeployResult<()> {
//!     let deployer = Deployer::new(
//!         Arc::new(GenericPlatform::default()),
//!         Arc::new(InMemoryAuditDao::new()),
//!         Arc::new(InMemoryDeployExecutionDao::new()),
//!         Arc::new(InMemoryDeployBehavior::new()),
//!     )
//!     .with_config(DeployConfig::new().with_schema("app"));
//!
//!     let sources = vec![
//!         Change::incremental(ChangeType::table(), "app", "orders", "init", 1, "create table orders (id int)"),
//!         Change::rerunnable(ChangeType::view(), "app", "open_orders", "create view open_orders as select * from orders"),
//!     ];
//!
//!     let outcome = deployer.deploy(sources, &DeployArgs::new()).await?;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```

pub mod calculator;
pub mod change;
pub mod changeset;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod history;
pub mod memory;
pub mod onboarding;
pub mod pair;
pub mod platform;
pub mod rollback;
pub mod sorter;
pub mod text;

// Re-exports
pub use calculator::ChangeTypeCalculator;
pub use change::{
    CalculatorStrategy, Change, ChangeKey, ChangeKind, ChangeType, CodeDependency, DependencyKind,
    IncrementalChange, ObjectKey, content_hash,
};
pub use changeset::{Changeset, ChangesetCreator, ChangesetSelection};
pub use command::{AuditCommand, ChangeCommand, ChangeWarning, ExecuteAction, ExecuteCommand};
pub use config::{DeployArgs, DeployConfig, DeployMode};
pub use context::{DeployMetrics, DeployOutcome, ExecutionContext};
pub use engine::{Deployer, PostDeployAction};
pub use error::{DeployError, DeployResult, FailedChange, SkippedChange};
pub use executor::{DeployBehavior, DeployExecutor, ExecutionReport};
pub use graph::{DependencyGraph, GraphEnricher, GraphSorter};
pub use history::{
    AuditLock, ChangeAuditDao, DeployExecution, DeployExecutionDao, DeployExecutionStatus,
    acquire_lock_with_retry,
};
pub use memory::{AppliedOperation, InMemoryAuditDao, InMemoryDeployBehavior, InMemoryDeployExecutionDao};
pub use onboarding::{DisabledOnboarding, EnabledOnboarding, OnboardingStrategy};
pub use pair::{ChangePair, ChangePairs};
pub use platform::{ChangeTypeRegistry, GenericPlatform, Platform};
pub use rollback::RollbackDetector;
pub use sorter::ChangeCommandSorter;
pub use text::TextDependencyExtractor;
