//! # Strata
//!
//! Dependency-aware deployment of database schema changes.
//!
//! Strata provides:
//! - Incremental, rerunnable and grouped change definitions for schema objects
//! - Changeset calculation against an audit trail of what is already deployed
//! - Dependency discovery and deterministic, cycle-checked ordering
//! - Execution that isolates failures per object and reports them together
//! - Rollback detection from product versions, onboarding of failing files, preview runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), strata::DeployError> {
//!     let deployer = Deployer::new(
//!         Arc::new(GenericPlatform::default()),
//!         Arc::new(InMemoryAuditDao::new()),
//!         Arc::new(InMemoryDeployExecutionDao::new()),
//!         Arc::new(InMemoryDeployBehavior::new()),
//!     );
//!
//!     let sources = vec![Change::incremental(
//!         ChangeType::table(),
//!         "app",
//!         "orders",
//!         "init",
//!         1,
//!         "create table orders (id int)",
//!     )];
//!
//!     let outcome = deployer.deploy(sources, &DeployArgs::new().preview(true)).await?;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The deployment engine.
pub mod deploy {
    pub use strata_deploy::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::deploy::{
        Change, ChangeType, ChangesetSelection, DeployArgs, DeployBehavior, DeployConfig, Deployer,
        GenericPlatform, InMemoryAuditDao, InMemoryDeployBehavior, InMemoryDeployExecutionDao, Platform,
    };
}

// Re-export key types at the crate root
pub use deploy::{DeployError, DeployOutcome, DeployResult};
