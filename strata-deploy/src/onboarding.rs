//! Onboarding: relocate failing source files instead of blocking on them.
//!
//! With onboarding enabled, a change that fails moves its file into an `exceptions` directory next
//! to it together with a `<file>.exception` report; if it later succeeds it moves back. Changes
//! whose content mentions an object that already failed go to the dependent exception directory
//! instead.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::change::Change;
use crate::error::{DeployError, DeployResult};

/// Default directory for failing files.
pub const EXCEPTION_DIR: &str = "exceptions";

/// Directory for files that failed because an object they mention failed.
pub const DEPENDENT_EXCEPTION_DIR: &str = "dependentExceptions";

/// Hook notified about every executed change.
#[async_trait::async_trait]
pub trait OnboardingStrategy: Send + Sync {
    /// Called after a change deployed successfully.
    async fn handle_success(&self, change: &Change) -> DeployResult<()>;

    /// Called after a change failed; `failed_objects` holds the objects failed so far.
    async fn handle_exception(
        &self,
        change: &Change,
        error: &DeployError,
        failed_objects: &BTreeSet<String>,
    ) -> DeployResult<()>;

    /// Check the source directories before a run.
    async fn validate_source_dirs(&self, source_dirs: &[PathBuf], schemas: &[String]) -> DeployResult<()>;
}

/// Regular deployments: nothing moves, and leftover exception directories are rejected.
#[derive(Debug, Clone)]
pub struct DisabledOnboarding {
    exception_dir: String,
}

impl DisabledOnboarding {
    /// Strategy that only checks for leftover exception directories named `exception_dir`.
    pub fn new(exception_dir: impl Into<String>) -> Self {
        Self {
            exception_dir: exception_dir.into(),
        }
    }
}

impl Default for DisabledOnboarding {
    fn default() -> Self {
        Self::new(EXCEPTION_DIR)
    }
}

#[async_trait::async_trait]
impl OnboardingStrategy for DisabledOnboarding {
    async fn handle_success(&self, _change: &Change) -> DeployResult<()> {
        Ok(())
    }

    async fn handle_exception(&self, _: &Change, _: &DeployError, _: &BTreeSet<String>) -> DeployResult<()> {
        Ok(())
    }

    async fn validate_source_dirs(&self, source_dirs: &[PathBuf], schemas: &[String]) -> DeployResult<()> {
        for source_dir in source_dirs {
            let mut leftovers = Vec::new();
            for schema_dir in child_dirs(source_dir).await? {
                let is_schema = dir_name(&schema_dir).is_some_and(|name| schemas.iter().any(|s| s.eq_ignore_ascii_case(name)));
                if !is_schema {
                    continue;
                }
                let mut pending = vec![schema_dir];
                while let Some(dir) = pending.pop() {
                    for child in child_dirs(&dir).await? {
                        let is_exception_dir = dir_name(&child).is_some_and(|name| {
                            name.eq_ignore_ascii_case(&self.exception_dir)
                                || name.eq_ignore_ascii_case(DEPENDENT_EXCEPTION_DIR)
                        });
                        if is_exception_dir {
                            leftovers.push(child.display().to_string());
                        } else {
                            pending.push(child);
                        }
                    }
                }
            }
            if !leftovers.is_empty() {
                leftovers.sort();
                return Err(DeployError::config(format!(
                    "Directory {} has exception folders that need to be removed before regular deployments: [{}]",
                    source_dir.display(),
                    leftovers.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Onboarding deployments: failing files move into exception directories.
#[derive(Debug, Clone)]
pub struct EnabledOnboarding {
    exception_dir: String,
}

impl EnabledOnboarding {
    /// Strategy that moves failing files into `exception_dir`.
    pub fn new(exception_dir: impl Into<String>) -> Self {
        Self {
            exception_dir: exception_dir.into(),
        }
    }

    fn is_dependent_exception(change: &Change, failed_objects: &BTreeSet<String>) -> bool {
        let content = change.content.to_uppercase();
        failed_objects
            .iter()
            .any(|object| content.contains(&object.to_uppercase()))
    }
}

impl Default for EnabledOnboarding {
    fn default() -> Self {
        Self::new(EXCEPTION_DIR)
    }
}

#[async_trait::async_trait]
impl OnboardingStrategy for EnabledOnboarding {
    async fn handle_success(&self, change: &Change) -> DeployResult<()> {
        let Some(file) = existing_file(change).await else {
            return Ok(());
        };
        let (Some(dir), Some(file_name)) = (file.parent(), file.file_name()) else {
            return Ok(());
        };
        let in_exception_dir =
            dir_name(dir).is_some_and(|name| name == self.exception_dir || name == DEPENDENT_EXCEPTION_DIR);
        let Some(regular_dir) = dir.parent().filter(|_| in_exception_dir) else {
            return Ok(());
        };

        let target = regular_dir.join(file_name);
        info!(from = %file.display(), to = %target.display(), "Moving onboarded file back after success");
        tokio::fs::rename(&file, &target).await?;
        remove_if_exists(&exception_report(dir, file_name)).await?;
        Ok(())
    }

    async fn handle_exception(
        &self,
        change: &Change,
        error: &DeployError,
        failed_objects: &BTreeSet<String>,
    ) -> DeployResult<()> {
        let Some(file) = existing_file(change).await else {
            return Ok(());
        };
        let (Some(dir), Some(file_name)) = (file.parent(), file.file_name()) else {
            return Ok(());
        };
        let dependent = Self::is_dependent_exception(change, failed_objects);

        let exception_dir = match dir_name(dir) {
            Some(name) if name == self.exception_dir => dir.to_path_buf(),
            Some(DEPENDENT_EXCEPTION_DIR) if dependent => dir.to_path_buf(),
            Some(DEPENDENT_EXCEPTION_DIR) => {
                let target_dir = dir.parent().unwrap_or(dir).join(&self.exception_dir);
                tokio::fs::create_dir_all(&target_dir).await?;
                tokio::fs::rename(&file, target_dir.join(file_name)).await?;
                remove_if_exists(&exception_report(dir, file_name)).await?;
                target_dir
            }
            _ => {
                let target_dir = dir.join(if dependent { DEPENDENT_EXCEPTION_DIR } else { self.exception_dir.as_str() });
                tokio::fs::create_dir_all(&target_dir).await?;
                tokio::fs::rename(&file, target_dir.join(file_name)).await?;
                target_dir
            }
        };

        let report = exception_report(&exception_dir, file_name);
        debug!(report = %report.display(), "Writing onboarding exception report");
        tokio::fs::write(&report, render_error(error)).await?;
        Ok(())
    }

    async fn validate_source_dirs(&self, _source_dirs: &[PathBuf], _schemas: &[String]) -> DeployResult<()> {
        Ok(())
    }
}

async fn existing_file(change: &Change) -> Option<PathBuf> {
    let file = change.file_location.as_ref()?;
    match tokio::fs::try_exists(file).await {
        Ok(true) => Some(file.clone()),
        _ => None,
    }
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn exception_report(dir: &Path, file_name: &std::ffi::OsStr) -> PathBuf {
    let mut name = file_name.to_os_string();
    name.push(".exception");
    dir.join(name)
}

async fn remove_if_exists(path: &Path) -> DeployResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn child_dirs(dir: &Path) -> DeployResult<Vec<PathBuf>> {
    let mut children = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(children),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            children.push(entry.path());
        }
    }
    children.sort();
    Ok(children)
}

/// The error and each of its causes, one per line.
fn render_error(error: &DeployError) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        lines.push(format!("Caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}
