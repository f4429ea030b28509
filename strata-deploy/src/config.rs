//! Deployer configuration and per-run arguments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::changeset::ChangesetSelection;
use crate::error::{DeployError, DeployResult};

const DEFAULT_PARALLEL_THREADS: usize = 5;
const DEFAULT_LOCK_RETRY_SECS: u64 = 5;
const DEFAULT_LOCK_MAX_ATTEMPTS: u32 = 60;
const DEFAULT_EXCEPTION_DIR: &str = "exceptions";

/// Settings shared by every run against an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Who asked for the deployment.
    pub requester_id: Option<String>,
    /// Who runs the deployment.
    pub executor_id: String,
    /// Version recorded on every deploy execution.
    pub tool_version: String,
    /// Schemas the environment deploys to.
    pub schemas: Vec<String>,
    /// Concurrency hint for parallel deploy groups.
    pub parallel_threads: usize,
    /// Seconds between audit lock attempts.
    pub lock_retry_interval_secs: u64,
    /// Audit lock attempts before giving up.
    pub lock_max_attempts: u32,
    /// Detect rollbacks from the product version history.
    pub rollback_detection: bool,
    /// Directory name that onboarding moves failing files into.
    pub exception_dir: String,
    /// Source roots checked for leftover exception directories before a run.
    pub source_dirs: Vec<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            requester_id: None,
            executor_id: "strata".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            schemas: Vec::new(),
            parallel_threads: DEFAULT_PARALLEL_THREADS,
            lock_retry_interval_secs: DEFAULT_LOCK_RETRY_SECS,
            lock_max_attempts: DEFAULT_LOCK_MAX_ATTEMPTS,
            rollback_detection: true,
            exception_dir: DEFAULT_EXCEPTION_DIR.to_string(),
            source_dirs: Vec::new(),
        }
    }
}

impl DeployConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> DeployResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DeployError::config_file(format!("Failed to read config file {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DeployError::config_file(format!("Failed to parse config file {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as TOML.
    pub async fn save(&self, path: impl AsRef<Path>) -> DeployResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeployError::config_file(format!("Failed to create directory: {}", e)))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DeployError::config_file(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| DeployError::config_file(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Reject settings the deployer cannot run with.
    pub fn validate(&self) -> DeployResult<()> {
        if self.parallel_threads == 0 {
            return Err(DeployError::config("parallel_threads must be at least 1"));
        }
        if self.executor_id.trim().is_empty() {
            return Err(DeployError::config("executor_id must not be empty"));
        }
        if self.exception_dir.trim().is_empty() {
            return Err(DeployError::config("exception_dir must not be empty"));
        }
        Ok(())
    }

    /// Delay between lock attempts.
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_secs(self.lock_retry_interval_secs)
    }

    /// Set the requester recorded on executions.
    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    /// Set the executor recorded on executions.
    pub fn with_executor(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    /// Set the tool version recorded on executions.
    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = version.into();
        self
    }

    /// Add a managed schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schemas.push(schema.into());
        self
    }

    /// Set the parallel deploy thread count.
    pub fn with_parallel_threads(mut self, threads: usize) -> Self {
        self.parallel_threads = threads;
        self
    }

    /// Set the lock retry interval and attempt limit.
    pub fn with_lock_retry(mut self, interval_secs: u64, max_attempts: u32) -> Self {
        self.lock_retry_interval_secs = interval_secs;
        self.lock_max_attempts = max_attempts;
        self
    }

    /// Enable or disable product-version rollback detection.
    pub fn with_rollback_detection(mut self, enabled: bool) -> Self {
        self.rollback_detection = enabled;
        self
    }

    /// Set the onboarding exception directory name.
    pub fn with_exception_dir(mut self, dir: impl Into<String>) -> Self {
        self.exception_dir = dir.into();
        self
    }

    /// Add a source directory checked for leftover onboarding exceptions.
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dirs.push(dir.into());
        self
    }
}

/// How commands are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Run every command against the target and record it.
    #[default]
    Execute,
    /// Record commands in the audit trail without touching the target.
    ForceInit,
}

impl DeployMode {
    /// Whether hash mismatches on already deployed changes are accepted.
    pub fn is_init_allowed_on_hash_exceptions(self) -> bool {
        matches!(self, Self::ForceInit)
    }

    /// Verb used when listing the changes to apply.
    pub fn deploy_verb(self) -> &'static str {
        match self {
            Self::Execute => "deployed",
            Self::ForceInit => "marked as deployed in the audit table only (init mode)",
        }
    }
}

/// Arguments of a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployArgs {
    /// Run in rollback mode.
    pub rollback: bool,
    /// Calculate and print the changeset without executing it.
    pub preview: bool,
    /// Only initialize the audit trail.
    pub init_only: bool,
    /// Move failing source files aside instead of blocking.
    pub onboarding: bool,
    /// Version of the product being deployed; drives rollback detection.
    pub product_version: Option<String>,
    /// Free text recorded on the deploy execution.
    pub reason: Option<String>,
    /// Which changeset-tagged commands run.
    pub changesets: ChangesetSelection,
}

impl DeployArgs {
    /// Arguments for a plain forward deploy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a rollback.
    pub fn rollback(mut self, rollback: bool) -> Self {
        self.rollback = rollback;
        self
    }

    /// Stop after printing the changeset.
    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// Mark the audit trail without touching the target.
    pub fn init_only(mut self, init_only: bool) -> Self {
        self.init_only = init_only;
        self
    }

    /// Relocate failing source files instead of only reporting them.
    pub fn onboarding(mut self, onboarding: bool) -> Self {
        self.onboarding = onboarding;
        self
    }

    /// Product version recorded on the executions.
    pub fn product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into());
        self
    }

    /// Reason recorded on the executions.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Select which tagged changesets run.
    pub fn changesets(mut self, selection: ChangesetSelection) -> Self {
        self.changesets = selection;
        self
    }

    /// The deploy mode these arguments ask for.
    pub fn deploy_mode(&self) -> DeployMode {
        if self.init_only {
            DeployMode::ForceInit
        } else {
            DeployMode::Execute
        }
    }
}
