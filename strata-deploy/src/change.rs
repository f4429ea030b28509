//! Change definitions and their identity keys.
//!
//! A [`Change`] is one unit of work against a schema object. Incremental changes are applied once
//! in `order_within_object` order; rerunnable changes carry the full object definition and are
//! redeployed whenever their content hash moves.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fallback ordering for data-load commands.
pub const DEFAULT_CHANGE_ORDER: i32 = 500;

/// Change name used for rerunnable objects, which only ever have one change.
pub const RERUNNABLE_CHANGE_NAME: &str = "n/a";

/// How the changeset calculator treats a change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculatorStrategy {
    /// Ordered, apply-once changes (tables, migrations).
    Incremental,
    /// Full object definitions redeployed one object at a time (views, procedures).
    Rerunnable,
    /// Rerunnable objects deployed together per connected component (static data).
    Grouped,
}

/// A kind of schema object along with the rules for calculating its changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeType {
    /// Upper-case type name, e.g. `TABLE`.
    pub name: String,
    /// Calculator strategy.
    pub strategy: CalculatorStrategy,
    /// Lower values deploy earlier among otherwise unordered changes.
    pub deploy_order_priority: i32,
    /// Whether the content is scanned for dependencies on other objects.
    pub enrichable_for_dependencies: bool,
    /// Whether a change to one object forces a redeploy of same-type objects that depend on it.
    pub dependent_object_recalculation: bool,
}

impl ChangeType {
    /// Table type name.
    pub const TABLE: &'static str = "TABLE";
    /// Foreign key type name; ordered together with its table.
    pub const FOREIGN_KEY: &'static str = "FOREIGN_KEY";
    /// Trigger type name; ordered together with its table.
    pub const TRIGGER: &'static str = "TRIGGER";
    /// View type name.
    pub const VIEW: &'static str = "VIEW";
    /// Stored procedure type name.
    pub const SP: &'static str = "SP";
    /// Function type name.
    pub const FUNCTION: &'static str = "FUNCTION";
    /// Sequence type name.
    pub const SEQUENCE: &'static str = "SEQUENCE";
    /// Static data type name.
    pub const STATICDATA: &'static str = "STATICDATA";
    /// Migration type name; migrations are dropped from the audit trail once source removes them.
    pub const MIGRATION: &'static str = "MIGRATION";

    /// Create a change type with the given strategy.
    pub fn new(name: impl Into<String>, strategy: CalculatorStrategy) -> Self {
        Self {
            name: name.into().to_uppercase(),
            strategy,
            deploy_order_priority: 0,
            enrichable_for_dependencies: true,
            dependent_object_recalculation: false,
        }
    }

    /// Create an incremental change type.
    pub fn incremental(name: impl Into<String>) -> Self {
        Self::new(name, CalculatorStrategy::Incremental)
    }

    /// Create a rerunnable change type.
    pub fn rerunnable(name: impl Into<String>) -> Self {
        Self::new(name, CalculatorStrategy::Rerunnable)
    }

    /// Create a grouped rerunnable change type.
    pub fn grouped(name: impl Into<String>) -> Self {
        Self::new(name, CalculatorStrategy::Grouped)
    }

    /// Set the deploy order priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.deploy_order_priority = priority;
        self
    }

    /// Enable or disable dependency discovery from content.
    pub fn with_dependency_enrichment(mut self, enabled: bool) -> Self {
        self.enrichable_for_dependencies = enabled;
        self
    }

    /// Enable or disable dependent object recalculation.
    pub fn with_dependent_object_recalculation(mut self, enabled: bool) -> Self {
        self.dependent_object_recalculation = enabled;
        self
    }

    /// Tables: incremental, priority 10.
    pub fn table() -> Self {
        Self::incremental(Self::TABLE).with_priority(10)
    }

    /// Foreign keys, ordered with their table.
    pub fn foreign_key() -> Self {
        Self::incremental(Self::FOREIGN_KEY).with_priority(10)
    }

    /// Triggers, ordered with their table.
    pub fn trigger() -> Self {
        Self::incremental(Self::TRIGGER).with_priority(10)
    }

    /// Sequences deploy ahead of tables.
    pub fn sequence() -> Self {
        Self::incremental(Self::SEQUENCE).with_priority(5)
    }

    /// One-off data migrations.
    pub fn migration() -> Self {
        Self::incremental(Self::MIGRATION).with_priority(10)
    }

    /// Views: rerunnable, priority 20.
    pub fn view() -> Self {
        Self::rerunnable(Self::VIEW).with_priority(20)
    }

    /// Functions: rerunnable, priority 20.
    pub fn function() -> Self {
        Self::rerunnable(Self::FUNCTION).with_priority(20)
    }

    /// Stored procedures: rerunnable, priority 30.
    pub fn sp() -> Self {
        Self::rerunnable(Self::SP).with_priority(30)
    }

    /// Static data loads, deployed per connected component.
    pub fn static_data() -> Self {
        Self::grouped(Self::STATICDATA)
            .with_priority(40)
            .with_dependency_enrichment(false)
    }

    /// Whether changes of this type are rerunnable.
    pub fn is_rerunnable(&self) -> bool {
        self.strategy != CalculatorStrategy::Incremental
    }

    /// Whether this type loads data rather than defining structure.
    pub fn is_static_data(&self) -> bool {
        self.name == Self::STATICDATA
    }

    /// Whether this type holds one-off data migrations.
    pub fn is_migration(&self) -> bool {
        self.name.eq_ignore_ascii_case(Self::MIGRATION)
    }

    /// Type name used to group changes that share one ordering chain.
    ///
    /// Triggers and foreign keys are ordered together with the table they belong to.
    pub fn implicit_ordering_name(&self) -> &str {
        match self.name.as_str() {
            Self::FOREIGN_KEY | Self::TRIGGER => Self::TABLE,
            other => other,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of a schema object.
///
/// Keys compare by schema, object name and change type name; the type's tuning values are not
/// part of the identity.
#[derive(Debug, Clone)]
pub struct ObjectKey {
    pub schema: String,
    pub object_name: String,
    pub change_type: ChangeType,
}

impl ObjectKey {
    /// Create the key of an object of the given type.
    pub fn new(schema: impl Into<String>, object_name: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            schema: schema.into(),
            object_name: object_name.into(),
            change_type,
        }
    }

    /// Key used to track failed objects during execution: `schema:object`.
    pub fn db_object_key(&self) -> String {
        format!("{}:{}", self.schema, self.object_name)
    }
}

impl ObjectKey {
    fn identity(&self) -> (&str, &str, &str) {
        (&self.schema, &self.object_name, &self.change_type.name)
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for ObjectKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.schema, self.object_name, self.change_type)
    }
}

/// Identity of a single change within an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeKey {
    pub object_key: ObjectKey,
    pub change_name: String,
}

impl ChangeKey {
    /// Create the key of a named change within an object.
    pub fn new(object_key: ObjectKey, change_name: impl Into<String>) -> Self {
        Self {
            object_key,
            change_name: change_name.into(),
        }
    }

    /// Short label used in reports: `[object.change]`.
    pub fn label(&self) -> String {
        format!("[{}.{}]", self.object_key.object_name, self.change_name)
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} ({})",
            self.object_key.schema,
            self.object_key.object_name,
            self.change_name,
            self.object_key.change_type
        )
    }
}

/// How a dependency was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKind {
    /// Declared by the author.
    Explicit,
    /// Found by scanning the change content.
    Discovered,
    /// Ordering between consecutive changes of one object.
    Implicit,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explicit => "EXPLICIT",
            Self::Discovered => "DISCOVERED",
            Self::Implicit => "IMPLICIT",
        })
    }
}

/// A named dependency of a change on some other object or change.
///
/// The target may be `object`, `schema.object`, `object.change` or `schema.object.change`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeDependency {
    pub target: String,
    pub kind: DependencyKind,
}

impl CodeDependency {
    /// Dependency on `target` established the given way.
    pub fn new(target: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            target: target.into(),
            kind,
        }
    }

    /// Dependency declared by the author.
    pub fn explicit(target: impl Into<String>) -> Self {
        Self::new(target, DependencyKind::Explicit)
    }

    /// Dependency found in the change content.
    pub fn discovered(target: impl Into<String>) -> Self {
        Self::new(target, DependencyKind::Discovered)
    }
}

/// Attributes only incremental changes carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalChange {
    /// Inactive changes are kept in source but not applied.
    pub active: bool,
    /// Whether this change drops its object.
    pub drop: bool,
    /// Keep the drop in add order instead of the drop phase.
    pub keep_incremental_order: bool,
    /// The drop is hand-written and must run as a regular deploy.
    pub manually_coded_drop: bool,
    /// Drop was generated to clean an environment; never treated as "already dropped".
    pub force_drop_for_env_cleaning: bool,
    /// Set when this change rolls back a deployed change of the same key.
    pub rollback_if_already_deployed: Option<String>,
    /// Set by the calculator when the rollback content must be executed.
    pub rollback_activated: bool,
    /// Change names this baseline replaces.
    pub baselined_changes: BTreeSet<String>,
    /// Changes sharing a tag may deploy concurrently.
    pub parallel_group: Option<String>,
}

impl Default for IncrementalChange {
    fn default() -> Self {
        Self {
            active: true,
            drop: false,
            keep_incremental_order: false,
            manually_coded_drop: false,
            force_drop_for_env_cleaning: false,
            rollback_if_already_deployed: None,
            rollback_activated: false,
            baselined_changes: BTreeSet::new(),
            parallel_group: None,
        }
    }
}

/// Incremental or rerunnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Incremental(IncrementalChange),
    Rerunnable,
}

/// A single change definition, either read from source or loaded from the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: ChangeKey,
    pub content: String,
    pub content_hash: String,
    pub rollback_content: Option<String>,
    /// Additional hashes accepted as equal to the deployed one.
    pub acceptable_hashes: BTreeSet<String>,
    /// Pre-populated dependencies; `None` means they are discovered from content.
    pub code_dependencies: Option<BTreeSet<CodeDependency>>,
    pub include_dependencies: BTreeSet<String>,
    pub exclude_dependencies: BTreeSet<String>,
    /// Keys of the changes this change depends on, resolved by the graph enricher.
    pub dependent_changes: BTreeSet<ChangeKey>,
    /// Changes tagged with a changeset are deferred unless the run selects it.
    pub changeset: Option<String>,
    pub order: i32,
    pub order_within_object: i32,
    /// Whether redeploying this object leaves its dependents intact.
    pub create_or_replace: bool,
    pub file_location: Option<PathBuf>,
    pub kind: ChangeKind,
}

impl Change {
    fn with_kind(key: ChangeKey, content: impl Into<String>, kind: ChangeKind) -> Self {
        let content = content.into();
        Self {
            key,
            content_hash: content_hash(&content),
            content,
            rollback_content: None,
            acceptable_hashes: BTreeSet::new(),
            code_dependencies: None,
            include_dependencies: BTreeSet::new(),
            exclude_dependencies: BTreeSet::new(),
            dependent_changes: BTreeSet::new(),
            changeset: None,
            order: DEFAULT_CHANGE_ORDER,
            order_within_object: 0,
            create_or_replace: false,
            file_location: None,
            kind,
        }
    }

    /// Create an incremental change.
    pub fn incremental(
        change_type: ChangeType,
        schema: impl Into<String>,
        object_name: impl Into<String>,
        change_name: impl Into<String>,
        order_within_object: i32,
        content: impl Into<String>,
    ) -> Self {
        let key = ChangeKey::new(ObjectKey::new(schema, object_name, change_type), change_name);
        let mut change = Self::with_kind(key, content, ChangeKind::Incremental(IncrementalChange::default()));
        change.order_within_object = order_within_object;
        change
    }

    /// Create a rerunnable change holding the full object definition.
    pub fn rerunnable(
        change_type: ChangeType,
        schema: impl Into<String>,
        object_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let key = ChangeKey::new(ObjectKey::new(schema, object_name, change_type), RERUNNABLE_CHANGE_NAME);
        Self::with_kind(key, content, ChangeKind::Rerunnable)
    }

    /// Override the content hash, e.g. with the value read from the audit trail.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = hash.into();
        self
    }

    /// Set the content run when this change is rolled back.
    pub fn with_rollback(mut self, rollback: impl Into<String>) -> Self {
        self.rollback_content = Some(rollback.into());
        self
    }

    /// Accept an additional deployed hash as unchanged.
    pub fn with_acceptable_hash(mut self, hash: impl Into<String>) -> Self {
        self.acceptable_hashes.insert(hash.into());
        self
    }

    /// Use the given dependencies instead of discovering them.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = CodeDependency>) -> Self {
        self.code_dependencies = Some(deps.into_iter().collect());
        self
    }

    /// Add an explicit dependency on top of discovered ones.
    pub fn with_include_dependency(mut self, name: impl Into<String>) -> Self {
        self.include_dependencies.insert(name.into());
        self
    }

    /// Ignore a discovered dependency.
    pub fn with_exclude_dependency(mut self, name: impl Into<String>) -> Self {
        self.exclude_dependencies.insert(name.into());
        self
    }

    /// Tag the change with a named changeset.
    pub fn with_changeset(mut self, changeset: impl Into<String>) -> Self {
        self.changeset = Some(changeset.into());
        self
    }

    /// Set the data-load order.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Mark the object as redeployable without touching its dependents.
    pub fn with_create_or_replace(mut self, create_or_replace: bool) -> Self {
        self.create_or_replace = create_or_replace;
        self
    }

    /// Record the source file the change was read from.
    pub fn with_file_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_location = Some(path.into());
        self
    }

    /// Apply a modification to the incremental attributes. No-op for rerunnable changes.
    pub fn with_incremental(mut self, f: impl FnOnce(&mut IncrementalChange)) -> Self {
        if let ChangeKind::Incremental(inc) = &mut self.kind {
            f(inc);
        }
        self
    }

    /// Mark this change as dropping its object.
    pub fn as_drop(self) -> Self {
        self.with_incremental(|inc| inc.drop = true)
    }

    /// Mark this change inactive.
    pub fn inactive(self) -> Self {
        self.with_incremental(|inc| inc.active = false)
    }

    /// Deploy together with other changes of the same group.
    pub fn with_parallel_group(self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.with_incremental(|inc| inc.parallel_group = Some(group))
    }

    /// Make this change a baseline replacing the named changes.
    pub fn with_baselined_changes(self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        self.with_incremental(|inc| inc.baselined_changes = names)
    }

    /// Roll back a deployed change of the same key with this content.
    pub fn with_rollback_if_already_deployed(self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.with_incremental(|inc| inc.rollback_if_already_deployed = Some(content))
    }

    /// Logical schema of the change.
    pub fn schema(&self) -> &str {
        &self.key.object_key.schema
    }

    /// Name of the changed object.
    pub fn object_name(&self) -> &str {
        &self.key.object_key.object_name
    }

    /// Name of the change within its object.
    pub fn change_name(&self) -> &str {
        &self.key.change_name
    }

    /// The change type carried by the key.
    pub fn change_type(&self) -> &ChangeType {
        &self.key.object_key.change_type
    }

    /// Identity of the changed object.
    pub fn object_key(&self) -> &ObjectKey {
        &self.key.object_key
    }

    /// Incremental attributes, if this is an incremental change.
    pub fn incremental_attrs(&self) -> Option<&IncrementalChange> {
        match &self.kind {
            ChangeKind::Incremental(inc) => Some(inc),
            ChangeKind::Rerunnable => None,
        }
    }

    /// Incremental attributes, if this is an incremental change.
    pub fn incremental_attrs_mut(&mut self) -> Option<&mut IncrementalChange> {
        match &mut self.kind {
            ChangeKind::Incremental(inc) => Some(inc),
            ChangeKind::Rerunnable => None,
        }
    }

    /// Whether the change carries a full rerunnable definition.
    pub fn is_rerunnable(&self) -> bool {
        matches!(self.kind, ChangeKind::Rerunnable)
    }

    /// Rerunnable changes are always active.
    pub fn is_active(&self) -> bool {
        self.incremental_attrs().is_none_or(|inc| inc.active)
    }

    /// Whether this incremental change drops its object.
    pub fn is_drop(&self) -> bool {
        self.incremental_attrs().is_some_and(|inc| inc.drop)
    }

    /// Whether the rollback content should run instead of the content.
    pub fn is_rollback_activated(&self) -> bool {
        self.incremental_attrs().is_some_and(|inc| inc.rollback_activated)
    }

    /// Parallel group tag, if any.
    pub fn parallel_group(&self) -> Option<&str> {
        self.incremental_attrs().and_then(|inc| inc.parallel_group.as_deref())
    }

    /// Whether `hash` is this change's hash or one of its acceptable alternatives.
    pub fn accepts_hash(&self, hash: &str) -> bool {
        self.content_hash == hash || self.acceptable_hashes.contains(hash)
    }

    /// Content to run for this change, honouring an activated rollback.
    pub fn content_to_execute(&self) -> &str {
        match (&self.kind, &self.rollback_content) {
            (ChangeKind::Incremental(inc), Some(rollback)) if inc.rollback_activated => rollback,
            _ => &self.content,
        }
    }

    /// Short label used in graph and cycle reports.
    pub fn label(&self) -> String {
        self.key.label()
    }

    /// Human readable description used in logs and reports.
    pub fn display_string(&self) -> String {
        let prefix = if self.is_rollback_activated() { "ROLLING BACK: " } else { "" };
        format!(
            "{}Object [{}]; ChangeName [{}]; Type [{}]; LogicalSchema [{}]",
            prefix,
            self.object_name(),
            self.change_name(),
            self.change_type(),
            self.schema()
        )
    }

    /// Ordering used for deterministic graph sorting.
    pub fn sort_key(&self) -> (i32, &str, &str, &str, i32, &str) {
        (
            self.change_type().deploy_order_priority,
            &self.change_type().name,
            self.schema(),
            self.object_name(),
            self.order_within_object,
            self.change_name(),
        )
    }
}

/// SHA-256 of the content, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a rollback script carries anything beyond whitespace.
pub fn has_rollback_content(rollback: Option<&str>) -> bool {
    rollback.is_some_and(|r| !r.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("create table a"), content_hash("create table a"));
        assert_ne!(content_hash("create table a"), content_hash("create table b"));
        assert_eq!(content_hash("").len(), 64);
    }

    #[test]
    fn test_incremental_change_builders() {
        let change = Change::incremental(ChangeType::table(), "s1", "tab", "c1", 2, "alter table")
            .with_parallel_group("p1")
            .with_rollback("drop column")
            .as_drop();

        assert_eq!(change.schema(), "s1");
        assert_eq!(change.order_within_object, 2);
        assert_eq!(change.parallel_group(), Some("p1"));
        assert!(change.is_drop());
        assert!(change.is_active());
        assert!(!change.is_rerunnable());
        assert_eq!(change.content_to_execute(), "alter table");
    }

    #[test]
    fn test_rollback_activated_executes_rollback() {
        let change = Change::incremental(ChangeType::table(), "s1", "tab", "c1", 1, "add column")
            .with_rollback("drop column")
            .with_incremental(|inc| inc.rollback_activated = true);

        assert_eq!(change.content_to_execute(), "drop column");
        assert!(change.display_string().starts_with("ROLLING BACK: "));
    }

    #[test]
    fn test_rerunnable_ignores_incremental_modifiers() {
        let change = Change::rerunnable(ChangeType::view(), "s1", "v1", "create view v1").inactive().as_drop();

        assert!(change.is_rerunnable());
        assert!(change.is_active());
        assert!(!change.is_drop());
        assert_eq!(change.change_name(), RERUNNABLE_CHANGE_NAME);
    }

    #[test]
    fn test_accepts_hash() {
        let change = Change::rerunnable(ChangeType::view(), "s1", "v1", "body").with_acceptable_hash("old");
        assert!(change.accepts_hash(&content_hash("body")));
        assert!(change.accepts_hash("old"));
        assert!(!change.accepts_hash("other"));
    }

    #[test]
    fn test_keys_display() {
        let key = ChangeKey::new(ObjectKey::new("s1", "tab", ChangeType::table()), "c1");
        assert_eq!(key.to_string(), "s1.tab.c1 (TABLE)");
        assert_eq!(key.label(), "[tab.c1]");
        assert_eq!(key.object_key.db_object_key(), "s1:tab");
    }

    #[test]
    fn test_implicit_ordering_name() {
        assert_eq!(ChangeType::trigger().implicit_ordering_name(), "TABLE");
        assert_eq!(ChangeType::foreign_key().implicit_ordering_name(), "TABLE");
        assert_eq!(ChangeType::view().implicit_ordering_name(), "VIEW");
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  drop\n\ttable   a "), "drop table a");
        assert!(!has_rollback_content(Some("  \n")));
        assert!(has_rollback_content(Some("drop")));
        assert!(!has_rollback_content(None));
    }

    #[test]
    fn test_key_identity_ignores_type_tuning() {
        use std::collections::HashSet;

        let audited = Change::incremental(ChangeType::table(), "s1", "a", "1", 1, "create table a");
        let retuned = Change::incremental(
            ChangeType::table().with_priority(11).with_dependency_enrichment(false),
            "s1",
            "a",
            "1",
            1,
            "create table a",
        );
        assert_eq!(audited.key, retuned.key);
        assert_eq!(audited.key.cmp(&retuned.key), Ordering::Equal);
        let keys: HashSet<_> = [audited.key.clone(), retuned.key.clone()].into_iter().collect();
        assert_eq!(keys.len(), 1);

        let view = Change::rerunnable(ChangeType::view(), "s1", "a", "select 1");
        assert_ne!(audited.object_key(), view.object_key());
    }
}
