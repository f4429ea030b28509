//! Target platform description.

use indexmap::IndexMap;

use crate::change::{Change, ChangeType};
use crate::error::{DeployError, DeployResult};

/// Registry of the change types a platform supports, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ChangeTypeRegistry {
    types: IndexMap<String, ChangeType>,
}

impl ChangeTypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the standard relational change types.
    pub fn standard() -> Self {
        Self::new()
            .register(ChangeType::sequence())
            .register(ChangeType::table())
            .register(ChangeType::foreign_key())
            .register(ChangeType::trigger())
            .register(ChangeType::view())
            .register(ChangeType::function())
            .register(ChangeType::sp())
            .register(ChangeType::static_data())
            .register(ChangeType::migration())
    }

    /// Register a change type, replacing any type with the same name.
    pub fn register(mut self, change_type: ChangeType) -> Self {
        self.types.insert(change_type.name.clone(), change_type);
        self
    }

    /// Look up a change type by name.
    pub fn get(&self, name: &str) -> DeployResult<&ChangeType> {
        self.types
            .get(&name.to_uppercase())
            .ok_or_else(|| DeployError::UnknownChangeType(name.to_string()))
    }

    /// Fail if the change refers to a type that is not registered here.
    pub fn validate(&self, change: &Change) -> DeployResult<()> {
        let registered = self.get(&change.change_type().name)?;
        if registered != change.change_type() {
            return Err(DeployError::config(format!(
                "Change {} uses a definition of type {} that differs from the registered one",
                change.key, registered
            )));
        }
        Ok(())
    }

    /// Rebind changes loaded from the audit trail to the registered definition of their type.
    ///
    /// The audit trail only records type names, so a retuned type must not change how already
    /// deployed changes are calculated.
    pub fn bind(&self, changes: Vec<Change>) -> DeployResult<Vec<Change>> {
        changes
            .into_iter()
            .map(|mut change| {
                let registered = self.get(&change.change_type().name)?;
                change.key.object_key.change_type = registered.clone();
                Ok(change)
            })
            .collect()
    }

    /// Registered types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeType> {
        self.types.values()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Platform-specific rules the engine needs.
pub trait Platform: Send + Sync {
    /// Platform name for logs.
    fn name(&self) -> &str;

    /// Normalize an object name the way the platform compares identifiers.
    fn convert_db_object_name(&self, name: &str) -> String;

    /// Whether drops of rerunnable objects must follow dependency order.
    fn is_drop_order_required(&self) -> bool;

    /// Change types supported by the platform.
    fn change_types(&self) -> &ChangeTypeRegistry;
}

/// Platform with case-insensitive identifiers and the standard change types.
#[derive(Debug, Clone)]
pub struct GenericPlatform {
    name: String,
    drop_order_required: bool,
    change_types: ChangeTypeRegistry,
}

impl GenericPlatform {
    /// Platform with the given name, unordered drops and the standard change types.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            drop_order_required: false,
            change_types: ChangeTypeRegistry::standard(),
        }
    }

    /// Set whether rerunnable drops follow dependency order.
    pub fn with_drop_order_required(mut self, required: bool) -> Self {
        self.drop_order_required = required;
        self
    }

    /// Replace the change type registry.
    pub fn with_change_types(mut self, change_types: ChangeTypeRegistry) -> Self {
        self.change_types = change_types;
        self
    }
}

impl Default for GenericPlatform {
    fn default() -> Self {
        Self::new("generic")
    }
}

impl Platform for GenericPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn convert_db_object_name(&self, name: &str) -> String {
        name.to_uppercase()
    }

    fn is_drop_order_required(&self) -> bool {
        self.drop_order_required
    }

    fn change_types(&self) -> &ChangeTypeRegistry {
        &self.change_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry() {
        let registry = ChangeTypeRegistry::standard();
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.get("table").unwrap(), &ChangeType::table());
        assert!(matches!(registry.get("widget"), Err(DeployError::UnknownChangeType(_))));
    }

    #[test]
    fn test_validate_rejects_divergent_type() {
        let registry = ChangeTypeRegistry::standard();
        let ok = Change::rerunnable(ChangeType::view(), "s1", "v1", "body");
        assert!(registry.validate(&ok).is_ok());

        let odd = Change::rerunnable(ChangeType::view().with_priority(99), "s1", "v1", "body");
        assert!(registry.validate(&odd).is_err());
    }

    #[test]
    fn test_bind_uses_registered_definition() {
        let registry = ChangeTypeRegistry::standard().register(ChangeType::table().with_priority(11));
        let audited = Change::incremental(ChangeType::table(), "s1", "a", "1", 1, "create table a");
        let source = Change::incremental(ChangeType::table().with_priority(11), "s1", "a", "1", 1, "create table a");

        let bound = registry.bind(vec![audited]).unwrap();
        assert_eq!(bound[0].change_type().deploy_order_priority, 11);
        assert_eq!(bound[0].key, source.key);

        let unknown = Change::rerunnable(ChangeType::rerunnable("widget"), "s1", "w", "body");
        assert!(matches!(registry.bind(vec![unknown]), Err(DeployError::UnknownChangeType(_))));
    }

    #[test]
    fn test_generic_platform() {
        let platform = GenericPlatform::default().with_drop_order_required(true);
        assert_eq!(platform.convert_db_object_name("myTab"), "MYTAB");
        assert!(platform.is_drop_order_required());
        assert_eq!(platform.name(), "generic");
    }
}
