//! Live entity access.
//!
//! Tracked objects are owned by the caller through `Arc<RwLock<_>>` handles.
//! The tracker never owns an entity; it keeps an [`EntityRef`] clone and
//! identifies the instance by the address of its allocation, so two
//! value-equal objects are always distinct tracked instances.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Handle to a tracked entry inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(usize);

impl EntryId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Persistence state of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked
    Detached,
    /// Tracked and in sync with the store
    Unchanged,
    /// New; will be inserted
    Added,
    /// Changed; will be updated
    Modified,
    /// Removed; will be deleted
    Deleted,
}

impl EntityState {
    /// Whether saving this state produces a command.
    pub const fn has_pending_write(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    pub const fn is_tracked(self) -> bool {
        !matches!(self, EntityState::Detached)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Detached => "Detached",
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// A domain object whose properties the tracker can read and write.
///
/// Property and navigation names are the names declared in the entity
/// type's metadata.
pub trait Entity: Send + Sync + 'static {
    /// Name of the entity type in the model.
    fn entity_type(&self) -> &'static str;

    /// Current value of a scalar property. Unknown names yield `Null`.
    fn get_value(&self, property: &str) -> Value;

    /// Overwrite a scalar property (generated values, fix-up, read-back).
    fn set_value(&mut self, property: &str, value: Value);

    /// Current value of a navigation.
    fn navigation(&self, _name: &str) -> NavigationValue {
        NavigationValue::Reference(None)
    }

    /// Downcasting support for host code holding an erased handle.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a live entity.
pub type EntityRef = Arc<RwLock<dyn Entity>>;

/// Wrap an entity in a shareable handle.
pub fn entity_ref<E: Entity>(entity: E) -> EntityRef {
    Arc::new(RwLock::new(entity))
}

/// Identity of the instance behind a handle.
pub fn entity_address(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Read-lock an entity, recovering from poisoning.
pub fn read_entity(entity: &EntityRef) -> RwLockReadGuard<'_, dyn Entity> {
    entity.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock an entity, recovering from poisoning.
pub fn write_entity(entity: &EntityRef) -> RwLockWriteGuard<'_, dyn Entity> {
    entity.write().unwrap_or_else(PoisonError::into_inner)
}

/// Value of a navigation property.
#[derive(Clone)]
pub enum NavigationValue {
    /// Single-valued navigation
    Reference(Option<EntityRef>),
    /// Collection navigation
    Collection(Vec<EntityRef>),
}

impl NavigationValue {
    /// All entities referenced by this navigation.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            NavigationValue::Reference(r) => r.iter().cloned().collect(),
            NavigationValue::Collection(items) => items.clone(),
        }
    }

    /// Whether `entity` is referenced by this navigation (by identity).
    pub fn contains(&self, entity: &EntityRef) -> bool {
        let address = entity_address(entity);
        match self {
            NavigationValue::Reference(r) => r.as_ref().is_some_and(|e| entity_address(e) == address),
            NavigationValue::Collection(items) => {
                items.iter().any(|e| entity_address(e) == address)
            }
        }
    }
}

impl fmt::Debug for NavigationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationValue::Reference(None) => write!(f, "Reference(None)"),
            NavigationValue::Reference(Some(e)) => {
                write!(f, "Reference({:#x})", entity_address(e))
            }
            NavigationValue::Collection(items) => f
                .debug_list()
                .entries(items.iter().map(|e| format!("{:#x}", entity_address(e))))
                .finish(),
        }
    }
}

/// A property-bag entity.
///
/// Useful for shared-type entities such as join rows, and for hosts that
/// do not map every entity type to a Rust struct.
#[derive(Debug, Default)]
pub struct DynamicEntity {
    entity_type: &'static str,
    values: HashMap<String, Value>,
    navigations: HashMap<String, NavigationValue>,
}

impl DynamicEntity {
    pub fn new(entity_type: &'static str) -> Self {
        Self {
            entity_type,
            values: HashMap::new(),
            navigations: HashMap::new(),
        }
    }

    /// Set a property (builder pattern).
    #[must_use]
    pub fn with(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.values.insert(property.to_string(), value.into());
        self
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> EntityRef {
        entity_ref(self)
    }

    pub fn set(&mut self, property: &str, value: impl Into<Value>) {
        self.values.insert(property.to_string(), value.into());
    }

    /// Point a reference navigation at `target`.
    pub fn set_reference(&mut self, navigation: &str, target: Option<EntityRef>) {
        self.navigations
            .insert(navigation.to_string(), NavigationValue::Reference(target));
    }

    /// Append to a collection navigation.
    pub fn push(&mut self, navigation: &str, item: EntityRef) {
        let slot = self
            .navigations
            .entry(navigation.to_string())
            .or_insert_with(|| NavigationValue::Collection(Vec::new()));
        match slot {
            NavigationValue::Collection(items) => items.push(item),
            NavigationValue::Reference(_) => *slot = NavigationValue::Collection(vec![item]),
        }
    }

    /// Remove `item` from a collection navigation, by identity.
    pub fn remove_item(&mut self, navigation: &str, item: &EntityRef) -> bool {
        let address = entity_address(item);
        if let Some(NavigationValue::Collection(items)) = self.navigations.get_mut(navigation) {
            if let Some(pos) = items.iter().position(|e| entity_address(e) == address) {
                items.remove(pos);
                return true;
            }
        }
        false
    }
}

impl Entity for DynamicEntity {
    fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    fn get_value(&self, property: &str) -> Value {
        self.values.get(property).cloned().unwrap_or(Value::Null)
    }

    fn set_value(&mut self, property: &str, value: Value) {
        self.values.insert(property.to_string(), value);
    }

    fn navigation(&self, name: &str) -> NavigationValue {
        self.navigations
            .get(name)
            .cloned()
            .unwrap_or(NavigationValue::Reference(None))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_equal_instances_have_distinct_identity() {
        let a = DynamicEntity::new("Tag").with("name", "x").into_ref();
        let b = DynamicEntity::new("Tag").with("name", "x").into_ref();
        assert_ne!(entity_address(&a), entity_address(&b));
        assert_eq!(entity_address(&a), entity_address(&a.clone()));
    }

    #[test]
    fn typed_handle_and_erased_handle_share_identity() {
        let typed = Arc::new(RwLock::new(DynamicEntity::new("Tag")));
        let erased: EntityRef = typed.clone();
        assert_eq!(
            Arc::as_ptr(&typed).cast::<()>() as usize,
            entity_address(&erased)
        );
    }

    #[test]
    fn collection_membership_is_by_identity() {
        let item = DynamicEntity::new("Tag").with("name", "x").into_ref();
        let twin = DynamicEntity::new("Tag").with("name", "x").into_ref();
        let mut owner = DynamicEntity::new("Post");
        owner.push("tags", item.clone());

        let nav = owner.navigation("tags");
        assert!(nav.contains(&item));
        assert!(!nav.contains(&twin));
        assert!(!owner.remove_item("tags", &twin));
        assert!(owner.remove_item("tags", &item));
        assert!(owner.navigation("tags").entities().is_empty());
    }

    #[test]
    fn missing_properties_read_as_null() {
        let e = DynamicEntity::new("Tag");
        assert_eq!(e.get_value("nope"), Value::Null);
        assert_eq!(e.entity_type(), "Tag");
    }
}
