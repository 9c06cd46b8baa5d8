//! Snapshot sidecars kept next to a tracked entry.
//!
//! Both sidecars are optional. An entry only pays for original values when
//! its type tracks originals, and only pays for a relationship snapshot when
//! its type has keys, foreign keys or navigations.

use sqltrack_core::{EntityRef, NavigationValue, Value, entity_address};
use std::collections::{HashMap, HashSet};

/// Scalar values as they were at the last synchronization point.
///
/// Slots are indexed by `PropertyInfo::original_value_index`. An empty slot
/// means the property has not changed since the snapshot was started (lazy
/// snapshots fill slots from `property_changing`).
#[derive(Debug, Clone)]
pub struct OriginalValues {
    slots: Vec<Option<Value>>,
}

impl OriginalValues {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn has(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(value);
        }
    }
}

/// Last known value of a navigation.
#[derive(Clone)]
pub enum NavigationSnapshot {
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
}

impl From<NavigationValue> for NavigationSnapshot {
    fn from(value: NavigationValue) -> Self {
        match value {
            NavigationValue::Reference(r) => NavigationSnapshot::Reference(r),
            NavigationValue::Collection(items) => NavigationSnapshot::Collection(items),
        }
    }
}

impl std::fmt::Debug for NavigationSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavigationSnapshot::Reference(r) => {
                write!(f, "Reference({:?})", r.as_ref().map(entity_address))
            }
            NavigationSnapshot::Collection(items) => {
                write!(f, "Collection(len={})", items.len())
            }
        }
    }
}

/// Last known key/foreign-key values and navigation targets.
#[derive(Debug, Clone, Default)]
pub struct RelationshipSnapshot {
    scalars: HashMap<&'static str, Value>,
    navigations: HashMap<&'static str, NavigationSnapshot>,
}

impl RelationshipSnapshot {
    pub fn scalar(&self, property: &str) -> Option<&Value> {
        self.scalars.get(property)
    }

    pub fn set_scalar(&mut self, property: &'static str, value: Value) {
        self.scalars.insert(property, value);
    }

    pub fn navigation(&self, navigation: &str) -> Option<&NavigationSnapshot> {
        self.navigations.get(navigation)
    }

    pub fn set_navigation(&mut self, navigation: &'static str, value: NavigationSnapshot) {
        self.navigations.insert(navigation, value);
    }
}

/// A set of entity handles keyed by instance identity.
///
/// Two value-equal objects are two members.
#[derive(Clone, Default)]
pub struct ReferenceSet {
    members: HashMap<usize, EntityRef>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: EntityRef) -> bool {
        self.members.insert(entity_address(&entity), entity).is_none()
    }

    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        self.members.remove(&entity_address(entity)).is_some()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.members.contains_key(&entity_address(entity))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<EntityRef> for ReferenceSet {
    fn from_iter<I: IntoIterator<Item = EntityRef>>(iter: I) -> Self {
        let mut set = ReferenceSet::new();
        for entity in iter {
            set.insert(entity);
        }
        set
    }
}

/// Added and removed members of a collection navigation.
#[derive(Clone, Default)]
pub struct CollectionDelta {
    pub added: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
}

impl CollectionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff two collections by reference identity.
///
/// `added` is `current - snapshot` in `current` order, `removed` is
/// `snapshot - current` in `snapshot` order.
pub fn diff_by_identity(snapshot: &[EntityRef], current: &[EntityRef]) -> CollectionDelta {
    let mut remaining: ReferenceSet = snapshot.iter().cloned().collect();
    let mut seen = HashSet::new();
    let mut added = Vec::new();
    for entity in current {
        if !seen.insert(entity_address(entity)) {
            continue;
        }
        if !remaining.remove(entity) {
            added.push(entity.clone());
        }
    }
    let removed = snapshot
        .iter()
        .filter(|e| remaining.contains(e))
        .cloned()
        .collect();
    CollectionDelta { added, removed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::DynamicEntity;

    fn tag(name: &str) -> EntityRef {
        DynamicEntity::new("Tag").with("name", name).into_ref()
    }

    fn addresses(items: &[EntityRef]) -> Vec<usize> {
        items.iter().map(entity_address).collect()
    }

    #[test]
    fn diff_treats_value_equal_instances_as_distinct() {
        let kept = tag("a");
        let dropped = tag("b");
        let twin = tag("b");
        let snapshot = vec![kept.clone(), dropped.clone()];
        let current = vec![kept.clone(), twin.clone()];

        let delta = diff_by_identity(&snapshot, &current);
        assert_eq!(addresses(&delta.added), addresses(&[twin]));
        assert_eq!(addresses(&delta.removed), addresses(&[dropped]));
    }

    #[test]
    fn diff_of_identical_collections_is_empty() {
        let a = tag("a");
        let b = tag("b");
        let delta = diff_by_identity(&[a.clone(), b.clone()], &[b, a]);
        assert!(delta.is_empty());
    }

    #[test]
    fn diff_ignores_duplicate_current_members() {
        let a = tag("a");
        let delta = diff_by_identity(&[], &[a.clone(), a.clone()]);
        assert_eq!(delta.added.len(), 1);
    }

    #[test]
    fn original_values_report_empty_slots() {
        let mut originals = OriginalValues::new(2);
        assert!(!originals.has(0));
        originals.set(1, Value::Int(3));
        assert_eq!(originals.get(1), Some(&Value::Int(3)));
        originals.set(7, Value::Int(1));
        assert!(originals.get(7).is_none());
    }

    #[test]
    fn reference_set_membership() {
        let a = tag("a");
        let mut set = ReferenceSet::new();
        assert!(set.insert(a.clone()));
        assert!(!set.insert(a.clone()));
        assert!(set.contains(&a));
        assert!(!set.contains(&tag("a")));
        assert!(set.remove(&a));
        assert!(set.is_empty());
    }
}
