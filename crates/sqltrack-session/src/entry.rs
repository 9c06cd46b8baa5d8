//! Tracked entries.
//!
//! A [`TrackedEntry`] pairs one live entity (or, for shadow entities, a
//! value buffer) with its persistence state, per-property flags and the
//! optional snapshot sidecars.

use crate::snapshot::{NavigationSnapshot, OriginalValues, RelationshipSnapshot};
use sqltrack_core::{
    EntityRef, EntityState, EntityType, EntryId, ForeignKeyInfo, KeyInfo, KeyValue,
    NavigationInfo, NavigationValue, PropertyBase, PropertyInfo, Value, read_entity, write_entity,
};
use std::sync::Arc;

/// Where the values of an entry live.
#[derive(Clone)]
pub enum EntityData {
    /// A caller-owned object
    Live(EntityRef),
    /// No object; values are held by the entry (indexed by property)
    Shadow(Vec<Value>),
}

/// The tracker's record of one entity instance.
pub struct TrackedEntry {
    id: EntryId,
    entity_type: Arc<EntityType>,
    data: EntityData,
    state: EntityState,
    modified: Vec<bool>,
    temporary: Vec<bool>,
    original_values: Option<OriginalValues>,
    relationship_snapshot: Option<RelationshipSnapshot>,
}

impl std::fmt::Debug for TrackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntry")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type.name())
            .field("state", &self.state)
            .field("modified", &self.modified_properties())
            .field("shadow", &self.is_shadow())
            .finish_non_exhaustive()
    }
}

impl TrackedEntry {
    pub(crate) fn new(id: EntryId, entity_type: Arc<EntityType>, data: EntityData) -> Self {
        let count = entity_type.properties().len();
        Self {
            id,
            entity_type,
            data,
            state: EntityState::Detached,
            modified: vec![false; count],
            temporary: vec![false; count],
            original_values: None,
            relationship_snapshot: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// The live object, or `None` for shadow entries.
    pub fn entity(&self) -> Option<&EntityRef> {
        match &self.data {
            EntityData::Live(entity) => Some(entity),
            EntityData::Shadow(_) => None,
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.data, EntityData::Shadow(_))
    }

    /// Current value of a property.
    pub fn current_value(&self, property: &PropertyInfo) -> Value {
        match &self.data {
            EntityData::Live(entity) => read_entity(entity).get_value(property.name),
            EntityData::Shadow(values) => values
                .get(property.index())
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    /// Current value of a property looked up by name.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.entity_type
            .property_named(name)
            .map(|p| self.current_value(p))
    }

    /// Value at the last synchronization point. Falls back to the current
    /// value when no original was recorded.
    pub fn original_value(&self, property: &PropertyInfo) -> Value {
        property
            .original_value_index()
            .and_then(|i| self.original_values.as_ref()?.get(i).cloned())
            .unwrap_or_else(|| self.current_value(property))
    }

    /// Current value of a navigation, shaped by its metadata: an unset
    /// collection reads as empty.
    pub fn navigation(&self, navigation: &NavigationInfo) -> NavigationValue {
        let value = match &self.data {
            EntityData::Live(entity) => read_entity(entity).navigation(navigation.name),
            EntityData::Shadow(_) => NavigationValue::Reference(None),
        };
        match value {
            NavigationValue::Reference(target) if navigation.is_collection => {
                NavigationValue::Collection(target.into_iter().collect())
            }
            NavigationValue::Collection(mut items) if !navigation.is_collection => {
                NavigationValue::Reference(if items.is_empty() {
                    None
                } else {
                    Some(items.swap_remove(0))
                })
            }
            value => value,
        }
    }

    pub fn is_modified(&self, property: &PropertyInfo) -> bool {
        self.modified.get(property.index()).copied().unwrap_or(false)
    }

    pub fn modified_properties(&self) -> Vec<&'static str> {
        self.entity_type
            .properties()
            .iter()
            .filter(|p| self.is_modified(p))
            .map(|p| p.name)
            .collect()
    }

    /// Whether the property holds a placeholder the store will replace.
    pub fn is_temporary(&self, property: &PropertyInfo) -> bool {
        self.temporary.get(property.index()).copied().unwrap_or(false)
    }

    pub fn has_temporary_values(&self) -> bool {
        self.temporary.iter().any(|t| *t)
    }

    pub fn key_value(&self, key: &KeyInfo) -> KeyValue {
        KeyValue::new(self.member_values(&key.properties, |p| self.current_value(p)))
    }

    pub fn primary_key_value(&self) -> KeyValue {
        self.key_value(self.entity_type.primary_key_info())
    }

    pub fn foreign_key_value(&self, foreign_key: &ForeignKeyInfo) -> KeyValue {
        KeyValue::new(self.member_values(&foreign_key.properties, |p| self.current_value(p)))
    }

    /// Foreign key value at the last synchronization point.
    pub fn original_foreign_key_value(&self, foreign_key: &ForeignKeyInfo) -> KeyValue {
        KeyValue::new(self.member_values(&foreign_key.properties, |p| self.original_value(p)))
    }

    /// Key value as recorded in the relationship snapshot.
    pub fn snapshot_key_value(&self, key: &KeyInfo) -> KeyValue {
        KeyValue::new(self.member_values(&key.properties, |p| self.snapshot_value(p)))
    }

    /// Foreign key value as recorded in the relationship snapshot.
    pub fn snapshot_foreign_key_value(&self, foreign_key: &ForeignKeyInfo) -> KeyValue {
        KeyValue::new(self.member_values(&foreign_key.properties, |p| self.snapshot_value(p)))
    }

    /// Relationship snapshot value, falling back to the current value.
    pub fn snapshot_value(&self, property: &PropertyInfo) -> Value {
        self.relationship_snapshot
            .as_ref()
            .and_then(|s| s.scalar(property.name).cloned())
            .unwrap_or_else(|| self.current_value(property))
    }

    pub fn original_values(&self) -> Option<&OriginalValues> {
        self.original_values.as_ref()
    }

    pub fn relationship_snapshot(&self) -> Option<&RelationshipSnapshot> {
        self.relationship_snapshot.as_ref()
    }

    fn member_values(
        &self,
        names: &[&'static str],
        read: impl Fn(&PropertyInfo) -> Value,
    ) -> Vec<Value> {
        names
            .iter()
            .map(|name| {
                self.entity_type
                    .property_named(name)
                    .map_or(Value::Null, &read)
            })
            .collect()
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    /// Overwrite the current value of a property.
    pub(crate) fn write_value(&mut self, property: &PropertyInfo, value: Value) {
        match &mut self.data {
            EntityData::Live(entity) => write_entity(entity).set_value(property.name, value),
            EntityData::Shadow(values) => {
                if let Some(slot) = values.get_mut(property.index()) {
                    *slot = value;
                }
            }
        }
    }

    /// Mark or unmark a property as modified. Returns true if the flag changed.
    ///
    /// Marking a property of an Unchanged entry moves it to Modified.
    pub(crate) fn set_modified(&mut self, property: &PropertyInfo, modified: bool) -> bool {
        let Some(flag) = self.modified.get_mut(property.index()) else {
            return false;
        };
        if *flag == modified {
            return false;
        }
        *flag = modified;
        if modified && self.state == EntityState::Unchanged {
            self.state = EntityState::Modified;
        }
        true
    }

    /// Mark every non-key property modified.
    pub(crate) fn mark_all_modified(&mut self) {
        let entity_type = Arc::clone(&self.entity_type);
        for property in entity_type.properties() {
            if !property.is_primary_key() {
                self.modified[property.index()] = true;
            }
        }
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified.fill(false);
    }

    pub(crate) fn set_temporary(&mut self, property: &PropertyInfo, temporary: bool) {
        if let Some(flag) = self.temporary.get_mut(property.index()) {
            *flag = temporary;
        }
    }

    /// Record every tracked original from the current values.
    pub(crate) fn take_original_snapshot(&mut self) {
        let count = self.entity_type.original_value_count();
        if count == 0 {
            return;
        }
        let mut originals = OriginalValues::new(count);
        for property in self.entity_type.properties() {
            if let Some(index) = property.original_value_index() {
                originals.set(index, self.current_value(property));
            }
        }
        self.original_values = Some(originals);
    }

    /// Record the original of one property unless it is already recorded.
    pub(crate) fn ensure_original_value(&mut self, property: &PropertyInfo) {
        let Some(index) = property.original_value_index() else {
            return;
        };
        if self.original_values.as_ref().is_some_and(|o| o.has(index)) {
            return;
        }
        let value = self.current_value(property);
        let count = self.entity_type.original_value_count();
        self.original_values
            .get_or_insert_with(|| OriginalValues::new(count))
            .set(index, value);
    }

    pub(crate) fn discard_original_values(&mut self) {
        self.original_values = None;
    }

    /// Refresh the relationship snapshot of one member.
    pub(crate) fn snapshot_member(&mut self, member: PropertyBase<'_>) {
        let snapshot = match member {
            PropertyBase::Scalar(p) => Snapshotted::Scalar(p.name, self.current_value(p)),
            PropertyBase::Navigation(n) => {
                Snapshotted::Navigation(n.name, self.navigation(n).into())
            }
        };
        let target = self
            .relationship_snapshot
            .get_or_insert_with(RelationshipSnapshot::default);
        match snapshot {
            Snapshotted::Scalar(name, value) => target.set_scalar(name, value),
            Snapshotted::Navigation(name, value) => target.set_navigation(name, value),
        }
    }

    /// Snapshot a member unless the relationship snapshot already holds it.
    pub(crate) fn ensure_snapshot_member(&mut self, member: PropertyBase<'_>) {
        let present = self.relationship_snapshot.as_ref().is_some_and(|s| match member {
            PropertyBase::Scalar(p) => s.scalar(p.name).is_some(),
            PropertyBase::Navigation(n) => s.navigation(n.name).is_some(),
        });
        if !present {
            self.snapshot_member(member);
        }
    }

    /// Take a full relationship snapshot: keys, foreign keys, navigations.
    pub(crate) fn take_relationship_snapshot(&mut self) {
        if !self.entity_type.needs_relationship_snapshot() {
            return;
        }
        let entity_type = Arc::clone(&self.entity_type);
        let mut snapshot = RelationshipSnapshot::default();
        for property in entity_type
            .properties()
            .iter()
            .filter(|p| p.is_key() || p.is_foreign_key())
        {
            snapshot.set_scalar(property.name, self.current_value(property));
        }
        for navigation in entity_type.navigations() {
            snapshot.set_navigation(navigation.name, self.navigation(navigation).into());
        }
        self.relationship_snapshot = Some(snapshot);
    }

    pub(crate) fn discard_relationship_snapshot(&mut self) {
        self.relationship_snapshot = None;
    }

    /// Make the current values the new synchronization point.
    pub(crate) fn accept_changes(&mut self) {
        self.state = EntityState::Unchanged;
        self.clear_modified();
        self.temporary.fill(false);
        if self.entity_type.uses_eager_snapshots() {
            self.take_original_snapshot();
            self.take_relationship_snapshot();
        } else {
            self.discard_original_values();
            self.discard_relationship_snapshot();
        }
    }
}

enum Snapshotted {
    Scalar(&'static str, Value),
    Navigation(&'static str, NavigationSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::{DynamicEntity, EntityType, Model, PropertyInfo};

    fn model() -> Model {
        Model::builder()
            .entity(
                EntityType::new("Note")
                    .property(PropertyInfo::new("id"))
                    .property(PropertyInfo::new("body"))
                    .primary_key(&["id"]),
            )
            .build()
            .unwrap()
    }

    fn live_entry() -> (TrackedEntry, EntityRef) {
        let model = model();
        let et = Arc::clone(model.entity_type("Note").unwrap());
        let entity = DynamicEntity::new("Note")
            .with("id", 1_i64)
            .with("body", "hi")
            .into_ref();
        let entry = TrackedEntry::new(EntryId::new(0), et, EntityData::Live(entity.clone()));
        (entry, entity)
    }

    #[test]
    fn originals_fall_back_to_current_values() {
        let (entry, _) = live_entry();
        let body = entry.entity_type().property_named("body").unwrap().clone();
        assert!(entry.original_values().is_none());
        assert_eq!(entry.original_value(&body), Value::Text("hi".into()));
    }

    #[test]
    fn snapshot_survives_live_mutation() {
        let (mut entry, entity) = live_entry();
        entry.take_original_snapshot();
        let body = entry.entity_type().property_named("body").unwrap().clone();

        write_entity(&entity).set_value("body", Value::Text("changed".into()));
        assert_eq!(entry.current_value(&body), Value::Text("changed".into()));
        assert_eq!(entry.original_value(&body), Value::Text("hi".into()));
    }

    #[test]
    fn marking_modified_moves_unchanged_to_modified() {
        let (mut entry, _) = live_entry();
        entry.set_state(EntityState::Unchanged);
        let body = entry.entity_type().property_named("body").unwrap().clone();

        assert!(entry.set_modified(&body, true));
        assert!(!entry.set_modified(&body, true));
        assert_eq!(entry.state(), EntityState::Modified);
        assert_eq!(entry.modified_properties(), ["body"]);

        entry.accept_changes();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert!(entry.modified_properties().is_empty());
    }

    #[test]
    fn shadow_entries_hold_their_own_values() {
        let model = model();
        let et = Arc::clone(model.entity_type("Note").unwrap());
        let mut entry = TrackedEntry::new(
            EntryId::new(3),
            et,
            EntityData::Shadow(vec![Value::Int(9), Value::Null]),
        );
        let body = entry.entity_type().property_named("body").unwrap().clone();
        entry.write_value(&body, Value::Text("x".into()));

        assert!(entry.is_shadow());
        assert!(entry.entity().is_none());
        assert_eq!(entry.value("body"), Some(Value::Text("x".into())));
        assert_eq!(entry.primary_key_value(), KeyValue::single(Value::Int(9)));
    }

    #[test]
    fn lazy_original_is_recorded_once() {
        let (mut entry, entity) = live_entry();
        let body = entry.entity_type().property_named("body").unwrap().clone();
        entry.ensure_original_value(&body);
        write_entity(&entity).set_value("body", Value::Text("second".into()));
        entry.ensure_original_value(&body);
        assert_eq!(entry.original_value(&body), Value::Text("hi".into()));
    }
}
