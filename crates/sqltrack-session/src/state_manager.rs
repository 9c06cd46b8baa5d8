//! The tracked-entry arena.
//!
//! [`StateManager`] owns every [`TrackedEntry`] of a session, the identity
//! map over their keys and the value generators. Entities stay owned by the
//! caller; the manager only holds `EntityRef` clones and refers to entries by
//! [`EntryId`].

use crate::entry::{EntityData, TrackedEntry};
use crate::events::{RelationshipEvent, RelationshipListener};
use crate::identity_map::IdentityMap;
use crate::value_generation::ValueGenerationManager;
use sqltrack_core::{
    DeleteBehavior, EntityRef, EntityState, EntityType, EntryId, Error, KeyInfo, KeyValue, Model,
    ModelErrorKind, PropertyBase, PropertyInfo, Result, Value, entity_address, read_entity,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// How a property write should affect entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Set by the host through the session.
    User,
    /// Copied by relationship fix-up.
    Fixup { temporary: bool },
    /// Produced by a value generator.
    Generated { temporary: bool },
    /// Read back from the store after a write.
    Store,
}

/// State assigned to entities reached while tracking a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GraphMode {
    Add,
    Attach,
    Update,
}

impl GraphMode {
    fn state_for(self, key_set: bool) -> EntityState {
        match (self, key_set) {
            (GraphMode::Add, _) | (_, false) => EntityState::Added,
            (GraphMode::Attach, true) => EntityState::Unchanged,
            (GraphMode::Update, true) => EntityState::Modified,
        }
    }
}

#[derive(Default)]
struct DeletePlan {
    deletes: Vec<EntryId>,
    nullings: Vec<(EntryId, &'static str)>,
}

/// Tracks entity instances for one session.
pub struct StateManager {
    model: Arc<Model>,
    entries: BTreeMap<EntryId, TrackedEntry>,
    next_id: usize,
    by_address: HashMap<usize, EntryId>,
    pub(crate) identity_map: IdentityMap,
    pub(crate) value_generation: ValueGenerationManager,
    listeners: Vec<RelationshipListener>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("entries", &self.entries.len())
            .field("identity_map", &self.identity_map.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl StateManager {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            entries: BTreeMap::new(),
            next_id: 0,
            by_address: HashMap::new(),
            identity_map: IdentityMap::new(),
            value_generation: ValueGenerationManager::new(),
            listeners: Vec::new(),
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    /// Look up an entry, failing with a usage fault if it is not tracked.
    pub fn try_entry(&self, id: EntryId) -> Result<&TrackedEntry> {
        self.entries.get(&id).ok_or_else(|| not_tracked(id))
    }

    pub(crate) fn try_entry_mut(&mut self, id: EntryId) -> Result<&mut TrackedEntry> {
        self.entries.get_mut(&id).ok_or_else(|| not_tracked(id))
    }

    /// All tracked entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    /// Entry tracking this instance, if any.
    pub fn entry_for(&self, entity: &EntityRef) -> Option<EntryId> {
        self.by_address.get(&entity_address(entity)).copied()
    }

    /// State of an instance; `Detached` when it is not tracked.
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.entry_for(entity)
            .and_then(|id| self.entries.get(&id))
            .map_or(EntityState::Detached, TrackedEntry::state)
    }

    /// Entries that will produce a write on the next save, in id order.
    pub fn pending_entries(&self) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.state().has_pending_write())
            .map(TrackedEntry::id)
            .collect()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.entries.values().any(|e| e.state().has_pending_write())
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Find the entry holding `value` for a key of `entity_type`.
    pub fn resolve(&self, entity_type: &str, key: &str, value: &KeyValue) -> Option<EntryId> {
        self.identity_map.resolve(entity_type, key, value)
    }

    /// Find an entry by primary key.
    pub fn find(&self, entity_type: &str, value: &KeyValue) -> Option<EntryId> {
        let et = self.model.entity_type(entity_type)?;
        self.resolve(entity_type, et.primary_key_info().name, value)
    }

    /// Dependents whose foreign key currently equals `value`.
    pub fn dependents(&self, entity_type: &str, foreign_key: &str, value: &KeyValue) -> Vec<EntryId> {
        self.identity_map.dependents(entity_type, foreign_key, value)
    }

    /// Register a callback observing every relationship event.
    pub fn add_listener(&mut self, listener: impl FnMut(&RelationshipEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Start tracking `entity` as Added, together with every untracked
    /// entity reachable from it.
    pub fn add(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.track_graph(entity, GraphMode::Add)
    }

    /// Start tracking `entity` as Unchanged (Added when its key is not set).
    pub fn attach(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.track_graph(entity, GraphMode::Attach)
    }

    /// Start tracking `entity` as Modified with every non-key property
    /// marked (Added when its key is not set).
    pub fn update(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.track_graph(entity, GraphMode::Update)
    }

    /// Track an entity that has no live object; values live in the entry.
    pub fn track_shadow(
        &mut self,
        entity_type: &str,
        values: &[(&str, Value)],
        state: EntityState,
    ) -> Result<EntryId> {
        let et = Arc::clone(self.model.find_entity_type(entity_type)?);
        let mut data = vec![Value::Null; et.properties().len()];
        for (name, value) in values {
            let index = find_property(&et, name)?.index();
            data[index] = value.clone();
        }
        let id = self.allocate(et, EntityData::Shadow(data));
        if let Err(e) = self.start_tracking(id, state) {
            self.entries.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Track a shadow entity as Added.
    pub fn add_shadow(&mut self, entity_type: &str, values: &[(&str, Value)]) -> Result<EntryId> {
        self.track_shadow(entity_type, values, EntityState::Added)
    }

    /// Mark an entity for deletion, applying delete behaviour to its
    /// tracked dependents. Untracked entities are attached first.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        let id = match self.entry_for(entity) {
            Some(id) => id,
            None => self.attach(Arc::clone(entity))?,
        };
        self.remove_entry(id)
    }

    /// Mark an entry for deletion. Added entries are detached instead.
    pub fn remove_entry(&mut self, id: EntryId) -> Result<()> {
        let state = self.try_entry(id)?.state();
        if state == EntityState::Deleted {
            return Ok(());
        }

        let mut plan = DeletePlan::default();
        self.plan_delete(id, &mut plan)?;

        for (dependent, foreign_key) in plan.nullings {
            if plan.deletes.contains(&dependent) {
                continue;
            }
            let et = Arc::clone(self.try_entry(dependent)?.entity_type());
            let Some(fk) = et.foreign_key_named(foreign_key) else {
                continue;
            };
            for name in &fk.properties {
                if let Some(property) = et.property_named(name) {
                    self.write_property(
                        dependent,
                        property,
                        Value::Null,
                        WriteKind::Fixup { temporary: false },
                    )?;
                }
            }
        }
        for entry in plan.deletes {
            if self.entries.contains_key(&entry) {
                self.set_state(entry, EntityState::Deleted)?;
            }
        }
        Ok(())
    }

    fn plan_delete(&self, id: EntryId, plan: &mut DeletePlan) -> Result<()> {
        if plan.deletes.contains(&id) {
            return Ok(());
        }
        plan.deletes.push(id);
        let entry = self.try_entry(id)?;
        let et = entry.entity_type();

        for (dependent_type, fk) in self.model.referencing_foreign_keys(et.name()) {
            let Some(key) = et.key_named(fk.principal_key_name()) else {
                continue;
            };
            let value = entry.key_value(key);
            if value.has_null() {
                continue;
            }
            for dependent in self
                .identity_map
                .dependents(dependent_type.name(), fk.name, &value)
            {
                let live = self
                    .entries
                    .get(&dependent)
                    .is_some_and(|d| d.state() != EntityState::Deleted);
                if !live || plan.deletes.contains(&dependent) {
                    continue;
                }
                match fk.delete_behavior {
                    DeleteBehavior::Cascade => self.plan_delete(dependent, plan)?,
                    DeleteBehavior::SetNull if !fk.is_required() => {
                        plan.nullings.push((dependent, fk.name));
                    }
                    DeleteBehavior::SetNull | DeleteBehavior::Restrict => {
                        return Err(Error::model(
                            ModelErrorKind::RequiredRelationship,
                            Some(et.name()),
                            format!(
                                "cannot remove {} {value}: '{}' {dependent} still references it \
                                 through '{}'",
                                et.name(),
                                dependent_type.name(),
                                fk.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop tracking an instance. Returns false if it was not tracked.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        match self.entry_for(entity) {
            Some(id) => self.stop_tracking(id).is_some(),
            None => false,
        }
    }

    /// Move an entry to a new state.
    ///
    /// Added entries that become Deleted are detached. Entering Modified
    /// marks every non-key property; entering Unchanged makes the current
    /// values the new synchronization point.
    pub fn set_state(&mut self, id: EntryId, state: EntityState) -> Result<()> {
        let old = self.try_entry(id)?.state();
        if old == state {
            return Ok(());
        }
        match state {
            EntityState::Detached => {
                self.stop_tracking(id);
            }
            EntityState::Deleted if old == EntityState::Added => {
                self.stop_tracking(id);
            }
            EntityState::Deleted => self.try_entry_mut(id)?.set_state(state),
            EntityState::Added => {
                let entry = self.try_entry_mut(id)?;
                entry.set_state(state);
                entry.clear_modified();
                self.generate_values(id)?;
            }
            EntityState::Modified => {
                self.require_key(id)?;
                let entry = self.try_entry_mut(id)?;
                entry.set_state(state);
                entry.mark_all_modified();
            }
            EntityState::Unchanged => {
                self.require_key(id)?;
                self.detect_entry_changes(id)?;
                self.try_entry_mut(id)?.accept_changes();
            }
        }
        tracing::debug!(entry = %id, from = %old, to = %state, "Entry state changed");
        Ok(())
    }

    /// Set a property through the tracker, marking it modified.
    pub fn set_property_value(
        &mut self,
        id: EntryId,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let property = find_property(&et, property)?;
        self.write_property(id, property, value.into(), WriteKind::User)
    }

    /// Store a value read back from the store. Clears the temporary flag
    /// without marking the property modified.
    pub fn set_store_value(&mut self, id: EntryId, property: &str, value: Value) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let property = find_property(&et, property)?;
        self.write_property(id, property, value, WriteKind::Store)
    }

    /// Put back a value that a store write replaced, restoring its
    /// temporary flag. Used to undo read-back values of a failed save.
    pub fn restore_store_value(
        &mut self,
        id: EntryId,
        property: &str,
        value: Value,
        temporary: bool,
    ) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let property = find_property(&et, property)?;
        self.write_property(id, property, value, WriteKind::Generated { temporary })
    }

    /// Accept the current values of one entry after a successful save.
    pub fn accept_changes(&mut self, id: EntryId) -> Result<()> {
        match self.try_entry(id)?.state() {
            EntityState::Deleted => {
                self.stop_tracking(id);
            }
            EntityState::Detached => {}
            EntityState::Added | EntityState::Modified | EntityState::Unchanged => {
                self.try_entry_mut(id)?.accept_changes();
            }
        }
        Ok(())
    }

    /// Accept every entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_all_changes(&mut self) {
        let pending = self.pending_entries();
        for id in &pending {
            if let Err(error) = self.accept_changes(*id) {
                tracing::warn!(entry = %id, %error, "Failed to accept changes");
            }
        }
        tracing::debug!(accepted = pending.len(), "Accepted changes");
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_address.clear();
        self.identity_map.clear();
    }

    fn allocate(&mut self, entity_type: Arc<EntityType>, data: EntityData) -> EntryId {
        let id = EntryId::new(self.next_id);
        self.next_id += 1;
        if let EntityData::Live(entity) = &data {
            self.by_address.insert(entity_address(entity), id);
        }
        self.entries
            .insert(id, TrackedEntry::new(id, entity_type, data));
        id
    }

    fn entity_type_of(&self, entity: &EntityRef) -> Result<Arc<EntityType>> {
        let name = read_entity(entity).entity_type();
        self.model.find_entity_type(name).map(Arc::clone)
    }

    pub(crate) fn track_graph(&mut self, root: EntityRef, mode: GraphMode) -> Result<EntryId> {
        let mut created = Vec::new();
        let root_id = if let Some(id) = self.entry_for(&root) {
            match mode {
                GraphMode::Add => self.set_state(id, EntityState::Added)?,
                GraphMode::Update => {
                    let state = mode.state_for(self.key_is_set(id)?);
                    self.set_state(id, state)?;
                }
                GraphMode::Attach => {}
            }
            id
        } else {
            let id = self.begin_tracking(root, mode)?;
            created.push(id);
            id
        };

        let mut queue = VecDeque::from([root_id]);
        while let Some(id) = queue.pop_front() {
            for target in self.reachable_from(id) {
                if self.entry_for(&target).is_some() {
                    continue;
                }
                match self.begin_tracking(target, mode) {
                    Ok(new_id) => {
                        created.push(new_id);
                        queue.push_back(new_id);
                    }
                    Err(e) => {
                        for id in created {
                            self.stop_tracking(id);
                        }
                        return Err(e);
                    }
                }
            }
        }

        for id in &created {
            self.initial_fixup(*id)?;
        }
        Ok(root_id)
    }

    fn reachable_from(&self, id: EntryId) -> Vec<EntityRef> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        entry
            .entity_type()
            .navigations()
            .iter()
            .flat_map(|n| entry.navigation(n).entities())
            .collect()
    }

    fn begin_tracking(&mut self, entity: EntityRef, mode: GraphMode) -> Result<EntryId> {
        let et = self.entity_type_of(&entity)?;
        let key_set = et.primary_key_info().properties.iter().all(|name| {
            et.property_named(name).is_some_and(|p| {
                let value = read_entity(&entity).get_value(p.name);
                !p.is_default(&value)
            })
        });
        let state = mode.state_for(key_set);
        let address = entity_address(&entity);
        let id = self.allocate(et, EntityData::Live(entity));
        if let Err(e) = self.start_tracking(id, state) {
            self.entries.remove(&id);
            self.by_address.remove(&address);
            return Err(e);
        }
        Ok(id)
    }

    /// Generate values, take eager snapshots and index a fresh entry.
    fn start_tracking(&mut self, id: EntryId, state: EntityState) -> Result<()> {
        if state == EntityState::Added {
            self.generate_values(id)?;
        } else {
            self.require_key(id)?;
        }

        let entry = self.try_entry_mut(id)?;
        entry.set_state(state);
        if state == EntityState::Modified {
            entry.mark_all_modified();
        }
        if entry.entity_type().uses_eager_snapshots() {
            if state != EntityState::Added {
                entry.take_original_snapshot();
            }
            entry.take_relationship_snapshot();
        }

        if let Err(e) = self.index_entry(id) {
            self.try_entry_mut(id)?.set_state(EntityState::Detached);
            return Err(e);
        }
        let entity_type = self.try_entry(id)?.entity_type().name();
        tracing::debug!(entry = %id, entity_type, state = %state, "Started tracking");
        Ok(())
    }

    /// Remove an entry and all of its index mappings.
    pub(crate) fn stop_tracking(&mut self, id: EntryId) -> Option<TrackedEntry> {
        self.unindex_entry(id);
        let mut entry = self.entries.remove(&id)?;
        if let Some(entity) = entry.entity() {
            self.by_address.remove(&entity_address(entity));
        }
        entry.set_state(EntityState::Detached);
        tracing::debug!(entry = %id, entity_type = entry.entity_type().name(), "Stopped tracking");
        Some(entry)
    }

    fn index_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self.try_entry(id)?;
        let et = Arc::clone(entry.entity_type());
        let keys: Vec<(&KeyInfo, KeyValue)> =
            et.keys().iter().map(|k| (k, entry.key_value(k))).collect();
        let foreign_keys: Vec<(&'static str, KeyValue)> = et
            .foreign_keys()
            .iter()
            .map(|fk| (fk.name, entry.foreign_key_value(fk)))
            .collect();

        let mut inserted: Vec<(&'static str, KeyValue)> = Vec::new();
        for (key, value) in keys {
            if value.has_null() {
                continue;
            }
            if let Err(holder) = self.identity_map.insert(et.name(), key.name, value.clone(), id) {
                for (name, value) in &inserted {
                    self.identity_map.remove(et.name(), name, value, id);
                }
                return Err(identity_conflict(&et, key, &value, holder));
            }
            inserted.push((key.name, value));
        }
        for (name, value) in foreign_keys {
            if !value.has_null() {
                self.identity_map.insert_dependent(et.name(), name, value, id);
            }
        }
        Ok(())
    }

    fn unindex_entry(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let et = Arc::clone(entry.entity_type());
        let mut keys = Vec::new();
        for key in et.keys() {
            keys.push((key.name, entry.key_value(key)));
            keys.push((key.name, entry.snapshot_key_value(key)));
        }
        let mut foreign_keys = Vec::new();
        for fk in et.foreign_keys() {
            foreign_keys.push((fk.name, entry.foreign_key_value(fk)));
            foreign_keys.push((fk.name, entry.snapshot_foreign_key_value(fk)));
        }
        for (name, value) in &keys {
            self.identity_map.remove(et.name(), name, value, id);
        }
        for (name, value) in &foreign_keys {
            self.identity_map.remove_dependent(et.name(), name, value, id);
        }
    }

    fn key_is_set(&self, id: EntryId) -> Result<bool> {
        let entry = self.try_entry(id)?;
        let et = entry.entity_type();
        Ok(et.primary_key_info().properties.iter().all(|name| {
            et.property_named(name).is_some_and(|p| {
                !entry.is_temporary(p) && !p.is_default(&entry.current_value(p))
            })
        }))
    }

    fn require_key(&self, id: EntryId) -> Result<()> {
        if self.key_is_set(id)? {
            return Ok(());
        }
        let entry = self.try_entry(id)?;
        Err(Error::model(
            ModelErrorKind::KeyNotSet,
            Some(entry.entity_type().name()),
            format!(
                "the primary key {} of {id} is not set; only Added entries may have \
                 unset or temporary keys",
                entry.primary_key_value()
            ),
        ))
    }

    /// Write one property and keep flags, snapshots and indexes consistent.
    pub(crate) fn write_property(
        &mut self,
        id: EntryId,
        property: &PropertyInfo,
        value: Value,
        kind: WriteKind,
    ) -> Result<()> {
        let entry = self.try_entry_mut(id)?;
        let state = entry.state();
        let live = state != EntityState::Detached;
        let relational = property.is_key() || property.is_foreign_key();
        if live && !entry.entity_type().uses_eager_snapshots() {
            entry.ensure_original_value(property);
            if relational {
                entry.ensure_snapshot_member(PropertyBase::Scalar(property));
            }
        }

        entry.write_value(property, value);
        let tracks_modification = matches!(state, EntityState::Unchanged | EntityState::Modified);
        match kind {
            WriteKind::User => {
                entry.set_temporary(property, false);
                if tracks_modification {
                    entry.set_modified(property, true);
                }
            }
            WriteKind::Fixup { temporary } => {
                entry.set_temporary(property, temporary);
                if tracks_modification {
                    entry.set_modified(property, true);
                }
            }
            WriteKind::Generated { temporary } => entry.set_temporary(property, temporary),
            WriteKind::Store => entry.set_temporary(property, false),
        }

        if live && relational {
            self.detect_key_change(id, property)?;
        }
        Ok(())
    }

    /// Deliver events to listeners, then to the built-in fix-up.
    pub(crate) fn publish(&mut self, events: Vec<RelationshipEvent>) -> Result<()> {
        for event in events {
            tracing::trace!(?event, "Relationship change");
            let mut listeners = std::mem::take(&mut self.listeners);
            for listener in &mut listeners {
                listener(&event);
            }
            self.listeners = listeners;
            self.fix_up(&event)?;
        }
        Ok(())
    }
}

fn find_property<'a>(et: &'a EntityType, name: &str) -> Result<&'a PropertyInfo> {
    et.property_named(name).ok_or_else(|| {
        Error::model(
            ModelErrorKind::InvalidModel,
            Some(et.name()),
            format!("unknown property '{name}'"),
        )
    })
}

fn not_tracked(id: EntryId) -> Error {
    Error::model(
        ModelErrorKind::NotTracked,
        None,
        format!("entry {id} is not tracked"),
    )
}

pub(crate) fn identity_conflict(et: &EntityType, key: &KeyInfo, value: &KeyValue, holder: EntryId) -> Error {
    Error::model(
        ModelErrorKind::IdentityConflict,
        Some(et.name()),
        format!(
            "another instance with {} = {value} is already tracked as {holder}",
            key.name
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::{DynamicEntity, ForeignKeyInfo, ValueGenerated, read_entity};

    fn model(team_id_nullable: bool, on_delete: DeleteBehavior) -> Arc<Model> {
        let team = EntityType::new("Team")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .primary_key(&["id"]);
        let hero = EntityType::new("Hero")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .property(PropertyInfo::new("team_id").nullable(team_id_nullable))
            .primary_key(&["id"])
            .foreign_key(
                ForeignKeyInfo::new("FK_Hero_Team", &["team_id"], "Team")
                    .navigation("team")
                    .inverse("heroes")
                    .on_delete(on_delete),
            );
        Arc::new(Model::builder().entity(team).entity(hero).build().unwrap())
    }

    fn team(id: i64) -> EntityRef {
        DynamicEntity::new("Team")
            .with("id", id)
            .with("name", "Avengers")
            .into_ref()
    }

    fn hero(id: i64, team_id: Option<i64>) -> EntityRef {
        DynamicEntity::new("Hero")
            .with("id", id)
            .with("name", "Hulk")
            .with("team_id", team_id)
            .into_ref()
    }

    fn key(v: i64) -> KeyValue {
        KeyValue::single(Value::BigInt(v))
    }

    fn model_error_kind(error: &Error) -> Option<ModelErrorKind> {
        match error {
            Error::Model(e) => Some(e.kind),
            _ => None,
        }
    }

    #[test]
    fn attach_indexes_primary_key() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let t = team(1);
        let id = sm.attach(t.clone()).unwrap();

        assert_eq!(sm.state_of(&t), EntityState::Unchanged);
        assert_eq!(sm.entry_for(&t), Some(id));
        assert_eq!(sm.find("Team", &key(1)), Some(id));
        assert!(!sm.has_pending_changes());
    }

    #[test]
    fn add_assigns_temporary_key() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let t = DynamicEntity::new("Team").with("name", "New").into_ref();
        let id = sm.add(t.clone()).unwrap();

        let entry = sm.entry(id).unwrap();
        let pk = entry.entity_type().property_named("id").unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert!(entry.is_temporary(pk));
        assert_eq!(read_entity(&t).get_value("id"), Value::BigInt(-1));
        assert_eq!(sm.find("Team", &key(-1)), Some(id));
        assert_eq!(sm.pending_entries(), [id]);
    }

    #[test]
    fn identity_conflict_leaves_second_instance_untracked() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        sm.attach(team(1)).unwrap();
        let twin = team(1);
        let err = sm.attach(twin.clone()).unwrap_err();

        assert_eq!(model_error_kind(&err), Some(ModelErrorKind::IdentityConflict));
        assert_eq!(sm.state_of(&twin), EntityState::Detached);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn unknown_entity_type_is_rejected() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let err = sm.attach(DynamicEntity::new("Villain").into_ref()).unwrap_err();
        assert_eq!(model_error_kind(&err), Some(ModelErrorKind::UnknownEntityType));
    }

    #[test]
    fn attaching_a_graph_fixes_up_foreign_keys() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let member = hero(10, None);
        let mut t = DynamicEntity::new("Team").with("id", 1_i64).with("name", "A");
        t.push("heroes", member.clone());
        let team_id = sm.attach(t.into_ref()).unwrap();

        let hero_id = sm.entry_for(&member).unwrap();
        let entry = sm.entry(hero_id).unwrap();
        assert_eq!(entry.value("team_id"), Some(Value::BigInt(1)));
        assert_eq!(entry.state(), EntityState::Modified);
        assert_eq!(entry.modified_properties(), ["team_id"]);
        assert_eq!(sm.dependents("Hero", "FK_Hero_Team", &key(1)), [hero_id]);
        assert_eq!(sm.entry(team_id).unwrap().state(), EntityState::Unchanged);
    }

    #[test]
    fn added_graph_shares_temporary_keys() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let member = DynamicEntity::new("Hero").with("name", "Thor").into_ref();
        let mut t = DynamicEntity::new("Team").with("name", "A");
        t.push("heroes", member.clone());
        sm.add(t.into_ref()).unwrap();

        let hero_id = sm.entry_for(&member).unwrap();
        let entry = sm.entry(hero_id).unwrap();
        let team_id = entry.entity_type().property_named("team_id").unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert_eq!(entry.current_value(team_id), Value::BigInt(-1));
        assert!(entry.is_temporary(team_id));
    }

    #[test]
    fn remove_with_set_null_detaches_dependents() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let t = team(1);
        let h = hero(10, Some(1));
        let team_id = sm.attach(t.clone()).unwrap();
        let hero_id = sm.attach(h.clone()).unwrap();

        sm.remove(&t).unwrap();

        assert_eq!(sm.entry(team_id).unwrap().state(), EntityState::Deleted);
        let hero = sm.entry(hero_id).unwrap();
        assert_eq!(hero.state(), EntityState::Modified);
        assert_eq!(read_entity(&h).get_value("team_id"), Value::Null);
        assert!(sm.dependents("Hero", "FK_Hero_Team", &key(1)).is_empty());
    }

    #[test]
    fn remove_with_restrict_fails_without_side_effects() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::Restrict));
        let t = team(1);
        sm.attach(t.clone()).unwrap();
        sm.attach(hero(10, Some(1))).unwrap();

        let err = sm.remove(&t).unwrap_err();
        assert_eq!(
            model_error_kind(&err),
            Some(ModelErrorKind::RequiredRelationship)
        );
        assert_eq!(sm.state_of(&t), EntityState::Unchanged);
    }

    #[test]
    fn set_null_on_required_foreign_key_fails() {
        let mut sm = StateManager::new(model(false, DeleteBehavior::SetNull));
        let t = team(1);
        sm.attach(t.clone()).unwrap();
        sm.attach(hero(10, Some(1))).unwrap();

        let err = sm.remove(&t).unwrap_err();
        assert_eq!(
            model_error_kind(&err),
            Some(ModelErrorKind::RequiredRelationship)
        );
    }

    #[test]
    fn remove_cascades_to_dependents() {
        let mut sm = StateManager::new(model(false, DeleteBehavior::Cascade));
        let t = team(1);
        let h = hero(10, Some(1));
        sm.attach(t.clone()).unwrap();
        sm.attach(h.clone()).unwrap();

        sm.remove(&t).unwrap();
        assert_eq!(sm.state_of(&t), EntityState::Deleted);
        assert_eq!(sm.state_of(&h), EntityState::Deleted);
    }

    #[test]
    fn removing_an_added_entity_detaches_it() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let t = DynamicEntity::new("Team").with("name", "New").into_ref();
        sm.add(t.clone()).unwrap();
        sm.remove(&t).unwrap();

        assert_eq!(sm.state_of(&t), EntityState::Detached);
        assert!(sm.is_empty());
        assert_eq!(sm.find("Team", &key(-1)), None);
    }

    #[test]
    fn unchanged_requires_a_permanent_key() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let id = sm
            .add(DynamicEntity::new("Team").with("name", "New").into_ref())
            .unwrap();

        let err = sm.set_state(id, EntityState::Unchanged).unwrap_err();
        assert_eq!(model_error_kind(&err), Some(ModelErrorKind::KeyNotSet));
    }

    #[test]
    fn update_marks_every_non_key_property() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let id = sm.update(hero(10, Some(1))).unwrap();

        let entry = sm.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Modified);
        assert_eq!(entry.modified_properties(), ["name", "team_id"]);
    }

    #[test]
    fn shadow_entries_are_indexed() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let id = sm
            .track_shadow(
                "Team",
                &[("id", Value::BigInt(5)), ("name", Value::Text("S".into()))],
                EntityState::Unchanged,
            )
            .unwrap();

        assert!(sm.entry(id).unwrap().is_shadow());
        assert_eq!(sm.find("Team", &key(5)), Some(id));

        sm.set_property_value(id, "name", "T").unwrap();
        let entry = sm.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Modified);
        assert_eq!(entry.value("name"), Some(Value::Text("T".into())));
    }

    #[test]
    fn accept_changes_resets_flags_and_forgets_deleted() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let t = team(1);
        let h = hero(10, None);
        let team_id = sm.attach(t.clone()).unwrap();
        let hero_id = sm.attach(h.clone()).unwrap();
        sm.set_property_value(team_id, "name", "B").unwrap();
        sm.remove(&h).unwrap();

        sm.accept_all_changes();
        assert_eq!(sm.entry(team_id).unwrap().state(), EntityState::Unchanged);
        assert!(sm.entry(team_id).unwrap().modified_properties().is_empty());
        assert!(sm.entry(hero_id).is_none());
        assert_eq!(sm.state_of(&h), EntityState::Detached);
    }

    #[test]
    fn conflicting_store_key_keeps_the_entry_findable() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let existing = sm.attach(hero(42, None)).unwrap();
        let added = sm
            .add(DynamicEntity::new("Hero").with("name", "Thor").into_ref())
            .unwrap();
        let temporary = sm.try_entry(added).unwrap().value("id").unwrap();

        let err = sm.set_store_value(added, "id", Value::BigInt(42)).unwrap_err();
        assert_eq!(model_error_kind(&err), Some(ModelErrorKind::IdentityConflict));
        assert_eq!(sm.find("Hero", &KeyValue::single(temporary.clone())), Some(added));
        assert_eq!(sm.find("Hero", &key(42)), Some(existing));

        sm.restore_store_value(added, "id", temporary.clone(), true)
            .unwrap();
        assert_eq!(sm.find("Hero", &KeyValue::single(temporary)), Some(added));
        assert_eq!(sm.find("Hero", &key(42)), Some(existing));
    }

    #[test]
    fn store_key_reuses_the_key_of_a_deleted_entry() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let old = hero(42, None);
        let deleted = sm.attach(old.clone()).unwrap();
        sm.remove(&old).unwrap();
        let added = sm
            .add(DynamicEntity::new("Hero").with("name", "Thor").into_ref())
            .unwrap();

        sm.set_store_value(added, "id", Value::BigInt(42)).unwrap();
        assert_eq!(sm.find("Hero", &key(42)), Some(added));

        sm.accept_all_changes();
        assert!(sm.entry(deleted).is_none());
        assert_eq!(sm.find("Hero", &key(42)), Some(added));
    }

    #[test]
    fn deleted_entry_gets_its_key_back_when_the_new_holder_lets_go() {
        let mut sm = StateManager::new(model(true, DeleteBehavior::SetNull));
        let old = hero(42, None);
        let deleted = sm.attach(old.clone()).unwrap();
        sm.remove(&old).unwrap();
        let added = sm
            .add(DynamicEntity::new("Hero").with("name", "Thor").into_ref())
            .unwrap();
        let temporary = sm.try_entry(added).unwrap().value("id").unwrap();

        sm.set_store_value(added, "id", Value::BigInt(42)).unwrap();
        sm.restore_store_value(added, "id", temporary.clone(), true)
            .unwrap();

        assert_eq!(sm.find("Hero", &key(42)), Some(deleted));
        assert_eq!(sm.find("Hero", &KeyValue::single(temporary)), Some(added));
    }
}
