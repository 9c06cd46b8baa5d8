//! Change detection.
//!
//! Detection compares live values with the entry's snapshots:
//!
//! - scalar properties with a recorded original value are diffed and marked
//!   modified (skipped for types that report changes through notifications)
//! - key and foreign key properties are compared structurally with the
//!   relationship snapshot; a change re-indexes the entry and publishes a
//!   [`RelationshipEvent`]
//! - navigations are compared by reference identity; newly referenced
//!   untracked entities are attached as Added before the change is published
//!
//! Marking a property modified never touches the snapshot, so running
//! detection twice without further mutation reports nothing the second time.

use crate::events::RelationshipEvent;
use crate::snapshot::{NavigationSnapshot, diff_by_identity};
use crate::state_manager::{GraphMode, StateManager, identity_conflict};
use serde::Serialize;
use sqltrack_core::{
    EntityRef, EntityState, EntryId, Error, ModelErrorKind, NavigationInfo, NavigationValue,
    PropertyBase, PropertyInfo, Result, entity_address, structural_eq,
};
use std::sync::Arc;

/// What one detection pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    /// Properties newly marked modified
    pub modified: Vec<(EntryId, &'static str)>,
    /// Key and foreign key properties whose value moved
    pub key_changes: usize,
    /// Navigations whose target or membership changed
    pub navigation_changes: usize,
    /// Entries that started tracking because a navigation reached them
    pub attached: Vec<EntryId>,
}

impl ChangeReport {
    pub fn has_changes(&self) -> bool {
        !self.modified.is_empty()
            || self.key_changes > 0
            || self.navigation_changes > 0
            || !self.attached.is_empty()
    }

    fn merge(&mut self, other: ChangeReport) {
        self.modified.extend(other.modified);
        self.key_changes += other.key_changes;
        self.navigation_changes += other.navigation_changes;
        self.attached.extend(other.attached);
    }
}

impl StateManager {
    /// Detect changes on every tracked entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<ChangeReport> {
        let mut report = ChangeReport::default();
        for id in self.entry_ids() {
            if self.entry(id).is_some() {
                report.merge(self.detect_entry_changes(id)?);
            }
        }
        tracing::debug!(
            modified = report.modified.len(),
            key_changes = report.key_changes,
            navigation_changes = report.navigation_changes,
            attached = report.attached.len(),
            "Change detection complete"
        );
        Ok(report)
    }

    /// Detect changes on one entry.
    pub fn detect_entry_changes(&mut self, id: EntryId) -> Result<ChangeReport> {
        let mut report = ChangeReport::default();
        let entry = self.try_entry(id)?;
        let state = entry.state();
        if matches!(state, EntityState::Detached | EntityState::Deleted) {
            return Ok(report);
        }
        let et = Arc::clone(entry.entity_type());

        if !et.has_change_notifications()
            && matches!(state, EntityState::Unchanged | EntityState::Modified)
        {
            let changed: Vec<&PropertyInfo> = et
                .properties()
                .iter()
                .filter(|p| p.original_value_index().is_some() && !entry.is_modified(p))
                .filter(|p| !structural_eq(&entry.current_value(p), &entry.original_value(p)))
                .collect();
            let entry = self.try_entry_mut(id)?;
            for property in changed {
                entry.set_modified(property, true);
                tracing::trace!(entry = %id, property = property.name, "Property modified");
                report.modified.push((id, property.name));
            }
        }

        for property in et
            .properties()
            .iter()
            .filter(|p| p.is_key() || p.is_foreign_key())
        {
            if self.entry(id).is_none() {
                return Ok(report);
            }
            if self.detect_key_change(id, property)? {
                report.key_changes += 1;
            }
        }

        for navigation in et.navigations() {
            if self.entry(id).is_none() {
                return Ok(report);
            }
            if self.detect_navigation_change(id, navigation, &mut report.attached)? {
                report.navigation_changes += 1;
            }
        }
        Ok(report)
    }

    /// Compare a key or foreign key property with its snapshot and, on a
    /// change, re-index the entry, refresh the snapshot and publish events.
    pub(crate) fn detect_key_change(&mut self, id: EntryId, property: &PropertyInfo) -> Result<bool> {
        let entry = self.try_entry(id)?;
        let Some(snapshot) = entry
            .relationship_snapshot()
            .and_then(|s| s.scalar(property.name))
        else {
            return Ok(false);
        };
        let current = entry.current_value(property);
        if structural_eq(snapshot, &current) {
            return Ok(false);
        }
        tracing::trace!(
            entry = %id,
            property = property.name,
            old = %snapshot,
            new = %current,
            "Key property changed"
        );

        let et = Arc::clone(entry.entity_type());
        let foreign_keys: Vec<_> = et
            .foreign_keys_containing(property.name)
            .map(|fk| {
                (
                    fk,
                    entry.snapshot_foreign_key_value(fk),
                    entry.foreign_key_value(fk),
                )
            })
            .collect();
        let keys: Vec<_> = et
            .keys_containing(property.name)
            .map(|k| (k, entry.snapshot_key_value(k), entry.key_value(k)))
            .collect();

        // Every new principal key is checked before the index changes, so a
        // conflict leaves the entry reachable under its old key.
        let mut takeovers = Vec::new();
        for (key, _, new) in &keys {
            if new.has_null() {
                continue;
            }
            match self.identity_map.resolve(et.name(), key.name, new) {
                Some(holder) if holder == id => {}
                Some(holder)
                    if self
                        .entry(holder)
                        .is_some_and(|h| h.state() == EntityState::Deleted) =>
                {
                    takeovers.push(key.name);
                }
                Some(holder) => return Err(identity_conflict(&et, key, new, holder)),
                None => {}
            }
        }

        let mut events = Vec::new();
        for (fk, old, new) in &foreign_keys {
            if !old.has_null() {
                self.identity_map
                    .remove_dependent(et.name(), fk.name, old, id);
            }
            if !new.has_null() {
                self.identity_map
                    .insert_dependent(et.name(), fk.name, new.clone(), id);
            }
            events.push(RelationshipEvent::ForeignKeyChanged {
                entry: id,
                foreign_key: fk.name,
                old: old.clone(),
                new: new.clone(),
            });
        }
        for (key, old, new) in &keys {
            if !old.has_null() {
                self.identity_map.remove(et.name(), key.name, old, id);
            }
            if !new.has_null() {
                if takeovers.contains(&key.name) {
                    if let Some(deleted) =
                        self.identity_map
                            .displace(et.name(), key.name, new.clone(), id)
                    {
                        tracing::debug!(
                            entry = %id,
                            %deleted,
                            key = key.name,
                            value = %new,
                            "Key taken over from a deleted entry"
                        );
                    }
                } else if let Err(holder) =
                    self.identity_map.insert(et.name(), key.name, new.clone(), id)
                {
                    return Err(identity_conflict(&et, key, new, holder));
                }
            }
            events.push(RelationshipEvent::PrincipalKeyChanged {
                entry: id,
                key: key.name,
                old: old.clone(),
                new: new.clone(),
            });
        }

        let entry = self.try_entry_mut(id)?;
        entry.snapshot_member(PropertyBase::Scalar(property));
        for name in foreign_keys
            .iter()
            .flat_map(|(fk, _, _)| fk.properties.iter())
            .chain(keys.iter().flat_map(|(k, _, _)| k.properties.iter()))
        {
            if let Some(member) = et.property_named(name) {
                entry.snapshot_member(PropertyBase::Scalar(member));
            }
        }

        self.publish(events)?;
        Ok(true)
    }

    /// Compare a navigation with its snapshot by reference identity.
    pub(crate) fn detect_navigation_change(
        &mut self,
        id: EntryId,
        navigation: &NavigationInfo,
        attached: &mut Vec<EntryId>,
    ) -> Result<bool> {
        let entry = self.try_entry(id)?;
        let Some(snapshot) = entry
            .relationship_snapshot()
            .and_then(|s| s.navigation(navigation.name))
            .cloned()
        else {
            return Ok(false);
        };
        let current = entry.navigation(navigation);

        let (event, added) = match (snapshot, current) {
            (NavigationSnapshot::Reference(old), NavigationValue::Reference(new)) => {
                if same_instance(old.as_ref(), new.as_ref()) {
                    return Ok(false);
                }
                let added: Vec<EntityRef> = new.iter().cloned().collect();
                let event = RelationshipEvent::NavigationReferenceChanged {
                    entry: id,
                    navigation: navigation.name,
                    old,
                    new,
                };
                (event, added)
            }
            (NavigationSnapshot::Collection(old), NavigationValue::Collection(new)) => {
                let delta = diff_by_identity(&old, &new);
                if delta.is_empty() {
                    return Ok(false);
                }
                let added = delta.added.clone();
                let event = RelationshipEvent::NavigationCollectionChanged {
                    entry: id,
                    navigation: navigation.name,
                    added: delta.added,
                    removed: delta.removed,
                };
                (event, added)
            }
            _ => {
                self.try_entry_mut(id)?
                    .snapshot_member(PropertyBase::Navigation(navigation));
                return Ok(false);
            }
        };
        tracing::trace!(entry = %id, navigation = navigation.name, "Navigation changed");

        for target in added {
            if self.entry_for(&target).is_none() {
                attached.push(self.track_graph(target, GraphMode::Add)?);
            }
        }
        self.try_entry_mut(id)?
            .snapshot_member(PropertyBase::Navigation(navigation));
        self.publish(vec![event])?;
        Ok(true)
    }

    /// Called by hosts before a property of a notifying entity changes.
    ///
    /// Lazily records the original value and relationship snapshot.
    pub fn property_changing(&mut self, id: EntryId, name: &str) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let member = et.member(name).ok_or_else(|| unknown_member(et.name(), name))?;
        let entry = self.try_entry_mut(id)?;
        match member {
            PropertyBase::Scalar(property) => {
                entry.ensure_original_value(property);
                if property.is_key() || property.is_foreign_key() {
                    entry.ensure_snapshot_member(member);
                }
            }
            PropertyBase::Navigation(_) => entry.ensure_snapshot_member(member),
        }
        Ok(())
    }

    /// Called by hosts after a property of a notifying entity changed.
    pub fn property_changed(&mut self, id: EntryId, name: &str) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let member = et.member(name).ok_or_else(|| unknown_member(et.name(), name))?;
        let entry = self.try_entry_mut(id)?;
        match member {
            PropertyBase::Scalar(property) => {
                if matches!(entry.state(), EntityState::Unchanged | EntityState::Modified)
                    && entry.set_modified(property, true)
                {
                    tracing::trace!(entry = %id, property = property.name, "Property modified");
                }
                if property.is_key() || property.is_foreign_key() {
                    self.detect_key_change(id, property)?;
                }
            }
            PropertyBase::Navigation(navigation) => {
                let mut attached = Vec::new();
                self.detect_navigation_change(id, navigation, &mut attached)?;
            }
        }
        Ok(())
    }
}

fn same_instance(a: Option<&EntityRef>, b: Option<&EntityRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => entity_address(a) == entity_address(b),
        _ => false,
    }
}

fn unknown_member(entity_type: &'static str, name: &str) -> Error {
    Error::model(
        ModelErrorKind::InvalidModel,
        Some(entity_type),
        format!("unknown property or navigation '{name}'"),
    )
}
