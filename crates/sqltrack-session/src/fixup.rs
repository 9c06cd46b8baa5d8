//! Built-in relationship fix-up.
//!
//! Keeps foreign key values consistent with navigations and principal keys.
//! Navigations themselves belong to the host and are never rewritten here.

use crate::events::RelationshipEvent;
use crate::state_manager::{StateManager, WriteKind};
use sqltrack_core::{
    DeleteBehavior, EntityRef, EntityState, EntryId, ForeignKeyInfo, KeyValue, Result, Value, structural_eq,
};
use std::sync::Arc;

impl StateManager {
    pub(crate) fn fix_up(&mut self, event: &RelationshipEvent) -> Result<()> {
        match event {
            // Navigations are host-owned, so a foreign key move needs no follow-up.
            RelationshipEvent::ForeignKeyChanged { .. } => Ok(()),
            RelationshipEvent::PrincipalKeyChanged { entry, key, old, .. } => {
                self.fix_up_principal_key(*entry, key, old)
            }
            RelationshipEvent::NavigationReferenceChanged {
                entry,
                navigation,
                old,
                new,
            } => self.fix_up_reference(*entry, navigation, old.as_ref(), new.as_ref()),
            RelationshipEvent::NavigationCollectionChanged {
                entry,
                navigation,
                added,
                removed,
            } => {
                let Some(fk) = self.navigation_foreign_key(*entry, navigation)? else {
                    return Ok(());
                };
                for item in removed {
                    if let Some(dependent) = self.entry_for(item) {
                        self.sever(dependent, fk, *entry)?;
                    }
                }
                for item in added {
                    if let Some(dependent) = self.entry_for(item) {
                        self.copy_principal_key(dependent, fk, *entry)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Copy a changed principal key into every dependent still carrying the
    /// old value.
    fn fix_up_principal_key(&mut self, principal: EntryId, key: &str, old: &KeyValue) -> Result<()> {
        if old.has_null() {
            return Ok(());
        }
        let et = Arc::clone(self.try_entry(principal)?.entity_type());
        let referencing: Vec<(&'static str, &'static str)> = self
            .model()
            .referencing_foreign_keys(et.name())
            .filter(|(_, fk)| fk.principal_key_name() == key)
            .map(|(dependent, fk)| (dependent.name(), fk.name))
            .collect();
        for (dependent_type, fk) in referencing {
            for dependent in self.dependents(dependent_type, fk, old) {
                self.copy_principal_key(dependent, fk, principal)?;
            }
        }
        Ok(())
    }

    fn fix_up_reference(
        &mut self,
        id: EntryId,
        navigation: &str,
        old: Option<&EntityRef>,
        new: Option<&EntityRef>,
    ) -> Result<()> {
        let et = Arc::clone(self.try_entry(id)?.entity_type());
        let Some(nav) = et.navigation_named(navigation) else {
            return Ok(());
        };
        let old = old.and_then(|e| self.entry_for(e));
        let new = new.and_then(|e| self.entry_for(e));

        if nav.points_to_principal {
            match (new, old) {
                (Some(principal), _) => self.copy_principal_key(id, nav.foreign_key, principal),
                (None, Some(principal)) => self.sever(id, nav.foreign_key, principal),
                (None, None) => Ok(()),
            }
        } else {
            if let Some(dependent) = old.filter(|d| Some(*d) != new) {
                self.sever(dependent, nav.foreign_key, id)?;
            }
            if let Some(dependent) = new {
                self.copy_principal_key(dependent, nav.foreign_key, id)?;
            }
            Ok(())
        }
    }

    /// Copy the principal's key into the dependent's foreign key, carrying
    /// temporary flags along.
    pub(crate) fn copy_principal_key(
        &mut self,
        dependent: EntryId,
        foreign_key: &str,
        principal: EntryId,
    ) -> Result<()> {
        let dependent_entry = self.try_entry(dependent)?;
        if dependent_entry.state() == EntityState::Deleted {
            return Ok(());
        }
        let dependent_type = Arc::clone(dependent_entry.entity_type());
        let principal_entry = self.try_entry(principal)?;
        let principal_type = Arc::clone(principal_entry.entity_type());
        let Some(fk) = dependent_type.foreign_key_named(foreign_key) else {
            return Ok(());
        };
        let Some(key) = principal_type.key_named(fk.principal_key_name()) else {
            return Ok(());
        };

        let mut writes = Vec::new();
        for (dependent_name, principal_name) in fk.properties.iter().zip(&key.properties) {
            let (Some(target), Some(source)) = (
                dependent_type.property_named(dependent_name),
                principal_type.property_named(principal_name),
            ) else {
                continue;
            };
            let value = principal_entry.current_value(source);
            let temporary = principal_entry.is_temporary(source);
            if structural_eq(&dependent_entry.current_value(target), &value)
                && dependent_entry.is_temporary(target) == temporary
            {
                continue;
            }
            writes.push((target, value, temporary));
        }

        for (target, value, temporary) in writes {
            tracing::trace!(
                dependent = %dependent,
                principal = %principal,
                property = target.name,
                value = %value,
                temporary,
                "Fixing up foreign key"
            );
            self.write_property(dependent, target, value, WriteKind::Fixup { temporary })?;
        }
        Ok(())
    }

    /// Break the link between a dependent and a principal it no longer
    /// belongs to.
    ///
    /// If another tracked principal now claims the dependent, its key is
    /// copied instead. Otherwise an optional foreign key is nulled and a
    /// required one with cascade semantics deletes the orphan.
    fn sever(&mut self, dependent: EntryId, foreign_key: &str, principal: EntryId) -> Result<()> {
        let Some(dependent_entry) = self.entry(dependent) else {
            return Ok(());
        };
        if dependent_entry.state() == EntityState::Deleted {
            return Ok(());
        }
        let dependent_type = Arc::clone(dependent_entry.entity_type());
        let Some(fk) = dependent_type.foreign_key_named(foreign_key) else {
            return Ok(());
        };
        let principal_entry = self.try_entry(principal)?;
        let Some(key) = principal_entry
            .entity_type()
            .key_named(fk.principal_key_name())
        else {
            return Ok(());
        };
        if dependent_entry.foreign_key_value(fk) != principal_entry.key_value(key) {
            return Ok(());
        }

        if let Some(other) = self.find_principal(dependent, fk).filter(|p| *p != principal) {
            return self.copy_principal_key(dependent, foreign_key, other);
        }
        if !fk.is_required() {
            for name in &fk.properties {
                if let Some(property) = dependent_type.property_named(name) {
                    self.write_property(
                        dependent,
                        property,
                        Value::Null,
                        WriteKind::Fixup { temporary: false },
                    )?;
                }
            }
        } else if fk.delete_behavior == DeleteBehavior::Cascade {
            tracing::debug!(entry = %dependent, foreign_key, "Deleting orphan");
            self.remove_entry(dependent)?;
        }
        Ok(())
    }

    /// Find the tracked principal of a dependent through navigations: the
    /// dependent's own reference first, then any principal whose inverse
    /// navigation contains it.
    pub(crate) fn find_principal(&self, dependent: EntryId, fk: &ForeignKeyInfo) -> Option<EntryId> {
        let entry = self.entry(dependent)?;
        if let Some(nav) = fk
            .dependent_to_principal
            .and_then(|name| entry.entity_type().navigation_named(name))
        {
            if let Some(principal) = entry
                .navigation(nav)
                .entities()
                .first()
                .and_then(|p| self.entry_for(p))
            {
                return Some(principal);
            }
        }

        let inverse = fk.principal_to_dependent?;
        let entity = entry.entity()?;
        self.entries()
            .filter(|candidate| {
                candidate.entity_type().name() == fk.principal_type
                    && candidate.state() != EntityState::Deleted
            })
            .find(|candidate| {
                candidate
                    .entity_type()
                    .navigation_named(inverse)
                    .is_some_and(|nav| candidate.navigation(nav).contains(entity))
            })
            .map(|candidate| candidate.id())
    }

    /// Fix-up run once when an entry starts tracking, in both directions.
    pub(crate) fn initial_fixup(&mut self, id: EntryId) -> Result<()> {
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };
        let et = Arc::clone(entry.entity_type());

        for fk in et.foreign_keys() {
            if let Some(principal) = self.find_principal(id, fk) {
                self.copy_principal_key(id, fk.name, principal)?;
            }
        }

        for nav in et.navigations().iter().filter(|n| !n.points_to_principal) {
            let Some(entry) = self.entry(id) else {
                return Ok(());
            };
            for item in entry.navigation(nav).entities() {
                if let Some(dependent) = self.entry_for(&item) {
                    self.copy_principal_key(dependent, nav.foreign_key, id)?;
                }
            }
        }
        Ok(())
    }

    fn navigation_foreign_key(&self, id: EntryId, navigation: &str) -> Result<Option<&'static str>> {
        let entry = self.try_entry(id)?;
        Ok(entry
            .entity_type()
            .navigation_named(navigation)
            .map(|n| n.foreign_key))
    }
}
