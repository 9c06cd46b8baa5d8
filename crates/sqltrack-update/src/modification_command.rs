//! One INSERT, UPDATE or DELETE of a single row.

use crate::column_modification::ColumnModification;
use sqltrack_core::{EntityState, EntryId, Error, ModelErrorKind, Result, Row};
use sqltrack_session::{StateManager, TrackedEntry};

/// The column-level changes for one physical row.
///
/// Usually built from a single entry. Entries of different types mapped to
/// the same table and key (table splitting) contribute to one command; their
/// columns are merged by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationCommand {
    table: &'static str,
    schema: Option<&'static str>,
    state: EntityState,
    entries: Vec<EntryId>,
    columns: Vec<ColumnModification>,
}

impl ModificationCommand {
    /// Empty command for a row of `table` in `state`.
    pub fn new(table: &'static str, schema: Option<&'static str>, state: EntityState) -> Self {
        Self {
            table,
            schema,
            state,
            entries: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Build the command for the entries sharing one row.
    pub fn from_entries(state_manager: &StateManager, ids: &[EntryId]) -> Result<Self> {
        let mut command: Option<Self> = None;
        for id in ids {
            let entry = state_manager.try_entry(*id)?;
            let command = command.get_or_insert_with(|| {
                let et = entry.entity_type();
                Self::new(et.table_name(), et.schema_name(), entry.state())
            });
            command.add_entry(entry)?;
        }
        command.ok_or_else(|| {
            Error::model(
                ModelErrorKind::InvalidModel,
                None,
                "a modification command needs at least one entry",
            )
        })
    }

    /// Add an entry's columns to this command.
    pub fn add_entry(&mut self, entry: &TrackedEntry) -> Result<()> {
        let et = entry.entity_type();
        if et.table_name() != self.table || et.schema_name() != self.schema {
            return Err(Error::model(
                ModelErrorKind::InvalidModel,
                Some(et.name()),
                format!(
                    "entry {} maps to table '{}', not '{}'",
                    entry.id(),
                    et.table_name(),
                    self.table
                ),
            ));
        }
        if entry.state() != self.state {
            return Err(Error::model(
                ModelErrorKind::ConflictingRowState,
                Some(et.name()),
                format!(
                    "entry {} is {} but shares a row of '{}' with {} entries",
                    entry.id(),
                    entry.state(),
                    self.table,
                    self.state
                ),
            ));
        }

        for property in et.properties() {
            let Some(column) = ColumnModification::for_property(entry, property, self.state) else {
                continue;
            };
            match self
                .columns
                .iter_mut()
                .find(|c| c.column_name() == column.column_name())
            {
                Some(existing) => existing.merge(column),
                None => self.columns.push(column),
            }
        }
        self.entries.push(entry.id());
        Ok(())
    }

    pub fn table_name(&self) -> &'static str {
        self.table
    }

    pub fn schema(&self) -> Option<&'static str> {
        self.schema
    }

    /// Added, Modified or Deleted.
    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    pub fn columns(&self) -> &[ColumnModification] {
        &self.columns
    }

    pub fn write_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_write())
    }

    pub fn read_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_read())
    }

    pub fn condition_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_condition())
    }

    /// Whether the store returns a row for this command.
    pub fn requires_result_propagation(&self) -> bool {
        self.columns.iter().any(ColumnModification::is_read)
    }

    /// Whether executing the command changes anything.
    ///
    /// An update with nothing to write is skipped.
    pub fn has_work(&self) -> bool {
        match self.state {
            EntityState::Modified => self.write_columns().next().is_some(),
            EntityState::Added | EntityState::Deleted => true,
            EntityState::Unchanged | EntityState::Detached => false,
        }
    }

    /// First written or compared column still holding a temporary value.
    ///
    /// Such a value belongs to another row that has not been saved yet.
    pub fn pending_value(&self) -> Option<&ColumnModification> {
        self.columns
            .iter()
            .find(|c| c.is_temporary() && (c.is_write() || c.is_condition()))
    }

    /// Map a returned row onto the read columns, positionally.
    #[tracing::instrument(level = "trace", skip(self, state_manager, row), fields(table = self.table))]
    pub fn propagate_results(&self, state_manager: &mut StateManager, row: &Row) -> Result<()> {
        for (position, column) in self.read_columns().enumerate() {
            let value = row.get(position).ok_or_else(|| {
                Error::protocol(format!(
                    "result row for '{}' has {} columns, expected {}",
                    self.table,
                    row.len(),
                    self.read_columns().count()
                ))
            })?;
            column.set_value(state_manager, value.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::{DynamicEntity, EntityType, Model, PropertyInfo, Value, ValueGenerated};
    use std::sync::Arc;

    fn model() -> Arc<Model> {
        let hero = EntityType::new("Hero")
            .table("heroes")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .property(PropertyInfo::new("version").concurrency_token())
            .property(PropertyInfo::new("updated_at").generated(ValueGenerated::OnAddOrUpdate))
            .primary_key(&["id"]);
        let profile = EntityType::new("HeroProfile")
            .table("heroes")
            .property(PropertyInfo::new("id").default_value(0_i64))
            .property(PropertyInfo::new("bio").column("biography"))
            .primary_key(&["id"]);
        let villain = EntityType::new("Villain")
            .property(PropertyInfo::new("id"))
            .primary_key(&["id"]);
        Arc::new(
            Model::builder()
                .entity(hero)
                .entity(profile)
                .entity(villain)
                .build()
                .unwrap(),
        )
    }

    fn hero(id: i64, name: &str) -> sqltrack_core::EntityRef {
        DynamicEntity::new("Hero")
            .with("id", id)
            .with("name", name)
            .with("version", 1_i64)
            .into_ref()
    }

    fn flags(command: &ModificationCommand, column: &str) -> (bool, bool, bool) {
        let c = command
            .columns()
            .iter()
            .find(|c| c.column_name() == column)
            .unwrap();
        (c.is_read(), c.is_write(), c.is_condition())
    }

    #[test]
    fn insert_reads_back_generated_columns() {
        let mut sm = StateManager::new(model());
        let id = sm.add(hero(0, "Deadpond")).unwrap();
        let command = ModificationCommand::from_entries(&sm, &[id]).unwrap();

        assert_eq!(command.state(), EntityState::Added);
        assert_eq!(flags(&command, "id"), (true, false, false));
        assert_eq!(flags(&command, "name"), (false, true, false));
        assert_eq!(flags(&command, "updated_at"), (true, false, false));
        assert!(command.requires_result_propagation());
        assert!(command.pending_value().is_none());
    }

    #[test]
    fn update_writes_changes_and_checks_tokens() {
        let mut sm = StateManager::new(model());
        let id = sm.attach(hero(1, "Deadpond")).unwrap();
        sm.set_property_value(id, "name", "Rusty-Man").unwrap();
        sm.set_property_value(id, "version", 2_i64).unwrap();
        let command = ModificationCommand::from_entries(&sm, &[id]).unwrap();

        assert_eq!(flags(&command, "id"), (false, false, true));
        assert_eq!(flags(&command, "name"), (false, true, false));
        assert_eq!(flags(&command, "version"), (false, true, true));
        assert_eq!(flags(&command, "updated_at"), (true, false, false));
        let version = command
            .condition_columns()
            .find(|c| c.is_concurrency_token())
            .unwrap();
        assert_eq!(version.original_value(), &Value::BigInt(1));
        assert_eq!(version.value(), &Value::BigInt(2));
    }

    #[test]
    fn delete_only_compares() {
        let mut sm = StateManager::new(model());
        let entity = hero(1, "Deadpond");
        let id = sm.attach(Arc::clone(&entity)).unwrap();
        sm.remove(&entity).unwrap();
        let command = ModificationCommand::from_entries(&sm, &[id]).unwrap();

        assert_eq!(command.write_columns().count(), 0);
        assert_eq!(command.read_columns().count(), 0);
        assert_eq!(command.condition_columns().count(), 2);
        assert!(command.has_work());
    }

    #[test]
    fn update_without_writes_has_no_work() {
        let mut sm = StateManager::new(model());
        let id = sm
            .track_shadow("Villain", &[("id", Value::BigInt(3))], EntityState::Modified)
            .unwrap();
        let command = ModificationCommand::from_entries(&sm, &[id]).unwrap();

        assert_eq!(command.condition_columns().count(), 1);
        assert!(!command.has_work());
    }

    #[test]
    fn table_splitting_merges_columns_and_targets() {
        let mut sm = StateManager::new(model());
        let hero_id = sm.add(hero(0, "Deadpond")).unwrap();
        let profile_id = sm
            .add_shadow("HeroProfile", &[("id", Value::BigInt(0)), ("bio", "x".into())])
            .unwrap();
        let command = ModificationCommand::from_entries(&sm, &[hero_id, profile_id]).unwrap();

        assert_eq!(command.entries(), [hero_id, profile_id]);
        let id = command.columns().iter().find(|c| c.is_key()).unwrap();
        assert!(id.is_read());
        assert!(!id.is_write());
        assert_eq!(id.targets(), [(hero_id, "id"), (profile_id, "id")]);
        assert_eq!(flags(&command, "biography"), (false, true, false));
    }

    #[test]
    fn conflicting_row_states_are_rejected() {
        let mut sm = StateManager::new(model());
        let hero_id = sm.attach(hero(7, "Deadpond")).unwrap();
        sm.set_property_value(hero_id, "name", "Rusty-Man").unwrap();
        let profile_id = sm
            .add_shadow("HeroProfile", &[("id", Value::BigInt(7))])
            .unwrap();

        let err = ModificationCommand::from_entries(&sm, &[hero_id, profile_id]).unwrap_err();
        assert!(matches!(
            err,
            Error::Model(ref e) if e.kind == ModelErrorKind::ConflictingRowState
        ));
    }

    #[test]
    fn other_tables_are_rejected() {
        let mut sm = StateManager::new(model());
        let hero_id = sm.add(hero(0, "Deadpond")).unwrap();
        let villain_id = sm.add_shadow("Villain", &[("id", Value::BigInt(1))]).unwrap();
        let err = ModificationCommand::from_entries(&sm, &[hero_id, villain_id]).unwrap_err();
        assert!(matches!(
            err,
            Error::Model(ref e) if e.kind == ModelErrorKind::InvalidModel
        ));
    }

    #[test]
    fn propagation_fans_out_to_every_target() {
        let mut sm = StateManager::new(model());
        let hero_id = sm.add(hero(0, "Deadpond")).unwrap();
        let profile_id = sm
            .add_shadow("HeroProfile", &[("id", Value::BigInt(0))])
            .unwrap();
        let command = ModificationCommand::from_entries(&sm, &[hero_id, profile_id]).unwrap();

        let row = Row::from_values(vec![Value::BigInt(42), Value::Text("now".into())]);
        command.propagate_results(&mut sm, &row).unwrap();

        assert_eq!(sm.try_entry(hero_id).unwrap().value("id"), Some(Value::BigInt(42)));
        assert_eq!(sm.try_entry(profile_id).unwrap().value("id"), Some(Value::BigInt(42)));
        assert_eq!(
            sm.try_entry(hero_id).unwrap().value("updated_at"),
            Some(Value::Text("now".into()))
        );
        assert!(!sm.try_entry(hero_id).unwrap().has_temporary_values());
    }

    #[test]
    fn short_result_rows_are_protocol_errors() {
        let mut sm = StateManager::new(model());
        let id = sm.add(hero(0, "Deadpond")).unwrap();
        let command = ModificationCommand::from_entries(&sm, &[id]).unwrap();
        let err = command
            .propagate_results(&mut sm, &Row::from_values(vec![Value::BigInt(1)]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
