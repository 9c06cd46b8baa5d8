//! Column-level changes of one command.

use sqltrack_core::{EntityState, EntryId, PropertyInfo, Result, Value};
use sqltrack_session::{StateManager, TrackedEntry};

/// What a command does with one column of its row.
///
/// A column is written, read back after the write, used as a predicate,
/// or some combination of the three. When several entries share a row
/// (table splitting) every entry mapping the column is a target, and a
/// read-back value is written to all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    column_name: &'static str,
    targets: Vec<(EntryId, &'static str)>,
    value: Value,
    original_value: Value,
    temporary: bool,
    is_read: bool,
    is_write: bool,
    is_condition: bool,
    is_key: bool,
    is_concurrency_token: bool,
}

impl ColumnModification {
    /// Column flags for one property of an entry in `state`.
    ///
    /// Returns `None` when the column takes no part in the command.
    pub fn for_property(
        entry: &TrackedEntry,
        property: &PropertyInfo,
        state: EntityState,
    ) -> Option<Self> {
        let value = entry.current_value(property);
        let temporary = entry.is_temporary(property);
        let is_key = property.is_primary_key();
        let is_concurrency_token = property.concurrency_token;

        let (is_read, is_write, is_condition) = match state {
            EntityState::Added => {
                let read = property.is_store_generated_on_add()
                    && (temporary || property.is_default(&value));
                (read, !read, false)
            }
            EntityState::Modified => {
                let write = entry.is_modified(property);
                let read = property.is_store_generated_on_update() && !write;
                (read, write, is_key || is_concurrency_token)
            }
            EntityState::Deleted => (false, false, is_key || is_concurrency_token),
            EntityState::Unchanged | EntityState::Detached => return None,
        };
        if !(is_read || is_write || is_condition) {
            return None;
        }

        Some(Self {
            column_name: property.column_name,
            targets: vec![(entry.id(), property.name)],
            original_value: entry.original_value(property),
            value,
            temporary,
            is_read,
            is_write,
            is_condition,
            is_key,
            is_concurrency_token,
        })
    }

    pub fn column_name(&self) -> &'static str {
        self.column_name
    }

    /// The entry this column was first built from.
    pub fn entry(&self) -> EntryId {
        self.targets[0].0
    }

    /// Property name on [`entry`](Self::entry).
    pub fn property(&self) -> &'static str {
        self.targets[0].1
    }

    /// Every `(entry, property)` pair mapped to this column.
    pub fn targets(&self) -> &[(EntryId, &'static str)] {
        &self.targets
    }

    /// Value to write.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Value the predicate compares against.
    pub fn original_value(&self) -> &Value {
        &self.original_value
    }

    /// Whether the value is a placeholder the store has not replaced yet.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_read(&self) -> bool {
        self.is_read
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn is_condition(&self) -> bool {
        self.is_condition
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn is_concurrency_token(&self) -> bool {
        self.is_concurrency_token
    }

    /// Write a value read back from the store into every target.
    pub fn set_value(&self, state_manager: &mut StateManager, value: Value) -> Result<()> {
        for (entry, property) in &self.targets {
            tracing::trace!(
                entry = %entry,
                property,
                column = self.column_name,
                value = %value,
                "Propagating store value"
            );
            state_manager.set_store_value(*entry, property, value.clone())?;
        }
        Ok(())
    }

    /// Fold the same column of another entry of the row into this one.
    ///
    /// A column read back for any entry is read for all of them and never
    /// written.
    pub(crate) fn merge(&mut self, other: ColumnModification) {
        if other.is_write && (!self.is_write || self.temporary) {
            self.value = other.value;
            self.temporary = other.temporary;
        }
        if other.is_condition && !self.is_condition {
            self.original_value = other.original_value;
        }
        self.is_read |= other.is_read;
        self.is_write = (self.is_write || other.is_write) && !self.is_read;
        self.is_condition |= other.is_condition;
        self.is_key |= other.is_key;
        self.is_concurrency_token |= other.is_concurrency_token;
        self.targets.extend(other.targets);
    }
}
