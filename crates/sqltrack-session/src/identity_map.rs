//! Key-to-entry lookup.
//!
//! Principal keys (primary and alternate) map to at most one entry per
//! entity type. Foreign key values map to the set of dependent entries that
//! currently carry them.

use sqltrack_core::{EntryId, KeyValue};
use std::collections::{BTreeSet, HashMap};

/// One principal key of one entity type.
///
/// A value can be taken over from a Deleted entry while a save is in
/// flight. The Deleted entry is parked in `displaced` and gets the value
/// back if the new holder lets go of it before the delete is accepted.
#[derive(Debug, Default)]
struct KeyIndex {
    holders: HashMap<KeyValue, EntryId>,
    displaced: HashMap<KeyValue, EntryId>,
}

type ByKey<T> = HashMap<&'static str, HashMap<&'static str, T>>;

/// Identity map for tracked entries.
#[derive(Debug, Default)]
pub struct IdentityMap {
    principals: ByKey<KeyIndex>,
    dependents: ByKey<HashMap<KeyValue, BTreeSet<EntryId>>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the entry holding `value` for the given key.
    pub fn resolve(&self, entity_type: &str, key: &str, value: &KeyValue) -> Option<EntryId> {
        self.principals
            .get(entity_type)
            .and_then(|keys| keys.get(key))
            .and_then(|index| index.holders.get(value).copied())
    }

    /// Map `value` to `entry`.
    ///
    /// Re-inserting the same entry is a no-op. If another entry already holds
    /// the value, nothing changes and that entry is returned as the error.
    pub fn insert(
        &mut self,
        entity_type: &'static str,
        key: &'static str,
        value: KeyValue,
        entry: EntryId,
    ) -> Result<(), EntryId> {
        let index = self.key_index_mut(entity_type, key);
        match index.holders.get(&value) {
            Some(existing) if *existing != entry => Err(*existing),
            Some(_) => Ok(()),
            None => {
                index.holders.insert(value, entry);
                Ok(())
            }
        }
    }

    /// Map `value` to `entry`, parking the current holder until `entry`
    /// releases the value again. Returns the parked holder.
    pub fn displace(
        &mut self,
        entity_type: &'static str,
        key: &'static str,
        value: KeyValue,
        entry: EntryId,
    ) -> Option<EntryId> {
        let index = self.key_index_mut(entity_type, key);
        let previous = index.holders.insert(value.clone(), entry)?;
        if previous == entry {
            return None;
        }
        index.displaced.insert(value, previous);
        Some(previous)
    }

    /// Remove the mapping for `value`, but only if it points at `entry`.
    ///
    /// A holder parked by [`displace`](Self::displace) is reinstated.
    pub fn remove(
        &mut self,
        entity_type: &'static str,
        key: &'static str,
        value: &KeyValue,
        entry: EntryId,
    ) -> bool {
        let Some(index) = self
            .principals
            .get_mut(entity_type)
            .and_then(|keys| keys.get_mut(key))
        else {
            return false;
        };
        if index.holders.get(value) == Some(&entry) {
            index.holders.remove(value);
            if let Some(parked) = index.displaced.remove(value) {
                index.holders.insert(value.clone(), parked);
            }
            true
        } else if index.displaced.get(value) == Some(&entry) {
            index.displaced.remove(value);
            true
        } else {
            false
        }
    }

    fn key_index_mut(&mut self, entity_type: &'static str, key: &'static str) -> &mut KeyIndex {
        self.principals
            .entry(entity_type)
            .or_default()
            .entry(key)
            .or_default()
    }

    /// Entries whose foreign key currently equals `value`, in id order.
    pub fn dependents(
        &self,
        entity_type: &str,
        foreign_key: &str,
        value: &KeyValue,
    ) -> Vec<EntryId> {
        self.dependents
            .get(entity_type)
            .and_then(|fks| fks.get(foreign_key))
            .and_then(|map| map.get(value))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn insert_dependent(
        &mut self,
        entity_type: &'static str,
        foreign_key: &'static str,
        value: KeyValue,
        entry: EntryId,
    ) {
        self.dependents
            .entry(entity_type)
            .or_default()
            .entry(foreign_key)
            .or_default()
            .entry(value)
            .or_default()
            .insert(entry);
    }

    pub fn remove_dependent(
        &mut self,
        entity_type: &'static str,
        foreign_key: &'static str,
        value: &KeyValue,
        entry: EntryId,
    ) {
        let Some(map) = self
            .dependents
            .get_mut(entity_type)
            .and_then(|fks| fks.get_mut(foreign_key))
        else {
            return;
        };
        if let Some(set) = map.get_mut(value) {
            set.remove(&entry);
            if set.is_empty() {
                map.remove(value);
            }
        }
    }

    /// Number of principal key mappings across all keys.
    pub fn len(&self) -> usize {
        self.principals
            .values()
            .flat_map(HashMap::values)
            .map(|index| index.holders.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.principals.clear();
        self.dependents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::Value;

    fn key(v: i64) -> KeyValue {
        KeyValue::single(Value::BigInt(v))
    }

    #[test]
    fn insert_and_resolve() {
        let mut map = IdentityMap::new();
        map.insert("Hero", "PK", key(1), EntryId::new(0)).unwrap();

        assert_eq!(map.resolve("Hero", "PK", &key(1)), Some(EntryId::new(0)));
        assert_eq!(map.resolve("Hero", "PK", &key(2)), None);
        assert_eq!(map.resolve("Team", "PK", &key(1)), None);
    }

    #[test]
    fn conflicting_insert_reports_holder() {
        let mut map = IdentityMap::new();
        map.insert("Hero", "PK", key(1), EntryId::new(0)).unwrap();
        assert!(map.insert("Hero", "PK", key(1), EntryId::new(0)).is_ok());
        assert_eq!(
            map.insert("Hero", "PK", key(1), EntryId::new(5)),
            Err(EntryId::new(0))
        );
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_only_own_mapping() {
        let mut map = IdentityMap::new();
        map.insert("Hero", "PK", key(1), EntryId::new(0)).unwrap();
        assert!(!map.remove("Hero", "PK", &key(1), EntryId::new(9)));
        assert!(map.remove("Hero", "PK", &key(1), EntryId::new(0)));
        assert!(map.is_empty());
    }

    #[test]
    fn dependents_are_ordered_sets() {
        let mut map = IdentityMap::new();
        map.insert_dependent("Hero", "FK", key(1), EntryId::new(4));
        map.insert_dependent("Hero", "FK", key(1), EntryId::new(2));
        map.insert_dependent("Hero", "FK", key(1), EntryId::new(4));

        assert_eq!(
            map.dependents("Hero", "FK", &key(1)),
            [EntryId::new(2), EntryId::new(4)]
        );
        map.remove_dependent("Hero", "FK", &key(1), EntryId::new(2));
        map.remove_dependent("Hero", "FK", &key(1), EntryId::new(4));
        assert!(map.dependents("Hero", "FK", &key(1)).is_empty());
    }

    #[test]
    fn displaced_holder_comes_back_when_released() {
        let mut map = IdentityMap::new();
        map.insert("Hero", "PK", key(42), EntryId::new(0)).unwrap();

        assert_eq!(
            map.displace("Hero", "PK", key(42), EntryId::new(1)),
            Some(EntryId::new(0))
        );
        assert_eq!(map.resolve("Hero", "PK", &key(42)), Some(EntryId::new(1)));
        assert_eq!(map.len(), 1);

        assert!(map.remove("Hero", "PK", &key(42), EntryId::new(1)));
        assert_eq!(map.resolve("Hero", "PK", &key(42)), Some(EntryId::new(0)));
    }

    #[test]
    fn displaced_holder_can_leave_first() {
        let mut map = IdentityMap::new();
        map.insert("Hero", "PK", key(42), EntryId::new(0)).unwrap();
        map.displace("Hero", "PK", key(42), EntryId::new(1));

        assert!(map.remove("Hero", "PK", &key(42), EntryId::new(0)));
        assert_eq!(map.resolve("Hero", "PK", &key(42)), Some(EntryId::new(1)));
        assert!(map.remove("Hero", "PK", &key(42), EntryId::new(1)));
        assert!(map.is_empty());
    }
}
