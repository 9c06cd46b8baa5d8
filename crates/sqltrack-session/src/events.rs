//! Relationship change notifications.

use sqltrack_core::{EntityRef, EntryId, KeyValue, entity_address};
use std::fmt;

/// A key or navigation change observed on a tracked entry.
///
/// Events are delivered to registered listeners first and then to the
/// built-in fix-up, in the order they were detected.
#[derive(Clone)]
pub enum RelationshipEvent {
    /// A dependent's foreign key value changed.
    ForeignKeyChanged {
        entry: EntryId,
        foreign_key: &'static str,
        old: KeyValue,
        new: KeyValue,
    },
    /// A principal or alternate key value changed.
    PrincipalKeyChanged {
        entry: EntryId,
        key: &'static str,
        old: KeyValue,
        new: KeyValue,
    },
    /// A reference navigation now points somewhere else.
    NavigationReferenceChanged {
        entry: EntryId,
        navigation: &'static str,
        old: Option<EntityRef>,
        new: Option<EntityRef>,
    },
    /// Items were added to or removed from a collection navigation.
    NavigationCollectionChanged {
        entry: EntryId,
        navigation: &'static str,
        added: Vec<EntityRef>,
        removed: Vec<EntityRef>,
    },
}

impl RelationshipEvent {
    /// Entry the change was observed on.
    pub fn entry(&self) -> EntryId {
        match self {
            RelationshipEvent::ForeignKeyChanged { entry, .. }
            | RelationshipEvent::PrincipalKeyChanged { entry, .. }
            | RelationshipEvent::NavigationReferenceChanged { entry, .. }
            | RelationshipEvent::NavigationCollectionChanged { entry, .. } => *entry,
        }
    }
}

fn addresses(items: &[EntityRef]) -> Vec<String> {
    items
        .iter()
        .map(|e| format!("{:#x}", entity_address(e)))
        .collect()
}

fn address(item: Option<&EntityRef>) -> Option<String> {
    item.map(|e| format!("{:#x}", entity_address(e)))
}

impl fmt::Debug for RelationshipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationshipEvent::ForeignKeyChanged {
                entry,
                foreign_key,
                old,
                new,
            } => f
                .debug_struct("ForeignKeyChanged")
                .field("entry", entry)
                .field("foreign_key", foreign_key)
                .field("old", old)
                .field("new", new)
                .finish(),
            RelationshipEvent::PrincipalKeyChanged {
                entry,
                key,
                old,
                new,
            } => f
                .debug_struct("PrincipalKeyChanged")
                .field("entry", entry)
                .field("key", key)
                .field("old", old)
                .field("new", new)
                .finish(),
            RelationshipEvent::NavigationReferenceChanged {
                entry,
                navigation,
                old,
                new,
            } => f
                .debug_struct("NavigationReferenceChanged")
                .field("entry", entry)
                .field("navigation", navigation)
                .field("old", &address(old.as_ref()))
                .field("new", &address(new.as_ref()))
                .finish(),
            RelationshipEvent::NavigationCollectionChanged {
                entry,
                navigation,
                added,
                removed,
            } => f
                .debug_struct("NavigationCollectionChanged")
                .field("entry", entry)
                .field("navigation", navigation)
                .field("added", &addresses(added))
                .field("removed", &addresses(removed))
                .finish(),
        }
    }
}

/// Callback observing relationship events.
pub type RelationshipListener = Box<dyn FnMut(&RelationshipEvent) + Send>;
