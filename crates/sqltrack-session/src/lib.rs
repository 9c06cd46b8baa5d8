//! Change tracking for sqltrack.
//!
//! `sqltrack-session` is the **tracking layer**. It keeps one
//! [`TrackedEntry`] per live entity, detects what changed since the last
//! synchronization point and keeps keys and relationships consistent while
//! values move.
//!
//! # Role In The Architecture
//!
//! - **State manager**: arena of tracked entries addressed by `EntryId`.
//! - **Identity map**: key values to entries, re-keyed on every key change.
//! - **Change detection**: snapshot diffing plus notification entry points.
//! - **Fix-up**: foreign keys follow navigations and principal keys.
//! - **Value generation**: temporary and client-generated values for Added entries.
//!
//! # Example
//!
//! ```ignore
//! let mut tracker = StateManager::new(Arc::new(model));
//! let hero = tracker.attach(hero_ref.clone())?;
//!
//! write_entity(&hero_ref).set_value("name", "Spider-Man".into());
//! let report = tracker.detect_changes()?;
//! assert_eq!(report.modified, [(hero, "name")]);
//! ```

pub mod change_detector;
pub mod entry;
pub mod events;
mod fixup;
pub mod identity_map;
pub mod snapshot;
pub mod state_manager;
pub mod value_generation;

pub use change_detector::ChangeReport;
pub use entry::{EntityData, TrackedEntry};
pub use events::{RelationshipEvent, RelationshipListener};
pub use identity_map::IdentityMap;
pub use snapshot::{
    CollectionDelta, NavigationSnapshot, OriginalValues, ReferenceSet, RelationshipSnapshot,
    diff_by_identity,
};
pub use state_manager::StateManager;
pub use value_generation::{
    SequenceValueGenerator, TemporaryValueGenerator, ValueGenerationManager, ValueGenerator,
};
