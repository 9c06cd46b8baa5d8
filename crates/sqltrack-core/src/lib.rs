//! Core types and traits for sqltrack.
//!
//! This crate provides the foundations shared by the tracking and update
//! pipelines:
//!
//! - `Value` and `KeyValue` for dynamically typed, structurally compared data
//! - `Entity` and `EntityRef` for access to caller-owned domain objects
//! - `EntityType` / `Model` read-only metadata
//! - `StoreConnection` and `ResultCursor` for batched round trips
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod entity;
pub mod error;
pub mod key;
pub mod metadata;
pub mod row;
pub mod store;
pub mod value;

pub use entity::{
    DynamicEntity, Entity, EntityRef, EntityState, EntryId, NavigationValue, entity_address,
    entity_ref, read_entity, write_entity,
};
pub use error::{
    ConcurrencyError, ConnectionError, ConnectionErrorKind, Error, ModelError, ModelErrorKind,
    ProtocolError, QueryError, QueryErrorKind, Result, StoreUpdateError, TypeError,
};
pub use key::{KeyValue, structural_eq};
pub use metadata::{
    ChangeTrackingStrategy, DeleteBehavior, EntityType, ForeignKeyInfo, KeyInfo, Model,
    ModelBuilder, NavigationInfo, PropertyBase, PropertyInfo, ValueGenerated,
};
pub use row::{FromValue, Row};
pub use store::{
    Blocking, BlockingCursor, IsolationLevel, ResultCursor, Statement, StoreConnection,
    SyncResultCursor, SyncStoreConnection, complete_now,
};
pub use value::Value;
