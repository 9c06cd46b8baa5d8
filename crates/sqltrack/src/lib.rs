//! sqltrack - change tracking and batched persistence for tracked entities.
//!
//! sqltrack keeps a unit of work over caller-owned entities and writes their
//! changes back to a relational store:
//!
//! - Snapshot and notification based change detection
//! - An identity map kept consistent across key changes
//! - Relationship fix-up between navigations and foreign keys
//! - Temporary and client-generated key values
//! - Dependency-ordered, batched INSERT/UPDATE/DELETE round trips
//! - Optimistic concurrency through rows-affected checks
//!
//! # Quick Start
//!
//! ```ignore
//! use sqltrack::prelude::*;
//! use std::sync::Arc;
//!
//! let hero = EntityType::new("Hero")
//!     .property(PropertyInfo::new("id").default_value(0_i64).generated(ValueGenerated::OnAdd))
//!     .property(PropertyInfo::new("name"))
//!     .primary_key(&["id"]);
//! let model = Arc::new(Model::builder().entity(hero).build()?);
//!
//! async fn save(cx: &Cx, conn: impl StoreConnection, model: Arc<Model>) {
//!     let mut session = Session::new(conn, model);
//!
//!     let deadpond = DynamicEntity::new("Hero").with("name", "Deadpond").into_ref();
//!     session.add(deadpond.clone()).unwrap();
//!
//!     // The generated key is read back into the entity.
//!     let rows = session.save_changes(cx).await;
//!     assert!(matches!(rows, Outcome::Ok(1)));
//!     assert_eq!(session.state_of(&deadpond), EntityState::Unchanged);
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct saves
//! - **Batching**: Commands share round trips up to the store's limit
//! - **Pluggable SQL**: Any [`UpdateSqlGenerator`]; [`DialectSqlGenerator`] ships for
//!   PostgreSQL, SQLite and MySQL
//! - **Blocking stores**: [`Blocking`] adapts a synchronous driver

pub mod session;

pub use session::{Session, SessionConfig};

pub use sqltrack_core::{
    // asupersync re-exports
    Budget,
    Cx,
    Outcome,
    RegionId,
    TaskId,
    // Metadata
    ChangeTrackingStrategy,
    DeleteBehavior,
    EntityType,
    ForeignKeyInfo,
    KeyInfo,
    Model,
    ModelBuilder,
    NavigationInfo,
    PropertyInfo,
    ValueGenerated,
    // Entities
    DynamicEntity,
    Entity,
    EntityRef,
    EntityState,
    EntryId,
    NavigationValue,
    entity_ref,
    read_entity,
    write_entity,
    // Values
    KeyValue,
    Row,
    Value,
    // Storage
    Blocking,
    IsolationLevel,
    ResultCursor,
    Statement,
    StoreConnection,
    SyncResultCursor,
    SyncStoreConnection,
    // Errors
    ConcurrencyError,
    Error,
    ModelError,
    ModelErrorKind,
    Result,
    StoreUpdateError,
};

pub use sqltrack_session::{
    ChangeReport, RelationshipEvent, SequenceValueGenerator, StateManager,
    TemporaryValueGenerator, TrackedEntry, ValueGenerator,
};

pub use sqltrack_update::{
    BatchExecutor, CommandBatchPreparer, DEFAULT_MAX_BATCH_SIZE, Dialect, DialectSqlGenerator,
    ModificationCommand, ModificationCommandBatch, UpdateSqlGenerator,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Blocking, ConcurrencyError, Cx, DeleteBehavior, Dialect, DynamicEntity, Entity,
        EntityRef, EntityState, EntityType, EntryId, Error, Model, NavigationInfo, Outcome,
        PropertyInfo, Result, Session, SessionConfig, StoreConnection, SyncStoreConnection,
        Value, ValueGenerated, read_entity, write_entity,
    };
}
