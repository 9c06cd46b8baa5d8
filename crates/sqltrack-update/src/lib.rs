//! Persisting tracked changes for sqltrack.
//!
//! `sqltrack-update` turns the pending entries of a
//! [`StateManager`](sqltrack_session::StateManager) into store round trips.
//!
//! # Pipeline
//!
//! 1. [`CommandBatchPreparer`] groups pending entries by physical row and
//!    orders the rows so foreign keys hold at every step
//! 2. each row becomes a [`ModificationCommand`] whose
//!    [`ColumnModification`]s say what is written, read back or compared
//! 3. commands fill a [`ModificationCommandBatch`] up to the provider limit
//! 4. [`BatchExecutor`] compiles each batch with an [`UpdateSqlGenerator`],
//!    sends it, consumes the result sets and propagates read-back values
//!
//! # Example
//!
//! ```rust,ignore
//! let mut preparer = CommandBatchPreparer::new(42);
//! preparer.prepare(&state_manager)?;
//! let rows = BatchExecutor::new()
//!     .execute(&cx, &mut state_manager, &mut conn, &mut preparer, &generator)
//!     .await;
//! ```

pub mod batch;
pub mod column_modification;
pub mod executor;
pub mod modification_command;
pub mod preparer;
pub mod sql;

pub use batch::{ModificationCommandBatch, ResultSetGroup, ResultSetKind};
pub use column_modification::ColumnModification;
pub use executor::BatchExecutor;
pub use modification_command::ModificationCommand;
pub use preparer::{CommandBatchPreparer, DEFAULT_MAX_BATCH_SIZE};
pub use sql::{Dialect, DialectSqlGenerator, UpdateSqlGenerator};
