//! Executing batches and consuming their results.
//!
//! A save runs every batch of a [`CommandBatchPreparer`] inside one
//! transaction. Each batch is one round trip; its result sets are consumed
//! in command order, read-back values are propagated into the tracked
//! entries, and row counts are checked for optimistic concurrency.

use crate::batch::{ModificationCommandBatch, ResultSetGroup, ResultSetKind, entries_of};
use crate::modification_command::ModificationCommand;
use crate::preparer::CommandBatchPreparer;
use crate::sql::UpdateSqlGenerator;
use asupersync::{Cx, Outcome};
use sqltrack_core::{
    Blocking, ConcurrencyError, EntryId, Error, IsolationLevel, Result, ResultCursor,
    StoreConnection, SyncStoreConnection, Value, complete_now,
};
use sqltrack_session::StateManager;

/// A value overwritten by read-back, kept until the save commits.
#[derive(Debug)]
struct Replaced {
    entry: EntryId,
    property: &'static str,
    value: Value,
    temporary: bool,
}

/// Runs prepared batches against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchExecutor {
    isolation: IsolationLevel,
    use_transaction: bool,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            use_transaction: true,
        }
    }
}

impl BatchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Isolation level of the save transaction.
    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Whether to wrap the save in a transaction (default true).
    #[must_use]
    pub fn use_transaction(mut self, value: bool) -> Self {
        self.use_transaction = value;
        self
    }

    /// Execute every batch of `preparer`, returning the rows affected.
    ///
    /// Nothing is sent when the preparer is empty. Otherwise the transaction
    /// is committed after the last batch is fully consumed, and rolled back
    /// on any error, cancellation or panic. After a rollback, values read
    /// back into entries are replaced by what they held before the save.
    #[tracing::instrument(level = "info", skip_all, fields(rows = preparer.remaining()))]
    pub async fn execute<C: StoreConnection>(
        &self,
        cx: &Cx,
        state_manager: &mut StateManager,
        conn: &mut C,
        preparer: &mut CommandBatchPreparer,
        generator: &dyn UpdateSqlGenerator,
    ) -> Outcome<u64, Error> {
        if preparer.is_empty() {
            tracing::debug!("Nothing to save");
            return Outcome::Ok(0);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        if self.use_transaction {
            match conn.begin(cx, self.isolation).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e.into_store_update(&[])),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let mut replaced = Vec::new();
        let outcome = self
            .run_batches(cx, state_manager, conn, preparer, generator, &mut replaced)
            .await;
        if !self.use_transaction {
            return outcome;
        }

        let outcome = match outcome {
            Outcome::Ok(rows) => match conn.commit(cx).await {
                Outcome::Ok(()) => {
                    tracing::info!(rows, "Save committed");
                    return Outcome::Ok(rows);
                }
                Outcome::Err(e) => Outcome::Err(e.into_store_update(&[])),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            failed => failed,
        };
        rollback(cx, conn).await;
        restore(state_manager, replaced);
        outcome
    }

    /// Blocking variant of [`execute`](Self::execute) for [`Blocking`]
    /// stores.
    pub fn execute_blocking<S: SyncStoreConnection>(
        &self,
        cx: &Cx,
        state_manager: &mut StateManager,
        conn: &mut Blocking<S>,
        preparer: &mut CommandBatchPreparer,
        generator: &dyn UpdateSqlGenerator,
    ) -> Result<u64> {
        let outcome = complete_now(self.execute(cx, state_manager, conn, preparer, generator))?;
        match outcome {
            Outcome::Ok(rows) => Ok(rows),
            Outcome::Err(e) => Err(e),
            Outcome::Cancelled(_) => Err(Error::Cancelled),
            Outcome::Panicked(_) => Err(Error::Custom("save panicked".to_string())),
        }
    }

    async fn run_batches<C: StoreConnection>(
        &self,
        cx: &Cx,
        state_manager: &mut StateManager,
        conn: &mut C,
        preparer: &mut CommandBatchPreparer,
        generator: &dyn UpdateSqlGenerator,
        replaced: &mut Vec<Replaced>,
    ) -> Outcome<u64, Error> {
        let mut rows = 0;
        loop {
            let batch = match preparer.next_batch(state_manager) {
                Ok(Some(batch)) => batch,
                Ok(None) => return Outcome::Ok(rows),
                Err(e) => return Outcome::Err(e),
            };
            match execute_batch(cx, state_manager, conn, &batch, generator, replaced).await {
                Outcome::Ok(n) => rows += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(commands = batch.len()))]
async fn execute_batch<C: StoreConnection>(
    cx: &Cx,
    state_manager: &mut StateManager,
    conn: &mut C,
    batch: &ModificationCommandBatch,
    generator: &dyn UpdateSqlGenerator,
    replaced: &mut Vec<Replaced>,
) -> Outcome<u64, Error> {
    let statements = batch.compile(generator);
    let groups = batch.result_sets(generator.coalesces_affected_counts());

    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let mut cursor = match conn.send_batch(cx, &statements).await {
        Outcome::Ok(cursor) => cursor,
        Outcome::Err(e) => return Outcome::Err(e.into_store_update(&batch.entries())),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut rows = 0;
    for (position, group) in groups.iter().enumerate() {
        if position > 0 {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match cursor.next_result(cx).await {
                Outcome::Ok(true) => {}
                Outcome::Ok(false) => {
                    return Outcome::Err(missing_results(batch, group.commands.start));
                }
                Outcome::Err(e) => {
                    return Outcome::Err(e.into_store_update(&entries_of(group_commands(batch, group))));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let consumed = match group.kind {
            ResultSetKind::Propagation => {
                let commands = group_commands(batch, group);
                consume_propagation(cx, state_manager, &mut cursor, commands, replaced).await
            }
            ResultSetKind::AffectedCount => {
                consume_affected_count(cx, &mut cursor, batch, group).await
            }
        };
        match consumed {
            Outcome::Ok(n) => rows += n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }

    tracing::debug!(rows, "Batch consumed");
    Outcome::Ok(rows)
}

/// Read one row per command and propagate it.
///
/// A missing row means this and every later command of the group matched
/// nothing.
async fn consume_propagation<R: ResultCursor>(
    cx: &Cx,
    state_manager: &mut StateManager,
    cursor: &mut R,
    commands: &[ModificationCommand],
    replaced: &mut Vec<Replaced>,
) -> Outcome<u64, Error> {
    let mut rows = 0;
    for (position, command) in commands.iter().enumerate() {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match cursor.read(cx).await {
            Outcome::Ok(Some(row)) => {
                remember_read_targets(state_manager, command, replaced);
                if let Err(e) = command.propagate_results(state_manager, &row) {
                    return Outcome::Err(e.into_store_update(command.entries()));
                }
                rows += 1;
            }
            Outcome::Ok(None) => {
                return Outcome::Err(concurrency_failure(
                    commands.len(),
                    position,
                    &commands[position..],
                ));
            }
            Outcome::Err(e) => return Outcome::Err(e.into_store_update(command.entries())),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(rows)
}

/// Read the single rows-affected count closing a group of commands.
async fn consume_affected_count<R: ResultCursor>(
    cx: &Cx,
    cursor: &mut R,
    batch: &ModificationCommandBatch,
    group: &ResultSetGroup,
) -> Outcome<u64, Error> {
    let commands = group_commands(batch, group);
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let row = match cursor.read(cx).await {
        Outcome::Ok(Some(row)) => row,
        Outcome::Ok(None) => return Outcome::Err(missing_results(batch, group.commands.start)),
        Outcome::Err(e) => return Outcome::Err(e.into_store_update(&entries_of(commands))),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let Some(actual) = row
        .get(0)
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
    else {
        return Outcome::Err(
            Error::protocol(format!(
                "expected a rows-affected count, got {:?}",
                row.get(0)
            ))
            .into_store_update(&entries_of(commands)),
        );
    };
    if actual != commands.len() as u64 {
        return Outcome::Err(concurrency_failure(
            commands.len(),
            usize::try_from(actual).unwrap_or(usize::MAX),
            commands,
        ));
    }
    Outcome::Ok(actual)
}

fn group_commands<'a>(
    batch: &'a ModificationCommandBatch,
    group: &ResultSetGroup,
) -> &'a [ModificationCommand] {
    &batch.commands()[group.commands.clone()]
}

fn concurrency_failure(expected: usize, actual: usize, unmet: &[ModificationCommand]) -> Error {
    let error = ConcurrencyError {
        expected: expected as u64,
        actual: actual as u64,
        entries: entries_of(unmet),
    };
    tracing::warn!(
        expected = error.expected,
        actual = error.actual,
        entries = ?error.entries,
        "Optimistic concurrency check failed"
    );
    Error::Concurrency(error)
}

/// The cursor ran out of result sets before every command was answered.
fn missing_results(batch: &ModificationCommandBatch, consumed: usize) -> Error {
    Error::protocol(format!(
        "the store returned results for {consumed} of {} commands",
        batch.len()
    ))
    .into_store_update(&entries_of(&batch.commands()[consumed..]))
}

fn remember_read_targets(
    state_manager: &StateManager,
    command: &ModificationCommand,
    replaced: &mut Vec<Replaced>,
) {
    for column in command.read_columns() {
        for (entry, property) in column.targets() {
            let Some(tracked) = state_manager.entry(*entry) else {
                continue;
            };
            let Some(info) = tracked.entity_type().property_named(property) else {
                continue;
            };
            replaced.push(Replaced {
                entry: *entry,
                property: *property,
                value: tracked.current_value(info),
                temporary: tracked.is_temporary(info),
            });
        }
    }
}

/// Undo read-back in reverse order so the first value recorded wins.
fn restore(state_manager: &mut StateManager, replaced: Vec<Replaced>) {
    for Replaced {
        entry,
        property,
        value,
        temporary,
    } in replaced.into_iter().rev()
    {
        if let Err(error) = state_manager.restore_store_value(entry, property, value, temporary) {
            tracing::warn!(%entry, property, %error, "Failed to restore value after rollback");
        }
    }
}

async fn rollback<C: StoreConnection>(cx: &Cx, conn: &mut C) {
    match conn.rollback(cx).await {
        Outcome::Ok(()) => tracing::debug!("Save rolled back"),
        Outcome::Err(error) => tracing::warn!(%error, "Rollback failed"),
        Outcome::Cancelled(reason) => tracing::warn!(?reason, "Rollback cancelled"),
        Outcome::Panicked(_) => tracing::warn!("Rollback panicked"),
    }
}
