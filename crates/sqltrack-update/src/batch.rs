//! Command batches: the unit of one round trip.

use crate::modification_command::ModificationCommand;
use crate::sql::UpdateSqlGenerator;
use serde::Serialize;
use sqltrack_core::{EntryId, Statement};
use std::ops::Range;

/// How the result set closing a group of commands is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultSetKind {
    /// One row per command carrying its read-back columns.
    Propagation,
    /// One row with one integer: rows affected by the whole group.
    AffectedCount,
}

/// A run of consecutive commands answered by one result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSetGroup {
    pub kind: ResultSetKind,
    pub commands: Range<usize>,
}

impl ResultSetGroup {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Ordered commands sent together.
///
/// The batch never reorders. Once it holds `max_batch_size` commands it
/// refuses more and the caller starts a new one.
#[derive(Debug, Clone)]
pub struct ModificationCommandBatch {
    commands: Vec<ModificationCommand>,
    max_batch_size: usize,
}

impl ModificationCommandBatch {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            commands: Vec::new(),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Append a command, or hand it back when the batch is full.
    pub fn add_command(&mut self, command: ModificationCommand) -> Result<(), ModificationCommand> {
        if self.is_full() {
            return Err(command);
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.commands.len() >= self.max_batch_size
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    /// Every entry written by this batch, in command order.
    pub fn entries(&self) -> Vec<EntryId> {
        entries_of(&self.commands)
    }

    /// Per command: whether it is the last one answered by its result set.
    ///
    /// A command with read-back columns always ends its own result set.
    /// Runs of other commands share one count when `coalesce` is set.
    pub fn result_set_ends(&self, coalesce: bool) -> Vec<bool> {
        let propagating: Vec<bool> = self
            .commands
            .iter()
            .map(ModificationCommand::requires_result_propagation)
            .collect();
        (0..propagating.len())
            .map(|i| {
                propagating[i]
                    || !coalesce
                    || propagating.get(i + 1).is_none_or(|next| *next)
            })
            .collect()
    }

    /// Split the batch into result-set groups using the boundary flags.
    pub fn result_sets(&self, coalesce: bool) -> Vec<ResultSetGroup> {
        let mut groups = Vec::new();
        let mut start = 0;
        for (i, ends) in self.result_set_ends(coalesce).into_iter().enumerate() {
            if !ends {
                continue;
            }
            let kind = if self.commands[start].requires_result_propagation() {
                ResultSetKind::Propagation
            } else {
                ResultSetKind::AffectedCount
            };
            groups.push(ResultSetGroup {
                kind,
                commands: start..i + 1,
            });
            start = i + 1;
        }
        groups
    }

    /// Statements for the whole batch, in command order.
    #[tracing::instrument(level = "debug", skip_all, fields(commands = self.commands.len()))]
    pub fn compile(&self, generator: &dyn UpdateSqlGenerator) -> Vec<Statement> {
        let mut statements = Vec::new();
        for group in self.result_sets(generator.coalesces_affected_counts()) {
            let commands = &self.commands[group.commands];
            match group.kind {
                ResultSetKind::Propagation => {
                    for command in commands {
                        generator.append_command(&mut statements, command);
                    }
                }
                ResultSetKind::AffectedCount => {
                    generator.append_affected_count(&mut statements, commands);
                }
            }
        }
        tracing::trace!(statements = statements.len(), "Compiled batch");
        statements
    }
}

pub(crate) fn entries_of(commands: &[ModificationCommand]) -> Vec<EntryId> {
    commands
        .iter()
        .flat_map(|c| c.entries().iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Dialect, DialectSqlGenerator};
    use sqltrack_core::{DynamicEntity, EntityType, Model, PropertyInfo, ValueGenerated};
    use sqltrack_session::StateManager;
    use std::sync::Arc;

    fn state_manager() -> StateManager {
        let hero = EntityType::new("Hero")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .primary_key(&["id"]);
        StateManager::new(Arc::new(Model::builder().entity(hero).build().unwrap()))
    }

    /// `pattern` uses `i` for an insert (propagating) and `u` for an update.
    fn batch(sm: &mut StateManager, pattern: &str) -> ModificationCommandBatch {
        let mut batch = ModificationCommandBatch::new(100);
        for (n, kind) in pattern.chars().enumerate() {
            let id = match kind {
                'i' => sm
                    .add(DynamicEntity::new("Hero").with("name", "new").into_ref())
                    .unwrap(),
                _ => {
                    let key = i64::try_from(n).unwrap() + 1;
                    let id = sm
                        .attach(
                            DynamicEntity::new("Hero")
                                .with("id", key)
                                .with("name", "old")
                                .into_ref(),
                        )
                        .unwrap();
                    sm.set_property_value(id, "name", "changed").unwrap();
                    id
                }
            };
            let command = ModificationCommand::from_entries(sm, &[id]).unwrap();
            batch.add_command(command).unwrap();
        }
        batch
    }

    #[test]
    fn full_batch_hands_the_command_back() {
        let mut sm = state_manager();
        let source = batch(&mut sm, "uu");
        let first = source.commands()[0].clone();
        let second = source.commands()[1].clone();

        let mut small = ModificationCommandBatch::new(1);
        small.add_command(first).unwrap();
        assert!(small.is_full());
        assert_eq!(small.add_command(second.clone()), Err(second));
        assert_eq!(small.len(), 1);
    }

    #[test]
    fn non_propagating_runs_share_a_result_set() {
        let mut sm = state_manager();
        let batch = batch(&mut sm, "uuiuu");

        assert_eq!(batch.result_set_ends(true), [false, true, true, false, true]);
        let groups = batch.result_sets(true);
        assert_eq!(
            groups,
            [
                ResultSetGroup {
                    kind: ResultSetKind::AffectedCount,
                    commands: 0..2
                },
                ResultSetGroup {
                    kind: ResultSetKind::Propagation,
                    commands: 2..3
                },
                ResultSetGroup {
                    kind: ResultSetKind::AffectedCount,
                    commands: 3..5
                },
            ]
        );
    }

    #[test]
    fn without_coalescing_every_command_ends_a_result_set() {
        let mut sm = state_manager();
        let batch = batch(&mut sm, "uui");
        assert_eq!(batch.result_set_ends(false), [true, true, true]);
        assert_eq!(batch.result_sets(false).len(), 3);
    }

    #[test]
    fn compile_follows_result_set_groups() {
        let mut sm = state_manager();
        let batch = batch(&mut sm, "iuu");

        let postgres = batch.compile(&DialectSqlGenerator::new(Dialect::Postgres));
        assert_eq!(postgres.len(), 2);
        assert!(postgres[0].sql.starts_with("INSERT INTO \"Hero\""));
        assert!(postgres[1].sql.starts_with("WITH c0 AS (UPDATE"));

        let sqlite = batch.compile(&DialectSqlGenerator::new(Dialect::Sqlite));
        let sql: Vec<&str> = sqlite.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql.len(), 5);
        assert_eq!(sql[2], "SELECT changes()");
        assert_eq!(sql[4], "SELECT changes()");
    }
}
