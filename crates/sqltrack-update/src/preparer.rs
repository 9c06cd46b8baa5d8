//! Ordering pending entries into batches.
//!
//! The preparer groups pending entries by physical row, sorts the rows so
//! that foreign keys are satisfied at every step, and hands out batches one
//! at a time. Commands are built when their batch is cut, so values read
//! back by an earlier batch are already in place.

use crate::batch::ModificationCommandBatch;
use crate::modification_command::ModificationCommand;
use sqltrack_core::{EntityState, EntryId, Error, ForeignKeyInfo, KeyValue, ModelErrorKind, Result};
use sqltrack_session::{StateManager, TrackedEntry};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

/// Provider-independent default for commands per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 42;

/// The entries sharing one physical row.
#[derive(Debug)]
struct RowGroup {
    table: &'static str,
    deleting: bool,
    key: KeyValue,
    entries: Vec<EntryId>,
}

/// Produces dependency-ordered command batches for a save.
#[derive(Debug)]
pub struct CommandBatchPreparer {
    max_batch_size: usize,
    rows: VecDeque<Vec<EntryId>>,
}

impl Default for CommandBatchPreparer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl CommandBatchPreparer {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            rows: VecDeque::new(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// No rows left to write.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows not yet handed out in a batch.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Group and order every pending entry of `state_manager`.
    ///
    /// Principals are inserted before their dependents and dependents are
    /// deleted (or moved away) before their principals. A cycle among the
    /// rows is reported as [`ModelErrorKind::DependencyCycle`].
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn prepare(&mut self, state_manager: &StateManager) -> Result<()> {
        let groups = group_rows(state_manager);
        let node_of: HashMap<EntryId, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(node, g)| g.entries.iter().map(move |id| (*id, node)))
            .collect();

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); groups.len()];
        for (node, group) in groups.iter().enumerate() {
            for id in &group.entries {
                let entry = state_manager.try_entry(*id)?;
                for (from, to) in dependency_edges(state_manager, entry, &node_of) {
                    if from != to {
                        successors[from].insert(to);
                    }
                }
            }
            // A row deleted and re-inserted under the same key: delete first.
            if !group.deleting {
                if let Some(deleted) = groups
                    .iter()
                    .position(|g| g.deleting && g.table == group.table && g.key == group.key)
                {
                    successors[deleted].insert(node);
                }
            }
        }

        let order = topological_order(&successors).map_err(|stuck| {
            let tables: BTreeSet<&str> = stuck.iter().map(|n| groups[*n].table).collect();
            Error::model(
                ModelErrorKind::DependencyCycle,
                None,
                format!(
                    "unable to order the changes: rows of {} depend on each other in a cycle",
                    tables.into_iter().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;

        let mut groups: Vec<Option<RowGroup>> = groups.into_iter().map(Some).collect();
        self.rows = order
            .into_iter()
            .filter_map(|node| groups[node].take().map(|g| g.entries))
            .collect();
        tracing::debug!(rows = self.rows.len(), "Prepared rows");
        Ok(())
    }

    /// Cut the next batch, or `None` when every row has been handed out.
    ///
    /// A command writing a temporary value that another command of the
    /// current batch will read back starts a new batch, so the store value
    /// is propagated before the command is built.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn next_batch(
        &mut self,
        state_manager: &StateManager,
    ) -> Result<Option<ModificationCommandBatch>> {
        let mut batch = ModificationCommandBatch::new(self.max_batch_size);
        while let Some(row) = self.rows.pop_front() {
            let command = ModificationCommand::from_entries(state_manager, &row)?;
            if !command.has_work() {
                tracing::trace!(entries = ?row, "Skipping command without writes");
                continue;
            }
            if let Some(column) = command.pending_value() {
                if batch.is_empty() {
                    return Err(Error::model(
                        ModelErrorKind::KeyNotSet,
                        None,
                        format!(
                            "column '{}' of '{}' still holds a temporary value and no \
                             earlier command produces it",
                            column.column_name(),
                            command.table_name()
                        ),
                    ));
                }
                self.rows.push_front(row);
                break;
            }
            if batch.add_command(command).is_err() {
                self.rows.push_front(row);
                break;
            }
        }

        if batch.is_empty() {
            return Ok(None);
        }
        tracing::debug!(commands = batch.len(), remaining = self.rows.len(), "Cut batch");
        Ok(Some(batch))
    }
}

/// Group pending entries by (table, row key, deleting), in entry order.
///
/// The key is taken from original values so a row whose key is being
/// changed is still found under the key the store knows.
fn group_rows(state_manager: &StateManager) -> Vec<RowGroup> {
    let mut groups: Vec<RowGroup> = Vec::new();
    let mut index: HashMap<(Option<&'static str>, &'static str, bool, KeyValue), usize> =
        HashMap::new();
    for entry in state_manager.entries() {
        let state = entry.state();
        if !state.has_pending_write() {
            continue;
        }
        if state == EntityState::Modified && entry.modified_properties().is_empty() {
            continue;
        }
        let et = entry.entity_type();
        let key = KeyValue::new(
            et.primary_key_info()
                .properties
                .iter()
                .filter_map(|name| et.property_named(name))
                .map(|p| entry.original_value(p))
                .collect(),
        );
        let deleting = state == EntityState::Deleted;
        let slot = (et.schema_name(), et.table_name(), deleting, key.clone());
        match index.get(&slot) {
            Some(node) => groups[*node].entries.push(entry.id()),
            None => {
                index.insert(slot, groups.len());
                groups.push(RowGroup {
                    table: et.table_name(),
                    deleting,
                    key,
                    entries: vec![entry.id()],
                });
            }
        }
    }
    groups
}

/// Ordering constraints contributed by one entry's foreign keys, as
/// `(before, after)` node pairs.
fn dependency_edges(
    state_manager: &StateManager,
    entry: &TrackedEntry,
    node_of: &HashMap<EntryId, usize>,
) -> Vec<(usize, usize)> {
    let Some(&node) = node_of.get(&entry.id()) else {
        return Vec::new();
    };
    let principal_node = |fk: &ForeignKeyInfo, value: &KeyValue, state: EntityState| {
        if value.has_null() {
            return None;
        }
        let principal = state_manager.resolve(fk.principal_type, fk.principal_key_name(), value)?;
        let principal_entry = state_manager.entry(principal)?;
        if principal_entry.state() != state {
            return None;
        }
        node_of.get(&principal).copied()
    };

    let mut edges = Vec::new();
    for fk in entry.entity_type().foreign_keys() {
        let current = entry.foreign_key_value(fk);
        match entry.state() {
            EntityState::Added | EntityState::Modified => {
                if let Some(principal) = principal_node(fk, &current, EntityState::Added) {
                    edges.push((principal, node));
                }
                let original = entry.original_foreign_key_value(fk);
                if entry.state() == EntityState::Modified && original != current {
                    if let Some(principal) = principal_node(fk, &original, EntityState::Deleted) {
                        edges.push((node, principal));
                    }
                }
            }
            // Fix-up may have set the key after tracking started, so the
            // current value counts as well as the original.
            EntityState::Deleted => {
                let original = entry.original_foreign_key_value(fk);
                for value in [&original, &current] {
                    if let Some(principal) = principal_node(fk, value, EntityState::Deleted) {
                        edges.push((node, principal));
                    }
                }
            }
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }
    edges
}

/// Kahn's algorithm, always taking the lowest ready node so the order is
/// deterministic and otherwise follows entry order. On a cycle, returns the
/// nodes that could not be placed.
fn topological_order(successors: &[BTreeSet<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut in_degree = vec![0_usize; successors.len()];
    for targets in successors {
        for target in targets {
            in_degree[*target] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse(n))
        .collect();

    let mut order = Vec::with_capacity(successors.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for target in &successors[node] {
            in_degree[*target] -= 1;
            if in_degree[*target] == 0 {
                ready.push(Reverse(*target));
            }
        }
    }

    if order.len() == successors.len() {
        Ok(order)
    } else {
        Err((0..successors.len()).filter(|n| in_degree[*n] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltrack_core::{
        DeleteBehavior, DynamicEntity, EntityRef, EntityType, Model, PropertyInfo, ValueGenerated,
        read_entity,
    };
    use sqltrack_session::TemporaryValueGenerator;
    use std::sync::Arc;

    fn model() -> Arc<Model> {
        let team = EntityType::new("Team")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .primary_key(&["id"]);
        let hero = EntityType::new("Hero")
            .property(
                PropertyInfo::new("id")
                    .default_value(0_i64)
                    .generated(ValueGenerated::OnAdd),
            )
            .property(PropertyInfo::new("name"))
            .property(PropertyInfo::new("team_id").nullable(true))
            .primary_key(&["id"])
            .foreign_key(
                ForeignKeyInfo::new("fk_hero_team", &["team_id"], "Team")
                    .navigation("team")
                    .inverse("heroes")
                    .on_delete(DeleteBehavior::Cascade),
            );
        Arc::new(Model::builder().entity(team).entity(hero).build().unwrap())
    }

    fn team(id: i64) -> EntityRef {
        DynamicEntity::new("Team")
            .with("id", id)
            .with("name", "Preventers")
            .into_ref()
    }

    fn hero(id: i64, team: Option<&EntityRef>) -> EntityRef {
        let mut hero = DynamicEntity::new("Hero").with("id", id).with("name", "Deadpond");
        if let Some(team) = team {
            hero.set("team_id", read_entity(team).get_value("id"));
            hero.set_reference("team", Some(Arc::clone(team)));
        }
        hero.into_ref()
    }

    fn tables(batch: &ModificationCommandBatch) -> Vec<(&'static str, EntityState)> {
        batch
            .commands()
            .iter()
            .map(|c| (c.table_name(), c.state()))
            .collect()
    }

    #[test]
    fn nothing_pending_prepares_nothing() {
        let mut sm = StateManager::new(model());
        sm.attach(team(1)).unwrap();
        let mut preparer = CommandBatchPreparer::default();
        preparer.prepare(&sm).unwrap();
        assert!(preparer.is_empty());
        assert!(preparer.next_batch(&sm).unwrap().is_none());
    }

    #[test]
    fn principals_are_inserted_first() {
        let mut sm = StateManager::new(model());
        let preventers = team(0);
        // The dependent is tracked first; the graph walk adds its team.
        sm.add(hero(0, Some(&preventers))).unwrap();

        let mut preparer = CommandBatchPreparer::default();
        preparer.prepare(&sm).unwrap();
        let first = preparer.next_batch(&sm).unwrap().unwrap();

        // The hero's foreign key waits for the team's generated key.
        assert_eq!(tables(&first), [("Team", EntityState::Added)]);
        assert_eq!(preparer.remaining(), 1);
    }

    #[test]
    fn dependents_are_deleted_first() {
        let mut sm = StateManager::new(model());
        let preventers = team(1);
        sm.attach(Arc::clone(&preventers)).unwrap();
        sm.attach(hero(10, Some(&preventers))).unwrap();
        sm.remove(&preventers).unwrap();

        let mut preparer = CommandBatchPreparer::default();
        preparer.prepare(&sm).unwrap();
        let batch = preparer.next_batch(&sm).unwrap().unwrap();
        assert_eq!(
            tables(&batch),
            [("Hero", EntityState::Deleted), ("Team", EntityState::Deleted)]
        );
    }

    #[test]
    fn moved_dependent_is_updated_before_its_old_principal_is_deleted() {
        let mut sm = StateManager::new(model());
        let old_team = team(1);
        let new_team = team(2);
        sm.attach(Arc::clone(&old_team)).unwrap();
        sm.attach(Arc::clone(&new_team)).unwrap();
        let hero_id = sm.attach(hero(10, Some(&old_team))).unwrap();

        sm.set_property_value(hero_id, "team_id", 2_i64).unwrap();
        let team_id = sm.entry_for(&old_team).unwrap();
        sm.set_state(team_id, EntityState::Deleted).unwrap();

        let mut preparer = CommandBatchPreparer::default();
        preparer.prepare(&sm).unwrap();
        let batch = preparer.next_batch(&sm).unwrap().unwrap();
        assert_eq!(
            tables(&batch),
            [("Hero", EntityState::Modified), ("Team", EntityState::Deleted)]
        );
    }

    #[test]
    fn batches_respect_the_size_limit() {
        let mut sm = StateManager::new(model());
        for id in 1..=5 {
            let entity = team(id);
            sm.attach(Arc::clone(&entity)).unwrap();
            sm.remove(&entity).unwrap();
        }

        let mut preparer = CommandBatchPreparer::new(2);
        preparer.prepare(&sm).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| preparer.next_batch(&sm).unwrap())
            .map(|b| b.len())
            .collect();
        assert_eq!(sizes, [2, 2, 1]);
    }

    #[test]
    fn unresolved_temporary_values_are_rejected() {
        let model = Arc::new(
            Model::builder()
                .entity(
                    EntityType::new("Tag")
                        .property(PropertyInfo::new("id").with_value_generator())
                        .property(PropertyInfo::new("name"))
                        .primary_key(&["id"]),
                )
                .build()
                .unwrap(),
        );
        let mut sm = StateManager::new(model);
        sm.register_value_generator("Tag", "id", TemporaryValueGenerator::default());
        sm.add_shadow("Tag", &[("name", "rust".into())]).unwrap();

        let mut preparer = CommandBatchPreparer::default();
        preparer.prepare(&sm).unwrap();
        let err = preparer.next_batch(&sm).unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::KeyNotSet));
    }

    #[test]
    fn topological_order_reports_cycles() {
        let successors = vec![BTreeSet::from([1]), BTreeSet::from([0]), BTreeSet::new()];
        assert_eq!(topological_order(&successors), Err(vec![0, 1]));

        let successors = vec![BTreeSet::new(), BTreeSet::from([0]), BTreeSet::from([1])];
        assert_eq!(topological_order(&successors), Ok(vec![2, 1, 0]));
    }
}
