//! The unit of work: tracked entities plus the store they are saved to.

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use sqltrack_core::{
    Blocking, EntityRef, EntityState, EntryId, Error, IsolationLevel, Model, Result,
    StoreConnection, SyncStoreConnection, Value, complete_now,
};
use sqltrack_session::{ChangeReport, RelationshipEvent, StateManager, ValueGenerator};
use sqltrack_update::{
    BatchExecutor, CommandBatchPreparer, DEFAULT_MAX_BATCH_SIZE, Dialect, DialectSqlGenerator,
    UpdateSqlGenerator,
};
use std::sync::Arc;

/// Configuration for a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run change detection over every entry before saving.
    pub auto_detect_changes: bool,
    /// Upper bound on commands per round trip. The store's own limit wins
    /// when it is lower.
    pub max_batch_size: usize,
    /// Wrap each save in a transaction.
    pub use_transaction: bool,
    /// Accept all changes after a successful save.
    pub accept_changes_on_success: bool,
    /// Dialect of the default SQL generator.
    pub dialect: Dialect,
    /// Isolation level of the save transaction.
    #[serde(skip)]
    pub isolation: IsolationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            use_transaction: true,
            accept_changes_on_success: true,
            dialect: Dialect::default(),
            isolation: IsolationLevel::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_auto_detect_changes(mut self, value: bool) -> Self {
        self.auto_detect_changes = value;
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value;
        self
    }

    #[must_use]
    pub fn with_use_transaction(mut self, value: bool) -> Self {
        self.use_transaction = value;
        self
    }

    #[must_use]
    pub fn with_accept_changes_on_success(mut self, value: bool) -> Self {
        self.accept_changes_on_success = value;
        self
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// A unit of work over one store connection.
///
/// The session tracks entities handed to it, and [`save_changes`]
/// writes everything pending in dependency order, batching commands into as
/// few round trips as the store allows.
///
/// [`save_changes`]: Session::save_changes
pub struct Session<C: StoreConnection> {
    connection: C,
    state_manager: StateManager,
    generator: Box<dyn UpdateSqlGenerator>,
    config: SessionConfig,
}

impl<C: StoreConnection> Session<C> {
    /// Create a new session with default configuration.
    pub fn new(connection: C, model: Arc<Model>) -> Self {
        Self::with_config(connection, model, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, model: Arc<Model>, config: SessionConfig) -> Self {
        Self {
            connection,
            state_manager: StateManager::new(model),
            generator: Box::new(DialectSqlGenerator::new(config.dialect)),
            config,
        }
    }

    /// Replace the SQL generator derived from the configured dialect.
    #[must_use]
    pub fn with_generator(mut self, generator: impl UpdateSqlGenerator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<Model> {
        self.state_manager.model()
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Give the connection back, dropping everything tracked.
    pub fn into_connection(self) -> C {
        self.connection
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub fn state_manager_mut(&mut self) -> &mut StateManager {
        &mut self.state_manager
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track `entity` and everything reachable from it as Added.
    pub fn add(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.state_manager.add(entity)
    }

    /// Track `entity` as Unchanged, or Added when its key is not set.
    pub fn attach(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.state_manager.attach(entity)
    }

    /// Track `entity` as Modified with every non-key property marked.
    pub fn update(&mut self, entity: EntityRef) -> Result<EntryId> {
        self.state_manager.update(entity)
    }

    /// Mark `entity` for deletion, applying delete behavior to dependents.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.state_manager.remove(entity)
    }

    /// Stop tracking `entity`. Returns whether it was tracked.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        self.state_manager.detach(entity)
    }

    /// Track an entry with no caller-owned object behind it.
    pub fn add_shadow(&mut self, entity_type: &str, values: &[(&str, Value)]) -> Result<EntryId> {
        self.state_manager.add_shadow(entity_type, values)
    }

    pub fn set_state(&mut self, id: EntryId, state: EntityState) -> Result<()> {
        self.state_manager.set_state(id, state)
    }

    /// State of `entity`; `Detached` when it is not tracked.
    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.state_manager.state_of(entity)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.state_manager.has_pending_changes()
    }

    pub fn detect_changes(&mut self) -> Result<ChangeReport> {
        self.state_manager.detect_changes()
    }

    pub fn detect_entry_changes(&mut self, id: EntryId) -> Result<ChangeReport> {
        self.state_manager.detect_entry_changes(id)
    }

    pub fn register_value_generator(
        &mut self,
        entity_type: &'static str,
        property: &'static str,
        generator: impl ValueGenerator + 'static,
    ) {
        self.state_manager
            .register_value_generator(entity_type, property, generator);
    }

    /// Observe every relationship change the session publishes.
    pub fn add_listener(&mut self, listener: impl FnMut(&RelationshipEvent) + Send + 'static) {
        self.state_manager.add_listener(listener);
    }

    pub fn accept_all_changes(&mut self) {
        self.state_manager.accept_all_changes();
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Write every pending change to the store.
    ///
    /// Returns the number of rows the store reported as affected. When
    /// nothing is pending no round trip is made and the result is 0. Pending
    /// entries become Unchanged (or are dropped, for deletions) only when
    /// the save commits and `accept_changes_on_success` is set.
    #[tracing::instrument(level = "info", skip_all, fields(entries = self.state_manager.len()))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<u64, Error> {
        let mut preparer = match self.prepare() {
            Ok(preparer) => preparer,
            Err(e) => return Outcome::Err(e),
        };

        let executor = BatchExecutor::new()
            .isolation(self.config.isolation)
            .use_transaction(self.config.use_transaction);
        let outcome = executor
            .execute(
                cx,
                &mut self.state_manager,
                &mut self.connection,
                &mut preparer,
                self.generator.as_ref(),
            )
            .await;

        if let Outcome::Ok(rows) = &outcome {
            tracing::debug!(rows, "Changes saved");
            if self.config.accept_changes_on_success {
                self.state_manager.accept_all_changes();
            }
        }
        outcome
    }

    fn prepare(&mut self) -> Result<CommandBatchPreparer> {
        if self.config.auto_detect_changes {
            self.state_manager.detect_changes()?;
        }
        self.state_manager.generate_pending_values()?;

        let max_batch_size = self
            .connection
            .max_batch_size()
            .map_or(self.config.max_batch_size, |limit| {
                limit.min(self.config.max_batch_size)
            });
        let mut preparer = CommandBatchPreparer::new(max_batch_size);
        preparer.prepare(&self.state_manager)?;
        Ok(preparer)
    }
}

impl<S: SyncStoreConnection> Session<Blocking<S>> {
    /// Save on the calling thread. See [`save_changes`](Self::save_changes).
    pub fn save_changes_blocking(&mut self, cx: &Cx) -> Result<u64> {
        match complete_now(self.save_changes(cx))? {
            Outcome::Ok(rows) => Ok(rows),
            Outcome::Err(e) => Err(e),
            Outcome::Cancelled(_) => Err(Error::Cancelled),
            Outcome::Panicked(_) => Err(Error::Custom("save panicked".to_string())),
        }
    }
}

impl<C: StoreConnection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("entries", &self.state_manager.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_detect_changes);
        assert_eq!(config.max_batch_size, 42);
        assert!(config.use_transaction);
        assert!(config.accept_changes_on_success);
        assert_eq!(config.dialect, Dialect::Postgres);
    }

    #[test]
    fn config_setters_chain() {
        let config = SessionConfig::default()
            .with_auto_detect_changes(false)
            .with_max_batch_size(5)
            .with_use_transaction(false)
            .with_accept_changes_on_success(false)
            .with_dialect(Dialect::Sqlite)
            .with_isolation(IsolationLevel::Serializable);
        assert!(!config.auto_detect_changes);
        assert_eq!(config.max_batch_size, 5);
        assert!(!config.use_transaction);
        assert!(!config.accept_changes_on_success);
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert_eq!(config.isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn config_loads_from_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"max_batch_size": 10, "dialect": "mysql"}"#).unwrap();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.dialect, Dialect::Mysql);
        assert!(config.auto_detect_changes);
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
    }
}
