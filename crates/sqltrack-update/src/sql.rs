//! SQL generation for modification commands.
//!
//! [`UpdateSqlGenerator`] is the seam between the batching pipeline and a
//! concrete store. [`DialectSqlGenerator`] is a reference implementation
//! covering PostgreSQL, SQLite and MySQL placeholder and quoting rules.

use crate::column_modification::ColumnModification;
use crate::modification_command::ModificationCommand;
use serde::{Deserialize, Serialize};
use sqltrack_core::{EntityState, Statement, Value};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Properly escapes embedded quote characters by doubling them:
    /// - For Postgres/SQLite: `"` becomes `""`
    /// - For MySQL: `` ` `` becomes ``` `` ```
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Check if INSERT/UPDATE/DELETE accept a RETURNING clause.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// Turns modification commands into statements.
pub trait UpdateSqlGenerator: Send + Sync {
    /// Append statements for a command whose read columns come back as the
    /// single row of one result set.
    fn append_command(&self, statements: &mut Vec<Statement>, command: &ModificationCommand);

    /// Append statements for `commands` followed by exactly one result set
    /// holding a single integer: the total number of rows they affected.
    fn append_affected_count(&self, statements: &mut Vec<Statement>, commands: &[ModificationCommand]);

    /// Whether [`append_affected_count`](Self::append_affected_count)
    /// accepts more than one command.
    fn coalesces_affected_counts(&self) -> bool;
}

/// Reference generator for the three supported dialects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialectSqlGenerator {
    dialect: Dialect,
}

impl DialectSqlGenerator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn table(&self, command: &ModificationCommand) -> String {
        let table = self.dialect.quote_identifier(command.table_name());
        match command.schema() {
            Some(schema) => format!("{}.{table}", self.dialect.quote_identifier(schema)),
            None => table,
        }
    }

    fn column_list<'a>(&self, columns: impl Iterator<Item = &'a ColumnModification>) -> String {
        columns
            .map(|c| self.dialect.quote_identifier(c.column_name()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The INSERT, UPDATE or DELETE itself, with RETURNING when requested
    /// and supported.
    fn command_sql(&self, builder: &mut SqlBuilder, command: &ModificationCommand, returning: bool) {
        let table = self.table(command);
        match command.state() {
            EntityState::Added => {
                let writes: Vec<&ColumnModification> = command.write_columns().collect();
                builder.push("INSERT INTO ");
                builder.push(&table);
                if writes.is_empty() {
                    builder.push(match self.dialect {
                        Dialect::Mysql => " () VALUES ()",
                        Dialect::Postgres | Dialect::Sqlite => " DEFAULT VALUES",
                    });
                } else {
                    builder.push(" (");
                    builder.push(&self.column_list(writes.iter().copied()));
                    builder.push(") VALUES (");
                    for (i, column) in writes.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        builder.bind(column.value().clone());
                    }
                    builder.push(")");
                }
            }
            EntityState::Modified => {
                builder.push("UPDATE ");
                builder.push(&table);
                builder.push(" SET ");
                for (i, column) in command.write_columns().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.push(&self.dialect.quote_identifier(column.column_name()));
                    builder.push(" = ");
                    builder.bind(column.value().clone());
                }
                self.where_clause(builder, command);
            }
            EntityState::Deleted => {
                builder.push("DELETE FROM ");
                builder.push(&table);
                self.where_clause(builder, command);
            }
            EntityState::Unchanged | EntityState::Detached => {}
        }

        if returning && self.dialect.supports_returning() {
            builder.push(" RETURNING ");
            builder.push(&self.column_list(command.read_columns()));
        }
    }

    fn where_clause(&self, builder: &mut SqlBuilder, command: &ModificationCommand) {
        builder.push(" WHERE ");
        for (i, column) in command.condition_columns().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            builder.push(&self.dialect.quote_identifier(column.column_name()));
            if column.original_value().is_null() {
                builder.push(" IS NULL");
            } else {
                builder.push(" = ");
                builder.bind(column.original_value().clone());
            }
        }
    }

    /// MySQL has no RETURNING; read the row back with a SELECT guarded by
    /// `ROW_COUNT()` so a missed update yields no row.
    fn select_after_write(&self, command: &ModificationCommand) -> Statement {
        let mut builder = SqlBuilder::new(self.dialect);
        builder.push("SELECT ");
        builder.push(&self.column_list(command.read_columns()));
        builder.push(" FROM ");
        builder.push(&self.table(command));
        builder.push(" WHERE ROW_COUNT() = 1");
        for column in command.columns().iter().filter(|c| c.is_key()) {
            builder.push(" AND ");
            builder.push(&self.dialect.quote_identifier(column.column_name()));
            if column.is_read() {
                builder.push(" = LAST_INSERT_ID()");
            } else {
                builder.push(" = ");
                builder.bind(column.value().clone());
            }
        }
        builder.finish()
    }
}

impl UpdateSqlGenerator for DialectSqlGenerator {
    fn append_command(&self, statements: &mut Vec<Statement>, command: &ModificationCommand) {
        let mut builder = SqlBuilder::new(self.dialect);
        self.command_sql(&mut builder, command, true);
        statements.push(builder.finish());
        if !self.dialect.supports_returning() {
            statements.push(self.select_after_write(command));
        }
    }

    fn append_affected_count(&self, statements: &mut Vec<Statement>, commands: &[ModificationCommand]) {
        let count = match self.dialect {
            Dialect::Sqlite => "SELECT changes()",
            Dialect::Mysql => "SELECT ROW_COUNT()",
            Dialect::Postgres => {
                // Each command runs as a data-modifying CTE; the outer SELECT
                // sums the rows they returned.
                let mut builder = SqlBuilder::new(self.dialect);
                builder.push("WITH ");
                for (i, command) in commands.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.push(&format!("c{i} AS ("));
                    self.command_sql(&mut builder, command, false);
                    builder.push(" RETURNING 1)");
                }
                let counts: Vec<String> = (0..commands.len())
                    .map(|i| format!("(SELECT count(*) FROM c{i})"))
                    .collect();
                builder.push(" SELECT ");
                builder.push(&counts.join(" + "));
                statements.push(builder.finish());
                return;
            }
        };

        for command in commands {
            let mut builder = SqlBuilder::new(self.dialect);
            self.command_sql(&mut builder, command, false);
            statements.push(builder.finish());
        }
        statements.push(Statement::new(count, Vec::new()));
    }

    /// `changes()` and `ROW_COUNT()` only see the last statement, so only
    /// PostgreSQL can sum a group.
    fn coalesces_affected_counts(&self) -> bool {
        matches!(self.dialect, Dialect::Postgres)
    }
}

/// Accumulates SQL text and bound parameters for one statement.
struct SqlBuilder {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    fn bind(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    fn finish(self) -> Statement {
        Statement::new(self.sql, self.params)
    }
}
