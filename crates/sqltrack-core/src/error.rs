//! Error types for change tracking and persistence.

use crate::entity::EntryId;
use std::fmt;

/// The primary error type for all sqltrack operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors reported by the store
    Connection(ConnectionError),
    /// Statement execution errors reported by the store
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (malformed or unexpected store responses)
    Protocol(ProtocolError),
    /// Optimistic concurrency conflict: fewer rows changed than expected
    Concurrency(ConcurrencyError),
    /// Store fault raised while saving, with the entries being saved
    StoreUpdate(StoreUpdateError),
    /// Invalid use of the tracking API or inconsistent metadata
    Model(ModelError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection already in use by another operation
    Busy,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Rows affected by a command group did not match the rows it expected.
///
/// Raised per result-set group; `entries` lists every tracked entry whose
/// command belonged to the unmet part of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyError {
    pub expected: u64,
    pub actual: u64,
    pub entries: Vec<EntryId>,
}

/// A store or protocol fault raised while a batch was being saved.
#[derive(Debug)]
pub struct StoreUpdateError {
    pub message: String,
    /// Entries of the command being processed when the fault occurred
    pub entries: Vec<EntryId>,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub entity_type: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// Entity type is not part of the model
    UnknownEntityType,
    /// Metadata references something that does not exist
    InvalidModel,
    /// Operation requires a key value that is not set
    KeyNotSet,
    /// Another tracked entry already uses the same key value
    IdentityConflict,
    /// Entry is referenced by dependents that block the operation
    RequiredRelationship,
    /// Entries sharing a row disagree on what should happen to it
    ConflictingRowState,
    /// Commands depend on each other in a cycle
    DependencyCycle,
    /// The entity or entry is not tracked by this session
    NotTracked,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::StoreUpdate(e) => e.source.as_deref().is_some_and(Error::is_retryable),
            _ => false,
        }
    }

    /// Is this an optimistic concurrency conflict?
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// Entries implicated by a save failure.
    pub fn affected_entries(&self) -> &[EntryId] {
        match self {
            Error::Concurrency(e) => &e.entries,
            Error::StoreUpdate(e) => &e.entries,
            _ => &[],
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::StoreUpdate(e) => e.source.as_deref().and_then(Error::sqlstate),
            _ => None,
        }
    }

    /// Model error helper.
    pub fn model(
        kind: ModelErrorKind,
        entity_type: Option<&'static str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Model(ModelError {
            kind,
            entity_type,
            message: message.into(),
        })
    }

    /// Protocol error helper.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            source: None,
        })
    }

    /// Wrap a store fault with the entries that were being saved.
    ///
    /// Concurrency conflicts and faults that are already wrapped pass through
    /// unchanged.
    pub fn into_store_update(self, entries: &[EntryId]) -> Self {
        match self {
            Error::Concurrency(_) | Error::StoreUpdate(_) | Error::Cancelled => self,
            other => Error::StoreUpdate(StoreUpdateError {
                message: format!("An error occurred while saving entries: {other}"),
                entries: entries.to_vec(),
                source: Some(Box::new(other)),
            }),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Concurrency(e) => write!(f, "Concurrency conflict: {}", e),
            Error::StoreUpdate(e) => write!(f, "Store update error: {}", e.message),
            Error::Model(e) => write!(f, "Model error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::StoreUpdate(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "store operation expected to affect {} row(s) but actually affected {} row(s); \
             data may have been modified or deleted since entities were loaded",
            self.expected, self.actual
        )
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_type {
            Some(name) => write!(f, "{} (entity type '{}')", self.message, name),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConcurrencyError> for Error {
    fn from(err: ConcurrencyError) -> Self {
        Error::Concurrency(err)
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        Error::Model(err)
    }
}

/// Result type alias for sqltrack operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn deadlock() -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: Some("UPDATE t SET a = $1".to_string()),
            sqlstate: Some("40P01".to_string()),
            message: "deadlock detected".to_string(),
            source: None,
        })
    }

    #[test]
    fn store_update_wraps_and_keeps_source() {
        let entries = [EntryId::new(1), EntryId::new(4)];
        let err = deadlock().into_store_update(&entries);

        assert!(matches!(err, Error::StoreUpdate(_)));
        assert_eq!(err.affected_entries(), &entries);
        assert!(err.is_retryable());
        assert_eq!(err.sqlstate(), Some("40P01"));
        let source = err.source().expect("wrapped source");
        assert!(source.to_string().contains("deadlock"));
    }

    #[test]
    fn concurrency_conflicts_are_not_rewrapped() {
        let err = Error::Concurrency(ConcurrencyError {
            expected: 3,
            actual: 2,
            entries: vec![EntryId::new(0)],
        })
        .into_store_update(&[EntryId::new(9)]);

        assert!(err.is_concurrency_conflict());
        assert_eq!(err.affected_entries(), &[EntryId::new(0)]);
        assert!(err.to_string().contains("expected to affect 3 row(s)"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn model_error_display_names_entity_type() {
        let err = Error::model(
            ModelErrorKind::KeyNotSet,
            Some("Hero"),
            "primary key value is not set",
        );
        assert_eq!(
            err.to_string(),
            "Model error: primary key value is not set (entity type 'Hero')"
        );
    }
}
