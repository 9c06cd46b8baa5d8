//! Storage-layer traits consumed by the batch executor.
//!
//! - [`StoreConnection`] - sends an ordered batch of parameterized statements
//!   in one round trip and owns the transaction scope
//! - [`ResultCursor`] - sequential access to the result sets of one batch
//! - [`SyncStoreConnection`] / [`SyncResultCursor`] - blocking counterparts,
//!   adapted to the async traits by [`Blocking`]
//!
//! Every async method takes the asupersync `Cx` so implementations can
//! observe cancellation and budgets.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// The default for most stores.
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// One parameterized statement of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Sequential reader over the result sets produced by one batch.
///
/// A fresh cursor is positioned on the first result set.
pub trait ResultCursor: Send {
    /// Read the next row of the current result set, or `None` at its end.
    fn read(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Advance to the next result set; `false` when there are no more.
    fn next_result(&mut self, cx: &Cx) -> impl Future<Output = Outcome<bool, Error>> + Send;
}

/// A store connection exclusively borrowed for the duration of a save.
pub trait StoreConnection: Send {
    /// Cursor over the results of one batch.
    type Cursor<'conn>: ResultCursor
    where
        Self: 'conn;

    /// Begin the transaction that scopes a save.
    fn begin(
        &mut self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the current transaction.
    fn commit(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Send `statements` as one round trip.
    fn send_batch<'conn>(
        &'conn mut self,
        cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Self::Cursor<'conn>, Error>> + Send;

    /// Provider limit on commands per batch, if any.
    fn max_batch_size(&self) -> Option<usize> {
        None
    }
}

/// Blocking counterpart of [`ResultCursor`].
pub trait SyncResultCursor: Send {
    fn read(&mut self) -> Result<Option<Row>>;
    fn next_result(&mut self) -> Result<bool>;
}

/// Blocking counterpart of [`StoreConnection`].
pub trait SyncStoreConnection: Send {
    type Cursor<'conn>: SyncResultCursor
    where
        Self: 'conn;

    fn begin(&mut self, isolation: IsolationLevel) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn send_batch(&mut self, statements: &[Statement]) -> Result<Self::Cursor<'_>>;

    fn max_batch_size(&self) -> Option<usize> {
        None
    }
}

/// Adapts a blocking store to the async traits.
///
/// Every future it returns is already complete, so a save over a
/// `Blocking` store never suspends.
#[derive(Debug)]
pub struct Blocking<S>(pub S);

impl<S> Blocking<S> {
    pub fn new(store: S) -> Self {
        Self(store)
    }

    pub fn get_ref(&self) -> &S {
        &self.0
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.0
    }

    pub fn into_inner(self) -> S {
        self.0
    }
}

/// Cursor returned by [`Blocking::send_batch`].
#[derive(Debug)]
pub struct BlockingCursor<C>(C);

impl<C: SyncResultCursor> ResultCursor for BlockingCursor<C> {
    fn read(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self.0.read();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn next_result(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let result = self.0.next_result();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl<S: SyncStoreConnection> StoreConnection for Blocking<S> {
    type Cursor<'conn>
        = BlockingCursor<S::Cursor<'conn>>
    where
        Self: 'conn;

    fn begin(
        &mut self,
        _cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.0.begin(isolation);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.0.commit();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.0.rollback();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn send_batch<'conn>(
        &'conn mut self,
        _cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Self::Cursor<'conn>, Error>> + Send {
        tracing::trace!(statements = statements.len(), "Sending batch to blocking store");
        let result = self.0.send_batch(statements).map(BlockingCursor);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn max_batch_size(&self) -> Option<usize> {
        self.0.max_batch_size()
    }
}

/// Run a future that never suspends to completion on the calling thread.
///
/// Used by blocking saves over [`Blocking`] stores. A future that does
/// suspend is reported as a protocol error instead of being spun on.
pub fn complete_now<F: Future>(future: F) -> Result<F::Output> {
    let mut future = pin!(future);
    let mut context = Context::from_waker(Waker::noop());
    match future.as_mut().poll(&mut context) {
        Poll::Ready(output) => Ok(output),
        Poll::Pending => {
            tracing::warn!("Store future suspended during a blocking save");
            Err(Error::protocol(
                "store suspended during a blocking save; use the async save path",
            ))
        }
    }
}
