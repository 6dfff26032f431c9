//! The generic driver contract.
//!
//! This module defines the interfaces a database engine implements so that a
//! higher-level query API can use it without knowing which engine sits below:
//!
//! - [`Driver`] - opens connections by name
//! - [`Conn`] - a single connection: prepare, exec, query, begin, ping, close
//! - [`Stmt`] - a prepared statement that can be executed repeatedly
//! - [`Rows`] - a lazy, forward-only cursor over a query's results
//! - [`Tx`] - an open transaction, finished by commit or rollback
//!
//! Every call that reaches the engine takes a [`Context`]. Implementations poll
//! it while the engine is running and abort the current statement once it is
//! done.
//!
//! A connection that has been closed must fail every later call with an error
//! for which [`DriverError::is_bad_conn`] holds, without touching the engine.

use crate::context::Context;
use crate::error::DriverError;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level requested when a transaction begins.
///
/// Engines accept the subset they can honor and reject the rest before any
/// statement is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the engine uses when nothing is requested.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    /// Human-readable name, used in error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "Default",
            IsolationLevel::ReadUncommitted => "Read Uncommitted",
            IsolationLevel::ReadCommitted => "Read Committed",
            IsolationLevel::WriteCommitted => "Write Committed",
            IsolationLevel::RepeatableRead => "Repeatable Read",
            IsolationLevel::Snapshot => "Snapshot",
            IsolationLevel::Serializable => "Serializable",
            IsolationLevel::Linearizable => "Linearizable",
        }
    }

    /// Get the SQL syntax for this isolation level, when there is one.
    #[must_use]
    pub const fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
            _ => None,
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for [`Conn::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// A statement argument.
///
/// `ordinal` is the 1-based position of the argument. When `name` is set the
/// engine resolves the parameter by name (including its prefix, e.g. `:id`)
/// and the ordinal is informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: Option<String>,
    pub ordinal: usize,
    pub value: Value,
}

impl NamedValue {
    /// A positional argument.
    pub fn positional(ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: None,
            ordinal,
            value: value.into(),
        }
    }

    /// A named argument.
    pub fn named(name: impl Into<String>, ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            ordinal,
            value: value.into(),
        }
    }

    /// Turn a plain argument list into positional arguments numbered from 1.
    ///
    /// ```
    /// use sqldriver_core::{NamedValue, Value};
    ///
    /// let args = NamedValue::from_values([Value::BigInt(1), Value::Null]);
    /// assert_eq!(args[1].ordinal, 2);
    /// ```
    pub fn from_values<I>(values: I) -> Vec<NamedValue>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| NamedValue::positional(i + 1, v))
            .collect()
    }
}

/// Outcome of a statement that does not return rows.
///
/// Snapshot taken right after the statement completed. Another write on the
/// same connection makes it stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: i64,
}

/// Opens connections.
pub trait Driver {
    type Conn: Conn;

    /// Open a new connection. The meaning of `name` is engine specific.
    fn open(&self, name: &str) -> Result<Self::Conn, <Self::Conn as Conn>::Error>;
}

/// A database connection.
///
/// Connections are used by one caller at a time. Statements, cursors and
/// transactions borrow the connection, so it cannot be closed while any of
/// them is alive.
pub trait Conn {
    /// The error type for every operation on this connection.
    type Error: DriverError;

    /// The prepared statement type.
    type Stmt<'conn>: Stmt<Error = Self::Error>
    where
        Self: 'conn;

    /// The cursor type returned by [`query`](Conn::query).
    type Rows<'conn>: Rows<Error = Self::Error>
    where
        Self: 'conn;

    /// The transaction type returned by [`begin`](Conn::begin).
    type Tx<'conn>: Tx<Error = Self::Error>
    where
        Self: 'conn;

    /// Prepare a statement for repeated execution.
    fn prepare<'conn>(
        &'conn self,
        ctx: &Context,
        query: &str,
    ) -> Result<Self::Stmt<'conn>, Self::Error>;

    /// Execute a statement that returns no rows.
    fn exec(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<ExecResult, Self::Error>;

    /// Execute a query and return a cursor over its rows.
    fn query<'conn>(
        &'conn self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<Self::Rows<'conn>, Self::Error>;

    /// Begin a transaction.
    fn begin<'conn>(
        &'conn self,
        ctx: &Context,
        opts: TxOptions,
    ) -> Result<Self::Tx<'conn>, Self::Error>;

    /// Verify the connection is still usable.
    fn ping(&self, ctx: &Context) -> Result<(), Self::Error>;

    /// Close the connection. Closing an already closed connection succeeds.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A prepared statement.
pub trait Stmt {
    type Error: DriverError;

    /// The cursor type returned by [`query`](Stmt::query).
    type Rows: Rows<Error = Self::Error>;

    /// Number of placeholders the statement expects.
    fn num_input(&self) -> usize;

    /// Bind `args` and run the statement to completion.
    fn exec(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<ExecResult, Self::Error>;

    /// Bind `args` and return a cursor over the statement's rows.
    ///
    /// At most one cursor may be open per statement; a second call fails
    /// until the first cursor is closed.
    fn query(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<Self::Rows, Self::Error>;

    /// Release the statement. If a cursor is still open, the release happens
    /// when that cursor closes.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A forward-only cursor over query results.
pub trait Rows {
    type Error: DriverError;

    /// Column names of the result set.
    fn columns(&self) -> &[String];

    /// Advance to the next row. `Ok(None)` marks the end of the results.
    fn next(&mut self) -> Result<Option<Row>, Self::Error>;

    /// Close the cursor. Idempotent.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// An open transaction.
pub trait Tx {
    type Error: DriverError;

    fn commit(self) -> Result<(), Self::Error>;

    fn rollback(self) -> Result<(), Self::Error>;
}
