//! The generic driver contract implemented on top of [`Connection`].
//!
//! [`SqliteDriver`] opens [`DriverConn`]s; statements, cursors and
//! transactions borrow the connection they come from. Every call that runs
//! SQL installs a progress handler polling the caller's [`Context`] for the
//! duration of the engine call, so a cancelled context interrupts the
//! statement within [`PROGRESS_INTERVAL`](crate::hooks::PROGRESS_INTERVAL)
//! instructions.
//!
//! ```no_run
//! use sqldriver_core::{Conn, Context, Driver, NamedValue, Rows};
//! use sqldriver_sqlite::SqliteDriver;
//!
//! let driver = SqliteDriver::new();
//! let conn = driver.open("file:app.db?mode=rwc")?;
//! let ctx = Context::background();
//! conn.exec(&ctx, "CREATE TABLE IF NOT EXISTS kv (k TEXT, v TEXT)", &[])?;
//! conn.exec(&ctx, "INSERT INTO kv VALUES (?, ?)", &NamedValue::from_values(["a", "1"]))?;
//! let mut rows = conn.query(&ctx, "SELECT k, v FROM kv", &[])?;
//! while let Some(row) = rows.next()? {
//!     println!("{}={}", row.get_as::<String>(0)?, row.get_as::<String>(1)?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{OpenFlags, SqliteConfig};
use crate::connection::{Connection, Handle};
use crate::error::{ConnError, Error, Result};
use crate::statement::Statement;
use sqldriver_core::{
    ColumnInfo, Conn, Context, Driver, ExecResult, IsolationLevel, NamedValue, Row, Rows, Stmt,
    Tx, TxOptions,
};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Busy timeout of connections opened by [`SqliteDriver::default_open`].
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 10_000;

/// Exec command answered with [`Error::Unwrap`] instead of being run.
const UNWRAP_COMMAND: &str = "unwrap";

type OpenFn = dyn Fn(&str) -> Result<Connection> + Send + Sync;
type ConfigureFn = dyn Fn(&mut Connection) -> Result<()> + Send + Sync;

/// Opens [`DriverConn`]s.
///
/// By default names are opened with [`SqliteDriver::default_open`]. A custom
/// open callback replaces that step; a configure callback runs on every new
/// connection and, when it fails, the connection is closed and the error
/// returned.
#[derive(Default)]
pub struct SqliteDriver {
    open: Option<Box<OpenFn>>,
    configure: Option<Box<ConfigureFn>>,
}

impl fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("custom_open", &self.open.is_some())
            .field("configure", &self.configure.is_some())
            .finish()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the open step.
    pub fn with_open<F>(mut self, open: F) -> Self
    where
        F: Fn(&str) -> Result<Connection> + Send + Sync + 'static,
    {
        self.open = Some(Box::new(open));
        self
    }

    /// Run `configure` on every new connection.
    pub fn with_configure<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.configure = Some(Box::new(configure));
        self
    }

    /// Open `name` as a URI-capable, read-write database (created when
    /// missing) in multi-thread mode, with a 10 s busy timeout and NUMERIC
    /// columns read as timestamps.
    pub fn default_open(name: &str) -> Result<Connection> {
        let config = SqliteConfig::file(name)
            .flags(OpenFlags::driver_default())
            .busy_timeout(DEFAULT_BUSY_TIMEOUT_MS)
            .scan_numeric_as_time(true);
        Connection::open_with(&config)
    }
}

impl Driver for SqliteDriver {
    type Conn = DriverConn;

    fn open(&self, name: &str) -> Result<DriverConn> {
        let mut conn = match &self.open {
            Some(open) => open(name)?,
            None => Self::default_open(name)?,
        };
        if let Some(configure) = &self.configure {
            if let Err(e) = configure(&mut conn) {
                if let Err(close_err) = conn.close() {
                    tracing::warn!(error = %close_err, "close after failed configure failed");
                }
                return Err(e);
            }
        }
        tracing::debug!(name, "driver opened connection");
        Ok(DriverConn { conn })
    }
}

/// A [`Connection`] behind the generic [`Conn`] interface.
#[derive(Debug)]
pub struct DriverConn {
    conn: Connection,
}

impl DriverConn {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// The underlying connection.
    pub fn native(&self) -> &Connection {
        &self.conn
    }

    pub fn native_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    fn check_open(&self) -> Result<()> {
        if self.conn.is_closed() {
            Err(Error::BadConn)
        } else {
            Ok(())
        }
    }
}

impl Conn for DriverConn {
    type Error = Error;
    type Stmt<'conn>
        = DriverStmt<'conn>
    where
        Self: 'conn;
    type Rows<'conn>
        = DriverRows<'conn>
    where
        Self: 'conn;
    type Tx<'conn>
        = DriverTx<'conn>
    where
        Self: 'conn;

    fn prepare<'conn>(&'conn self, _ctx: &Context, query: &str) -> Result<DriverStmt<'conn>> {
        self.check_open()?;
        let stmt = self.conn.prepare(query)?;
        Ok(DriverStmt::new(&self.conn, stmt, false))
    }

    fn exec(&self, ctx: &Context, query: &str, args: &[NamedValue]) -> Result<ExecResult> {
        self.check_open()?;
        if args.is_empty() {
            if query == UNWRAP_COMMAND {
                return Err(Error::Unwrap(self.conn.handle()));
            }
            let _guard = self.conn.watch_context(ctx)?;
            self.conn.exec_batch(query)?;
            return self.conn.result();
        }
        let mut stmt = self.conn.prepare(query)?;
        stmt.bind_named(args)?;
        let _guard = self.conn.watch_context(ctx)?;
        stmt.run()?;
        self.conn.result()
    }

    fn query<'conn>(
        &'conn self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<DriverRows<'conn>> {
        self.check_open()?;
        let stmt = self.conn.prepare(query)?;
        // The statement lives exactly as long as its cursor
        let mut stmt = DriverStmt::new(&self.conn, stmt, true);
        stmt.query(ctx, args)
    }

    fn begin<'conn>(&'conn self, _ctx: &Context, opts: TxOptions) -> Result<DriverTx<'conn>> {
        self.check_open()?;
        let conn = &self.conn;
        if !conn.autocommit()? {
            return Err(conn.specific_error("nested transactions are not supported"));
        }
        let read_uncommitted = match opts.isolation {
            IsolationLevel::Default | IsolationLevel::Serializable => false,
            IsolationLevel::ReadUncommitted => true,
            other => {
                return Err(
                    conn.specific_error(format!("isolation level {} is not supported", other))
                );
            }
        };

        conn.set_query_only(None, opts.read_only)?;
        let started = conn
            .exec_batch(&format!(
                "PRAGMA read_uncommitted={}",
                i32::from(read_uncommitted)
            ))
            .and_then(|()| conn.begin());
        if let Err(e) = started {
            if opts.read_only {
                reset_query_only(conn);
            }
            return Err(e);
        }
        tracing::debug!(isolation = %opts.isolation, read_only = opts.read_only, "driver transaction started");
        Ok(DriverTx {
            conn,
            done: false,
            read_only: opts.read_only,
        })
    }

    fn ping(&self, _ctx: &Context) -> Result<()> {
        self.check_open()?;
        self.conn.exec_batch("PRAGMA schema_version")
    }

    fn close(&mut self) -> Result<()> {
        self.conn.close()
    }
}

/// Native handle of a driver connection, obtained through the reserved
/// `unwrap` exec command. `None` when `conn` is not a SQLite connection
/// (or is closed).
pub fn unwrap<C: Conn<Error = Error>>(conn: &C) -> Option<Arc<Handle>> {
    match conn.exec(&Context::background(), UNWRAP_COMMAND, &[]) {
        Err(Error::Unwrap(handle)) => Some(handle),
        _ => None,
    }
}

struct StmtState<'c> {
    stmt: Option<Statement<'c>>,
    /// A cursor over this statement has not been closed yet
    rows_open: bool,
    /// Close was called while a cursor was open
    close_requested: bool,
}

/// A prepared statement behind the generic [`Stmt`] interface.
pub struct DriverStmt<'c> {
    conn: &'c Connection,
    state: Rc<RefCell<StmtState<'c>>>,
}

impl fmt::Debug for DriverStmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("DriverStmt")
            .field("sql", &state.stmt.as_ref().map(Statement::sql))
            .field("rows_open", &state.rows_open)
            .field("close_requested", &state.close_requested)
            .finish()
    }
}

impl<'c> DriverStmt<'c> {
    fn new(conn: &'c Connection, stmt: Statement<'c>, close_requested: bool) -> Self {
        Self {
            conn,
            state: Rc::new(RefCell::new(StmtState {
                stmt: Some(stmt),
                rows_open: false,
                close_requested,
            })),
        }
    }

    fn check_usable(&self, state: &StmtState<'c>) -> Result<()> {
        if self.conn.is_closed() {
            return Err(Error::BadConn);
        }
        if state.rows_open {
            return Err(self
                .conn
                .specific_error("previously returned rows still not closed"));
        }
        if state.stmt.is_none() {
            return Err(self.conn.specific_error("statement is closed"));
        }
        Ok(())
    }
}

impl<'c> Stmt for DriverStmt<'c> {
    type Error = Error;
    type Rows = DriverRows<'c>;

    fn num_input(&self) -> usize {
        self.state
            .borrow()
            .stmt
            .as_ref()
            .map_or(0, Statement::bind_parameter_count)
    }

    fn exec(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<ExecResult> {
        let mut state = self.state.borrow_mut();
        self.check_usable(&state)?;
        let Some(stmt) = state.stmt.as_mut() else {
            return Err(self.conn.specific_error("statement is closed"));
        };
        stmt.bind_named(args)?;
        let _guard = self.conn.watch_context(ctx)?;
        stmt.run()?;
        self.conn.result()
    }

    fn query(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<DriverRows<'c>> {
        let mut state = self.state.borrow_mut();
        self.check_usable(&state)?;
        let Some(stmt) = state.stmt.as_mut() else {
            return Err(self.conn.specific_error("statement is closed"));
        };
        stmt.bind_named(args)?;
        let columns = stmt.column_names();
        state.rows_open = true;
        Ok(DriverRows {
            conn: self.conn,
            state: Rc::clone(&self.state),
            ctx: ctx.clone(),
            info: Arc::new(ColumnInfo::new(columns.clone())),
            columns,
            closed: false,
            exhausted: false,
            failure: None,
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.rows_open {
            state.close_requested = true;
            return Ok(());
        }
        match state.stmt.take() {
            Some(stmt) => stmt.finalize(),
            None => Ok(()),
        }
    }
}

impl Drop for DriverStmt<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close statement on drop");
        }
    }
}

/// A cursor behind the generic [`Rows`] interface.
pub struct DriverRows<'c> {
    conn: &'c Connection,
    state: Rc<RefCell<StmtState<'c>>>,
    ctx: Context,
    columns: Vec<String>,
    info: Arc<ColumnInfo>,
    closed: bool,
    /// The last row was read or a step failed; the cursor never steps again
    exhausted: bool,
    /// Engine error of the failed step, returned again by later calls
    failure: Option<ConnError>,
}

impl fmt::Debug for DriverRows<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRows")
            .field("columns", &self.columns)
            .field("closed", &self.closed)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl DriverRows<'_> {
    /// Name of the Rust type the value of column `index` in the current row
    /// is read as.
    pub fn column_scan_type(&self, index: usize) -> &'static str {
        let state = self.state.borrow();
        state
            .stmt
            .as_ref()
            .map_or("()", |s| s.column_type(index).scan_type())
    }

    /// Declared type of column `index`, upper-cased; empty for expressions.
    pub fn column_database_type_name(&self, index: usize) -> String {
        let state = self.state.borrow();
        state
            .stmt
            .as_ref()
            .and_then(|s| s.column_decltype(index))
            .map(|t| t.to_ascii_uppercase())
            .unwrap_or_default()
    }
}

impl Rows for DriverRows<'_> {
    type Error = Error;

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> Result<Option<Row>> {
        if self.conn.is_closed() {
            return Err(Error::BadConn);
        }
        if self.closed {
            return Ok(None);
        }
        if let Some(err) = &self.failure {
            return Err(Error::Conn(err.clone()));
        }
        if self.exhausted {
            return Ok(None);
        }
        let mut state = self.state.borrow_mut();
        let Some(stmt) = state.stmt.as_mut() else {
            return Ok(None);
        };
        let _guard = self.conn.watch_context(&self.ctx)?;
        match stmt.next() {
            Ok(true) => Ok(Some(stmt.row_with(&self.info))),
            Ok(false) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(err) => {
                self.exhausted = true;
                if let Error::Conn(e) = &err {
                    self.failure = Some(e.clone());
                }
                Err(err)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.state.borrow_mut();
        state.rows_open = false;
        if state.close_requested {
            match state.stmt.take() {
                Some(stmt) => stmt.finalize(),
                None => Ok(()),
            }
        } else {
            let Some(stmt) = state.stmt.as_mut() else {
                return Ok(());
            };
            let reset = stmt.reset();
            stmt.clear_bindings()?;
            // Reset repeats the error of a failed step, already returned by next
            if self.failure.is_some() {
                Ok(())
            } else {
                reset
            }
        }
    }
}

impl Drop for DriverRows<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close rows on drop");
        }
    }
}

/// A transaction behind the generic [`Tx`] interface. Rolled back when
/// dropped unfinished.
#[derive(Debug)]
pub struct DriverTx<'c> {
    conn: &'c Connection,
    done: bool,
    read_only: bool,
}

fn reset_query_only(conn: &Connection) {
    if let Err(e) = conn.set_query_only(None, false) {
        tracing::warn!(error = %e, "failed to reset query_only");
    }
}

impl DriverTx<'_> {
    fn finish(&mut self, commit: bool) -> Result<()> {
        self.done = true;
        if self.conn.is_closed() {
            return Err(Error::BadConn);
        }
        let result = if commit {
            self.conn.commit()
        } else {
            self.conn.rollback()
        };
        if self.read_only {
            reset_query_only(self.conn);
        }
        result
    }
}

impl Tx for DriverTx<'_> {
    type Error = Error;

    fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    fn rollback(mut self) -> Result<()> {
        self.finish(false)
    }
}

impl Drop for DriverTx<'_> {
    fn drop(&mut self) {
        if self.done || self.conn.is_closed() {
            return;
        }
        tracing::debug!("rolling back unfinished transaction");
        if let Err(e) = self.finish(false) {
            tracing::warn!(error = %e, "rollback of dropped transaction failed");
        }
    }
}
