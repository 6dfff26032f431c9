//! SQLite connection implementation.
//!
//! A [`Connection`] owns one native database handle together with its
//! prepared statement cache, its hook registrations and the nesting depth of
//! [`Connection::transaction`]. It is `Send` but not `Sync`: one caller uses
//! it at a time, and statements borrow it, so it cannot be closed while any
//! of them is alive.
//!
//! The native pointer itself lives in a shared [`Handle`] so that an
//! [`InterruptHandle`] on another thread, or a [`ConnError`] inspected after
//! the fact, can still reach it. Closing the connection clears the handle;
//! from then on every operation fails with [`Error::BadConn`].

#![allow(clippy::cast_possible_truncation)]

use crate::cache::StatementCache;
use crate::config::{GlobalConfig, OpenFlags, SqliteConfig};
use crate::error::{ConnError, Error, ErrorCode, OpenError, Result};
use crate::ffi;
use crate::hooks::Hooks;
use crate::statement::{RawStatement, Statement};
use sqldriver_core::{ExecResult, Value};
use std::cell::{Cell, RefCell};
use std::ffi::{CString, c_int};
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct RawDb(*mut ffi::sqlite3);

// SAFETY: the pointer is only dereferenced by SQLite, and every access from
// outside the owning connection goes through the Mutex in `Handle`.
unsafe impl Send for RawDb {}

/// Shared reference to a native connection handle.
///
/// Null once the connection is closed.
pub struct Handle {
    db: Mutex<RawDb>,
}

impl Handle {
    fn new(db: *mut ffi::sqlite3) -> Arc<Self> {
        Arc::new(Self {
            db: Mutex::new(RawDb(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RawDb> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The raw `sqlite3*`, or null when the connection is closed.
    ///
    /// Using the pointer is unsafe: it must not outlive the connection, and
    /// must not be used concurrently with the owning [`Connection`].
    pub fn as_ptr(&self) -> *mut ffi::sqlite3 {
        self.lock().0
    }

    pub fn is_closed(&self) -> bool {
        self.as_ptr().is_null()
    }

    pub(crate) fn extended_errcode(&self) -> Option<i32> {
        let db = self.lock();
        if db.0.is_null() {
            return None;
        }
        // SAFETY: the handle is open while the lock is held
        Some(unsafe { ffi::sqlite3_extended_errcode(db.0) })
    }

    pub(crate) fn filename(&self, db_name: &str) -> Option<String> {
        let name = CString::new(db_name).ok()?;
        let db = self.lock();
        if db.0.is_null() {
            return None;
        }
        // SAFETY: the handle is open while the lock is held
        unsafe { ffi::to_string(ffi::sqlite3_db_filename(db.0, name.as_ptr())) }
            .filter(|f| !f.is_empty())
    }

    fn interrupt(&self) {
        let db = self.lock();
        if !db.0.is_null() {
            // SAFETY: sqlite3_interrupt may be called from any thread while
            // the handle is open, which the lock guarantees
            unsafe { ffi::sqlite3_interrupt(db.0) }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("db", &self.as_ptr())
            .finish()
    }
}

/// Aborts the statement running on a connection, from any thread.
///
/// Becomes a no-op once the connection is closed.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    handle: Arc<Handle>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }
}

/// A connection to a SQLite database.
pub struct Connection {
    handle: Arc<Handle>,
    pub(crate) cache: RefCell<StatementCache>,
    pub(crate) hooks: RefCell<Hooks>,
    pub(crate) n_transaction: Cell<u8>,
    time_layout: Option<String>,
    scan_numeric_as_time: bool,
}

// SAFETY: the connection is opened in multi-thread or serialized mode, so it
// may move between threads; the Cell/RefCell fields keep it !Sync.
unsafe impl Send for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("n_transaction", &self.n_transaction.get())
            .field("time_layout", &self.time_layout)
            .field("scan_numeric_as_time", &self.scan_numeric_as_time)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a database with the given flags.
    ///
    /// `":memory:"` opens an in-memory database, `""` a private temporary
    /// file.
    pub fn open(filename: &str, flags: OpenFlags) -> Result<Self> {
        Self::open_with(&SqliteConfig::file(filename).flags(flags))
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open_with(&SqliteConfig::memory())
    }

    /// Open a new SQLite connection with the given configuration.
    pub fn open_with(config: &SqliteConfig) -> Result<Self> {
        GlobalConfig::ensure();
        if !ffi::threadsafe() {
            return Err(ConnError::specific(
                "sqlite library was not compiled for thread-safe operation",
            )
            .into());
        }

        let c_path = CString::new(config.path.as_str()).map_err(|_| OpenError {
            code: ErrorCode::SPECIFIC,
            extended_code: -1,
            message: "path contains a NUL byte".to_string(),
            filename: config.path.clone(),
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let mut err = OpenError {
                code: ErrorCode(rc),
                extended_code: rc,
                message: String::new(),
                filename: config.path.clone(),
            };
            if !db.is_null() {
                // SAFETY: db is a valid (failed) handle that must still be closed
                unsafe {
                    err.extended_code = ffi::sqlite3_extended_errcode(db);
                    err.message = ffi::to_string(ffi::sqlite3_errmsg(db)).unwrap_or_default();
                    ffi::sqlite3_close(db);
                }
            }
            tracing::debug!(path = %config.path, error = %err, "open failed");
            return Err(err.into());
        }
        if db.is_null() {
            return Err(ConnError::specific("sqlite succeeded without returning a database").into());
        }

        let conn = Self {
            handle: Handle::new(db),
            cache: RefCell::new(StatementCache::new(config.cache_size)),
            hooks: RefCell::new(Hooks::default()),
            n_transaction: Cell::new(0),
            time_layout: config.time_layout.clone(),
            scan_numeric_as_time: config.scan_numeric_as_time,
        };

        if config.busy_timeout_ms > 0 {
            conn.busy_timeout(Duration::from_millis(u64::from(config.busy_timeout_ms)))?;
        }
        if std::env::var_os("SQLITE_DEBUG").is_some_and(|v| !v.is_empty()) {
            conn.trace(Some(|sql: &str| tracing::trace!(target: "sqlite", sql, "TRACE")))?;
        }

        tracing::debug!(path = %config.path, flags, "opened SQLite connection");
        Ok(conn)
    }

    /// The native handle, or [`Error::BadConn`] once closed.
    pub(crate) fn db(&self) -> Result<*mut ffi::sqlite3> {
        let db = self.handle.as_ptr();
        if db.is_null() {
            Err(Error::BadConn)
        } else {
            Ok(db)
        }
    }

    /// Build the error for status `rc`, snapshotting the current message.
    pub(crate) fn error(&self, rc: c_int, details: Option<String>) -> Error {
        let Ok(db) = self.db() else {
            return Error::BadConn;
        };
        // SAFETY: db is open; the message is copied immediately
        let message = unsafe { ffi::to_string(ffi::sqlite3_errmsg(db)) }.unwrap_or_default();
        ConnError::new(Some(Arc::clone(&self.handle)), ErrorCode(rc), message, details).into()
    }

    /// An error raised by this crate, tied to this connection.
    pub(crate) fn specific_error(&self, message: impl Into<String>) -> Error {
        ConnError::new(
            Some(Arc::clone(&self.handle)),
            ErrorCode::SPECIFIC,
            message,
            None,
        )
        .into()
    }

    pub(crate) fn check(&self, rc: c_int, details: &str) -> Result<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.error(rc, Some(details.to_string())))
        }
    }

    /// The error for the most recent failed API call, if it failed.
    pub fn last_error(&self) -> Option<Error> {
        let db = self.db().ok()?;
        // SAFETY: db is open
        let rc = unsafe { ffi::sqlite3_errcode(db) };
        if rc == ffi::SQLITE_OK {
            None
        } else {
            Some(self.error(rc, None))
        }
    }

    /// Close the connection, finalizing any statement left behind.
    ///
    /// Closing a closed connection succeeds without calling into SQLite.
    pub fn close(&mut self) -> Result<()> {
        // Detach the pointer before calling into SQLite: hooks run inside
        // sqlite3_close and may reach the handle, which reads as closed
        let db = std::mem::replace(&mut self.handle.lock().0, ptr::null_mut());
        if db.is_null() {
            return Ok(());
        }

        self.cache.get_mut().flush();

        // SAFETY: db is open and no Statement can borrow `self` here
        let mut rc = unsafe { ffi::sqlite3_close(db) };

        if rc & 0xFF == ffi::SQLITE_BUSY {
            // SAFETY: db is still open after a BUSY close; each statement is
            // finalized once and the iteration restarts from the head
            unsafe {
                let mut stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
                while !stmt.is_null() {
                    let sql = ffi::to_string(ffi::sqlite3_sql(stmt)).unwrap_or_default();
                    if ffi::sqlite3_stmt_busy(stmt) != 0 {
                        tracing::warn!(code = ffi::SQLITE_MISUSE, %sql, "Dangling statement (not reset)");
                    } else {
                        tracing::warn!(code = ffi::SQLITE_MISUSE, %sql, "Dangling statement (not finalized)");
                    }
                    ffi::sqlite3_finalize(stmt);
                    stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
                }
                rc = ffi::sqlite3_close(db);
            }
        }

        if rc != ffi::SQLITE_OK {
            tracing::error!(rc, "error while closing connection");
            // SAFETY: db is still open since the close failed
            let message = unsafe { ffi::to_string(ffi::sqlite3_errmsg(db)) }.unwrap_or_default();
            self.handle.lock().0 = db;
            return Err(ConnError::new(
                Some(Arc::clone(&self.handle)),
                ErrorCode(rc),
                message,
                Some("Conn.Close".to_string()),
            )
            .into());
        }

        *self.hooks.get_mut() = Hooks::default();
        self.n_transaction.set(0);
        tracing::debug!("closed SQLite connection");
        Ok(())
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Prepare a statement, reusing a cached one when available.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let cached = self.cache.borrow_mut().get(sql);
        let raw = match cached {
            Some(raw) => raw,
            None => self.prepare_raw(sql)?,
        };
        if raw.is_null() {
            return Err(self.specific_error(format!("no SQL statement in {:?}", sql)));
        }
        Ok(Statement::new(self, raw, true))
    }

    /// Compile the first statement of `sql`. The result is null for input
    /// holding only whitespace or comments.
    pub(crate) fn prepare_raw(&self, sql: &str) -> Result<RawStatement> {
        let db = self.db()?;
        let c_sql = CString::new(sql)
            .map_err(|_| self.specific_error("SQL contains a NUL byte"))?;

        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const std::ffi::c_char = ptr::null();

        // SAFETY: All pointers are valid; nByte includes the NUL terminator
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                (c_sql.as_bytes().len() + 1) as c_int,
                &mut stmt,
                &mut tail,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.error(rc, Some(format!("Conn.Prepare({:?})", sql))));
        }

        let consumed = if tail.is_null() {
            sql.len()
        } else {
            // SAFETY: tail points into c_sql
            unsafe { tail.offset_from(c_sql.as_ptr()) }.max(0) as usize
        };
        let rest = sql.get(consumed..).unwrap_or("");
        Ok(RawStatement::new(stmt, sql.to_string(), rest.to_string()))
    }

    /// Execute one or more non-parameterized statements separated by
    /// semicolons. Stops at the first failure and bypasses the cache.
    pub fn exec_batch(&self, sql: &str) -> Result<()> {
        let db = self.db()?;
        let c_sql = CString::new(sql)
            .map_err(|_| self.specific_error("SQL contains a NUL byte"))?;
        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), ptr::null_mut())
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.error(rc, None))
        }
    }

    /// Execute one or more parameterized statements separated by semicolons.
    ///
    /// Each statement consumes as many of `args` as it has parameters; the
    /// last one receives whatever is left. Not meant for queries returning
    /// rows.
    pub fn exec(&self, sql: &str, args: &[Value]) -> Result<()> {
        let mut rest = sql.to_string();
        let mut args = args;
        while !rest.is_empty() {
            let raw = self.prepare_raw(&rest)?;
            let tail = raw.tail().to_string();
            if tail.len() >= rest.len() {
                break;
            }
            if !raw.is_null() {
                let mut stmt = Statement::new(self, raw, false);
                let count = stmt.bind_parameter_count();
                let sub = if !tail.is_empty() && args.len() >= count {
                    let (head, remaining) = args.split_at(count);
                    args = remaining;
                    head
                } else {
                    args
                };
                stmt.exec(sub)?;
                stmt.finalize()?;
            }
            rest = tail;
        }
        Ok(())
    }

    /// Execute a DML statement and return the number of rows it changed.
    pub fn exec_dml(&self, sql: &str, args: &[Value]) -> Result<i64> {
        self.prepare(sql)?.exec_dml(args)
    }

    /// Execute an INSERT and return the new rowid, or `None` when no row
    /// was inserted.
    pub fn insert(&self, sql: &str, args: &[Value]) -> Result<Option<i64>> {
        self.prepare(sql)?.insert(args)
    }

    /// Whether the named database (`"main"`, `"temp"`, attached name) is
    /// read-only.
    pub fn readonly(&self, db_name: &str) -> Result<bool> {
        let db = self.db()?;
        let name = CString::new(db_name)
            .map_err(|_| self.specific_error("database name contains a NUL byte"))?;
        // SAFETY: db is open, name is NUL-terminated
        match unsafe { ffi::sqlite3_db_readonly(db, name.as_ptr()) } {
            -1 => Err(self.specific_error(format!("{:?} is not the name of a database", db_name))),
            rv => Ok(rv == 1),
        }
    }

    /// File name of the named database; `None` for in-memory and temporary
    /// databases, or once closed.
    pub fn filename(&self, db_name: &str) -> Option<String> {
        self.handle.filename(db_name)
    }

    /// Abort the statement currently running on this connection.
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    /// A handle to interrupt this connection from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            handle: Arc::clone(&self.handle),
        }
    }

    /// The shared native handle.
    pub fn handle(&self) -> Arc<Handle> {
        Arc::clone(&self.handle)
    }

    /// Rows changed by the most recently completed statement.
    pub fn changes(&self) -> Result<i64> {
        let db = self.db()?;
        // SAFETY: db is open
        Ok(i64::from(unsafe { ffi::sqlite3_changes(db) }))
    }

    /// Rows changed since the connection was opened.
    pub fn total_changes(&self) -> Result<i64> {
        let db = self.db()?;
        // SAFETY: db is open
        Ok(i64::from(unsafe { ffi::sqlite3_total_changes(db) }))
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let db = self.db()?;
        // SAFETY: db is open
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
    }

    /// Snapshot of the last insert rowid and the changed row count.
    pub fn result(&self) -> Result<ExecResult> {
        Ok(ExecResult {
            last_insert_id: self.last_insert_rowid()?,
            rows_affected: self.changes()?,
        })
    }

    /// Whether the connection is in autocommit mode (no open transaction).
    pub fn autocommit(&self) -> Result<bool> {
        let db = self.db()?;
        // SAFETY: db is open
        Ok(unsafe { ffi::sqlite3_get_autocommit(db) } != 0)
    }

    /// Wait up to `timeout` for locks to clear. Replaces any busy handler;
    /// a zero duration turns waiting off.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let db = self.db()?;
        let ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        // SAFETY: db is open
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, ms) };
        self.hooks.borrow_mut().clear_busy();
        self.check(rc, "Conn.BusyTimeout")
    }

    /// Toggle `PRAGMA query_only` on `db_name` (or the main database).
    pub fn set_query_only(&self, db_name: Option<&str>, query_only: bool) -> Result<()> {
        let prefix = db_name
            .map(|name| format!("\"{}\".", name.replace('"', "\"\"")))
            .unwrap_or_default();
        self.exec_batch(&format!(
            "PRAGMA {}query_only={}",
            prefix,
            i32::from(query_only)
        ))
    }

    /// Number of statements the cache keeps; 0 disables caching.
    pub fn set_cache_size(&self, size: usize) {
        self.cache.borrow_mut().set_capacity(size);
    }

    pub fn cache_size(&self) -> usize {
        self.cache.borrow().capacity()
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Layout used to store and parse time values; `None` means unix seconds.
    pub fn time_layout(&self) -> Option<&str> {
        self.time_layout.as_deref()
    }

    pub fn set_time_layout(&mut self, layout: Option<String>) {
        self.time_layout = layout;
    }

    /// Whether NUMERIC-affinity columns are read as timestamps.
    pub fn scan_numeric_as_time(&self) -> bool {
        self.scan_numeric_as_time
    }

    pub fn set_scan_numeric_as_time(&mut self, enabled: bool) {
        self.scan_numeric_as_time = enabled;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "failed to close connection on drop");
        }
    }
}
