//! Prepared statements.
//!
//! A [`Statement`] borrows its [`Connection`] and wraps one compiled native
//! statement. Dropping it (or calling [`Statement::finalize`]) hands the
//! native statement back to the connection's cache, reset and with its
//! bindings cleared, so the next `prepare` of the same SQL skips compilation.

#![allow(clippy::cast_possible_truncation)]

use crate::connection::Connection;
use crate::error::Result;
use crate::ffi;
use crate::types::{self, Affinity, ColumnType};
use chrono::DateTime;
use sqldriver_core::{ColumnInfo, FromValue, NamedValue, Row, Value};
use std::ffi::{CString, c_int};
use std::ptr;
use std::sync::Arc;

/// Owner of a native statement handle. Finalizes on drop.
#[derive(Debug)]
pub(crate) struct RawStatement {
    ptr: *mut ffi::sqlite3_stmt,
    /// SQL text the statement was prepared from; the cache key.
    key: String,
    /// Unparsed remainder of the SQL text.
    tail: String,
}

impl RawStatement {
    pub(crate) fn new(ptr: *mut ffi::sqlite3_stmt, key: String, tail: String) -> Self {
        Self { ptr, key, tail }
    }

    fn empty() -> Self {
        Self::new(ptr::null_mut(), String::new(), String::new())
    }

    pub(crate) fn ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.ptr
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn tail(&self) -> &str {
        &self.tail
    }

    pub(crate) fn reset(&self) -> c_int {
        if self.ptr.is_null() {
            return ffi::SQLITE_OK;
        }
        // SAFETY: ptr is a live statement
        unsafe { ffi::sqlite3_reset(self.ptr) }
    }

    pub(crate) fn clear_bindings(&self) -> c_int {
        if self.ptr.is_null() {
            return ffi::SQLITE_OK;
        }
        // SAFETY: ptr is a live statement
        unsafe { ffi::sqlite3_clear_bindings(self.ptr) }
    }

    pub(crate) fn finalize(mut self) -> c_int {
        let ptr = std::mem::replace(&mut self.ptr, ptr::null_mut());
        if ptr.is_null() {
            return ffi::SQLITE_OK;
        }
        // SAFETY: ptr is a live statement, finalized exactly once
        unsafe { ffi::sqlite3_finalize(ptr) }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr is a live statement, finalized exactly once
            unsafe {
                ffi::sqlite3_finalize(self.ptr);
            }
        }
    }
}

/// A prepared statement bound to a connection.
#[derive(Debug)]
pub struct Statement<'conn> {
    conn: &'conn Connection,
    raw: RawStatement,
    cacheable: bool,
}

impl<'conn> Statement<'conn> {
    pub(crate) fn new(conn: &'conn Connection, raw: RawStatement, cacheable: bool) -> Self {
        Self {
            conn,
            raw,
            cacheable,
        }
    }

    /// The connection this statement belongs to.
    pub fn conn(&self) -> &'conn Connection {
        self.conn
    }

    fn ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.raw.ptr()
    }

    fn op_error(&self, rc: c_int, op: &str) -> crate::Error {
        self.conn
            .error(rc, Some(format!("Stmt.{}({:?})", op, self.raw.key())))
    }

    /// Number of SQL parameters.
    pub fn bind_parameter_count(&self) -> usize {
        // SAFETY: ptr is a live statement
        let n = unsafe { ffi::sqlite3_bind_parameter_count(self.ptr()) };
        n.max(0) as usize
    }

    /// 1-based index of the parameter called `name`.
    ///
    /// The name is looked up as given (`:id`, `@id`, `$id`, `?1`); a bare
    /// name is also tried with each of the `:`, `@` and `$` prefixes.
    pub fn bind_parameter_index(&self, name: &str) -> Result<usize> {
        let lookup = |candidate: &str| -> usize {
            let Ok(c_name) = CString::new(candidate) else {
                return 0;
            };
            // SAFETY: ptr is a live statement, c_name is NUL-terminated
            let i = unsafe { ffi::sqlite3_bind_parameter_index(self.ptr(), c_name.as_ptr()) };
            i.max(0) as usize
        };

        let mut index = lookup(name);
        if index == 0 && !name.starts_with([':', '@', '$', '?']) {
            index = [":", "@", "$"]
                .iter()
                .map(|prefix| lookup(&format!("{}{}", prefix, name)))
                .find(|&i| i > 0)
                .unwrap_or(0);
        }
        if index == 0 {
            return Err(self
                .conn
                .specific_error(format!("invalid parameter name: {:?}", name)));
        }
        Ok(index)
    }

    /// Name of the 1-based parameter `index`, including its prefix.
    pub fn bind_parameter_name(&self, index: usize) -> Option<String> {
        // SAFETY: ptr is a live statement
        unsafe { ffi::to_string(ffi::sqlite3_bind_parameter_name(self.ptr(), index as c_int)) }
    }

    /// Bind one value at a 1-based position.
    pub fn bind_by_index(&mut self, index: usize, value: &Value) -> Result<()> {
        let layout = self.conn.time_layout();
        // SAFETY: ptr is a live statement; out-of-range indexes are reported
        // by SQLite as SQLITE_RANGE
        let rc = unsafe { types::bind_value(self.ptr(), index as c_int, value, layout) };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.op_error(rc, "Bind"))
        }
    }

    /// Forget any previous bindings and step position.
    fn rebind(&mut self, given: usize) -> Result<()> {
        self.raw.reset();
        self.raw.clear_bindings();
        let expected = self.bind_parameter_count();
        if given != expected {
            return Err(self.conn.specific_error(format!(
                "incorrect argument count for Stmt.Bind: have {} want {}",
                given, expected
            )));
        }
        Ok(())
    }

    /// Bind positional arguments, replacing every previous binding.
    pub fn bind(&mut self, args: &[Value]) -> Result<()> {
        self.rebind(args.len())?;
        for (i, value) in args.iter().enumerate() {
            self.bind_by_index(i + 1, value)?;
        }
        Ok(())
    }

    /// Bind named or ordinal arguments, replacing every previous binding.
    pub fn bind_named(&mut self, args: &[NamedValue]) -> Result<()> {
        self.rebind(args.len())?;
        for arg in args {
            let index = match arg.name.as_deref() {
                Some(name) if !name.is_empty() => self.bind_parameter_index(name)?,
                _ => arg.ordinal,
            };
            self.bind_by_index(index, &arg.value)?;
        }
        Ok(())
    }

    fn step(&mut self, op: &str) -> Result<bool> {
        // SAFETY: ptr is a live statement
        let rc = unsafe { ffi::sqlite3_step(self.ptr()) };
        match rc {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            // The statement stays where it failed; stepping again would
            // restart it from the first row
            _ => Err(self.op_error(rc, op)),
        }
    }

    /// Run the already-bound statement to completion, then reset it.
    pub fn run(&mut self) -> Result<()> {
        let result = loop {
            match self.step("Exec") {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.raw.reset();
        result
    }

    /// Bind `args` and run the statement to completion.
    pub fn exec(&mut self, args: &[Value]) -> Result<()> {
        self.bind(args)?;
        self.run()
    }

    /// Execute a DML statement and return the number of rows it changed.
    pub fn exec_dml(&mut self, args: &[Value]) -> Result<i64> {
        self.exec(args)?;
        self.conn.changes()
    }

    /// Execute an INSERT and return the new rowid, or `None` when no row
    /// was inserted.
    pub fn insert(&mut self, args: &[Value]) -> Result<Option<i64>> {
        if self.exec_dml(args)? == 0 {
            return Ok(None);
        }
        self.conn.last_insert_rowid().map(Some)
    }

    /// Advance to the next row. `Ok(false)` once the rows are exhausted.
    ///
    /// After an error or the last row, the statement must be [`reset`]
    /// before it is stepped again.
    ///
    /// [`reset`]: Self::reset
    pub fn next(&mut self) -> Result<bool> {
        self.step("Next")
    }

    /// Bind `args` and collect every row.
    pub fn query_all(&mut self, args: &[Value]) -> Result<Vec<Row>> {
        self.bind(args)?;
        let columns = Arc::new(ColumnInfo::new(self.column_names()));
        let mut rows = Vec::new();
        let result = loop {
            match self.next() {
                Ok(true) => rows.push(self.row_with(&columns)),
                Ok(false) => break Ok(rows),
                Err(e) => break Err(e),
            }
        };
        self.raw.reset();
        result
    }

    /// Rewind the statement, keeping its bindings.
    pub fn reset(&mut self) -> Result<()> {
        let rc = self.raw.reset();
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.op_error(rc, "Reset"))
        }
    }

    /// Reset every parameter to NULL.
    pub fn clear_bindings(&mut self) -> Result<()> {
        let rc = self.raw.clear_bindings();
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.op_error(rc, "ClearBindings"))
        }
    }

    /// Number of columns in the result set.
    pub fn column_count(&self) -> usize {
        // SAFETY: ptr is a live statement
        let n = unsafe { ffi::sqlite3_column_count(self.ptr()) };
        n.max(0) as usize
    }

    pub fn column_name(&self, index: usize) -> Option<String> {
        // SAFETY: ptr is a live statement; SQLite bounds-checks the index
        unsafe { types::column_name(self.ptr(), index as c_int) }
    }

    pub fn column_names(&self) -> Vec<String> {
        (0..self.column_count())
            .map(|i| self.column_name(i).unwrap_or_default())
            .collect()
    }

    /// Storage class of column `index` in the current row.
    pub fn column_type(&self, index: usize) -> ColumnType {
        // SAFETY: ptr is a live statement; SQLite bounds-checks the index
        ColumnType::from_code(unsafe { ffi::sqlite3_column_type(self.ptr(), index as c_int) })
    }

    /// Declared type of column `index`, when it is a table column.
    pub fn column_decltype(&self, index: usize) -> Option<String> {
        // SAFETY: ptr is a live statement; SQLite bounds-checks the index
        unsafe { types::column_decltype(self.ptr(), index as c_int) }
    }

    pub fn column_affinity(&self, index: usize) -> Affinity {
        Affinity::from_decltype(&self.column_decltype(index).unwrap_or_default())
    }

    /// Value of column `index` in the current row, as stored.
    pub fn column_value(&self, index: usize) -> Value {
        // SAFETY: ptr is a live statement; SQLite bounds-checks the index
        unsafe { types::read_column(self.ptr(), index as c_int) }
    }

    /// Value of column `index`, interpreting NUMERIC-affinity columns as
    /// timestamps when the connection asks for it.
    ///
    /// Text is parsed with the connection's time layout; integers are read
    /// as unix seconds when no layout is configured. Anything that does not
    /// parse is returned as stored.
    pub fn scan_value(&self, index: usize) -> Value {
        let conn = self.conn;
        if !conn.scan_numeric_as_time() {
            return self.column_value(index);
        }
        match (self.column_type(index), conn.time_layout()) {
            (ColumnType::Text, Some(layout)) if self.column_affinity(index) == Affinity::Numeric => {
                let value = self.column_value(index);
                if let Value::Text(text) = &value {
                    if let Some(ts) = types::parse_time(text, layout) {
                        return Value::Timestamp(ts);
                    }
                    tracing::warn!(column = index, %text, layout, "unable to parse time");
                }
                value
            }
            (ColumnType::Integer, None) if self.column_affinity(index) == Affinity::Numeric => {
                let value = self.column_value(index);
                match value.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)) {
                    Some(ts) => Value::Timestamp(ts),
                    None => value,
                }
            }
            _ => self.column_value(index),
        }
    }

    /// Typed value of column `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.scan_value(index);
        T::from_value(&value).map_err(|mut e| {
            e.column = self.column_name(index);
            e.into()
        })
    }

    /// The current row.
    pub fn row(&self) -> Row {
        self.row_with(&Arc::new(ColumnInfo::new(self.column_names())))
    }

    /// The current row, sharing `columns` with its siblings.
    pub fn row_with(&self, columns: &Arc<ColumnInfo>) -> Row {
        let values = (0..self.column_count())
            .map(|i| self.scan_value(i))
            .collect();
        Row::with_columns(Arc::clone(columns), values)
    }

    /// SQL text of this statement.
    pub fn sql(&self) -> String {
        // SAFETY: ptr is a live statement
        unsafe { ffi::to_string(ffi::sqlite3_sql(self.ptr())) }.unwrap_or_default()
    }

    /// Unparsed SQL following this statement.
    pub fn tail(&self) -> &str {
        self.raw.tail()
    }

    /// Whether the statement makes no direct changes to the database.
    pub fn readonly(&self) -> bool {
        // SAFETY: ptr is a live statement
        unsafe { ffi::sqlite3_stmt_readonly(self.ptr()) != 0 }
    }

    /// Whether the statement has been stepped but not run to completion or
    /// reset.
    pub fn busy(&self) -> bool {
        // SAFETY: ptr is a live statement
        unsafe { ffi::sqlite3_stmt_busy(self.ptr()) != 0 }
    }

    fn release(&mut self) -> c_int {
        let raw = std::mem::replace(&mut self.raw, RawStatement::empty());
        if self.cacheable {
            self.conn.cache.borrow_mut().put(raw)
        } else {
            raw.finalize()
        }
    }

    /// Return the statement to the cache, or finalize it when it cannot be
    /// cached.
    pub fn finalize(mut self) -> Result<()> {
        let rc = self.release();
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.conn.error(rc, Some("Stmt.Finalize".to_string())))
        }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
