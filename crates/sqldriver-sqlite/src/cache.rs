//! Prepared statement cache.
//!
//! Statements are keyed by the exact SQL text they were prepared from and kept
//! in most-recently-used order. A statement checked out with [`get`] is owned
//! by its user until it is handed back with [`put`], so statements in use are
//! never in the cache and a [`flush`] cannot pull one out from under an open
//! cursor.
//!
//! [`get`]: StatementCache::get
//! [`put`]: StatementCache::put
//! [`flush`]: StatementCache::flush

use crate::config::DEFAULT_CACHE_SIZE;
use crate::ffi;
use crate::statement::RawStatement;
use std::collections::VecDeque;
use std::ffi::c_int;

pub(crate) struct StatementCache {
    entries: VecDeque<RawStatement>,
    capacity: usize,
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Check out the most recent statement prepared from `sql`.
    pub(crate) fn get(&mut self, sql: &str) -> Option<RawStatement> {
        let index = self.entries.iter().position(|s| s.key() == sql)?;
        self.entries.remove(index)
    }

    /// Return a statement to the cache.
    ///
    /// The statement is reset and its bindings cleared. Statements that
    /// cannot be reused as-is (an unconsumed SQL tail, or caching disabled)
    /// are finalized instead, as is the least recently used entry when the
    /// cache overflows. Returns the SQLite status of the reset or finalize.
    pub(crate) fn put(&mut self, stmt: RawStatement) -> c_int {
        if stmt.is_null() {
            return ffi::SQLITE_OK;
        }
        if self.capacity == 0 || !stmt.tail().trim().is_empty() {
            return stmt.finalize();
        }
        let rc = stmt.reset();
        if rc != ffi::SQLITE_OK {
            stmt.finalize();
            return rc;
        }
        stmt.clear_bindings();
        self.entries.push_front(stmt);
        self.entries.truncate(self.capacity);
        ffi::SQLITE_OK
    }

    /// Finalize every cached statement.
    pub(crate) fn flush(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, finalizing entries that no longer fit.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.entries.truncate(capacity);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
