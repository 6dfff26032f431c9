//! Transactions and savepoints.
//!
//! [`Connection::transaction`] runs a closure inside a transaction and nests:
//! the outermost call issues `BEGIN`, inner calls open a savepoint named
//! after the current depth. A failing inner body only unwinds its own
//! savepoint, so the enclosing body can recover and continue.
//!
//! ```no_run
//! use sqldriver_sqlite::{Connection, Error, TransactionType};
//!
//! let conn = Connection::open_memory()?;
//! conn.exec_batch("CREATE TABLE log (msg TEXT)")?;
//! conn.transaction(TransactionType::Immediate, |c| {
//!     c.exec("INSERT INTO log VALUES (?)", &["outer".into()])?;
//!     let inner = c.transaction(TransactionType::Deferred, |c| {
//!         c.exec("INSERT INTO log VALUES (?)", &["inner".into()])?;
//!         Err::<(), _>(Error::custom("changed my mind"))
//!     });
//!     assert!(inner.is_err());
//!     Ok(())
//! })?;
//! # Ok::<(), Error>(())
//! ```

use crate::connection::Connection;
use crate::error::{Error, Result};

/// How `BEGIN` acquires locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionType {
    /// No lock until the database is first read or written
    #[default]
    Deferred,
    /// Take the write lock immediately
    Immediate,
    /// Take the write lock and keep readers out (outside WAL mode)
    Exclusive,
}

impl TransactionType {
    fn begin_sql(self) -> &'static str {
        match self {
            TransactionType::Deferred => "BEGIN",
            TransactionType::Immediate => "BEGIN IMMEDIATE",
            TransactionType::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Quote `name` as an SQL string literal.
fn quote(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// Restores the nesting depth when a transaction body returns or panics.
struct DepthGuard<'c> {
    conn: &'c Connection,
    depth: u8,
    completed: bool,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.conn.n_transaction.set(self.depth);
        if !self.completed {
            tracing::warn!(depth = self.depth, "transaction body panicked, rolling back");
            self.conn.abort_level(self.depth, true);
        }
    }
}

impl Connection {
    /// Start a deferred transaction.
    pub fn begin(&self) -> Result<()> {
        self.begin_transaction(TransactionType::Deferred)
    }

    /// Start a transaction of the given type.
    pub fn begin_transaction(&self, t: TransactionType) -> Result<()> {
        self.exec_batch(t.begin_sql())?;
        tracing::debug!(kind = ?t, "transaction started");
        Ok(())
    }

    /// Commit the current transaction.
    ///
    /// When the commit fails and the transaction is still open, it is rolled
    /// back. A failure of that rollback is logged; the commit error is
    /// returned.
    pub fn commit(&self) -> Result<()> {
        let err = match self.exec_batch("COMMIT") {
            Ok(()) => {
                tracing::debug!("transaction committed");
                return Ok(());
            }
            Err(e) => e,
        };
        if !self.autocommit().unwrap_or(true) {
            if let Err(rollback_err) = self.rollback() {
                tracing::warn!(error = %rollback_err, commit_error = %err, "rollback after failed commit failed");
            }
        }
        Err(err)
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.exec_batch("ROLLBACK")?;
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    /// Open a savepoint.
    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.exec_batch(&format!("SAVEPOINT {}", quote(name)))?;
        tracing::trace!(name, "savepoint");
        Ok(())
    }

    /// Release the savepoint `name` and every savepoint opened after it.
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.exec_batch(&format!("RELEASE {}", quote(name)))?;
        tracing::trace!(name, "released savepoint");
        Ok(())
    }

    /// Undo everything done since the savepoint `name`, keeping it open.
    pub fn rollback_savepoint(&self, name: &str) -> Result<()> {
        self.exec_batch(&format!("ROLLBACK TO SAVEPOINT {}", quote(name)))?;
        tracing::trace!(name, "rolled back to savepoint");
        Ok(())
    }

    /// Number of [`transaction`](Self::transaction) calls currently running.
    pub fn transaction_depth(&self) -> u8 {
        self.n_transaction.get()
    }

    /// Run `f` inside a transaction.
    ///
    /// At depth 0 a transaction of type `t` is started; nested calls open a
    /// savepoint instead, and `t` is ignored. When `f` succeeds the
    /// transaction is committed (or the savepoint released); when that
    /// fails everything is rolled back and the failure returned.
    ///
    /// When `f` fails, a nested call only rolls back its savepoint, unless
    /// the error came from the engine ([`Error::Conn`]), in which case the
    /// whole transaction is rolled back. The error of `f` is returned as is.
    pub fn transaction<T, F>(&self, t: TransactionType, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let depth = self.n_transaction.get();
        if depth == u8::MAX {
            return Err(self.specific_error("too many nested transactions"));
        }
        if depth == 0 {
            self.begin_transaction(t)?;
        } else {
            self.savepoint(&depth.to_string())?;
        }
        self.n_transaction.set(depth + 1);

        let mut guard = DepthGuard {
            conn: self,
            depth,
            completed: false,
        };
        let result = f(self);
        guard.completed = true;
        drop(guard);

        match result {
            Ok(value) => {
                self.finish_level(depth)?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(depth, error = %err, "transaction body failed");
                self.abort_level(depth, matches!(err, Error::Conn(_)));
                Err(err)
            }
        }
    }

    fn finish_level(&self, depth: u8) -> Result<()> {
        let result = if depth == 0 {
            self.commit()
        } else {
            self.release_savepoint(&depth.to_string())
        };
        if let Err(err) = result {
            if !self.autocommit().unwrap_or(true) {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed release failed");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Undo the level opened at `depth`; `full` rolls back the whole
    /// transaction. Failures are logged only.
    fn abort_level(&self, depth: u8, full: bool) {
        if depth == 0 || full {
            if let Err(e) = self.rollback() {
                tracing::warn!(depth, error = %e, "rollback failed");
            }
            return;
        }
        let name = depth.to_string();
        if let Err(e) = self.rollback_savepoint(&name) {
            tracing::warn!(depth, error = %e, "rollback to savepoint failed");
        } else if let Err(e) = self.release_savepoint(&name) {
            tracing::warn!(depth, error = %e, "release of savepoint failed");
        }
    }
}
