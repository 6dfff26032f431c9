//! SQLite driver for sqldriver.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate wraps libsqlite3 in a [`Connection`] with a prepared
//! statement cache, nested transactions built on savepoints, and
//! cooperative cancellation through the engine's progress handler. The
//! [`driver`] module exposes it through the generic contract of
//! `sqldriver-core`.
//!
//! # Features
//!
//! - Statement cache keyed by SQL text, reused across bind/execute cycles
//! - [`Connection::transaction`] nesting through savepoints
//! - Cancellation and deadlines via [`sqldriver_core::Context`]
//! - Busy, progress, commit, rollback, update, authorizer and trace hooks
//! - Configurable time layout for storing and scanning timestamps
//!
//! # Example
//!
//! ```rust
//! use sqldriver_sqlite::{Connection, TransactionType};
//! use sqldriver_core::Value;
//!
//! let conn = Connection::open_memory()?;
//! conn.exec_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//!
//! let id = conn.transaction(TransactionType::Deferred, |c| {
//!     c.insert("INSERT INTO users (name) VALUES (?)", &[Value::from("Alice")])
//! })?;
//! assert_eq!(id, Some(1));
//!
//! let mut stmt = conn.prepare("SELECT name FROM users WHERE id = ?")?;
//! stmt.bind(&[Value::BigInt(1)])?;
//! assert!(stmt.next()?);
//! assert_eq!(stmt.get::<String>(0)?, "Alice");
//! # Ok::<(), sqldriver_sqlite::Error>(())
//! ```
//!
//! # Type Mapping
//!
//! | Rust Value | SQLite Type |
//! |-----------|-------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Null` | NULL |
//! | `Timestamp` | TEXT in the time layout, or INTEGER unix seconds |
//! | `Json` | TEXT |
//!
//! # Thread Safety
//!
//! `Connection` is `Send` but not `Sync`: one caller uses it at a time.
//! [`InterruptHandle`] is `Send + Sync` and may abort a running statement
//! from another thread.

mod cache;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod hooks;
pub mod statement;
pub mod transaction;
pub mod types;

pub use config::{DEFAULT_CACHE_SIZE, DEFAULT_TIME_LAYOUT, GlobalConfig, OpenFlags, SqliteConfig};
pub use connection::{Connection, Handle, InterruptHandle};
pub use driver::{DriverConn, DriverRows, DriverStmt, DriverTx, SqliteDriver, unwrap};
pub use error::{ConnError, Error, ErrorCode, OpenError, Result};
pub use hooks::{Action, AuthContext, Authorization, PROGRESS_INTERVAL, ProgressGuard};
pub use statement::Statement;
pub use transaction::TransactionType;
pub use types::{Affinity, ColumnType};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
