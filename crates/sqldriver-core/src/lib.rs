//! Core types and traits for sqldriver.
//!
//! This crate provides the engine-independent half of the driver stack:
//!
//! - [`driver`] - the generic `Driver`/`Conn`/`Stmt`/`Rows`/`Tx` contract a
//!   higher-level query API programs against
//! - [`Value`] and [`Row`] for parameter binding and result fetching
//! - [`Context`] for cooperative cancellation and deadlines
//! - [`DriverError`] for the errors that cross the contract boundary

pub mod context;
pub mod driver;
pub mod error;
pub mod row;
pub mod value;

pub use context::{CancelHandle, Context, ContextError};
pub use driver::{
    Conn, Driver, ExecResult, IsolationLevel, NamedValue, Rows, Stmt, Tx, TxOptions,
};
pub use error::{DriverError, TypeError};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
