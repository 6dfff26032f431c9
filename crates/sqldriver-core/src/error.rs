//! Error types shared across the driver contract.

use std::fmt;

/// Errors produced by a driver.
///
/// Drivers keep their own error enums so callers can match on the concrete
/// failure; the contract only needs to recognize one condition: a connection
/// that is no longer usable. A pool that sees [`is_bad_conn`] discards the
/// connection and retries on a fresh one.
///
/// [`is_bad_conn`]: DriverError::is_bad_conn
pub trait DriverError: std::error::Error + Send + Sync + 'static {
    /// The error reported when an operation is attempted on a closed
    /// connection.
    fn bad_conn() -> Self;

    /// Whether this error means the connection must be discarded.
    fn is_bad_conn(&self) -> bool;
}

/// A typed read from a [`Value`](crate::Value) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl TypeError {
    pub fn new(expected: &'static str, actual: impl Into<String>) -> Self {
        Self {
            expected,
            actual: actual.into(),
            column: None,
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

impl std::error::Error for TypeError {}
