//! Error types for the SQLite driver.
//!
//! Failures fall into three shapes:
//!
//! - [`OpenError`] when no connection could be established. There is no
//!   handle left to query, so everything SQLite reported is captured eagerly.
//! - [`ConnError`] for an operation on a live connection. The message is a
//!   snapshot taken right after the failing call; the extended code and the
//!   file name are fetched lazily through a back-reference to the handle.
//! - [`ConnError`]s with code [`ErrorCode::SPECIFIC`] for conditions detected
//!   by this crate rather than by SQLite (wrong argument count, unsupported
//!   isolation level, rows still open...).
//!
//! All of them are folded into the [`Error`] enum callers match on.

use crate::connection::Handle;
use crate::ffi;
use sqldriver_core::{DriverError, TypeError};
use std::fmt;
use std::sync::Arc;

/// A SQLite result code, possibly extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Errors raised by this crate rather than by SQLite.
    pub const SPECIFIC: ErrorCode = ErrorCode(-1);

    pub const ERROR: ErrorCode = ErrorCode(ffi::SQLITE_ERROR);
    pub const INTERNAL: ErrorCode = ErrorCode(ffi::SQLITE_INTERNAL);
    pub const PERM: ErrorCode = ErrorCode(ffi::SQLITE_PERM);
    pub const ABORT: ErrorCode = ErrorCode(ffi::SQLITE_ABORT);
    pub const BUSY: ErrorCode = ErrorCode(ffi::SQLITE_BUSY);
    pub const LOCKED: ErrorCode = ErrorCode(ffi::SQLITE_LOCKED);
    pub const NOMEM: ErrorCode = ErrorCode(ffi::SQLITE_NOMEM);
    pub const READONLY: ErrorCode = ErrorCode(ffi::SQLITE_READONLY);
    pub const INTERRUPT: ErrorCode = ErrorCode(ffi::SQLITE_INTERRUPT);
    pub const IOERR: ErrorCode = ErrorCode(ffi::SQLITE_IOERR);
    pub const CORRUPT: ErrorCode = ErrorCode(ffi::SQLITE_CORRUPT);
    pub const NOTFOUND: ErrorCode = ErrorCode(ffi::SQLITE_NOTFOUND);
    pub const FULL: ErrorCode = ErrorCode(ffi::SQLITE_FULL);
    pub const CANTOPEN: ErrorCode = ErrorCode(ffi::SQLITE_CANTOPEN);
    pub const PROTOCOL: ErrorCode = ErrorCode(ffi::SQLITE_PROTOCOL);
    pub const EMPTY: ErrorCode = ErrorCode(ffi::SQLITE_EMPTY);
    pub const SCHEMA: ErrorCode = ErrorCode(ffi::SQLITE_SCHEMA);
    pub const TOOBIG: ErrorCode = ErrorCode(ffi::SQLITE_TOOBIG);
    pub const CONSTRAINT: ErrorCode = ErrorCode(ffi::SQLITE_CONSTRAINT);
    pub const MISMATCH: ErrorCode = ErrorCode(ffi::SQLITE_MISMATCH);
    pub const MISUSE: ErrorCode = ErrorCode(ffi::SQLITE_MISUSE);
    pub const NOLFS: ErrorCode = ErrorCode(ffi::SQLITE_NOLFS);
    pub const AUTH: ErrorCode = ErrorCode(ffi::SQLITE_AUTH);
    pub const FORMAT: ErrorCode = ErrorCode(ffi::SQLITE_FORMAT);
    pub const RANGE: ErrorCode = ErrorCode(ffi::SQLITE_RANGE);
    pub const NOTADB: ErrorCode = ErrorCode(ffi::SQLITE_NOTADB);
    pub const ROW: ErrorCode = ErrorCode(ffi::SQLITE_ROW);
    pub const DONE: ErrorCode = ErrorCode(ffi::SQLITE_DONE);

    /// The primary result code (the low byte of an extended code).
    #[must_use]
    pub const fn primary(self) -> ErrorCode {
        if self.0 < 0 {
            self
        } else {
            ErrorCode(self.0 & 0xFF)
        }
    }

    /// English description, as reported by `sqlite3_errstr`.
    pub fn description(self) -> String {
        let s = if self == ErrorCode::SPECIFIC {
            "wrapper specific error"
        } else {
            ffi::error_string(self.0)
        };
        if s.is_empty() {
            format!("errno {}", self.0)
        } else {
            s.to_string()
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Failure to open a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenError {
    pub code: ErrorCode,
    pub extended_code: i32,
    pub message: String,
    pub filename: String,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.filename.is_empty() {
            "(temporary)"
        } else {
            self.filename.as_str()
        };
        write!(f, "{}: open: ", file)?;
        let code = self.code.description();
        if self.message.is_empty() {
            f.write_str(&code)
        } else if code == self.message {
            f.write_str(&self.message)
        } else {
            write!(f, "{} ({})", self.message, code)
        }
    }
}

impl std::error::Error for OpenError {}

/// Failure of an operation on an open connection.
#[derive(Debug, Clone)]
pub struct ConnError {
    code: ErrorCode,
    message: String,
    details: Option<String>,
    handle: Option<Arc<Handle>>,
}

impl ConnError {
    pub(crate) fn new(
        handle: Option<Arc<Handle>>,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            handle,
        }
    }

    /// A wrapper-specific error that is not tied to any connection.
    pub fn specific(message: impl Into<String>) -> Self {
        Self::new(None, ErrorCode::SPECIFIC, message, None)
    }

    /// The result code, or [`ErrorCode::SPECIFIC`] for wrapper errors.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Context about where the error happened, e.g. `Conn.Close`.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// The extended result code currently recorded on the connection.
    ///
    /// Read lazily, so it must be inspected before the connection runs
    /// another statement. `None` once the connection is closed or for errors
    /// without a connection.
    pub fn extended_code(&self) -> Option<i32> {
        self.handle.as_ref().and_then(|h| h.extended_errcode())
    }

    /// File name of the `main` database of the originating connection.
    pub fn filename(&self) -> Option<String> {
        self.handle.as_ref().and_then(|h| h.filename("main"))
    }

    /// Whether this error was raised by the wrapper rather than SQLite.
    pub fn is_specific(&self) -> bool {
        self.code == ErrorCode::SPECIFIC
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) if !details.is_empty() => {
                write!(f, "{} ({}) ({})", self.message, details, self.code)
            }
            _ if !self.message.is_empty() => write!(f, "{} ({})", self.message, self.code),
            _ => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for ConnError {}

/// The error type of every fallible operation in this crate.
#[derive(Debug)]
pub enum Error {
    /// The database could not be opened
    Open(OpenError),
    /// An operation on an open connection failed
    Conn(ConnError),
    /// The connection is closed; callers should discard it and use another
    BadConn,
    /// Result of the reserved `unwrap` command, carrying the native handle
    Unwrap(Arc<Handle>),
    /// A column could not be read as the requested type
    Type(TypeError),
    /// Application error returned from a transaction body
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an application error.
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Custom(err.into())
    }

    /// Result code of an engine or wrapper failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Open(e) => Some(e.code),
            Error::Conn(e) => Some(e.code),
            _ => None,
        }
    }

    /// Whether a statement was aborted by an interrupt or a cancelled context.
    pub fn is_interrupt(&self) -> bool {
        self.code().map(ErrorCode::primary) == Some(ErrorCode::INTERRUPT)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open(e) => write!(f, "{}", e),
            Error::Conn(e) => write!(f, "{}", e),
            Error::BadConn => write!(f, "driver: bad connection"),
            Error::Unwrap(_) => write!(f, "native connection handle"),
            Error::Type(e) => write!(f, "{}", e),
            Error::Custom(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Open(e) => Some(e),
            Error::Conn(e) => Some(e),
            Error::Type(e) => Some(e),
            Error::Custom(e) => Some(e.as_ref()),
            Error::BadConn | Error::Unwrap(_) => None,
        }
    }
}

impl DriverError for Error {
    fn bad_conn() -> Self {
        Error::BadConn
    }

    fn is_bad_conn(&self) -> bool {
        matches!(self, Error::BadConn)
    }
}

impl From<OpenError> for Error {
    fn from(err: OpenError) -> Self {
        Error::Open(err)
    }
}

impl From<ConnError> for Error {
    fn from(err: ConnError) -> Self {
        Error::Conn(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
