//! Type encoding and decoding between Rust and SQLite.
//!
//! SQLite has a simple type system with 5 storage classes:
//! - INTEGER: Signed integer (1, 2, 3, 4, 6, or 8 bytes)
//! - REAL: 8-byte IEEE floating point
//! - TEXT: UTF-8 or UTF-16 string
//! - BLOB: Binary data
//! - NULL: The NULL value
//!
//! We map these to/from sqldriver-core's Value type. Columns additionally
//! carry a type affinity derived from their declared type, which decides
//! whether a value may be read back as a timestamp.

#![allow(clippy::cast_possible_truncation)]

use crate::ffi;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqldriver_core::Value;
use std::ffi::{c_int, c_uchar, c_void};

/// Storage class of a column value in the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

impl ColumnType {
    pub(crate) fn from_code(code: c_int) -> Self {
        match code {
            ffi::SQLITE_INTEGER => ColumnType::Integer,
            ffi::SQLITE_FLOAT => ColumnType::Float,
            ffi::SQLITE_TEXT => ColumnType::Text,
            ffi::SQLITE_NULL => ColumnType::Null,
            _ => ColumnType::Blob,
        }
    }

    /// Name of the Rust type a value of this class is read as.
    pub fn scan_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "i64",
            ColumnType::Float => "f64",
            ColumnType::Text => "String",
            ColumnType::Null => "()",
            ColumnType::Blob => "Vec<u8>",
        }
    }
}

/// Column type affinity (see "Determination Of Column Affinity" in the
/// SQLite documentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    /// BLOB affinity, also used for expressions without a declared type.
    None,
    Real,
    Numeric,
}

impl Affinity {
    /// Derive the affinity from a declared column type.
    pub fn from_decltype(decltype: &str) -> Self {
        let t = decltype.to_ascii_uppercase();
        if t.contains("INT") {
            Affinity::Integer
        } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
            Affinity::Text
        } else if t.is_empty() || t.contains("BLOB") {
            Affinity::None
        } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

/// Format a timestamp for storage.
pub(crate) fn format_time(ts: &DateTime<Utc>, layout: &str) -> String {
    ts.format(layout).to_string()
}

/// Parse stored time text.
///
/// Tries `layout` first, then RFC 3339, then a zone-less layout read as UTC.
pub(crate) fn parse_time(text: &str, layout: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_str(text, layout) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc())
}

unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, s: &str) -> c_int {
    let bytes = s.as_bytes();
    // SAFETY: SQLITE_TRANSIENT makes SQLite copy the bytes before returning;
    // lengths beyond SQLITE_LIMIT_LENGTH are rejected with SQLITE_TOOBIG
    unsafe {
        ffi::sqlite3_bind_text64(
            stmt,
            index,
            bytes.as_ptr().cast(),
            bytes.len() as ffi::sqlite3_uint64,
            ffi::SQLITE_TRANSIENT(),
            ffi::SQLITE_UTF8 as c_uchar,
        )
    }
}

/// Bind a Value to a prepared statement parameter.
///
/// Timestamps are stored as text formatted with `time_layout`, or as unix
/// seconds when no layout is given.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    value: &Value,
    time_layout: Option<&str>,
) -> c_int {
    // SAFETY: guaranteed by the caller; every buffer is copied (TRANSIENT)
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),

            Value::Bool(b) => ffi::sqlite3_bind_int(stmt, index, c_int::from(*b)),

            Value::Int(v) => ffi::sqlite3_bind_int(stmt, index, *v),

            Value::BigInt(v) => ffi::sqlite3_bind_int64(stmt, index, *v),

            Value::Double(v) => ffi::sqlite3_bind_double(stmt, index, *v),

            Value::Text(s) => bind_text(stmt, index, s),

            // An empty slice may have a dangling pointer, which SQLite would
            // read as NULL
            Value::Bytes(b) if b.is_empty() => ffi::sqlite3_bind_zeroblob(stmt, index, 0),

            Value::Bytes(b) => ffi::sqlite3_bind_blob64(
                stmt,
                index,
                b.as_ptr().cast::<c_void>(),
                b.len() as ffi::sqlite3_uint64,
                ffi::SQLITE_TRANSIENT(),
            ),

            Value::Timestamp(ts) => match time_layout {
                Some(layout) => bind_text(stmt, index, &format_time(ts, layout)),
                None => ffi::sqlite3_bind_int64(stmt, index, ts.timestamp()),
            },

            // JSON stored as text
            Value::Json(json) => bind_text(stmt, index, &json.to_string()),
        }
    }
}

/// Read a column value from a result row, without any time interpretation.
///
/// # Safety
/// - `stmt` must be a valid prepared statement that has just returned SQLITE_ROW
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: guaranteed by the caller; the text/blob pointers are copied
    // before any other call on the statement
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_NULL => Value::Null,

            ffi::SQLITE_INTEGER => Value::BigInt(ffi::sqlite3_column_int64(stmt, index)),

            ffi::SQLITE_FLOAT => Value::Double(ffi::sqlite3_column_double(stmt, index)),

            ffi::SQLITE_TEXT => match column_text(stmt, index) {
                Some(s) => Value::Text(s),
                None => Value::Null,
            },

            _ => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len <= 0 {
                    Value::Bytes(Vec::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Bytes(slice.to_vec())
                }
            }
        }
    }
}

/// Read a TEXT column.
///
/// # Safety
/// Same as [`read_column`].
pub unsafe fn column_text(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: guaranteed by the caller
    unsafe {
        let ptr = ffi::sqlite3_column_text(stmt, index);
        if ptr.is_null() {
            return None;
        }
        let len = ffi::sqlite3_column_bytes(stmt, index);
        let slice = std::slice::from_raw_parts(ptr, len.max(0) as usize);
        Some(String::from_utf8_lossy(slice).into_owned())
    }
}

/// Get the column name from a result.
///
/// # Safety
/// - `stmt` must be a valid prepared statement
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: guaranteed by the caller
    unsafe { ffi::to_string(ffi::sqlite3_column_name(stmt, index)) }
}

/// Get the declared type of a result column, if it maps to a table column.
///
/// # Safety
/// Same as [`column_name`].
pub unsafe fn column_decltype(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: guaranteed by the caller
    unsafe { ffi::to_string(ffi::sqlite3_column_decltype(stmt, index)) }
}
