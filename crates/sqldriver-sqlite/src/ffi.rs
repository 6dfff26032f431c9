//! Low-level FFI surface of libsqlite3.
//!
//! The raw bindings come from `libsqlite3-sys` (bundled amalgamation). This
//! module re-exports them and adds the few safe helpers the rest of the crate
//! builds on.

use std::ffi::{CStr, c_char, c_int};

pub use libsqlite3_sys::*;

/// Get the SQLite library version as a string.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static string
    unsafe { static_str(sqlite3_libversion()) }.unwrap_or("unknown")
}

/// Get the SQLite library version as a number.
pub fn version_number() -> i32 {
    // SAFETY: sqlite3_libversion_number is always safe to call
    unsafe { sqlite3_libversion_number() }
}

/// Whether the library was compiled for thread-safe operation.
pub fn threadsafe() -> bool {
    // SAFETY: sqlite3_threadsafe only reads a compile-time constant
    unsafe { sqlite3_threadsafe() != 0 }
}

/// English description of a result code, or `""` when SQLite has none.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string (or NULL)
    unsafe { static_str(sqlite3_errstr(code)) }.unwrap_or("")
}

/// Borrow a NUL-terminated string owned by SQLite for the program lifetime.
///
/// # Safety
/// `ptr` must be NULL or point to a static, NUL-terminated string.
unsafe fn static_str(ptr: *const c_char) -> Option<&'static str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Copy a SQLite-owned C string into an owned `String`.
///
/// # Safety
/// `ptr` must be NULL or point to a NUL-terminated string that stays valid
/// for the duration of the call.
pub(crate) unsafe fn to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
