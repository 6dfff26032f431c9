//! Connection and process-wide configuration.
//!
//! [`SqliteConfig`] describes a single connection and can be built in code or
//! deserialized with serde. [`GlobalConfig`] holds the handful of settings
//! SQLite only accepts once per process, before the library initializes.

use crate::ffi;
use serde::{Deserialize, Serialize};
use std::ffi::{c_char, c_int, c_void};
use std::ptr;
use std::sync::OnceLock;

/// Layout used to persist and parse time values, in `chrono` format syntax.
///
/// Produces e.g. `2024-03-01 12:30:00.000+00:00`.
pub const DEFAULT_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.3f%:z";

/// Default number of prepared statements kept per connection.
pub const DEFAULT_CACHE_SIZE: usize = 10;

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Multi-thread mode: the connection must not be used by two threads at once.
    pub no_mutex: bool,
    /// Serialized mode.
    pub full_mutex: bool,
    /// Enable shared cache mode.
    pub shared_cache: bool,
    /// Disable shared cache mode.
    pub private_cache: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    /// The flags the driver uses: URI names, multi-thread mode, read-write,
    /// create.
    pub fn driver_default() -> Self {
        Self {
            uri: true,
            no_mutex: true,
            ..Self::create_read_write()
        }
    }

    #[must_use]
    pub fn with_uri(mut self, uri: bool) -> Self {
        self.uri = uri;
        self
    }

    #[must_use]
    pub fn with_no_mutex(mut self, no_mutex: bool) -> Self {
        self.no_mutex = no_mutex;
        self
    }

    #[must_use]
    pub fn with_shared_cache(mut self, shared_cache: bool) -> Self {
        self.shared_cache = shared_cache;
        self
    }

    pub(crate) fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if self.shared_cache {
            flags |= ffi::SQLITE_OPEN_SHAREDCACHE;
        }
        if self.private_cache {
            flags |= ffi::SQLITE_OPEN_PRIVATECACHE;
        }

        // No access mode given: serialized read-write with creation
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX | ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, `":memory:"` for an in-memory database, or
    /// `""` for a private temporary file.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds; 0 leaves SQLite's default (no waiting).
    pub busy_timeout_ms: u32,
    /// Capacity of the prepared statement cache; 0 disables caching.
    pub cache_size: usize,
    /// Layout for persisting time values as text. `None` stores unix seconds.
    pub time_layout: Option<String>,
    /// Read NUMERIC-affinity columns as timestamps.
    pub scan_numeric_as_time: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::default(),
            busy_timeout_ms: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            time_layout: Some(DEFAULT_TIME_LAYOUT.to_string()),
            scan_numeric_as_time: false,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Persist and parse time values as text with `layout`.
    pub fn time_layout(mut self, layout: impl Into<String>) -> Self {
        self.time_layout = Some(layout.into());
        self
    }

    /// Persist time values as integer unix seconds.
    pub fn unix_time(mut self) -> Self {
        self.time_layout = None;
        self
    }

    pub fn scan_numeric_as_time(mut self, enabled: bool) -> Self {
        self.scan_numeric_as_time = enabled;
        self
    }
}

/// Process-wide SQLite settings.
///
/// SQLite accepts these only before it initializes, so they are applied at
/// most once per process: by an explicit [`GlobalConfig::init`], or from the
/// environment when the first connection is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Forward SQLite's internal log to `tracing` (target `sqlite`).
    pub log: bool,
    /// Collect memory allocation statistics.
    pub memstatus: bool,
}

static GLOBAL: OnceLock<GlobalConfig> = OnceLock::new();

impl GlobalConfig {
    /// Read `SQLITE_LOG` (any non-empty value enables log forwarding) and
    /// `SQLITE_MEMSTATUS` (`1`, `true`, `on` or `yes`).
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("SQLITE_LOG").ok().as_deref(),
            std::env::var("SQLITE_MEMSTATUS").ok().as_deref(),
        )
    }

    fn from_vars(log: Option<&str>, memstatus: Option<&str>) -> Self {
        let memstatus = memstatus.is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            )
        });
        Self {
            log: log.is_some_and(|v| !v.is_empty()),
            memstatus,
        }
    }

    /// Apply this configuration unless one was applied already.
    ///
    /// Returns the configuration in effect for the process.
    pub fn init(self) -> &'static GlobalConfig {
        GLOBAL.get_or_init(|| {
            self.apply();
            self
        })
    }

    /// The configuration in effect, if any was applied.
    pub fn current() -> Option<&'static GlobalConfig> {
        GLOBAL.get()
    }

    /// Apply the environment configuration if nothing was applied yet.
    pub(crate) fn ensure() -> &'static GlobalConfig {
        GLOBAL.get_or_init(|| {
            let config = Self::from_env();
            config.apply();
            config
        })
    }

    fn apply(self) {
        // SAFETY: both options take the documented argument types; SQLite
        // rejects them with SQLITE_MISUSE once initialized, which is reported
        // below.
        let rc = unsafe {
            ffi::sqlite3_config(ffi::SQLITE_CONFIG_MEMSTATUS, c_int::from(self.memstatus))
        };
        if rc != ffi::SQLITE_OK {
            tracing::warn!(rc, "unable to configure SQLite memory status");
        }
        if self.log {
            // SAFETY: log_callback matches the signature SQLite expects for
            // SQLITE_CONFIG_LOG and needs no user data
            let rc = unsafe {
                ffi::sqlite3_config(
                    ffi::SQLITE_CONFIG_LOG,
                    log_callback as extern "C" fn(*mut c_void, c_int, *const c_char),
                    ptr::null_mut::<c_void>(),
                )
            };
            if rc != ffi::SQLITE_OK {
                tracing::warn!(rc, "unable to install SQLite log callback");
            }
        }
        tracing::debug!(log = self.log, memstatus = self.memstatus, "SQLite configured");
    }
}

extern "C" fn log_callback(_: *mut c_void, code: c_int, msg: *const c_char) {
    // SAFETY: SQLite passes a NUL-terminated message valid for this call
    let msg = unsafe { ffi::to_string(msg) }.unwrap_or_default();
    match code & 0xFF {
        ffi::SQLITE_NOTICE => tracing::info!(target: "sqlite", code, "{}", msg),
        ffi::SQLITE_WARNING => tracing::warn!(target: "sqlite", code, "{}", msg),
        _ => tracing::warn!(target: "sqlite", code, error = %ffi::error_string(code), "{}", msg),
    }
}
