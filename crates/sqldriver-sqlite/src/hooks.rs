//! Engine callbacks registered on a connection.
//!
//! Each hook kind has at most one registration; setting a hook replaces the
//! previous one and passing `None` removes it. The closure is boxed and kept
//! in the connection's [`Hooks`] for as long as SQLite holds a pointer to it.
//! The old box is only dropped after SQLite has switched to the new callback.
//!
//! Panics inside a hook are caught at the FFI boundary, logged, and turned
//! into the most conservative answer for that hook (stop waiting, interrupt,
//! roll back, deny).

use crate::connection::Connection;
use crate::error::Result;
use crate::ffi;
use sqldriver_core::Context;
use std::any::Any;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::time::Duration;

/// Number of virtual machine instructions between two context polls.
pub const PROGRESS_INTERVAL: i32 = 100;

type BoxedHook = Box<dyn Any + Send>;

/// Closures currently registered with the engine.
#[derive(Default)]
pub(crate) struct Hooks {
    busy: Option<BoxedHook>,
    progress: Option<BoxedHook>,
    commit: Option<BoxedHook>,
    rollback: Option<BoxedHook>,
    update: Option<BoxedHook>,
    authorizer: Option<BoxedHook>,
    trace: Option<Box<TraceHooks>>,
}

impl Hooks {
    /// Forget the busy handler. SQLite replaces it whenever a busy timeout
    /// is set.
    pub(crate) fn clear_busy(&mut self) {
        self.busy = None;
    }
}

#[derive(Default)]
struct TraceHooks {
    stmt: Option<Box<dyn FnMut(&str) + Send>>,
    profile: Option<Box<dyn FnMut(&str, Duration) + Send>>,
}

impl TraceHooks {
    fn mask(&self) -> c_uint {
        let mut mask = 0;
        if self.stmt.is_some() {
            mask |= ffi::SQLITE_TRACE_STMT as c_uint;
        }
        if self.profile.is_some() {
            mask |= ffi::SQLITE_TRACE_PROFILE as c_uint;
        }
        mask
    }
}

/// Box `f` and return the box together with a thin pointer to the closure.
fn boxed<F: Send + 'static>(f: F) -> (BoxedHook, *mut c_void) {
    let mut hook = Box::new(f);
    let data = ptr::from_mut::<F>(&mut *hook).cast::<c_void>();
    let hook: BoxedHook = hook;
    (hook, data)
}

/// Kind of row change reported to an update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Unknown(i32),
}

impl Action {
    fn from_code(code: c_int) -> Self {
        match code {
            ffi::SQLITE_INSERT => Action::Insert,
            ffi::SQLITE_UPDATE => Action::Update,
            ffi::SQLITE_DELETE => Action::Delete,
            other => Action::Unknown(other),
        }
    }
}

/// What the authorizer is asked about.
///
/// `action` is one of the `SQLITE_*` authorizer action codes (for example
/// [`ffi::SQLITE_INSERT`] or [`ffi::SQLITE_READ`]); the meaning of `arg1`
/// and `arg2` depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext<'a> {
    pub action: i32,
    pub arg1: Option<&'a str>,
    pub arg2: Option<&'a str>,
    /// Database name ("main", "temp", ...)
    pub database: Option<&'a str>,
    /// Innermost trigger or view responsible for the access
    pub accessor: Option<&'a str>,
}

/// Authorizer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Allow the action
    Ok,
    /// Fail the statement with an authorization error
    Deny,
    /// Allow the statement but treat the column as NULL / skip the action
    Ignore,
}

impl Authorization {
    fn code(self) -> c_int {
        match self {
            Authorization::Ok => ffi::SQLITE_OK,
            Authorization::Deny => ffi::SQLITE_DENY,
            Authorization::Ignore => ffi::SQLITE_IGNORE,
        }
    }
}

/// Removes the progress handler it was created with when dropped.
#[must_use = "the progress handler is removed when the guard is dropped"]
pub struct ProgressGuard<'c> {
    conn: &'c Connection,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.conn.remove_progress_handler();
    }
}

impl std::fmt::Debug for ProgressGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressGuard").finish_non_exhaustive()
    }
}

unsafe fn borrowed_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: SQLite passes NUL-terminated strings valid for the callback
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe extern "C" fn call_busy<F>(data: *mut c_void, count: c_int) -> c_int
where
    F: FnMut(i32) -> bool,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::busy
        let f = unsafe { &mut *data.cast::<F>() };
        f(count)
    }));
    match result {
        Ok(retry) => c_int::from(retry),
        Err(_) => {
            tracing::error!("panic in busy handler");
            0
        }
    }
}

unsafe extern "C" fn call_progress<F>(data: *mut c_void) -> c_int
where
    F: FnMut() -> bool,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::progress
        let f = unsafe { &mut *data.cast::<F>() };
        f()
    }));
    match result {
        Ok(interrupt) => c_int::from(interrupt),
        Err(_) => {
            tracing::error!("panic in progress handler");
            1
        }
    }
}

unsafe extern "C" fn call_commit<F>(data: *mut c_void) -> c_int
where
    F: FnMut() -> bool,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::commit
        let f = unsafe { &mut *data.cast::<F>() };
        f()
    }));
    match result {
        Ok(rollback) => c_int::from(rollback),
        Err(_) => {
            tracing::error!("panic in commit hook");
            1
        }
    }
}

unsafe extern "C" fn call_rollback<F>(data: *mut c_void)
where
    F: FnMut(),
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::rollback
        let f = unsafe { &mut *data.cast::<F>() };
        f();
    }));
    if result.is_err() {
        tracing::error!("panic in rollback hook");
    }
}

unsafe extern "C" fn call_update<F>(
    data: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) where
    F: FnMut(Action, &str, &str, i64),
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::update; the
        // names are valid for the duration of the call
        let (f, db_name, table) = unsafe {
            (
                &mut *data.cast::<F>(),
                borrowed_str(db_name).unwrap_or_default(),
                borrowed_str(table).unwrap_or_default(),
            )
        };
        f(Action::from_code(op), db_name, table, rowid);
    }));
    if result.is_err() {
        tracing::error!("panic in update hook");
    }
}

unsafe extern "C" fn call_authorizer<F>(
    data: *mut c_void,
    action: c_int,
    arg1: *const c_char,
    arg2: *const c_char,
    database: *const c_char,
    accessor: *const c_char,
) -> c_int
where
    F: for<'a> FnMut(AuthContext<'a>) -> Authorization,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the F kept alive in Hooks::authorizer; the
        // strings are valid for the duration of the call
        let (f, ctx) = unsafe {
            (
                &mut *data.cast::<F>(),
                AuthContext {
                    action,
                    arg1: borrowed_str(arg1),
                    arg2: borrowed_str(arg2),
                    database: borrowed_str(database),
                    accessor: borrowed_str(accessor),
                },
            )
        };
        f(ctx)
    }));
    match result {
        Ok(verdict) => verdict.code(),
        Err(_) => {
            tracing::error!("panic in authorizer");
            ffi::SQLITE_DENY
        }
    }
}

unsafe extern "C" fn call_trace(
    event: c_uint,
    data: *mut c_void,
    p: *mut c_void,
    x: *mut c_void,
) -> c_int {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: data points to the TraceHooks kept alive in Hooks::trace
        let hooks = unsafe { &mut *data.cast::<TraceHooks>() };
        if event == ffi::SQLITE_TRACE_STMT as c_uint {
            if let Some(f) = hooks.stmt.as_mut() {
                // SAFETY: for STMT events x is the statement text
                if let Some(sql) = unsafe { borrowed_str(x.cast::<c_char>()) } {
                    f(sql);
                }
            }
        } else if event == ffi::SQLITE_TRACE_PROFILE as c_uint {
            if let Some(f) = hooks.profile.as_mut() {
                // SAFETY: for PROFILE events p is the statement and x points
                // to its run time in nanoseconds
                let (sql, nanos) = unsafe {
                    (
                        ffi::to_string(ffi::sqlite3_sql(p.cast::<ffi::sqlite3_stmt>()))
                            .unwrap_or_default(),
                        *x.cast::<i64>(),
                    )
                };
                f(&sql, Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)));
            }
        }
    }));
    if result.is_err() {
        tracing::error!("panic in trace hook");
    }
    0
}

impl Connection {
    /// Call `handler` with the retry count whenever a table is locked.
    /// Returning `false` gives up with `SQLITE_BUSY`.
    ///
    /// Replaces any busy timeout.
    pub fn busy_handler<F>(&self, handler: Option<F>) -> Result<()>
    where
        F: FnMut(i32) -> bool + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        let rc = match handler {
            Some(f) => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                let rc = unsafe { ffi::sqlite3_busy_handler(db, Some(call_busy::<F>), data) };
                hooks.busy = Some(hook);
                rc
            }
            None => {
                // SAFETY: db is open
                let rc = unsafe { ffi::sqlite3_busy_handler(db, None, ptr::null_mut()) };
                hooks.busy = None;
                rc
            }
        };
        drop(hooks);
        self.check(rc, "Conn.BusyHandler")
    }

    /// Call `handler` every `n_ops` virtual machine instructions. Returning
    /// `true` interrupts the running statement.
    pub fn progress_handler<F>(&self, n_ops: i32, handler: Option<F>) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        match handler {
            Some(f) if n_ops > 0 => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                unsafe { ffi::sqlite3_progress_handler(db, n_ops, Some(call_progress::<F>), data) };
                hooks.progress = Some(hook);
            }
            _ => {
                // SAFETY: db is open
                unsafe { ffi::sqlite3_progress_handler(db, 0, None, ptr::null_mut()) };
                hooks.progress = None;
            }
        }
        Ok(())
    }

    /// Remove the progress handler, if any.
    pub fn remove_progress_handler(&self) {
        if let Ok(db) = self.db() {
            // SAFETY: db is open
            unsafe { ffi::sqlite3_progress_handler(db, 0, None, ptr::null_mut()) };
        }
        self.hooks.borrow_mut().progress = None;
    }

    /// Interrupt statements on this connection once `ctx` is done.
    ///
    /// Installs a progress handler polling `ctx` every
    /// [`PROGRESS_INTERVAL`] instructions and returns a guard that removes
    /// it. Returns `None` for contexts that can never be done.
    pub fn watch_context(&self, ctx: &Context) -> Result<Option<ProgressGuard<'_>>> {
        if !ctx.can_be_done() {
            return Ok(None);
        }
        let ctx = ctx.clone();
        self.progress_handler(PROGRESS_INTERVAL, Some(move || ctx.is_done()))?;
        Ok(Some(ProgressGuard { conn: self }))
    }

    /// Call `hook` before each commit. Returning `true` turns the commit
    /// into a rollback.
    pub fn commit_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        match hook {
            Some(f) => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                unsafe { ffi::sqlite3_commit_hook(db, Some(call_commit::<F>), data) };
                hooks.commit = Some(hook);
            }
            None => {
                // SAFETY: db is open
                unsafe { ffi::sqlite3_commit_hook(db, None, ptr::null_mut()) };
                hooks.commit = None;
            }
        }
        Ok(())
    }

    /// Call `hook` whenever a transaction is rolled back.
    pub fn rollback_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        match hook {
            Some(f) => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                unsafe { ffi::sqlite3_rollback_hook(db, Some(call_rollback::<F>), data) };
                hooks.rollback = Some(hook);
            }
            None => {
                // SAFETY: db is open
                unsafe { ffi::sqlite3_rollback_hook(db, None, ptr::null_mut()) };
                hooks.rollback = None;
            }
        }
        Ok(())
    }

    /// Call `hook` with (action, database, table, rowid) for every row
    /// inserted, updated or deleted in a rowid table.
    pub fn update_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut(Action, &str, &str, i64) + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        match hook {
            Some(f) => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                unsafe { ffi::sqlite3_update_hook(db, Some(call_update::<F>), data) };
                hooks.update = Some(hook);
            }
            None => {
                // SAFETY: db is open
                unsafe { ffi::sqlite3_update_hook(db, None, ptr::null_mut()) };
                hooks.update = None;
            }
        }
        Ok(())
    }

    /// Consult `authorizer` for every action while statements are compiled.
    pub fn set_authorizer<F>(&self, authorizer: Option<F>) -> Result<()>
    where
        F: for<'a> FnMut(AuthContext<'a>) -> Authorization + Send + 'static,
    {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();
        let rc = match authorizer {
            Some(f) => {
                let (hook, data) = boxed(f);
                // SAFETY: db is open; data stays valid while stored in hooks
                let rc = unsafe { ffi::sqlite3_set_authorizer(db, Some(call_authorizer::<F>), data) };
                hooks.authorizer = Some(hook);
                rc
            }
            None => {
                // SAFETY: db is open
                let rc = unsafe { ffi::sqlite3_set_authorizer(db, None, ptr::null_mut()) };
                hooks.authorizer = None;
                rc
            }
        };
        drop(hooks);
        self.check(rc, "Conn.SetAuthorizer")
    }

    /// Call `hook` with the text of each statement as it starts running.
    pub fn trace<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.update_trace(|hooks| {
            hooks.stmt = hook.map(|f| Box::new(f) as Box<dyn FnMut(&str) + Send>);
        })
    }

    /// Call `hook` with the SQL and wall-clock run time of each finished
    /// statement.
    pub fn profile<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut(&str, Duration) + Send + 'static,
    {
        self.update_trace(|hooks| {
            hooks.profile = hook.map(|f| Box::new(f) as Box<dyn FnMut(&str, Duration) + Send>);
        })
    }

    fn update_trace(&self, change: impl FnOnce(&mut TraceHooks)) -> Result<()> {
        let db = self.db()?;
        let mut hooks = self.hooks.borrow_mut();

        // Unregister first so the callback never sees a half-updated set
        // SAFETY: db is open
        let rc = unsafe { ffi::sqlite3_trace_v2(db, 0, None, ptr::null_mut()) };
        if rc != ffi::SQLITE_OK {
            drop(hooks);
            return self.check(rc, "Conn.Trace");
        }

        let mut trace = hooks.trace.take().unwrap_or_default();
        change(&mut trace);
        let mask = trace.mask();
        if mask == 0 {
            return Ok(());
        }

        let data = ptr::from_mut::<TraceHooks>(&mut *trace).cast::<c_void>();
        // SAFETY: db is open; data stays valid while stored in hooks
        let rc = unsafe { ffi::sqlite3_trace_v2(db, mask, Some(call_trace), data) };
        hooks.trace = Some(trace);
        drop(hooks);
        self.check(rc, "Conn.Trace")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn setup() -> Connection {
        let conn = Connection::open_memory().unwrap();
        conn.exec_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn
    }

    const LONG_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000) SELECT count(*) FROM c";

    #[test]
    fn test_progress_handler_interrupts() {
        let conn = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        conn.progress_handler(
            PROGRESS_INTERVAL,
            Some(move || seen.fetch_add(1, Ordering::SeqCst) >= 3),
        )
        .unwrap();

        let mut stmt = conn.prepare(LONG_QUERY).unwrap();
        let err = stmt.next().unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        drop(stmt);

        conn.remove_progress_handler();
        let mut stmt = conn.prepare(LONG_QUERY).unwrap();
        assert!(stmt.next().unwrap());
        assert_eq!(stmt.get::<i64>(0).unwrap(), 1_000_000);
    }

    #[test]
    fn test_watch_context_cancelled() {
        let conn = setup();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        {
            let _guard = conn.watch_context(&ctx).unwrap();
            let mut stmt = conn.prepare(LONG_QUERY).unwrap();
            let err = stmt.next().unwrap_err();
            assert_eq!(err.code().map(ErrorCode::primary), Some(ErrorCode::INTERRUPT));
        }
        // Guard dropped: the same query now completes
        let mut stmt = conn.prepare(LONG_QUERY).unwrap();
        assert!(stmt.next().unwrap());
    }

    #[test]
    fn test_watch_background_context_is_noop() {
        let conn = setup();
        assert!(conn.watch_context(&Context::background()).unwrap().is_none());
    }

    #[test]
    fn test_commit_and_rollback_hooks() {
        let conn = setup();
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&events);
        conn.commit_hook(Some(move || {
            log.lock().unwrap().push("commit");
            false
        }))
        .unwrap();
        let log = Arc::clone(&events);
        conn.rollback_hook(Some(move || log.lock().unwrap().push("rollback")))
            .unwrap();

        conn.exec_batch("BEGIN; INSERT INTO t (v) VALUES ('a'); COMMIT")
            .unwrap();
        conn.exec_batch("BEGIN; INSERT INTO t (v) VALUES ('b'); ROLLBACK")
            .unwrap();
        assert_eq!(*events.lock().unwrap(), ["commit", "rollback"]);
    }

    #[test]
    fn test_rollback_hook_during_close_can_use_handle() {
        let mut conn = setup();
        conn.exec_batch("BEGIN; INSERT INTO t (v) VALUES ('open')")
            .unwrap();

        let handle = conn.handle();
        let interrupt = conn.interrupt_handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        conn.rollback_hook(Some(move || {
            interrupt.interrupt();
            log.lock().unwrap().push(handle.is_closed());
        }))
        .unwrap();

        // Closing with an open transaction rolls it back
        conn.close().unwrap();
        assert_eq!(*seen.lock().unwrap(), [true]);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_commit_hook_can_veto() {
        let conn = setup();
        conn.commit_hook(Some(|| true)).unwrap();
        let err = conn.exec_batch("INSERT INTO t (v) VALUES ('x')").unwrap_err();
        assert_eq!(err.code().map(ErrorCode::primary), Some(ErrorCode::CONSTRAINT));

        conn.commit_hook(None::<fn() -> bool>).unwrap();
        conn.exec_batch("INSERT INTO t (v) VALUES ('x')").unwrap();
        assert_eq!(conn.changes().unwrap(), 1);
    }

    #[test]
    fn test_update_hook() {
        let conn = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        conn.update_hook(Some(move |action: Action, db: &str, table: &str, rowid: i64| {
            log.lock()
                .unwrap()
                .push((action, db.to_string(), table.to_string(), rowid));
        }))
        .unwrap();

        conn.exec_batch(
            "INSERT INTO t (v) VALUES ('a'); UPDATE t SET v = 'b' WHERE id = 1; DELETE FROM t",
        )
        .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (Action::Insert, "main".to_string(), "t".to_string(), 1));
        assert_eq!(seen[1].0, Action::Update);
        assert_eq!(seen[2].0, Action::Delete);
    }

    #[test]
    fn test_authorizer_denies() {
        let conn = setup();
        conn.set_authorizer(Some(|ctx: AuthContext<'_>| {
            if ctx.action == ffi::SQLITE_DELETE {
                Authorization::Deny
            } else {
                Authorization::Ok
            }
        }))
        .unwrap();

        let err = conn.prepare("DELETE FROM t").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AUTH));
        conn.prepare("SELECT * FROM t").unwrap();

        conn.set_authorizer(None::<fn(AuthContext<'_>) -> Authorization>)
            .unwrap();
        conn.prepare("DELETE FROM t").unwrap();
    }

    #[test]
    fn test_trace_and_profile() {
        let conn = setup();
        let traced = Arc::new(Mutex::new(Vec::new()));
        let profiled = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&traced);
        conn.trace(Some(move |sql: &str| log.lock().unwrap().push(sql.to_string())))
            .unwrap();
        let count = Arc::clone(&profiled);
        conn.profile(Some(move |_sql: &str, _elapsed: Duration| {
            count.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        conn.exec_batch("SELECT 1").unwrap();
        assert_eq!(*traced.lock().unwrap(), ["SELECT 1"]);
        assert_eq!(profiled.load(Ordering::SeqCst), 1);

        // Removing the statement hook keeps profiling alive
        conn.trace(None::<fn(&str)>).unwrap();
        conn.exec_batch("SELECT 2").unwrap();
        assert_eq!(traced.lock().unwrap().len(), 1);
        assert_eq!(profiled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_busy_handler_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let path = path.to_str().unwrap();
        let a = Connection::open(path, crate::OpenFlags::create_read_write()).unwrap();
        let b = Connection::open(path, crate::OpenFlags::create_read_write()).unwrap();
        a.exec_batch("CREATE TABLE t (v)").unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        b.busy_handler(Some(move |count: i32| {
            seen.fetch_add(1, Ordering::SeqCst);
            count < 2
        }))
        .unwrap();

        a.exec_batch("BEGIN EXCLUSIVE").unwrap();
        let err = b.exec_batch("INSERT INTO t VALUES (1)").unwrap_err();
        assert_eq!(err.code().map(ErrorCode::primary), Some(ErrorCode::BUSY));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        a.exec_batch("COMMIT").unwrap();
    }

    #[test]
    fn test_hooks_fail_on_closed_connection() {
        let mut conn = setup();
        conn.close().unwrap();
        assert!(matches!(
            conn.commit_hook(Some(|| false)),
            Err(crate::Error::BadConn)
        ));
        assert!(conn.watch_context(&Context::background()).unwrap().is_none());
        let (ctx, _cancel) = Context::background().with_cancel();
        assert!(matches!(conn.watch_context(&ctx), Err(crate::Error::BadConn)));
    }
}
