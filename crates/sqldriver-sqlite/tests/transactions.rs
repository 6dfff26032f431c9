//! Nested transactions on a real database file.

use sqldriver_core::{Conn, Context, Driver, Rows, Tx, TxOptions, Value};
use sqldriver_sqlite::{
    AuthContext, Authorization, Connection, Error, ErrorCode, OpenFlags, SqliteDriver,
    TransactionType, ffi,
};
use std::sync::{Arc, Mutex};

fn open_file(dir: &tempfile::TempDir) -> Connection {
    let path = dir.path().join("tx.db");
    let conn = Connection::open(path.to_str().unwrap(), OpenFlags::create_read_write()).unwrap();
    conn.exec_batch("CREATE TABLE IF NOT EXISTS ledger (level INTEGER, note TEXT)")
        .unwrap();
    conn
}

fn levels(conn: &Connection) -> Vec<i64> {
    let mut stmt = conn.prepare("SELECT level FROM ledger ORDER BY level").unwrap();
    let mut out = Vec::new();
    while stmt.next().unwrap() {
        out.push(stmt.get::<i64>(0).unwrap());
    }
    out
}

fn record(conn: &Connection, level: i64) -> sqldriver_sqlite::Result<()> {
    conn.exec(
        "INSERT INTO ledger VALUES (?, ?)",
        &[Value::BigInt(level), Value::from(format!("level {}", level))],
    )
}

/// Open `depth` nested transactions, recording each level; the body at
/// `fail_at` returns an application error after recording.
fn nest(conn: &Connection, level: i64, depth: i64, fail_at: Option<i64>) -> sqldriver_sqlite::Result<()> {
    if level > depth {
        return Ok(());
    }
    conn.transaction(TransactionType::Immediate, |c| {
        assert_eq!(i64::from(c.transaction_depth()), level);
        record(c, level)?;
        if fail_at == Some(level) {
            return Err(Error::custom(format!("level {} failed", level)));
        }
        // An inner failure is handled here and does not abort this level
        if let Err(e) = nest(c, level + 1, depth, fail_at) {
            assert!(matches!(e, Error::Custom(_)));
        }
        Ok(())
    })
}

#[test]
fn nesting_round_trip() {
    for depth in [0, 1, 3] {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_file(&dir);
        nest(&conn, 1, depth, None).unwrap();
        assert_eq!(conn.transaction_depth(), 0);
        assert!(conn.autocommit().unwrap());
        assert_eq!(levels(&conn), (1..=depth).collect::<Vec<_>>());

        // Committed to disk: a second connection sees the same rows
        let other = open_file(&dir);
        assert_eq!(levels(&other), (1..=depth).collect::<Vec<_>>());
    }
}

#[test]
fn innermost_failure_rolls_back_only_its_savepoint() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_file(&dir);
    nest(&conn, 1, 3, Some(3)).unwrap();
    assert_eq!(levels(&conn), [1, 2]);
    assert_eq!(conn.transaction_depth(), 0);
    assert!(conn.autocommit().unwrap());
}

#[test]
fn middle_failure_discards_everything_below_it() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_file(&dir);
    nest(&conn, 1, 3, Some(2)).unwrap();
    assert_eq!(levels(&conn), [1]);
}

#[test]
fn outermost_failure_rolls_back_the_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_file(&dir);
    let err = nest(&conn, 1, 3, Some(1)).unwrap_err();
    assert_eq!(err.to_string(), "level 1 failed");
    assert!(levels(&conn).is_empty());
    assert!(conn.autocommit().unwrap());
}

#[test]
fn failed_commit_is_rolled_back_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_file(&dir);
    conn.exec_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE account (id INTEGER PRIMARY KEY);
         CREATE TABLE entry (account INTEGER REFERENCES account (id) DEFERRABLE INITIALLY DEFERRED);",
    )
    .unwrap();

    let rollbacks = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&rollbacks);
    conn.rollback_hook(Some(move || *seen.lock().unwrap() += 1))
        .unwrap();

    let err = conn
        .transaction(TransactionType::Deferred, |c| {
            record(c, 1)?;
            c.exec("INSERT INTO entry VALUES (?)", &[Value::BigInt(404)])
        })
        .unwrap_err();
    assert_eq!(err.code().map(ErrorCode::primary), Some(ErrorCode::CONSTRAINT));
    assert!(*rollbacks.lock().unwrap() >= 1);
    assert!(conn.autocommit().unwrap());
    assert!(levels(&conn).is_empty());
}

#[test]
fn commit_error_survives_a_failed_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_file(&dir);
    conn.exec_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE account (id INTEGER PRIMARY KEY);
         CREATE TABLE entry (account INTEGER REFERENCES account (id) DEFERRABLE INITIALLY DEFERRED);",
    )
    .unwrap();
    conn.set_authorizer(Some(|ctx: AuthContext<'_>| {
        if ctx.action == ffi::SQLITE_TRANSACTION && ctx.arg1 == Some("ROLLBACK") {
            Authorization::Deny
        } else {
            Authorization::Ok
        }
    }))
    .unwrap();

    conn.begin().unwrap();
    conn.exec("INSERT INTO entry VALUES (?)", &[Value::BigInt(404)])
        .unwrap();
    let err = conn.commit().unwrap_err();
    assert_eq!(err.code().map(ErrorCode::primary), Some(ErrorCode::CONSTRAINT));
    assert!(err.to_string().contains("FOREIGN KEY"), "unexpected error: {err}");
    // The denied rollback left the transaction open
    assert!(!conn.autocommit().unwrap());

    conn.set_authorizer(None::<fn(AuthContext<'_>) -> Authorization>)
        .unwrap();
    conn.rollback().unwrap();
    assert!(conn.autocommit().unwrap());
}

#[test]
fn driver_transaction_commit_and_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driver.db");
    let conn = SqliteDriver::new().open(path.to_str().unwrap()).unwrap();
    let ctx = Context::background();
    conn.exec(&ctx, "CREATE TABLE t (v INTEGER)", &[]).unwrap();

    let tx = conn.begin(&ctx, TxOptions::new()).unwrap();
    conn.exec(&ctx, "INSERT INTO t VALUES (1)", &[]).unwrap();
    tx.commit().unwrap();

    let tx = conn.begin(&ctx, TxOptions::new()).unwrap();
    conn.exec(&ctx, "INSERT INTO t VALUES (2)", &[]).unwrap();
    tx.rollback().unwrap();

    let mut rows = conn.query(&ctx, "SELECT sum(v) FROM t", &[]).unwrap();
    assert_eq!(rows.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 1);
}

#[test]
fn driver_connection_still_nests_natively() {
    let conn = SqliteDriver::new().open(":memory:").unwrap();
    let native = conn.native();
    native.exec_batch("CREATE TABLE t (v INTEGER)").unwrap();
    native
        .transaction(TransactionType::Deferred, |c| {
            c.exec("INSERT INTO t VALUES (?)", &[Value::BigInt(1)])?;
            // The driver refuses to begin inside a native transaction
            let err = conn
                .begin(&Context::background(), TxOptions::new())
                .unwrap_err();
            assert!(err.to_string().contains("nested transactions are not supported"));
            c.transaction(TransactionType::Deferred, |c| {
                c.exec("INSERT INTO t VALUES (?)", &[Value::BigInt(2)])
            })
        })
        .unwrap();
    assert_eq!(native.total_changes().unwrap(), 2);
}
