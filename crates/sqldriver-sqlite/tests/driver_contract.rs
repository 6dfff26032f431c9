//! The SQLite driver behind the generic contract.

use chrono::{TimeZone, Utc};
use sqldriver_core::{
    Conn, Context, Driver, DriverError, IsolationLevel, NamedValue, Rows, Stmt, Tx, TxOptions,
    Value,
};
use sqldriver_sqlite::{DriverConn, Error, ErrorCode, SqliteDriver};
use std::thread;
use std::time::Duration;

const ENDLESS_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10000000000) SELECT count(*) FROM c";
const MEDIUM_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000) SELECT count(*) FROM c";

fn open() -> DriverConn {
    let conn = SqliteDriver::new().open(":memory:").unwrap();
    conn.exec(
        &Context::background(),
        "CREATE TABLE items (id INTEGER PRIMARY KEY, qty INTEGER, label TEXT, added DATETIME)",
        &[],
    )
    .unwrap();
    conn
}

fn count(conn: &DriverConn) -> i64 {
    let mut rows = conn
        .query(&Context::background(), "SELECT count(*) FROM items", &[])
        .unwrap();
    rows.next().unwrap().unwrap().get_as::<i64>(0).unwrap()
}

fn pragma(conn: &DriverConn, name: &str) -> i64 {
    let mut rows = conn
        .query(&Context::background(), &format!("PRAGMA {}", name), &[])
        .unwrap();
    rows.next().unwrap().unwrap().get_as::<i64>(0).unwrap()
}

#[test]
fn insert_reports_rowid_and_affected_rows() {
    let conn = open();
    let ctx = Context::background();
    let res = conn
        .exec(
            &ctx,
            "INSERT INTO items (qty) VALUES (?)",
            &[NamedValue::positional(1, 42_i64)],
        )
        .unwrap();
    assert_eq!(res.last_insert_id, 1);
    assert_eq!(res.rows_affected, 1);

    let mut rows = conn
        .query(&ctx, "SELECT qty FROM items WHERE id = ?", &NamedValue::from_values([1_i64]))
        .unwrap();
    let row = rows.next().unwrap().unwrap();
    assert_eq!(row.get_named::<i64>("qty").unwrap(), 42);
    assert!(rows.next().unwrap().is_none());
}

#[test]
fn exec_without_arguments_runs_every_statement() {
    let conn = open();
    let res = conn
        .exec(
            &Context::background(),
            "INSERT INTO items (qty) VALUES (1); INSERT INTO items (qty) VALUES (2)",
            &[],
        )
        .unwrap();
    assert_eq!(res.last_insert_id, 2);
    assert_eq!(count(&conn), 2);
}

#[test]
fn second_query_is_rejected_without_disturbing_the_first() {
    let conn = open();
    let ctx = Context::background();
    conn.exec(&ctx, "INSERT INTO items (qty) VALUES (1), (2), (3)", &[])
        .unwrap();

    let mut stmt = conn
        .prepare(&ctx, "SELECT qty FROM items ORDER BY id")
        .unwrap();
    let mut first = stmt.query(&ctx, &[]).unwrap();
    assert_eq!(first.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 1);

    let err = stmt.query(&ctx, &[]).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SPECIFIC));
    assert!(err.to_string().contains("previously returned rows still not closed"));
    assert!(stmt.exec(&ctx, &[]).is_err());

    assert_eq!(first.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 2);
    assert_eq!(first.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 3);
    assert!(first.next().unwrap().is_none());
    // An exhausted cursor stays exhausted
    assert!(first.next().unwrap().is_none());
    first.close().unwrap();

    // Closed rows free the statement for another cursor
    let mut second = stmt.query(&ctx, &[]).unwrap();
    assert_eq!(second.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 1);
}

#[test]
fn rows_do_not_restart_after_a_step_error() {
    let conn = open();
    let ctx = Context::background();
    conn.exec(
        &ctx,
        "CREATE TABLE doc (x INTEGER); INSERT INTO doc VALUES (1), (2), (3)",
        &[],
    )
    .unwrap();

    // The second row holds malformed JSON
    let mut rows = conn
        .query(
            &ctx,
            "SELECT json(CASE WHEN x = 2 THEN char(123) ELSE x END) FROM doc",
            &[],
        )
        .unwrap();
    assert_eq!(rows.next().unwrap().unwrap().get_as::<String>(0).unwrap(), "1");
    let err = rows.next().unwrap_err();
    assert!(err.to_string().contains("malformed JSON"), "unexpected error: {err}");

    for _ in 0..3 {
        let again = rows.next().unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }
    rows.close().unwrap();
    assert!(rows.next().unwrap().is_none());
}

#[test]
fn named_and_positional_arguments() {
    let conn = open();
    let ctx = Context::background();
    let mut stmt = conn
        .prepare(&ctx, "INSERT INTO items (qty, label) VALUES (:qty, :label)")
        .unwrap();
    assert_eq!(stmt.num_input(), 2);
    stmt.exec(
        &ctx,
        &[
            NamedValue::named(":label", 2, "bolts"),
            NamedValue::named(":qty", 1, 7_i64),
        ],
    )
    .unwrap();
    stmt.exec(&ctx, &[NamedValue::positional(1, 9_i64), NamedValue::positional(2, "nuts")])
        .unwrap();

    let err = stmt
        .exec(&ctx, &[NamedValue::named("missing", 1, 1_i64), NamedValue::positional(2, "x")])
        .unwrap_err();
    assert!(err.to_string().contains("invalid parameter name"));

    let err = stmt
        .exec(&ctx, &[NamedValue::positional(1, 1_i64)])
        .unwrap_err();
    assert!(err.to_string().contains("have 1 want 2"));

    let mut rows = conn
        .query(&ctx, "SELECT label, qty FROM items ORDER BY id", &[])
        .unwrap();
    assert_eq!(rows.columns(), ["label", "qty"]);
    let row = rows.next().unwrap().unwrap();
    assert_eq!(row.get_named::<String>("label").unwrap(), "bolts");
    assert_eq!(row.get_named::<i64>("qty").unwrap(), 7);
    let row = rows.next().unwrap().unwrap();
    assert_eq!(row.get_named::<String>("label").unwrap(), "nuts");
}

#[test]
fn timestamps_round_trip() {
    let conn = open();
    let ctx = Context::background();
    let added = Utc.with_ymd_and_hms(2023, 11, 2, 9, 15, 0).unwrap();
    conn.exec(
        &ctx,
        "INSERT INTO items (added) VALUES (?)",
        &[NamedValue::positional(1, added)],
    )
    .unwrap();

    let mut rows = conn.query(&ctx, "SELECT added FROM items", &[]).unwrap();
    let row = rows.next().unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Timestamp(added)));
    assert_eq!(rows.column_database_type_name(0), "DATETIME");
}

#[test]
fn unsupported_isolation_level_has_no_side_effect() {
    let conn = open();
    let ctx = Context::background();
    for level in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Linearizable,
    ] {
        let err = conn
            .begin(&ctx, TxOptions::new().isolation(level).read_only(true))
            .unwrap_err();
        assert!(err.to_string().contains("is not supported"));
        assert!(conn.native().autocommit().unwrap());
        assert_eq!(pragma(&conn, "query_only"), 0);
    }
    conn.exec(&ctx, "INSERT INTO items (qty) VALUES (1)", &[])
        .unwrap();
}

#[test]
fn supported_isolation_levels() {
    let conn = open();
    let ctx = Context::background();

    let tx = conn
        .begin(&ctx, TxOptions::new().isolation(IsolationLevel::ReadUncommitted))
        .unwrap();
    assert_eq!(pragma(&conn, "read_uncommitted"), 1);
    tx.rollback().unwrap();

    let tx = conn
        .begin(&ctx, TxOptions::new().isolation(IsolationLevel::Serializable))
        .unwrap();
    assert_eq!(pragma(&conn, "read_uncommitted"), 0);
    conn.exec(&ctx, "INSERT INTO items (qty) VALUES (1)", &[])
        .unwrap();
    tx.commit().unwrap();
    assert_eq!(count(&conn), 1);
}

#[test]
fn cancellation_from_another_thread_interrupts_query() {
    let conn = open();
    let (ctx, cancel) = Context::background().with_cancel();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });

    let mut rows = conn.query(&ctx, ENDLESS_QUERY, &[]).unwrap();
    let err = rows.next().unwrap_err();
    assert!(err.is_interrupt(), "unexpected error: {err}");
    canceller.join().unwrap();
    drop(rows);

    // The polling hook is gone: a background query runs to completion
    let mut rows = conn
        .query(&Context::background(), MEDIUM_QUERY, &[])
        .unwrap();
    assert_eq!(rows.next().unwrap().unwrap().get_as::<i64>(0).unwrap(), 100_000);
}

#[test]
fn deadline_interrupts_exec() {
    let conn = open();
    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    let err = conn
        .exec(&ctx, &format!("CREATE TABLE big AS {}", ENDLESS_QUERY), &[])
        .unwrap_err();
    assert!(err.is_interrupt(), "unexpected error: {err}");
    assert!(ctx.err().is_some());
    conn.exec(&Context::background(), "SELECT 1", &[]).unwrap();
}

#[test]
fn interrupt_handle_aborts_from_another_thread() {
    let conn = open();
    let handle = conn.native().interrupt_handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.interrupt();
    });
    let mut stmt = conn.native().prepare(ENDLESS_QUERY).unwrap();
    let err = stmt.next().unwrap_err();
    assert!(err.is_interrupt());
    interrupter.join().unwrap();
}

#[test]
fn closed_connection_reports_bad_conn() {
    let mut conn = open();
    let ctx = Context::background();
    conn.close().unwrap();
    conn.close().unwrap();

    assert!(matches!(conn.ping(&ctx), Err(Error::BadConn)));
    assert!(conn.exec(&ctx, "SELECT 1", &[]).unwrap_err().is_bad_conn());
    assert!(conn.query(&ctx, "SELECT 1", &[]).unwrap_err().is_bad_conn());
    assert!(conn.prepare(&ctx, "SELECT 1").unwrap_err().is_bad_conn());
    assert!(conn.begin(&ctx, TxOptions::new()).unwrap_err().is_bad_conn());
    assert!(sqldriver_sqlite::unwrap(&conn).is_none());
    assert!(Error::bad_conn().is_bad_conn());
}

#[test]
fn ping_open_connection() {
    let conn = open();
    conn.ping(&Context::background()).unwrap();
}

#[test]
fn unwrap_exposes_native_handle() {
    let mut conn = open();
    let handle = sqldriver_sqlite::unwrap(&conn).unwrap();
    assert!(!handle.as_ptr().is_null());
    conn.close().unwrap();
    // The handle observes the close
    assert!(handle.is_closed());
}

#[test]
fn file_database_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contract.db");
    let name = path.to_str().unwrap();
    let ctx = Context::background();
    let driver = SqliteDriver::new();

    {
        let conn = driver.open(name).unwrap();
        conn.exec(&ctx, "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)", &[])
            .unwrap();
        let tx = conn.begin(&ctx, TxOptions::new()).unwrap();
        conn.exec(
            &ctx,
            "INSERT INTO kv VALUES (?, ?)",
            &NamedValue::from_values(["a", "1"]),
        )
        .unwrap();
        tx.commit().unwrap();
    }

    let conn = driver.open(name).unwrap();
    assert!(conn.native().filename("main").unwrap().ends_with("contract.db"));
    let mut rows = conn.query(&ctx, "SELECT v FROM kv WHERE k = 'a'", &[]).unwrap();
    assert_eq!(rows.next().unwrap().unwrap().get_as::<String>(0).unwrap(), "1");
}

#[test]
fn open_error_names_the_file() {
    let err = SqliteDriver::new()
        .open("file:/nonexistent/dir/x.db?mode=ro")
        .unwrap_err();
    match err {
        Error::Open(e) => assert_eq!(e.code, ErrorCode::CANTOPEN),
        other => panic!("unexpected error: {other}"),
    }
}
