//! Integration tests for the transactional command pipeline.
//!
//! Requires a running PostgreSQL server reachable via `DATABASE_URL`
//! (defaults to `postgres://postgres@localhost:5432/postgres`), matching the
//! connection style of the rest of the crate's integration tests.

use std::cell::RefCell;
use std::env;
use std::rc::Rc;

use zero_postgres::sync::Conn;
use zero_postgres::{Opts, SslMode, Transaction, TransactionMode};

fn get_conn() -> Conn {
    let host = env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = env::var("PGPORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5432);
    let opts = Opts {
        host: host.clone(),
        user: env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("PGPASSWORD").ok(),
        database: Some(env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string())),
        ssl_mode: SslMode::Disable,
        prefer_unix_socket: false,
        ..Default::default()
    };
    Conn::connect(&host, port, opts).expect("failed to connect")
}

#[test]
fn execute_simple_statement() {
    let mut conn = get_conn();
    let seen = Rc::new(RefCell::new(false));
    let seen2 = seen.clone();

    let tx = Transaction::new();
    tx.execute(
        "SELECT 1 AS one",
        move |_rs| {
            *seen2.borrow_mut() = true;
            Ok(())
        },
        |e| panic!("unexpected failure: {e}"),
    );

    let (_results, err) = conn.run(&tx).expect("pipeline run should not error");
    assert!(err.is_none());
    assert!(*seen.borrow());
}

#[test]
fn begin_commits_on_success() {
    let mut conn = get_conn();
    conn.query_drop("DROP TABLE IF EXISTS cmd_pipeline_commit").unwrap();
    conn.query_drop("CREATE TABLE cmd_pipeline_commit (id int)").unwrap();

    let tx = Transaction::new();
    let begin = tx.begin(
        TransactionMode::default(),
        |_| Ok(()),
        |e| panic!("begin failed: {e}"),
    );
    begin.execute(
        "INSERT INTO cmd_pipeline_commit VALUES (1)",
        |_| Ok(()),
        |e| panic!("insert failed: {e}"),
    );

    let (_results, err) = conn.run(&tx).expect("pipeline run should not error");
    assert!(err.is_none());

    let rows: Vec<(i32,)> = conn.query_collect("SELECT id FROM cmd_pipeline_commit").unwrap();
    assert_eq!(rows, vec![(1,)]);
}

#[test]
fn begin_rolls_back_on_child_failure() {
    let mut conn = get_conn();
    conn.query_drop("DROP TABLE IF EXISTS cmd_pipeline_rollback").unwrap();
    conn.query_drop("CREATE TABLE cmd_pipeline_rollback (id int)").unwrap();

    let begin_failed = Rc::new(RefCell::new(false));
    let begin_failed2 = begin_failed.clone();

    let tx = Transaction::new();
    let begin = tx.begin(
        TransactionMode::default(),
        |_| panic!("begin should not succeed"),
        move |_e| {
            *begin_failed2.borrow_mut() = true;
            Ok(())
        },
    );
    begin.execute(
        "INSERT INTO cmd_pipeline_rollback VALUES (1)",
        |_| Ok(()),
        |e| panic!("insert failed: {e}"),
    );
    begin.execute(
        "SELECT * FROM no_such_table_at_all",
        |_| panic!("bad statement should not succeed"),
        |_e| Ok(()),
    );

    let _ = conn.run(&tx).expect("pipeline run should not error at the wire level");
    assert!(*begin_failed.borrow());

    let rows: Vec<(i32,)> = conn.query_collect("SELECT id FROM cmd_pipeline_rollback").unwrap();
    assert!(rows.is_empty());
}

#[test]
fn savepoint_releases_independently_of_sibling_failure() {
    let mut conn = get_conn();
    conn.query_drop("DROP TABLE IF EXISTS cmd_pipeline_sp").unwrap();
    conn.query_drop("CREATE TABLE cmd_pipeline_sp (id int)").unwrap();

    let tx = Transaction::new();
    let begin = tx.begin(TransactionMode::default(), |_| Ok(()), |e| panic!("begin failed: {e}"));

    let sp_ok = begin.savepoint("sp_keep", |_| Ok(()), |e| panic!("sp_keep failed: {e}"));
    sp_ok.execute(
        "INSERT INTO cmd_pipeline_sp VALUES (1)",
        |_| Ok(()),
        |e| panic!("insert failed: {e}"),
    );

    let sp_bad = begin.savepoint("sp_discard", |_| panic!("sp_discard should fail"), |_e| Ok(()));
    sp_bad.execute(
        "SELECT * FROM no_such_table_either",
        |_| panic!("bad statement should not succeed"),
        |_e| Ok(()),
    );

    begin.execute(
        "INSERT INTO cmd_pipeline_sp VALUES (2)",
        |_| Ok(()),
        |e| panic!("insert failed: {e}"),
    );

    conn.run(&tx).expect("pipeline run should not error at the wire level");

    let rows: Vec<(i32,)> = conn
        .query_collect("SELECT id FROM cmd_pipeline_sp ORDER BY id")
        .unwrap();
    assert_eq!(rows, vec![(1,), (2,)]);
}

#[test]
fn prepare_then_execute_prepared_reuses_row_description() {
    let mut conn = get_conn();

    let tx = Transaction::new();
    tx.prepare(
        "cmd_pipeline_stmt",
        "SELECT $1::int4 + $2::int4 AS total",
        vec![
            zero_postgres::protocol::types::oid::INT4,
            zero_postgres::protocol::types::oid::INT4,
        ],
        |_| Ok(()),
        |e| panic!("prepare failed: {e}"),
    );

    let total = Rc::new(RefCell::new(0));
    let total2 = total.clone();
    tx.execute_prepared(
        "cmd_pipeline_stmt",
        (10i32, 32i32),
        move |rs| {
            let rows: Vec<(i32,)> = rs.rows()?;
            *total2.borrow_mut() = rows[0].0;
            Ok(())
        },
        |e| panic!("execute_prepared failed: {e}"),
    );

    let (_results, err) = conn.run(&tx).expect("pipeline run should not error");
    assert!(err.is_none());
    assert_eq!(*total.borrow(), 42);
}

#[test]
fn then_and_error_handlers_fire_based_on_parent_outcome() {
    let mut conn = get_conn();

    let then_fired = Rc::new(RefCell::new(false));
    let then_fired2 = then_fired.clone();
    let error_fired = Rc::new(RefCell::new(false));
    let error_fired2 = error_fired.clone();

    let tx = Transaction::new();
    let step = tx.execute("SELECT 1", |_| Ok(()), |e| panic!("unexpected failure: {e}"));
    step.then(move || {
        *then_fired2.borrow_mut() = true;
        Ok(())
    });
    step.error(move || {
        *error_fired2.borrow_mut() = true;
        Ok(())
    });

    conn.run(&tx).expect("pipeline run should not error");
    assert!(*then_fired.borrow());
    assert!(!*error_fired.borrow());
}

#[test]
fn null_into_non_optional_type_surfaces_value_is_null() {
    let mut conn = get_conn();

    let tx = Transaction::new();
    tx.execute(
        "SELECT NULL::int4 AS n",
        |rs| {
            let err = rs.rows::<(i32,)>().expect_err("NULL into i32 should fail to decode");
            assert!(matches!(err, zero_postgres::Error::ValueIsNull));
            Ok(())
        },
        |e| panic!("unexpected failure: {e}"),
    );

    let (_results, err) = conn.run(&tx).expect("pipeline run should not error");
    assert!(err.is_none());
}

#[test]
fn run_surfaces_last_collected_result_set() {
    let mut conn = get_conn();

    let tx = Transaction::new();
    tx.execute("SELECT 7 AS seven", |_| Ok(()), |e| panic!("unexpected failure: {e}"));

    let (results, err) = conn.run(&tx).expect("pipeline run should not error");
    assert!(err.is_none());
    let rows: Vec<(i32,)> = results.rows().unwrap();
    assert_eq!(rows, vec![(7,)]);
}
