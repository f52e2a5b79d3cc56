//! End-to-end protocol scenarios against the stub driver
//!
//! Each test drives a real session loop over a socketpair with scripted
//! wire bytes and asserts on the exact responses.

mod common;

use common::{
    build_controller, default_controller, start_session, TestClient, WireField, TEST_PASSWORD,
    TEST_USER,
};
use sqlrelay_common::config::{LimitsConfig, SessionConfig};
use sqlrelay_connection::session::SessionOutcome;
use sqlrelay_connection::CursorState;
use sqlrelay_driver::stub::{fixture_table, StubBehavior};
use sqlrelay_driver::{BindValue, ColumnType};
use sqlrelay_protocol::binds::{InputBind, OutputBindSpec};

#[test]
fn simple_select_one_batch() {
    // S1: rsbs=0 delivers the whole table in one batch
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let rs = client.select("select * from t", 0).unwrap();

    assert_eq!(rs.column_count, 3);
    assert_eq!(rs.columns.len(), 3);
    assert_eq!(rs.columns[0].name, "id");
    assert_eq!(rs.actual_rows, Some(5));
    assert_eq!(rs.rows.len(), 5);
    assert!(rs.end_of_result_set);

    // Values survive bit-for-bit
    assert_eq!(rs.rows[0][0], WireField::Integer(1));
    assert_eq!(rs.rows[0][1], WireField::Text(b"ada".to_vec()));
    assert_eq!(rs.rows[1][2], WireField::Double(98.25));
    assert_eq!(rs.rows[4][1], WireField::Null);

    client.end_session();
    let (controller, outcome) = server.join().unwrap();
    assert_eq!(outcome, SessionOutcome::EndSession);

    // Property: after a session every cursor is free (nothing suspended)
    for cursor in controller.cursors().iter() {
        assert_eq!(cursor.state(), CursorState::Free);
    }
}

#[test]
fn paged_fetch_batches_of_two() {
    // S2: rsbs=2 delivers 2,2,1 with the end marker on the last batch
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let first = client.select("select * from t", 2).unwrap();
    assert_eq!(first.rows.len(), 2);
    assert!(!first.end_of_result_set);

    let second = client.fetch(first.cursor_id, 0, 2).unwrap();
    assert_eq!(second.rows.len(), 2);
    assert!(!second.end_of_result_set);

    let third = client.fetch(first.cursor_id, 0, 2).unwrap();
    assert_eq!(third.rows.len(), 1);
    assert!(third.end_of_result_set);

    // Sum of returned rows equals the driver's row count
    assert_eq!(first.rows.len() + second.rows.len() + third.rows.len(), 5);

    client.end_session();
    server.join().unwrap();
}

#[test]
fn output_bind_integer_round_trip() {
    // S4: an INTEGER output bind comes back with the scripted value
    let mut behavior = StubBehavior::default();
    behavior
        .output_values
        .insert("n".to_string(), BindValue::Integer(42));
    let (controller, _stub) = build_controller(
        vec![fixture_table()],
        behavior,
        LimitsConfig::default(),
        SessionConfig::default(),
    );
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let rs = client
        .new_query(
            b"",
            b"call get_n(?)",
            &[],
            &[OutputBindSpec {
                name: "n".into(),
                tag: sqlrelay_protocol::consts::BindTag::Integer,
                max_size: 0,
            }],
            true,
            0,
            0,
        )
        .unwrap();

    assert_eq!(rs.output_values, vec![BindValue::Integer(42)]);
    assert_eq!(rs.column_count, 0);
    assert!(rs.rows.is_empty());

    client.end_session();
    server.join().unwrap();
}

#[test]
fn query_length_limit_keeps_session_alive() {
    // S6: an oversized query answers 900002 and the session continues
    let limits = LimitsConfig {
        max_query_size: 32,
        ..Default::default()
    };
    let (controller, _stub) = build_controller(
        vec![fixture_table()],
        StubBehavior::default(),
        limits,
        SessionConfig::default(),
    );
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let long_query = format!("select * from t where x = '{}'", "y".repeat(64));
    let err = client.select(&long_query, 0).unwrap_err();
    assert_eq!(err.code, 900002);
    assert_eq!(err.message, "Maximum query length exceeded.");
    assert!(!err.disconnect);

    // Session is still usable
    client.ping().unwrap();
    let rs = client.select("select * from t", 0).unwrap();
    assert_eq!(rs.rows.len(), 5);

    client.end_session();
    server.join().unwrap();
}

#[test]
fn authentication_gate() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    let err = client.authenticate(TEST_USER, "wrong").unwrap_err();
    assert_eq!(err.sqlstate, "IM001");
    assert_eq!(err.message, "Authentication Error.");

    let (_, outcome) = server.join().unwrap();
    assert_eq!(outcome, SessionOutcome::EndSession);
}

#[test]
fn commands_refused_before_authentication() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    let err = client.ping().unwrap_err();
    assert!(err.disconnect);
    assert_eq!(err.sqlstate, "08004");
    server.join().unwrap();
}

#[test]
fn driver_error_is_recoverable() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let err = client.select("select * from missing", 0).unwrap_err();
    assert!(!err.disconnect);
    assert_eq!(err.sqlstate, "42S02");
    assert_eq!(err.code, 1146);

    // Recoverable means the session continues
    let rs = client.select("select * from t", 0).unwrap();
    assert_eq!(rs.rows.len(), 5);

    client.end_session();
    server.join().unwrap();
}

#[test]
fn no_cursors_answers_canonical_code() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    // The pool holds 5 cursors; occupy them all
    for _ in 0..5 {
        client.select("select * from t", 1).unwrap();
    }
    let err = client.select("select * from t", 1).unwrap_err();
    assert_eq!(err.code, 900000);
    assert_eq!(
        err.message,
        "No server-side cursors were available to process the query."
    );

    client.end_session();
    server.join().unwrap();
}

#[test]
fn metadata_and_identity_commands() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    assert_eq!(client.identify().unwrap(), "stub");

    let tables = client.get_table_list("").unwrap();
    assert_eq!(tables.column_count, 1);
    assert_eq!(tables.rows, vec![vec![WireField::Text(b"t".to_vec())]]);
    assert!(tables.end_of_result_set);

    assert_eq!(client.get_last_insert_id().unwrap(), 0);

    client.end_session();
    server.join().unwrap();
}

#[test]
fn fake_transaction_blocks() {
    let session = SessionConfig {
        fake_transaction_blocks: true,
        ..Default::default()
    };
    let (controller, stub) = build_controller(
        vec![fixture_table()],
        StubBehavior::default(),
        LimitsConfig::default(),
        session,
    );
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    client.begin().unwrap();

    // Double BEGIN is a mismatch, not a silent success
    let err = client.begin().unwrap_err();
    assert_eq!(err.sqlstate, "25001");

    client.commit().unwrap();
    assert!(stub.executed().contains(&"commit".to_string()));

    client.end_session();
    server.join().unwrap();
}

#[test]
fn temp_tables_are_dropped_at_session_end() {
    let (controller, stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    client
        .new_query(b"", b"create temporary table scratch (x int)", &[], &[], true, 0, 0)
        .unwrap();
    client.end_session();
    server.join().unwrap();

    let executed = stub.executed();
    assert!(executed.contains(&"drop table scratch".to_string()));
}

#[test]
fn input_binds_are_forwarded() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let rs = client
        .new_query(
            b"report-job",
            b"select * from t",
            &[
                InputBind {
                    name: "low".into(),
                    value: BindValue::Integer(1),
                },
                InputBind {
                    name: "pattern".into(),
                    value: BindValue::String(b"a%".to_vec()),
                },
            ],
            &[],
            true,
            0,
            0,
        )
        .unwrap();
    assert_eq!(rs.rows.len(), 5);
    assert_eq!(
        rs.columns.iter().map(|c| c.type_id).collect::<Vec<_>>(),
        vec![
            ColumnType::Int.to_u16(),
            ColumnType::Varchar.to_u16(),
            ColumnType::Double.to_u16()
        ]
    );

    client.end_session();
    server.join().unwrap();
}
