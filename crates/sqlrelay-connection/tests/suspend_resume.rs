//! Suspend/resume and backend-disconnect scenarios

mod common;

use common::{
    build_controller, default_controller, start_session, TestClient, WireField, TEST_PASSWORD,
    TEST_USER,
};
use sqlrelay_common::config::{LimitsConfig, SessionConfig};
use sqlrelay_connection::session::SessionOutcome;
use sqlrelay_connection::CursorState;
use sqlrelay_driver::stub::{fixture_table, StubBehavior};
use sqlrelay_driver::DriverConnection;

#[test]
fn suspend_then_resume_yields_remaining_rows() {
    // S3: suspend after the first page, reconnect, resume, finish
    let (mut controller, _stub) = default_controller();
    controller.set_resume_endpoint(0, "/tmp/sqlrelay-test/resume-0");

    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let first = client.select("select * from t", 2).unwrap();
    assert_eq!(first.rows.len(), 2);
    let cursor_id = first.cursor_id;

    let (port, socket) = client.suspend_result_set(cursor_id).unwrap();
    assert_eq!(port, 0);
    assert_eq!(socket, "/tmp/sqlrelay-test/resume-0");

    // Client disconnects without END_SESSION
    drop(client);
    let (controller, outcome) = server.join().unwrap();
    assert_eq!(outcome, SessionOutcome::EndSession);

    // The suspended cursor survived the end-of-session sweep
    assert_eq!(
        controller.cursors().get(cursor_id).unwrap().state(),
        CursorState::ResultSetOpen
    );
    assert!(controller.cursors().get(cursor_id).unwrap().is_suspended());

    // Reconnect (in production: directly to the daemon's resume socket)
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);
    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();

    let resumed = client.resume_result_set(cursor_id, 0, 2).unwrap();
    assert_eq!(resumed.rows.len(), 2);
    assert_eq!(resumed.rows[0][0], WireField::Integer(3));
    assert!(!resumed.end_of_result_set);

    let last = client.fetch(cursor_id, 0, 2).unwrap();
    assert_eq!(last.rows.len(), 1);
    assert_eq!(last.rows[0][0], WireField::Integer(5));
    assert!(last.end_of_result_set);

    client.end_session();
    server.join().unwrap();
}

#[test]
fn resume_without_suspend_is_refused() {
    let (controller, _stub) = default_controller();
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let rs = client.select("select * from t", 2).unwrap();

    let err = client.resume_result_set(rs.cursor_id, 0, 2).unwrap_err();
    assert_eq!(err.code, 900009);
    assert_eq!(err.message, "The requested result set was not suspended.");

    client.end_session();
    server.join().unwrap();
}

#[test]
fn suspend_session_parks_open_result_sets() {
    let (mut controller, _stub) = default_controller();
    controller.set_resume_endpoint(0, "/tmp/sqlrelay-test/resume-1");
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    let rs = client.select("select * from t", 2).unwrap();

    // SUSPEND_SESSION answers with the reconnect endpoint
    let (_, socket) = client.suspend_session().unwrap();
    assert_eq!(socket, "/tmp/sqlrelay-test/resume-1");

    let (controller, outcome) = server.join().unwrap();
    assert_eq!(outcome, SessionOutcome::Suspended);
    assert!(controller.cursors().get(rs.cursor_id).unwrap().is_suspended());
}

#[test]
fn driver_disconnect_mid_fetch() {
    // S5: connection_alive=false during fetch surfaces as a disconnect
    // record and the daemon's next log-in succeeds
    let (controller, stub) = build_controller(
        vec![fixture_table()],
        StubBehavior::default(),
        LimitsConfig::default(),
        SessionConfig::default(),
    );
    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);

    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    stub.set_fail_fetch_after(Some(2));

    let err = client.select("select * from t", 0).unwrap_err();
    assert!(err.disconnect);

    let (mut controller, outcome) = server.join().unwrap();
    assert_eq!(outcome, SessionOutcome::Disconnect);

    // All cursors were torn down with the backend session
    for cursor in controller.cursors().iter() {
        assert_eq!(cursor.state(), CursorState::Free);
    }

    // Re-log-in restores health, as the daemon's relogin loop would
    stub.set_fail_fetch_after(None);
    let logins_before = stub.logins();
    controller.driver_mut().log_out();
    controller
        .driver_mut()
        .connect(&std::collections::HashMap::new())
        .unwrap();
    assert_eq!(stub.logins(), logins_before + 1);

    let (sock, server) = start_session(controller);
    let mut client = TestClient::new(sock);
    client.authenticate(TEST_USER, TEST_PASSWORD).unwrap();
    assert_eq!(client.select("select * from t", 0).unwrap().rows.len(), 5);
    client.end_session();
    server.join().unwrap();
}
