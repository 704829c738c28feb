// tests/integration/rebuild_test.rs

use super::test_helpers::{Harness, echo_ops, wait_until};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tether::TetherError;
use tether::core::message::{Message, MessageKind};
use tether::session::SessionStatus;

const TIMEOUT: Duration = Duration::from_secs(5);

fn ping() -> Message {
    Message::request(Bytes::from_static(b"echo"), vec![Bytes::from_static(b"ping")])
}

#[test]
fn test_lost_server_triggers_rebuild_then_sleep() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    server.destroy(TIMEOUT);
    assert!(wait_until(TIMEOUT, || client.status() != SessionStatus::Active));
    // Nothing is bound, so every attempt fails and the session backs off.
    assert!(client.wait_for_status(SessionStatus::Sleep, TIMEOUT));
    assert!(matches!(
        client.acquire_idle_connection(MessageKind::Request, Duration::from_millis(10)),
        Err(TetherError::NotActive(_))
    ));

    // Destroying a sleeping session is refused once, then goes through.
    let first = client.destroy(TIMEOUT);
    assert!(
        matches!(first, Ok(()) | Err(TetherError::Sleeping)),
        "unexpected result: {first:?}"
    );
    assert!(client.is_closed());
    assert!(wait_until(TIMEOUT, || client.destroy(TIMEOUT).is_ok()));
    assert_eq!(client.status(), SessionStatus::Close);
    assert_eq!(client.conn_num(), 0);
}

#[test]
fn test_sleep_lasts_at_least_the_backoff() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();
    let rebuild = h.config.session.rebuild.clone();

    server.destroy(TIMEOUT);
    assert!(client.wait_for_status(SessionStatus::Sleep, TIMEOUT));
    let slept_at = Instant::now();
    // The attempt that went over the ceiling is the one that put it to sleep.
    assert_eq!(client.reconnect_times(), rebuild.max_attempts + 1);

    let deadline = slept_at + TIMEOUT;
    while client.status() == SessionStatus::Sleep && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    let slept = slept_at.elapsed();
    assert_ne!(client.status(), SessionStatus::Sleep, "still sleeping after {slept:?}");
    // Entry into SLEEP is observed slightly after the fact.
    assert!(
        slept + Duration::from_millis(5) >= rebuild.backoff,
        "left SLEEP after {slept:?}, backoff is {:?}",
        rebuild.backoff
    );
    assert!(client.reconnect_times() <= rebuild.max_attempts + 1);

    assert!(wait_until(TIMEOUT, || client.destroy(TIMEOUT).is_ok()));
    assert_eq!(client.status(), SessionStatus::Close);
}

#[test]
fn test_rebuild_recovers_when_server_returns() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();
    let conn_ids: Vec<_> = client.connections().iter().map(|c| c.id()).collect();

    server.destroy(TIMEOUT);
    assert!(wait_until(TIMEOUT, || client.status() != SessionStatus::Active));

    let (ops, echo) = echo_ops();
    let server = h.server(ops);
    assert!(client.wait_for_status(SessionStatus::Active, TIMEOUT));
    assert_eq!(client.reconnect_times(), 0);

    // The rebuild reuses the existing connections and their threads.
    let rebuilt: Vec<_> = client.connections().iter().map(|c| c.id()).collect();
    assert_eq!(rebuilt, conn_ids);
    for conn in client.connections() {
        assert!(conn.wait_connected(TIMEOUT).is_ok());
    }

    let response = client.call(ping(), TIMEOUT).unwrap();
    assert_eq!(response.flatten_body(), Bytes::from_static(b"ping"));
    assert_eq!(echo.requests.load(std::sync::atomic::Ordering::SeqCst), 1);

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_session_wakes_from_sleep_and_reconnects() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    server.destroy(TIMEOUT);
    assert!(client.wait_for_status(SessionStatus::Sleep, TIMEOUT));

    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    // The backoff is short in tests; the next round of attempts finds the server.
    assert!(client.wait_for_status(SessionStatus::Active, TIMEOUT));
    assert_eq!(client.reconnect_times(), 0);
    client.call(ping(), TIMEOUT).unwrap();

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}
