// tests/integration/server_test.rs

use super::test_helpers::{Harness, echo_ops, test_config, wait_until};
use std::time::Duration;
use tether::server::{Server, WorkStatus};
use tether::session::SessionStatus;

const TIMEOUT: Duration = Duration::from_secs(3);

#[test]
fn test_bind_starts_one_binding_per_worker() {
    let mut config = test_config();
    config.server.workers = 3;
    let h = Harness::with_config(config);
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);

    assert_eq!(server.binding_count(), 3);
    assert_eq!(h.loopback.listener_count(&h.endpoint), 3);
    assert_eq!(server.session_count(), 0);

    server.destroy(TIMEOUT);
    assert_eq!(server.binding_count(), 0);
    assert_eq!(h.loopback.listener_count(&h.endpoint), 0);
}

#[test]
fn test_each_client_gets_its_own_server_session() {
    let mut config = test_config();
    config.server.workers = 2;
    let h = Harness::with_config(config);
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);

    let clients: Vec<_> = (0..3).map(|_| h.client()).collect();
    for client in &clients {
        client.connect(TIMEOUT).unwrap();
    }
    assert!(wait_until(TIMEOUT, || server.session_count() == 3));
    for session in server.sessions() {
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.endpoint(), Some(h.endpoint.as_str()));
    }

    clients[0].destroy(TIMEOUT).unwrap();
    assert!(wait_until(TIMEOUT, || server.session_count() == 2));

    // Tearing the server down drops the remaining clients into a rebuild.
    server.destroy(TIMEOUT);
    for client in &clients[1..] {
        assert!(wait_until(TIMEOUT, || client.status() != SessionStatus::Active));
    }
    for client in &clients[1..] {
        assert!(wait_until(TIMEOUT, || client.destroy(TIMEOUT).is_ok()));
    }
}

#[test]
fn test_bind_on_empty_endpoint_fails() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = Server::new(h.transport.clone(), h.executor.clone(), &h.config, ops);
    assert!(server.bind("").is_err());
    assert_eq!(server.binding_count(), 0);
}

#[test]
fn test_work_binding_status() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    assert_eq!(server.binding_count(), 1);
    assert!(
        server
            .bindings()
            .iter()
            .all(|(_, status)| *status == WorkStatus::Run)
    );
    server.destroy(TIMEOUT);
}
