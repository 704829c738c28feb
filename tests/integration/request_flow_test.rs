// tests/integration/request_flow_test.rs

use super::test_helpers::{Harness, echo_ops, wait_until};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tether::TetherError;
use tether::core::message::{Message, MessageKind};
use tether::core::pipeline::ServiceOps;
use tether::session::SessionStatus;

const TIMEOUT: Duration = Duration::from_secs(3);

fn ping(body: &str) -> Message {
    Message::request(
        Bytes::from_static(b"echo"),
        vec![Bytes::from(body.to_string())],
    )
}

#[test]
fn test_round_trip_and_counters() {
    let mut config = super::test_helpers::test_config();
    config.session.connections = 1;
    let h = Harness::with_config(config);
    let (ops, echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    let request = ping("hello");
    let id = request.id;
    let response = client.call(request, TIMEOUT).unwrap();
    assert_eq!(response.id, id);
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.header, Bytes::from_static(b"echo"));
    assert_eq!(response.flatten_body(), Bytes::from_static(b"hello"));
    assert_eq!(echo.requests.load(Ordering::SeqCst), 1);

    let conn = &client.connections()[0];
    assert!(!conn.is_busy());
    let stats = conn.stats().snapshot();
    assert_eq!(stats.tx_request.count, 1);
    assert_eq!(stats.rx_response.count, 1);
    assert_eq!(stats.tx_oneway.count, 0);

    let peer = &server.sessions()[0];
    let peer_conn = &peer.connections()[0];
    assert!(wait_until(TIMEOUT, || peer_conn.stats().tx(MessageKind::Response).count == 1));
    assert_eq!(peer_conn.stats().rx(MessageKind::Request).count, 1);

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_many_calls_across_threads() {
    let h = Harness::new();
    let (ops, echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let client = client.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    let body = format!("t{t}-{i}");
                    // A busy pool is a valid outcome; retry until a connection frees up.
                    let response = loop {
                        match client.call(ping(&body), TIMEOUT) {
                            Err(TetherError::Busy { .. }) => continue,
                            other => break other.unwrap(),
                        }
                    };
                    assert_eq!(response.flatten_body(), Bytes::from(body));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(echo.requests.load(Ordering::SeqCst), 40);

    let sent: u64 = client
        .connections()
        .iter()
        .map(|c| c.stats().snapshot().tx_request.count)
        .sum();
    assert_eq!(sent, 40);
    for conn in client.connections() {
        assert!(!conn.is_busy());
    }

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_oneway_delivery() {
    let h = Harness::new();
    let (ops, echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    for _ in 0..3 {
        client
            .send_oneway(
                Message::oneway(Bytes::from_static(b"note"), vec![Bytes::from_static(b"x")]),
                TIMEOUT,
            )
            .unwrap();
    }
    assert!(wait_until(TIMEOUT, || echo.oneways.load(Ordering::SeqCst) == 3));
    assert_eq!(echo.requests.load(Ordering::SeqCst), 0);

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_unanswered_request_times_out() {
    let h = Harness::new();
    // A server without a body handler rejects every request silently.
    let (ops, echo) = echo_ops();
    let ops = ServiceOps {
        body: None,
        ..ops
    };
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    let err = client
        .call(ping("lost"), Duration::from_millis(200))
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(echo.requests.load(Ordering::SeqCst), 0);
    // The connection was released despite the failure.
    for conn in client.connections() {
        assert!(!conn.is_busy());
    }

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_call_before_connect_fails() {
    let h = Harness::new();
    let client = h.client();
    assert_eq!(
        client.call(ping("early"), TIMEOUT).unwrap_err(),
        TetherError::NoConnections
    );
    assert_eq!(client.status(), SessionStatus::Init);
}

#[test]
fn test_status_dump_after_traffic() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();
    client.call(ping("status"), TIMEOUT).unwrap();

    let report = client.dump_status().unwrap();
    assert_eq!(report.status, SessionStatus::Active);
    assert_eq!(report.conn_num, h.config.session.connections);
    assert_eq!(report.connections.len(), h.config.session.connections);
    let sent: u64 = report
        .connections
        .iter()
        .map(|c| c.stats.tx_request.count)
        .sum();
    assert_eq!(sent, 1);
    assert!(client.dump_status().is_none());

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}
