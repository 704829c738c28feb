// tests/integration/session_lifecycle_test.rs

use super::test_helpers::{Harness, echo_ops, test_config, wait_until};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether::TetherError;
use tether::connection::{ConnStatus, ConnectionKind};
use tether::core::message::Message;
use tether::session::{Session, SessionKind, SessionStatus};
use tether::transport::{
    AcceptEvents, ConnId, Listener, LoopbackTransport, SessionEvents, SessionParams, Transport,
    TransportConnection, TransportContext, TransportSession,
};

const TIMEOUT: Duration = Duration::from_secs(3);

#[test]
fn test_tracing_setup_is_quiet_and_repeatable() {
    super::test_helpers::init_tracing();
    super::test_helpers::init_tracing();
    assert!(tracing::enabled!(tracing::Level::WARN));
    assert!(!tracing::enabled!(tracing::Level::DEBUG));
}

#[test]
fn test_connect_brings_session_active() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();

    client.connect(TIMEOUT).unwrap();
    assert_eq!(client.status(), SessionStatus::Active);
    assert_eq!(client.conn_num(), h.config.session.connections);
    for (index, conn) in client.connections().iter().enumerate() {
        assert_eq!(conn.kind(), ConnectionKind::Client);
        assert_eq!(conn.index(), index);
        assert_eq!(conn.status(), ConnStatus::RunAction);
        assert!(!conn.is_busy());
        assert!(conn.is_loop_running());
        assert!(conn.loop_thread().is_some());
    }

    // Connecting an active session is a no-op.
    client.connect(TIMEOUT).unwrap();
    assert_eq!(client.conn_num(), h.config.session.connections);

    assert!(wait_until(TIMEOUT, || server.session_count() == 1));
    let peer = &server.sessions()[0];
    assert_eq!(peer.status(), SessionStatus::Active);
    assert!(wait_until(TIMEOUT, || peer.conn_num() == h.config.session.connections));

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_connect_to_unbound_endpoint_fails_and_closes() {
    let h = Harness::new();
    let client = h.client();

    let err = client.connect(TIMEOUT).unwrap_err();
    assert!(
        matches!(err, TetherError::ConnectFailed(ref reason) if reason.contains("nothing bound")),
        "unexpected error: {err}"
    );
    assert!(wait_until(TIMEOUT, || client.status() == SessionStatus::Close));

    client.destroy(TIMEOUT).unwrap();
    assert_eq!(client.conn_num(), 0);
}

#[test]
fn test_destroy_closes_both_sides() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();
    assert!(wait_until(TIMEOUT, || server.session_count() == 1));
    let conns = client.connections();

    client.destroy(TIMEOUT).unwrap();
    assert_eq!(client.status(), SessionStatus::Close);
    assert_eq!(client.conn_num(), 0);
    for conn in &conns {
        assert_eq!(conn.status(), ConnStatus::Cleanup);
        assert!(!conn.is_loop_running());
    }

    // The server side sees every link close and drops its session.
    assert!(wait_until(TIMEOUT, || server.session_count() == 0));
    assert_eq!(server.reap_closed(), 1);
    server.destroy(TIMEOUT);
}

#[test]
fn test_disconnect_then_reconnect() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    client.disconnect(TIMEOUT).unwrap();
    assert!(wait_until(TIMEOUT, || client.status() == SessionStatus::Close));
    assert!(!client.is_closed());

    client.connect(TIMEOUT).unwrap();
    assert_eq!(client.status(), SessionStatus::Active);
    assert_eq!(client.conn_num(), h.config.session.connections);
    for conn in client.connections() {
        assert_eq!(conn.status(), ConnStatus::RunAction);
    }

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

#[test]
fn test_auto_disconnect_session_reconnects_on_demand() {
    let mut config = test_config();
    config.session.auto_disconnect = true;
    let h = Harness::with_config(config);
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let client = h.client();
    client.connect(TIMEOUT).unwrap();

    // Losing the server closes the session instead of rebuilding it.
    server.destroy(TIMEOUT);
    assert!(wait_until(TIMEOUT, || client.status() == SessionStatus::Close));
    assert_eq!(client.reconnect_times(), 0);

    // With a server back, a call reconnects inline.
    let (ops, echo) = echo_ops();
    let server = h.server(ops);
    let request = Message::request(Bytes::from_static(b"op"), vec![Bytes::from_static(b"again")]);
    let response = client.call(request, TIMEOUT).unwrap();
    assert_eq!(response.flatten_body(), Bytes::from_static(b"again"));
    assert_eq!(echo.requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.status(), SessionStatus::Active);

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}

/// Loopback transport that keeps every events sink it is handed.
struct RecordingTransport {
    inner: LoopbackTransport,
    sinks: Mutex<Vec<Arc<dyn SessionEvents>>>,
}

impl Transport for RecordingTransport {
    fn create_context(
        &self,
        affinity: Option<usize>,
    ) -> Result<Arc<dyn TransportContext>, TetherError> {
        self.inner.create_context(affinity)
    }

    fn create_session(
        &self,
        params: &SessionParams,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn TransportSession>, TetherError> {
        self.sinks.lock().push(events.clone());
        self.inner.create_session(params, events)
    }

    fn connect(
        &self,
        session: &Arc<dyn TransportSession>,
        ctx: &Arc<dyn TransportContext>,
        conn: ConnId,
    ) -> Result<Arc<dyn TransportConnection>, TetherError> {
        self.inner.connect(session, ctx, conn)
    }

    fn bind(
        &self,
        ctx: &Arc<dyn TransportContext>,
        endpoint: &str,
        accept: Arc<dyn AcceptEvents>,
    ) -> Result<Arc<dyn Listener>, TetherError> {
        self.inner.bind(ctx, endpoint, accept)
    }

    fn last_error(&self) -> String {
        self.inner.last_error()
    }
}

#[test]
fn test_events_from_replaced_transport_session_are_ignored() {
    let h = Harness::new();
    let (ops, _echo) = echo_ops();
    let server = h.server(ops);
    let recording = Arc::new(RecordingTransport {
        inner: h.loopback.clone(),
        sinks: Mutex::new(Vec::new()),
    });
    let client = Session::builder(SessionKind::Client, recording.clone(), h.executor.clone())
        .config(h.config.session.clone())
        .endpoint(h.endpoint.clone())
        .build()
        .unwrap();

    client.connect(TIMEOUT).unwrap();
    client.disconnect(TIMEOUT).unwrap();
    assert!(wait_until(TIMEOUT, || client.status() == SessionStatus::Close));
    client.connect(TIMEOUT).unwrap();

    let first = recording.sinks.lock()[0].clone();
    assert_eq!(recording.sinks.lock().len(), 2);

    // Late events from the first transport session must not touch the new links.
    for conn in client.connections() {
        first.on_connection_closed(conn.id());
        first.on_message(conn.id(), Message::response(1, Bytes::new(), vec![]));
    }
    first.on_session_teardown();
    for conn in client.connections() {
        assert_eq!(conn.status(), ConnStatus::RunAction);
    }
    assert_eq!(client.status(), SessionStatus::Active);

    let request = Message::request(Bytes::from_static(b"op"), vec![Bytes::from_static(b"fresh")]);
    let response = client.call(request, TIMEOUT).unwrap();
    assert_eq!(response.flatten_body(), Bytes::from_static(b"fresh"));

    client.destroy(TIMEOUT).unwrap();
    server.destroy(TIMEOUT);
}
