// src/session/hooks.rs

//! Routes transport events into the owning session.

use super::{Session, SessionInner, SessionKind};
use crate::connection::Connection;
use crate::core::message::{Message, MessageKind};
use crate::core::metrics;
use crate::core::pipeline::header::HeaderLimits;
use crate::core::pipeline::{
    Dispatch, ResponseSink, complete_response, process_header, process_oneway, process_request,
};
use crate::transport::{ConnId, SessionEvents, TransportConnection};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The events sink handed to the transport for one transport session.
///
/// Holds the session weakly, so a transport that outlives the session only
/// ever reaches a dead pointer it can detect. The generation identifies which
/// transport session it was handed out for.
pub(crate) struct SessionHook {
    session: Weak<SessionInner>,
    generation: u64,
}

impl SessionHook {
    pub(crate) fn new(session: Weak<SessionInner>, generation: u64) -> Self {
        Self {
            session,
            generation,
        }
    }

    /// The session and pooled connection an event is for, or `None` when the
    /// event comes from a superseded transport session.
    fn connection(&self, id: ConnId) -> Option<(Arc<SessionInner>, Arc<Connection>)> {
        let session = self.session.upgrade()?;
        if session.state.lock().generation != self.generation {
            debug!(
                "Session {}: ignoring stale event for connection {id}.",
                session.id
            );
            return None;
        }
        let conn = session.find_connection(id);
        if conn.is_none() {
            debug!("Session {}: event for unknown connection {id}.", session.id);
        }
        conn.map(|c| (session, c))
    }
}

impl SessionEvents for SessionHook {
    fn on_session_established(&self) {
        if let Some(session) = self.session.upgrade() {
            session.handle_established(self.generation);
        }
    }

    fn on_session_teardown(&self) {
        if let Some(session) = self.session.upgrade() {
            session.handle_teardown(self.generation);
        }
    }

    fn on_connection_established(&self, conn: ConnId) {
        if let Some((session, conn)) = self.connection(conn) {
            conn.mark_established();
            session.pool_cond.notify_all();
        }
    }

    fn on_connection_closed(&self, conn: ConnId) {
        let Some((session, conn)) = self.connection(conn) else {
            return;
        };
        conn.mark_closed();
        if session.kind == SessionKind::Server {
            let session = Session::from_inner(session);
            let _ = session.remove_connection(&conn);
            conn.destroy();
        }
    }

    fn on_connection_accepted(&self, link: Arc<dyn TransportConnection>) -> Option<ConnId> {
        let session = Session::from_inner(self.session.upgrade()?);
        match Connection::create_server_side(&session, link) {
            Ok(conn) => Some(conn.id()),
            Err(e) => {
                warn!("Session {}: refusing link: {e}", session.id());
                None
            }
        }
    }

    fn on_message(&self, conn: ConnId, msg: Message) {
        let Some((session, conn)) = self.connection(conn) else {
            return;
        };
        match msg.kind {
            MessageKind::Response => conn.complete_call(msg),
            MessageKind::Request | MessageKind::OneWay => {
                if session.kind != SessionKind::Server {
                    warn!(
                        "Session {}: dropping inbound {} on a client connection.",
                        session.id, msg.kind
                    );
                    return;
                }
                conn.stats().record_rx(msg.kind, msg.age());
                let kind = msg.kind;
                let limits = HeaderLimits {
                    max_message_len: session.config.max_message_len,
                    max_header_len: session.config.max_header_len,
                    max_iov_len: session.config.max_iov_len,
                };
                let inbound = match process_header(msg, &session.ops, limits) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        warn!("Session {}: {kind} rejected at header stage: {e}", session.id);
                        metrics::REQUESTS_PROCESSED_TOTAL
                            .with_label_values(&[Dispatch::Rejected.as_str()])
                            .inc();
                        return;
                    }
                };
                if kind == MessageKind::Request {
                    let sink: Arc<dyn ResponseSink> = conn;
                    process_request(inbound, &session.ops, sink, &session.executor);
                } else {
                    process_oneway(inbound, &session.ops, &session.executor);
                }
            }
        }
    }

    fn on_send_complete(&self, _conn: ConnId, msg: Message) {
        if msg.kind != MessageKind::Response {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            complete_response(msg, &session.ops);
        }
    }
}
