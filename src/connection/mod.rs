// src/connection/mod.rs

//! A single transport link inside a session's pool.
//!
//! Client connections own an event-loop context and a thread from the
//! executor that runs it; server connections wrap a link accepted by a work
//! binding and have no thread of their own. Status and the busy flag live
//! behind a reader-writer lock; waiters block on a separate signal so that
//! status can be read cheaply while someone waits for it to change.

mod event_loop;
mod state;

pub use state::{ConnState, ConnStatus, ConnectionKind};

use crate::core::TetherError;
use crate::core::executor::{Executor, Work, WorkHandle};
use crate::core::message::{Message, MessageKind};
use crate::core::metrics;
use crate::core::pipeline::ResponseSink;
use crate::core::stats::ConnStats;
use crate::session::{Session, SessionInner, SessionKind};
use crate::transport::{ConnId, Transport, TransportConnection, TransportContext, TransportSession};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The event-loop half of a client connection.
pub(crate) struct EventLoop {
    ctx: Arc<dyn TransportContext>,
    transport: Arc<dyn Transport>,
    work: Mutex<Option<WorkHandle>>,
    reconnect_interval: Duration,
}

pub struct Connection {
    id: ConnId,
    kind: ConnectionKind,
    index: usize,
    session: Weak<SessionInner>,
    state: RwLock<ConnState>,
    signal: Mutex<u64>,
    cond: Condvar,
    link: Mutex<Option<Arc<dyn TransportConnection>>>,
    event_loop: Option<EventLoop>,
    stats: ConnStats,
    /// Outstanding calls on this connection, keyed by request id.
    pending: Mutex<HashMap<u64, Option<Message>>>,
    pending_cond: Condvar,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Connection {
    fn new(
        kind: ConnectionKind,
        index: usize,
        session: Weak<SessionInner>,
        event_loop: Option<EventLoop>,
    ) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            index,
            session,
            state: RwLock::new(ConnState::new(kind)),
            signal: Mutex::new(0),
            cond: Condvar::new(),
            link: Mutex::new(None),
            event_loop,
            stats: ConnStats::default(),
            pending: Mutex::new(HashMap::new()),
            pending_cond: Condvar::new(),
        }
    }

    /// Creates a client connection at pool position `index`, adds it to the
    /// session's pool, opens its transport link, and starts its event loop.
    ///
    /// Returns once the loop thread is running. The link becomes usable later,
    /// when the transport reports it established. On any failure the
    /// connection is removed from the pool again and torn down.
    pub fn create_client(session: &Session, index: usize) -> Result<Arc<Connection>, TetherError> {
        let inner = session.inner();
        if inner.kind != SessionKind::Client {
            return Err(TetherError::InvalidState(
                "client connections belong to client sessions".into(),
            ));
        }
        let transport_session = session
            .transport_session()
            .ok_or_else(|| TetherError::InvalidState("session has no transport session".into()))?;

        let affinity = inner.placement.core_for(index);
        let ctx = inner.transport.create_context(affinity)?;
        let conn = Arc::new(Connection::new(
            ConnectionKind::Client,
            index,
            Arc::downgrade(inner),
            Some(EventLoop {
                ctx,
                transport: inner.transport.clone(),
                work: Mutex::new(None),
                reconnect_interval: inner.config.reconnect_interval,
            }),
        ));

        // In the pool before the loop starts, so link events can find it.
        session.insert_connection(conn.clone())?;
        if let Err(e) = conn.start_client(
            &transport_session,
            inner.executor.as_ref(),
            inner.config.thread_start_timeout,
        ) {
            warn!("Failed to start connection {} of session {}: {e}", conn.id, inner.id);
            let _ = session.remove_connection(&conn);
            conn.destroy();
            return Err(e);
        }
        info!(
            "Connection {} (index {index}, core {affinity:?}) started for session {}.",
            conn.id, inner.id
        );
        Ok(conn)
    }

    /// Wraps a link accepted on behalf of a server session and adds it to the
    /// session's pool.
    pub fn create_server_side(
        session: &Session,
        link: Arc<dyn TransportConnection>,
    ) -> Result<Arc<Connection>, TetherError> {
        let inner = session.inner();
        if inner.kind != SessionKind::Server {
            return Err(TetherError::InvalidState(
                "server connections belong to server sessions".into(),
            ));
        }
        let index = session.conn_num();
        let conn = Arc::new(Connection::new(
            ConnectionKind::Server,
            index,
            Arc::downgrade(inner),
            None,
        ));
        *conn.link.lock() = Some(link);
        session.insert_connection(conn.clone())?;
        debug!("Server connection {} accepted for session {}.", conn.id, inner.id);
        Ok(conn)
    }

    fn start_client(
        self: &Arc<Self>,
        transport_session: &Arc<dyn TransportSession>,
        executor: &dyn Executor,
        start_timeout: Duration,
    ) -> Result<(), TetherError> {
        let event_loop = self
            .event_loop
            .as_ref()
            .ok_or_else(|| TetherError::InvalidState("connection has no event loop".into()))?;

        let link = event_loop
            .transport
            .connect(transport_session, &event_loop.ctx, self.id)?;
        *self.link.lock() = Some(link);

        let runner = self.clone();
        let stopper = Arc::downgrade(self);
        let work = Work::new(format!("tether-conn-{}", self.id), move || {
            runner.run_event_loop()
        })
        .with_stop(move || {
            if let Some(conn) = stopper.upgrade() {
                conn.stop_event_loop();
            }
        });
        let handle = executor.post(work)?;
        *event_loop.work.lock() = Some(handle);

        let deadline = Instant::now() + start_timeout;
        if !self.wait_until(deadline, |s| s.status != ConnStatus::Init) {
            return Err(TetherError::Timeout(format!(
                "event loop of connection {} did not start within {start_timeout:?}",
                self.id
            )));
        }
        if self.status() == ConnStatus::Cleanup {
            // Stopped by a teardown racing the start; the session decides.
            debug!("Connection {} stopped during start.", self.id);
        }
        Ok(())
    }

    /// Opens a fresh link on this connection's existing context and thread.
    pub(crate) fn reconnect(
        &self,
        transport_session: &Arc<dyn TransportSession>,
    ) -> Result<(), TetherError> {
        let event_loop = self
            .event_loop
            .as_ref()
            .ok_or_else(|| TetherError::InvalidState("server connections cannot reconnect".into()))?;
        if self.status() == ConnStatus::Cleanup {
            return Err(TetherError::InvalidState(format!(
                "connection {} is being cleaned up",
                self.id
            )));
        }
        let old = self.link.lock().take();
        if let Some(old) = old
            && old.is_connected()
        {
            old.disconnect();
        }
        let link = event_loop
            .transport
            .connect(transport_session, &event_loop.ctx, self.id)?;
        *self.link.lock() = Some(link);
        self.state.write().is_draining = false;
        debug!("Connection {} reconnecting.", self.id);
        Ok(())
    }

    /// Starts closing the link and, for client connections, waits up to
    /// `timeout` for the transport to confirm it closed.
    ///
    /// The wait is skipped when called from the connection's own event-loop
    /// thread, since the confirmation is delivered on that thread.
    pub fn disconnect(&self, timeout: Duration) -> Result<(), TetherError> {
        self.state.write().is_draining = true;
        let link = self.link.lock().clone();
        let Some(link) = link else {
            return Ok(());
        };
        link.disconnect();
        self.notify();
        if self.kind == ConnectionKind::Server || self.on_loop_thread() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        if self.wait_until(deadline, |s| s.status != ConnStatus::RunAction) {
            debug!("Connection {} disconnected.", self.id);
            Ok(())
        } else {
            Err(TetherError::Timeout(format!(
                "connection {} did not report closed within {timeout:?}",
                self.id
            )))
        }
    }

    /// Stops the connection for good: cancels and joins its event loop (client
    /// side only), closes the link, and fails outstanding calls.
    pub fn destroy(&self) {
        if let Some(event_loop) = &self.event_loop {
            let work = event_loop.work.lock().take();
            match work {
                Some(work) => work.cancel(),
                None => self.stop_event_loop(),
            }
        } else {
            self.update(|s| s.status = ConnStatus::Cleanup);
        }
        let link = self.link.lock().take();
        if let Some(link) = link
            && link.is_connected()
        {
            link.disconnect();
        }
        self.wake_callers();
        debug!("Connection {} destroyed.", self.id);
    }

    /// Blocks until the link is established and the connection is idle.
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), TetherError> {
        if self.kind != ConnectionKind::Client {
            return Err(TetherError::InvalidState(
                "only client connections can be waited on".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        if self.wait_until(deadline, |s| s.status == ConnStatus::RunAction && !s.is_busy) {
            Ok(())
        } else {
            Err(TetherError::Timeout(format!(
                "connection {} not established within {timeout:?} (status {})",
                self.id,
                self.status()
            )))
        }
    }

    // --- Status and flags ---

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Position in the session's pool at creation time.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(Session::from_inner)
    }

    pub fn status(&self) -> ConnStatus {
        self.state.read().status
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_busy(&self) -> bool {
        self.state.read().is_busy
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    /// The OS thread running this connection's event loop, once started.
    pub fn loop_thread(&self) -> Option<std::thread::ThreadId> {
        self.event_loop
            .as_ref()
            .and_then(|el| el.work.lock().as_ref().and_then(|w| w.thread_id()))
    }

    /// Whether the event loop thread is still alive.
    pub fn is_loop_running(&self) -> bool {
        self.event_loop
            .as_ref()
            .and_then(|el| el.work.lock().as_ref().map(|w| !w.is_finished()))
            .unwrap_or(false)
    }

    fn on_loop_thread(&self) -> bool {
        self.event_loop
            .as_ref()
            .and_then(|el| el.work.lock().as_ref().map(|w| w.is_current_thread()))
            .unwrap_or(false)
    }

    /// Marks the connection busy if it is idle and usable for `kind`.
    pub(crate) fn try_acquire(&self, kind: MessageKind) -> bool {
        let mut state = self.state.write();
        if state.is_idle_for(kind) {
            state.is_busy = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn release(&self) {
        self.state.write().is_busy = false;
        self.notify();
    }

    fn update(&self, f: impl FnOnce(&mut ConnState)) {
        f(&mut self.state.write());
        self.notify();
    }

    fn notify(&self) {
        let mut signal = self.signal.lock();
        *signal = signal.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Waits until `pred` holds or `deadline` passes. Returns the final verdict.
    fn wait_until(&self, deadline: Instant, pred: impl Fn(&ConnState) -> bool) -> bool {
        let mut signal = self.signal.lock();
        loop {
            if pred(&self.state.read()) {
                return true;
            }
            if self.cond.wait_until(&mut signal, deadline).timed_out() {
                return pred(&self.state.read());
            }
        }
    }

    // --- Link events ---

    pub(crate) fn mark_established(&self) {
        self.update(|s| {
            if s.status != ConnStatus::Cleanup {
                s.status = ConnStatus::RunAction;
                s.is_draining = false;
            }
        });
        debug!("Connection {} established.", self.id);
    }

    pub(crate) fn mark_closed(&self) {
        self.update(|s| {
            if s.status == ConnStatus::RunAction {
                s.status = match self.kind {
                    ConnectionKind::Client => ConnStatus::Run,
                    ConnectionKind::Server => ConnStatus::Cleanup,
                };
            }
        });
        self.wake_callers();
        debug!("Connection {} closed.", self.id);
    }

    /// Closes the link without waiting.
    pub(crate) fn close_link(&self) {
        let link = self.link.lock().clone();
        if let Some(link) = link {
            link.disconnect();
        }
    }

    // --- Traffic ---

    fn current_link(&self) -> Result<Arc<dyn TransportConnection>, TetherError> {
        self.link
            .lock()
            .clone()
            .ok_or_else(|| TetherError::Transport(format!("connection {} has no link", self.id)))
    }

    /// Sends a request and waits up to `timeout` for the matching response.
    pub fn send_request(&self, request: Message, timeout: Duration) -> Result<Message, TetherError> {
        if request.kind != MessageKind::Request {
            return Err(TetherError::InvalidState(format!(
                "send_request expects a request, got a {}",
                request.kind
            )));
        }
        let id = request.id;
        let link = self.current_link()?;
        self.pending.lock().insert(id, None);

        let started = Instant::now();
        if let Err(e) = link.send(request) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        self.stats.record_tx(MessageKind::Request, started.elapsed());

        let deadline = started + timeout;
        let mut pending = self.pending.lock();
        loop {
            if let Some(slot) = pending.get_mut(&id)
                && let Some(response) = slot.take()
            {
                pending.remove(&id);
                let latency = started.elapsed();
                self.stats.record_rx(MessageKind::Response, latency);
                metrics::CALL_LATENCY_SECONDS.observe(latency.as_secs_f64());
                return Ok(response);
            }
            if !self.state.read().is_usable_for(MessageKind::Response) {
                pending.remove(&id);
                return Err(TetherError::ConnectFailed(format!(
                    "connection {} closed while request {id} was outstanding",
                    self.id
                )));
            }
            if self.pending_cond.wait_until(&mut pending, deadline).timed_out() {
                pending.remove(&id);
                return Err(TetherError::Timeout(format!(
                    "no response to request {id} within {timeout:?}"
                )));
            }
        }
    }

    /// Sends a one-way message.
    pub fn send_oneway(&self, msg: Message) -> Result<(), TetherError> {
        if msg.kind != MessageKind::OneWay {
            return Err(TetherError::InvalidState(format!(
                "send_oneway expects a one-way message, got a {}",
                msg.kind
            )));
        }
        let started = Instant::now();
        self.current_link()?.send(msg)?;
        self.stats.record_tx(MessageKind::OneWay, started.elapsed());
        Ok(())
    }

    /// Hands a response to the caller waiting for it.
    pub(crate) fn complete_call(&self, response: Message) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&response.id) {
            Some(slot) => {
                *slot = Some(response);
                self.pending_cond.notify_all();
            }
            None => debug!(
                "Dropping late response {} on connection {}.",
                response.id, self.id
            ),
        }
    }

    fn wake_callers(&self) {
        let _pending = self.pending.lock();
        self.pending_cond.notify_all();
    }
}

impl ResponseSink for Connection {
    fn send_response(&self, msg: Message) -> Result<(), (TetherError, Message)> {
        let link = match self.current_link() {
            Ok(link) => link,
            Err(e) => return Err((e, msg)),
        };
        let service_time = msg.age();
        match link.send(msg.clone()) {
            Ok(()) => {
                self.stats.record_tx(MessageKind::Response, service_time);
                Ok(())
            }
            Err(e) => Err((e, msg)),
        }
    }
}
